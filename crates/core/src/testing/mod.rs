//! Testing utilities and mock implementations for integration tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use oseo_core::testing::{fixtures, MockProcessor, RecordingNotifier};
//!
//! let plugin = MockProcessor::new();
//! plugin.fail_item("S2A_3", PluginError::ItemNotFound("S2A_3".into()));
//!
//! let spec = fixtures::product_spec("alice", &["S2A_1", "S2A_2", "S2A_3"]);
//! ```

mod mock_processor;
mod recording_notifier;

pub use mock_processor::MockProcessor;
pub use recording_notifier::RecordingNotifier;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};

    use crate::config::{Config, RetryConfig};
    use crate::order::{
        DeliveryOptions, ItemSpec, OrderSpec, OrderType, Priority, SubscriptionSpec,
    };

    /// A product order for the given identifiers of collection `S2`.
    pub fn product_spec(ordered_by: &str, identifiers: &[&str]) -> OrderSpec {
        OrderSpec {
            order_type: OrderType::Product,
            ordered_by: ordered_by.to_string(),
            reference: Some("test-order".to_string()),
            priority: Priority::Standard,
            delivery: DeliveryOptions::default(),
            options: BTreeMap::new(),
            extensions: BTreeMap::new(),
            items: identifiers
                .iter()
                .enumerate()
                .map(|(i, identifier)| ItemSpec {
                    item_id: format!("item-{}", i + 1),
                    identifier: identifier.to_string(),
                    collection: "S2".to_string(),
                    options: BTreeMap::new(),
                })
                .collect(),
            subscription: None,
        }
    }

    /// A subscription order on collection `S2` over `[begin, end)`.
    pub fn subscription_spec(
        ordered_by: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> OrderSpec {
        OrderSpec {
            order_type: OrderType::Subscription,
            ordered_by: ordered_by.to_string(),
            reference: None,
            priority: Priority::Standard,
            delivery: DeliveryOptions::default(),
            options: BTreeMap::new(),
            extensions: BTreeMap::new(),
            items: Vec::new(),
            subscription: Some(SubscriptionSpec {
                collection: "S2".to_string(),
                options: BTreeMap::new(),
                requested_begin: Some(begin),
                requested_end: Some(end),
                timeslot_secs: None,
            }),
        }
    }

    /// Configuration with fast retries, for tests driving the queue by hand.
    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.worker = config
            .worker
            .with_workers(2)
            .with_poll_interval_ms(10)
            .with_task_timeout_secs(5)
            .with_retry(RetryConfig {
                max_attempts: 3,
                initial_delay_secs: 0,
                max_delay_secs: 0,
                backoff_multiplier: 2.0,
            });
        config.notifications.moderators = vec!["moderator@example.com".to_string()];
        config
    }
}

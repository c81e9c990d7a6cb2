//! Mock processing plugin for testing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use crate::order::SubscriptionSpec;
use crate::plugin::{
    DeliveredItem, ItemRequest, OrderProcessor, PackageRequest, ParsedExtension, ParsedOption,
    PluginError, Timeslot,
};

#[derive(Debug, Default)]
struct MockState {
    /// Results returned by successive acquisitions of an identifier.
    scripts: HashMap<String, VecDeque<Result<(), PluginError>>>,
    /// Errors returned by every acquisition of an identifier.
    failures: HashMap<String, PluginError>,
    rejected_options: HashSet<String>,
    packaging_error: Option<String>,
    batch_identifiers: HashMap<String, Vec<String>>,
    subscription_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    subscription_error: Option<PluginError>,

    acquisitions: Vec<ItemRequest>,
    packages: Vec<PackageRequest>,
    cleaned: Vec<String>,
}

/// Mock implementation of the [`OrderProcessor`] trait.
///
/// Provides controllable behavior for testing:
/// - Script per-identifier acquisition results
/// - Hold acquisitions at a gate to observe in-production items
/// - Record acquisitions, packages and cleaned locations
///
/// Delivered locations are `mock://{order_id}/{identifier}`, so repeated
/// acquisitions of an item converge on one location.
///
/// # Example
///
/// ```rust,ignore
/// use oseo_core::testing::MockProcessor;
///
/// let plugin = MockProcessor::new();
/// plugin.script("S2A_1", vec![Err(PluginError::transient("timeout")), Ok(())]);
///
/// // ... run the item twice ...
/// assert_eq!(plugin.acquire_count("S2A_1"), 2);
/// ```
#[derive(Debug)]
pub struct MockProcessor {
    state: Arc<RwLock<MockState>>,
    gate: watch::Sender<bool>,
}

impl Default for MockProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcessor {
    /// Create a mock that delivers every item.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            gate,
        }
    }

    /// Queue results for successive acquisitions of `identifier`. Once the
    /// script runs out acquisitions succeed.
    pub fn script(&self, identifier: &str, results: Vec<Result<(), PluginError>>) {
        self.state
            .write()
            .unwrap()
            .scripts
            .insert(identifier.to_string(), results.into());
    }

    /// Fail every acquisition of `identifier`.
    pub fn fail_item(&self, identifier: &str, error: PluginError) {
        self.state
            .write()
            .unwrap()
            .failures
            .insert(identifier.to_string(), error);
    }

    /// Reject the named option during validation.
    pub fn reject_option(&self, name: &str) {
        self.state
            .write()
            .unwrap()
            .rejected_options
            .insert(name.to_string());
    }

    /// Make packaging fail with the given reason.
    pub fn set_packaging_error(&self, reason: Option<&str>) {
        self.state.write().unwrap().packaging_error = reason.map(str::to_string);
    }

    /// Identifiers returned for every timeslot of `collection`.
    pub fn set_batch_identifiers(&self, collection: &str, identifiers: Vec<String>) {
        self.state
            .write()
            .unwrap()
            .batch_identifiers
            .insert(collection.to_string(), identifiers);
    }

    /// Validity window returned for new subscriptions.
    pub fn set_subscription_window(&self, begin: DateTime<Utc>, end: DateTime<Utc>) {
        self.state.write().unwrap().subscription_window = Some((begin, end));
    }

    /// Fail every subscription window lookup with `error`.
    pub fn fail_subscription_duration(&self, error: PluginError) {
        self.state.write().unwrap().subscription_error = Some(error);
    }

    /// Block acquisitions until [`release_acquisitions`](Self::release_acquisitions).
    /// Blocked calls are recorded before they wait.
    pub fn hold_acquisitions(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_acquisitions(&self) {
        self.gate.send_replace(true);
    }

    /// Get all recorded acquisition requests.
    pub fn recorded_acquisitions(&self) -> Vec<ItemRequest> {
        self.state.read().unwrap().acquisitions.clone()
    }

    /// Number of acquisitions of `identifier`.
    pub fn acquire_count(&self, identifier: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .acquisitions
            .iter()
            .filter(|r| r.identifier == identifier)
            .count()
    }

    /// Get all recorded package requests.
    pub fn recorded_packages(&self) -> Vec<PackageRequest> {
        self.state.read().unwrap().packages.clone()
    }

    /// Get every location passed to `clean_files`.
    pub fn cleaned_locations(&self) -> Vec<String> {
        self.state.read().unwrap().cleaned.clone()
    }

    /// Location an item of `order_id` is delivered to.
    pub fn location_for(order_id: &str, identifier: &str) -> String {
        format!("mock://{}/{}", order_id, identifier)
    }

    fn next_result(&self, identifier: &str) -> Result<(), PluginError> {
        let mut state = self.state.write().unwrap();
        if let Some(error) = state.failures.get(identifier) {
            return Err(error.clone());
        }
        state
            .scripts
            .get_mut(identifier)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl OrderProcessor for MockProcessor {
    fn name(&self) -> &str {
        "mock"
    }

    fn validate_and_parse_option(
        &self,
        name: &str,
        raw: &str,
    ) -> Result<ParsedOption, PluginError> {
        if self.state.read().unwrap().rejected_options.contains(name) {
            return Err(PluginError::invalid_option(name, "rejected by mock"));
        }
        Ok(ParsedOption {
            name: name.to_string(),
            value: raw.trim().to_string(),
        })
    }

    fn validate_and_parse_extension(
        &self,
        name: &str,
        raw: &str,
    ) -> Result<ParsedExtension, PluginError> {
        Ok(ParsedExtension {
            name: name.to_string(),
            value: raw.trim().to_string(),
        })
    }

    async fn acquire_and_deliver_item(
        &self,
        request: &ItemRequest,
    ) -> Result<DeliveredItem, PluginError> {
        self.state
            .write()
            .unwrap()
            .acquisitions
            .push(request.clone());

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(PluginError::transient("mock gate closed"));
        }

        self.next_result(&request.identifier)?;
        Ok(DeliveredItem {
            location: Self::location_for(&request.order_id, &request.identifier),
            checksum: Some(format!("mock-{}", request.identifier)),
            size_bytes: 1024,
        })
    }

    async fn package_files(&self, request: &PackageRequest) -> Result<String, PluginError> {
        let mut state = self.state.write().unwrap();
        state.packages.push(request.clone());
        if let Some(reason) = &state.packaging_error {
            return Err(PluginError::Packaging(reason.clone()));
        }
        Ok(format!("mock://{}/package.{}", request.order_id, request.format))
    }

    async fn clean_files(
        &self,
        _older_than: DateTime<Utc>,
        locations: &[String],
    ) -> Result<usize, PluginError> {
        self.state
            .write()
            .unwrap()
            .cleaned
            .extend(locations.iter().cloned());
        Ok(locations.len())
    }

    async fn subscription_batch_item_identifiers(
        &self,
        timeslot: Timeslot,
        collection: &str,
        _options: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, PluginError> {
        if let Some(ids) = self.state.read().unwrap().batch_identifiers.get(collection) {
            return Ok(ids.clone());
        }
        Ok(vec![format!(
            "{}_{}",
            collection,
            timeslot.start.format("%Y%m%dT%H%M%S")
        )])
    }

    fn subscription_duration(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), PluginError> {
        let state = self.state.read().unwrap();
        if let Some(error) = &state.subscription_error {
            return Err(error.clone());
        }
        if let Some(window) = state.subscription_window {
            return Ok(window);
        }
        let begin = spec.requested_begin.unwrap_or_else(Utc::now);
        let end = spec.requested_end.unwrap_or(begin + Duration::days(30));
        Ok((begin, end))
    }
}

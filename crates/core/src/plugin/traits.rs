//! The processing plugin contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::PluginError;
use super::types::{
    DeliveredItem, ItemRequest, PackageRequest, ParsedExtension, ParsedOption, Timeslot,
};
use crate::order::SubscriptionSpec;

/// Deployer supplied domain logic.
///
/// The engine owns state and scheduling; the plugin only knows how to
/// validate requests, fetch items, and build and remove files. Apart from the
/// side effects of [`acquire_and_deliver_item`](Self::acquire_and_deliver_item)
/// every operation must be deterministic for identical inputs.
#[async_trait]
pub trait OrderProcessor: Send + Sync {
    /// Returns the name of this plugin.
    fn name(&self) -> &str;

    /// Validate a raw option value and return its normalized form.
    fn validate_and_parse_option(&self, name: &str, raw: &str)
        -> Result<ParsedOption, PluginError>;

    /// Validate a raw protocol extension and return its normalized form.
    fn validate_and_parse_extension(
        &self,
        name: &str,
        raw: &str,
    ) -> Result<ParsedExtension, PluginError>;

    /// Fetch an item and deliver it.
    ///
    /// May be called more than once for the same item: after a retryable
    /// failure, after a worker crash, or when a timed out attempt is still
    /// running. Implementations must make repeated calls converge on a single
    /// delivery, typically by writing to a location derived from the request.
    async fn acquire_and_deliver_item(
        &self,
        request: &ItemRequest,
    ) -> Result<DeliveredItem, PluginError>;

    /// Bundle delivered files into one archive and return its location.
    async fn package_files(&self, request: &PackageRequest) -> Result<String, PluginError>;

    /// Delete the given locations whose files were created at or before
    /// `older_than`. Returns how many were deleted; missing locations are
    /// skipped.
    async fn clean_files(
        &self,
        older_than: DateTime<Utc>,
        locations: &[String],
    ) -> Result<usize, PluginError>;

    /// Catalog identifiers published in a timeslot, in delivery order.
    async fn subscription_batch_item_identifiers(
        &self,
        timeslot: Timeslot,
        collection: &str,
        options: &std::collections::BTreeMap<String, String>,
    ) -> Result<Vec<String>, PluginError>;

    /// Validity window of a new subscription.
    fn subscription_duration(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), PluginError>;
}

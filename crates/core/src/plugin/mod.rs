//! Processing plugin contract and the bundled local archive plugin.

mod error;
mod local;
mod traits;
mod types;

pub use error::PluginError;
pub use local::{verify_delivery, LocalArchiveProcessor};
pub use traits::OrderProcessor;
pub use types::{
    DeliveredItem, ItemRequest, PackageRequest, ParsedExtension, ParsedOption, Timeslot,
};

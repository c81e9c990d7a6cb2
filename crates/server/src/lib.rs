pub mod api;
pub mod engine;
pub mod metrics;
pub mod state;

pub use engine::Engine;

pub mod attributes;
pub mod config;
pub mod error;
pub mod types;

pub use attributes::*;
pub use config::{Config, GuardrailLimits, GuardrailUpdate};
pub use error::EnrichError;
pub use types::*;

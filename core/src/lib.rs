//! oci-relay Core - shared types for the replication engine
//!
//! Error taxonomy and configuration consumed by the engine crate and by
//! whatever binary embeds it.

pub mod config;
pub mod error;

pub use config::{RegistryProtocol, RelayConfig};
pub use error::{RelayError, Result};

/// oci-relay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # Colony Common
//!
//! Shared types, constants, and errors used across Colony components.
//!
//! ## Modules
//! - `types` - Records stored in the coordination store (NodeRecord, PluginRecord, etc.)
//! - `error` - Cluster error taxonomy
//! - `constants` - Store keys, channel names and protocol timings

pub mod constants;
pub mod error;
pub mod types;

pub use error::{ClusterError, Result};
pub use types::*;

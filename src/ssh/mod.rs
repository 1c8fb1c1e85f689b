//! Client-side SSH files
//!
//! This module owns everything written on the machine that connects to
//! containers: the known_hosts trust store and the per-container blocks in
//! the user's SSH client config.

pub mod address;
pub mod config;
pub mod config_file;
pub mod known_hosts;
pub mod sanitize;

// Re-exports
pub use address::RemoteHost;
pub use config::{render_block, SshProfile, TrustMode};
pub use config_file::SshConfigFile;
pub use known_hosts::{TrustEntry, TrustStore};
pub use sanitize::{quote_config_value, validate_alias};

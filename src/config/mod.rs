//! Configuration module for tun-dispatch
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tun_dispatch::config::{load_config, Config};
//!
//! let config = load_config("/etc/tun-dispatch/config.json").unwrap();
//! println!("UDP workers: {}", config.tunnel.workers());
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{Config, DeviceConfig, DialerConfig, DialerKind, LogConfig, StatsConfig};

//! This is the main library interface for this project

pub mod atap;
pub mod atfa;
pub mod audit;
pub mod audit_log;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod events;
pub mod fastboot;
pub mod key_ingest;
pub mod lock_map;
pub mod orchestrator;
pub mod product;
pub mod provision;
pub mod reboot;
pub mod registry;
pub mod serial_mapper;
pub mod steps;

pub use config::{Cli, Config};
pub use console::Console;
pub use error::{Error, Result};

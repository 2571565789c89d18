//! # drover-master
//!
//! Master side of drover.
//!
//! This crate provides:
//! - [`SlaveProxy`], one object per connected slave, translating typed
//!   method calls into protocol exchanges
//! - [`SlaveRegistry`], a concurrent collection supporting blocking lookup
//!   by predicate
//! - [`TcpSlaveListener`] for real slaves and [`LocalSlaveListener`] for
//!   in-process ones
//! - Master configuration loading (YAML file plus environment overrides)

pub mod config;
pub mod error;
pub mod listener;
pub mod local;
pub mod proxy;
pub mod registry;

pub use config::{ConfigError, MasterConfig};
pub use error::OpError;
pub use listener::{perform_handshake, SetupFuture, SetupHook, TcpSlaveListener};
pub use local::LocalSlaveListener;
pub use proxy::{SlaveProxy, StatKind};
pub use registry::SlaveRegistry;

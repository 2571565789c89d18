//! # drover-slave
//!
//! Slave side of drover.
//!
//! This crate provides:
//! - The versioned operation table and the dispatcher's `serve()` loop
//! - Operation sub-protocols: set_cwd, getenv, mkdir, execute, send, fetch,
//!   remove, rename, copy, stat
//! - Command execution with multiplexed stdout/stderr streaming
//! - The outbound-connecting slave entry point (`drover-slave` binary)

pub mod error;
pub mod exec;
pub mod ops;

pub use error::{OpFault, SlaveError};
pub use ops::{OpTable, SlaveServer};

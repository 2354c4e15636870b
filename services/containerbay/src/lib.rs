//! containerbay library.
//!
//! The crate ships the `containerbay` binary; the library surface exists so
//! the serving pipeline can be assembled in integration tests with fake
//! registries and DNS.

pub mod admission;
pub mod api;
pub mod cleanup;
pub mod config;
pub mod image;
pub mod resolve;
pub mod scheduler;
pub mod state;
pub mod store;

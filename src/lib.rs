//! Typed D-Bus proxies and discovery waits for integration tests.
//!
//! Interface descriptions are loaded with [`introspection::load`] and turned
//! into proxy types by [`proxy::ProxyType::generate`]. The functions in
//! [`wait`] block until a remote interface or property reaches the expected
//! state.

#![allow(clippy::len_zero, clippy::new_without_default)]

pub mod async_engine;
pub mod cancellable;
pub mod cli;
pub mod dbus;
pub mod introspection;
pub mod logger;
pub mod memory_bus;
pub mod proxy;
pub mod utils;
pub mod wait;

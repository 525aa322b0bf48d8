//! Core of a virtual network-device framework: session multiplexing, tx/rx pipelines, primacy
//! election, and deterministic teardown over shared-memory descriptor rings.
//!
//! The entry point is [`device::DeviceInterface`], constructed over a [`contract::DeviceImplementation`]
//! supplied by an embedder. Everything else — sessions, the tx/rx queues, VMO registration, status
//! watchers — is reached through it or through the [`session::Session`] handles it hands back from
//! [`device::DeviceInterface::open_session`].

pub mod config;
pub mod contract;
pub mod descriptor;
pub mod device;
pub mod ds;
pub mod fifo;
pub mod port;
pub mod status;
pub mod status_watcher;
pub mod vmo;

pub mod session;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

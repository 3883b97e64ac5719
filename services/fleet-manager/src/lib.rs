//! Runner fleet manager library.
//!
//! Reconciles a fleet of ephemeral single-use CI runner VMs across
//! virtualization backends. The crate primarily ships the `fleet-manager`
//! binary; the library surface exists for integration testing and reuse.

pub mod api;
pub mod backend;
pub mod capacity;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod inventory;
pub mod metrics;
pub mod platform;
pub mod provision;
pub mod reactive;
pub mod reconciler;
pub mod types;

pub use error::{FleetError, Result};

//! vap-playground library crate
//!
//! Interactive evaluation of Kubernetes ValidatingAdmissionPolicies against
//! editable sample resources, backed by an external expression engine.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod policy;
pub mod server;

pub use error::{Error, Result};
pub use health::HealthState;

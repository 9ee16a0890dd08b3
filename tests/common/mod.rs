//! Shared test support (used by unit, functional, and proptest)

#![allow(dead_code)]

pub mod fakes;

pub use fakes::*;
pub use fixtures::*;

//! Shared fixtures for the integration tests

#![allow(dead_code)]

pub mod fixtures;
pub mod sinks;
pub mod strategies;

pub use fixtures::*;

//! Fixtures and a scripted executor shared by the test suites.

pub mod deployment;
pub mod executor;
pub mod fixtures;

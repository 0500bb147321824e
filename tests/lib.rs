//! Shared fixtures for Chimera integration tests.

pub mod fixtures;

//! Testing utilities and mock implementations
//!
//! Lets runners, dispatchers and HMI handlers be exercised without an IoT
//! Hub or any network access.

pub mod mocks;

pub use mocks::*;

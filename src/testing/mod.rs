//! Testing utilities and mock implementations
//!
//! Mocks for the platform, session and response seams so listener behavior
//! can be tested without a broker or a real platform API.

pub mod mocks;

pub use mocks::*;

//! Testing helpers for use writing unit and integration tests of the `s3mask` crate
//!
//! This is internal to `s3mask` and is not intended for use by any other crates.  Breaking changes
//! can be made at any time.
pub mod logging;
pub mod masking_service;
pub mod test_data;

/// Test code that reports errors can just cheat and use `eyre`
pub type Result<T> = color_eyre::Result<T>;

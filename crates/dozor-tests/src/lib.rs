//! Integration test crate for the dozor operations engine.
//!
//! All tests live under `tests/`; this library exists so the crate can hold
//! shared fixtures if they ever grow beyond one file.

#![forbid(unsafe_code)]

//! This module contains utilities for testing code that uses the satellite engine. They are
//!  used for testing the engine itself, but they are also exported for application testing,
//!  which is why they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod transport;

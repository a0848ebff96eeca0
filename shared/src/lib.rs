//! snirelay shared library.
//!
//! TLS peeking, SNI extraction and the forwarding rule engine, kept
//! separate from the relay binary so they can be exercised in isolation.

pub mod error;
pub mod rules;
pub mod sni;
pub mod tls;

pub use error::{Error, Result};

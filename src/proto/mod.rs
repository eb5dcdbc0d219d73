//! RESP (Redis Serialization Protocol) codec.
//!
//! Provides encoding and decoding of RESP2 messages as exchanged with a
//! Redis server: streaming decode with partial-input handling, and command
//! encoding as arrays of bulk strings.
//!
//! ## Modules
//!
//! - [`codec`] - Encoder and decoder for the wire format
//! - [`error`] - Error types for the whole crate
//! - [`frame`] - Value types representing RESP data

#![warn(missing_docs)]

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;

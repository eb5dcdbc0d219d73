//! RESP protocol encoder and decoder.
//!
//! This module provides encoding and decoding functionality for Redis
//! Serialization Protocol (RESP) values.
//!
//! # Modules
//!
//! - [`encoder`] - Value encoding to bytes
//! - [`decoder`] - Streaming value decoder from bytes

pub mod decoder;
pub mod encoder;

pub use decoder::Decoder;
pub use encoder::{encode_value, Encoder};

//! # Redlink
//!
//! A single-connection Redis client core for Rust: RESP2 codec, FIFO
//! request/response correlation, publish/subscribe dispatch, and cooperative
//! pipelining with an explicit auto-flush switch.
//!
//! ## Features
//!
//! - `tls` - TLS/SSL support via rustls
//!
//! ## Example
//!
//! ```no_run
//! use redlink::{command, ConnectionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = ConnectionBuilder::new()
//!         .address("redis://localhost:6379")
//!         .connect()
//!         .await?;
//!     let _pong = conn.send(command::ping()).await?;
//!     conn.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod core;
pub mod proto;

// Re-export the connection surface for convenience
pub use crate::core::builder::ConnectionBuilder;
pub use crate::core::command::{self, Cmd, CommandSignature, Pipeline};
pub use crate::core::metrics::{report_metrics, set_report_metrics};
pub use crate::core::pubsub::{MessageReceiver, PubSubMessage, SubscriptionChangeHook};
pub use crate::core::{
    ClosureCallback, ConnectionState, Error, InstrumentedConnection, RedisConnection, Result,
};
pub use crate::proto::frame::RespValue;

//! Concurrent serial-port ingestion with bounded history, protocol framing
//! and live stream search.
//!
//! Serialscope opens any number of serial connections, keeps a bounded
//! window of each one's raw bytes, cuts the stream into protocol frames and
//! reports pattern matches, all published on one ordered event feed per
//! connection.
//!
//! # Features
//!
//! - **Bounded memory**: a hard per-connection ceiling with FIFO eviction and
//!   optional archiving of evicted ranges
//! - **Framing**: Modbus RTU, start/end marker and length-prefixed framings,
//!   delimiter or quiet-gap framing for text protocols
//! - **Search**: literal, hex with wildcard nibbles and regex filters,
//!   including matches split across reads
//! - **Isolation**: every connection runs on its own tasks, so a slow or
//!   failing port never stalls the others
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use serialscope::config::{ConnectionConfig, OrchestratorConfig, RecognizerSpec};
//! use serialscope::stream::EventStreamExt;
//! use serialscope::transports::ChannelConnector;
//! use serialscope::Orchestrator;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> serialscope::Result<()> {
//!     let connector = ChannelConnector::new();
//!     let device = connector.add_port("bus0");
//!     let orchestrator = Orchestrator::new(Arc::new(connector), OrchestratorConfig::default());
//!
//!     let config = ConnectionConfig::new("bus0")
//!         .with_recognizers(vec![RecognizerSpec::modbus_rtu(10)]);
//!     let id = orchestrator.open_connection(config).await?;
//!     let mut frames = orchestrator.subscribe(id)?.frames();
//!
//!     device.feed(vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
//!     if let Some(frame) = frames.next().await {
//!         println!("{} frame at {}: valid={}", frame.protocol, frame.range, frame.valid);
//!     }
//!
//!     orchestrator.close_connection(id).await?;
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

pub mod checksum;
pub mod config;

// Pipeline stages
pub mod buffer;
pub mod detector;
pub mod filter;

// Transport boundary
pub mod transport;
pub mod transports;

// Runtime
mod orchestrator;
mod pipeline;
pub mod stream;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use orchestrator::{Ack, CloseMode, ConnectionInfo, Orchestrator};
pub use pipeline::ConnectionStats;
pub use stream::{EventStream, EventStreamExt};

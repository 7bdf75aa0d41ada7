//! Core data types shared by every pipeline stage.
//!
//! ## Architecture
//!
//! - [`ByteChunk`] is what a transport delivers, stamped with a sequence
//!   number and its logical offset
//! - [`ByteRange`] addresses the logical stream; offsets survive eviction
//! - [`Frame`] and [`MatchEvent`] are immutable results of detection and search
//! - [`ConnectionEvent`] is the ordered feed handed to subscribers
//! - [`TimeWindow`] narrows history queries to an arrival-time span
//!
//! ## Usage Example
//!
//! ```rust
//! use serialscope::types::{ByteChunk, ByteRange};
//! use std::time::SystemTime;
//!
//! let chunk = ByteChunk::new(0, 100, b"hello".to_vec(), SystemTime::now());
//! assert_eq!(chunk.range(), ByteRange::new(100, 105));
//! assert!(chunk.range().covers(&ByteRange::new(101, 103)));
//! ```

mod chunk;
mod event;
mod frame;
mod range;
mod window;

pub use chunk::ByteChunk;
pub use event::{ConnectionEvent, ConnectionState, FilterMode, MatchEvent};
pub use frame::{Frame, ProtocolTag};
pub use range::{ByteRange, ConnectionId};
pub use window::TimeWindow;

//! Stream utilities for the event feed

mod events;

pub use events::{EventStream, EventStreamExt};

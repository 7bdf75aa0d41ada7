//! Bundled [`Connector`](crate::transport::Connector) implementations.
//!
//! - [`ChannelConnector`]: simulated ports driven from the same process
//! - [`ReplayConnector`]: recorded captures played back at a fixed pace

mod channel;
mod replay;

pub use channel::{ChannelConnector, SimulatedPort};
pub use replay::ReplayConnector;

//! # Tether Channel - persistent event channel to the control plane
//!
//! Two layers:
//!
//! - [`Channel`]: a framed duplex transport with an inbound pump, an
//!   outbound pump and a heartbeat, each an explicit worker with its own
//!   cancellation token
//! - [`ProtocolClient`]: the session on top of it; waits for the open and
//!   namespace-connect packets, then routes application events through a
//!   static [`EventRouter`]
//!
//! Delivery is best effort and at most once. Neither layer reconnects; the
//! owner watches [`ProtocolClient::disconnected`] and decides.
//!
//! Transports plug in through [`Connector`]. [`WebSocketConnector`] is the
//! production transport; [`memory_transport`] pairs an in-process connector
//! with a listener for tests.

#![deny(unsafe_code)]

pub mod channel;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod memory;
pub mod router;
pub mod transport;

pub use channel::{
    Channel, ChannelConfig, CloseReason, CloseSignal, FrameHandler, FrameSender, HeartbeatMode,
    HeartbeatTiming,
};
pub use client::{ClientConfig, ClientState, ProtocolClient};
pub use endpoint::{socket_url, DEFAULT_ENGINE_VERSION};
pub use error::{ChannelError, ChannelResult};
pub use frame::{Frame, OpenPayload};
pub use memory::{memory_transport, MemoryConnector, MemoryListener, MemoryPeer};
pub use router::EventRouter;
pub use transport::{Connector, FrameSink, FrameStream, WebSocketConnector};

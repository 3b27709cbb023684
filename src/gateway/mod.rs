//! Remote worker gateway.
//!
//! Owns the duplex channel to each connected host:
//! - **Outbound**: `execute` and `cancel` frames, queued without blocking
//! - **Inbound**: heartbeats and outcomes, turned into [`HostEvent`]s and
//!   routed to the job worker of the host's group
//!
//! The transport is a WebSocket ([`handler::ws_handler`]); the connection
//! bookkeeping in [`HostGateway`] is transport-agnostic.

pub mod connection;
pub mod handler;
pub mod messages;

pub use connection::{ConnectionId, EventRouter, HostCommandSender, HostGateway};
pub use messages::{HostEvent, HostMessage, ServerMessage};

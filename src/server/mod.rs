//! Multi-client server core
//!
//! Transports accept connections and register a [`channel::QueueChannel`]
//! per client; the [`controller::Controller`] multiplexes every registered
//! channel and answers requests through the [`dispatch::CommandDispatcher`].

pub mod channel;
pub mod controller;
pub mod dispatch;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod telnet;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

pub use channel::{ChannelId, ClientChannel, ClientHandle, QueueChannel};
pub use controller::{Controller, ControllerBuilder, ControllerState};
pub use dispatch::{Command, CommandDispatcher, ControlSignal, Outcome};
pub use protocol::{Reply, Request};
pub use registry::ClientRegistry;
pub use transport::{ServerTransport, TcpTransport};

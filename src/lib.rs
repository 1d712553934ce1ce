//! hubwire - real-time hub messaging.
//!
//! Clients hold persistent connections to a hub, negotiate a wire protocol,
//! and call server methods by name (with results, server-to-client streams
//! and client-to-server upload streams). The server addresses clients
//! individually, by user, by group or all at once, across one process or
//! many joined through a backplane.
//!
//! # Architecture
//!
//! ```text
//! transport ─► framing ─► handshake ─► HubProtocol ─► dispatcher ─► hub methods
//!                                                          │
//!                  connection writer ◄── lifetime manager ◄┘
//!                                              │
//!                                          backplane (optional)
//! ```
//!
//! # Modules
//!
//! - [`framing`] - Length-prefixed and separator-terminated frames
//! - [`handshake`] - Protocol negotiation
//! - [`protocol`] - Hub message model and the JSON / MessagePack / CBOR codecs
//! - [`connection`] - Per-connection state, writer, keepalive and handler
//! - [`dispatcher`] - Method table and invocation routing
//! - [`lifetime`] - Membership registry and fan-out
//! - [`backplane`] - Cross-server fan-out
//! - [`server`] - Wiring and the TCP accept loop
//! - [`config`] - Options loading

pub mod backplane;
pub mod config;
pub mod connection;
pub mod constants;
pub mod dispatcher;
pub mod framing;
pub mod handshake;
pub mod lifetime;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use backplane::{Backplane, BackplaneHubLifetimeManager, BackplaneOptions, InMemoryBackplane};
pub use config::HubOptions;
pub use connection::{ConnectionInfo, HubConnectionContext, HubConnectionHandler};
pub use dispatcher::{HubCallContext, HubException, HubMethods, HubReturn, MethodSpec};
pub use lifetime::{DefaultHubLifetimeManager, HubLifetimeManager, LifetimeError};
pub use protocol::{HubMessage, HubProtocol, ParamType, ProtocolRegistry};
pub use server::{HubContext, HubServer};

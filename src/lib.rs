//! # A one-to-one TCP chat relay.
//!
//! Clients connect over plain TCP and talk in newline delimited text. Outside of a chat a client
//! can:
//!
//! 1. Register a nickname for its connection with `login <name>`.
//! 2. Start a chat with another connected account with `chat <name>`.
//!
//! Once a chat is running every line either side types shows up at the other side as
//! `<name>: <line>`. Either side sends `\q` to end it, after which both go back to sending
//! commands.
//!
//! There is no authentication, encryption or persistence; all state lives in memory.
//!
//! Architecture:
//!
//! ```text
//!  TcpListener
//!     v
//!  accept loop --handoff channel--> Session (one task per socket) <---> Hub
//!                                      |   ^                         (names, addrs,
//!                                      |   |                          live connections)
//!                                      v   |
//!                                    Relay (two forwarder tasks per chat)
//!                                      |
//!                          UnboundedLineChannel
//!                                      v
//!  TcpStream <-LineCodec-- writer task (one per socket)
//! ```
//!
//! Shutdown goes through one `CancellationToken`. Every read is raced against it, and the server
//! closes its listener only after every connection and relay task has returned.

pub mod client;
pub mod codec;
pub mod command;
pub mod error;
pub mod hub;
pub mod relay;
pub mod server;
pub mod session;

pub use error::{Error, Result};
pub use server::{Config, Server};

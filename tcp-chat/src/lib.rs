//! Publish/subscribe chat over plain TCP.
//!
//! Clients introduce themselves, create or subscribe to named conversations,
//! and post messages that the server fans out to every subscriber. Frames are
//! JSON records terminated by `\r\n`.
//!
//! - [`frame`] carves frames out of a byte stream and writes them back.
//! - [`envelope`] holds the records on the wire and decodes their payloads
//!   into typed operations and events.
//! - [`registry`] is the server's store of conversations.
//! - [`router`] tracks live sessions and their subscriptions and fans
//!   messages out to per-session mailboxes.
//! - `session` runs one connection: handshake, operation loop, teardown.
//! - [`server`] accepts connections and owns the shared state.
//! - [`client`] issues operations from terminal commands and renders what
//!   the server sends back.
//! - [`prompt`] and [`cli`] parse user input and command-line flags.

pub mod cli;
pub mod client;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod prompt;
pub mod registry;
pub mod router;
pub mod server;
mod session;

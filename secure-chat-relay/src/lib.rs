//! Encrypted direct-message relay.
//!
//! Clients connect over TCP, swap toy-RSA public keys with the relay and then
//! send each other direct messages addressed as `user/text`. The relay
//! decrypts every message with its own key and re-encrypts it for the
//! recipient. Each module has one responsibility:
//!
//! - [`server`] runs the accept loop, handshakes new connections and
//!   supervises one worker task per client.
//! - [`handshake`] implements the one-shot key exchange.
//! - [`registry`] is the shared table of sessions behind a single mutex.
//! - [`worker`] is the per-connection receive loop and teardown.
//! - [`router`] decides what a decrypted message means and forwards it.
//! - [`cipher`] is the toy cipher and its text serialization.
//! - [`frame`] reads and writes frames, where one socket read is one message.
//! - [`client`] is the client library and interactive terminal client.
//! - [`cli`] and [`config`] parse the command line into runtime settings.
//!
//! Framing has no length prefix. A message larger than the read buffer, or
//! two messages that land in one read, are not reassembled.

pub mod cipher;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod registry;
pub mod router;
pub mod server;
pub mod worker;

//! Call correlation, message framing and dispatch for skein RPC.
//!
//! A client assigns each call a sequence id, records it as pending and
//! matches replies back by that id, in whatever order they arrive. A server
//! looks up the handler for each inbound request and sends back exactly one
//! reply or exception (none for one-way calls). Transports move whole
//! messages; byte-stream transports length-prefix them.
#![forbid(unsafe_code)]

mod client;
mod config;
mod dispatch;
mod error;
mod frame;
mod outbound;
mod pending;
mod reassembly;
mod server;
pub mod transport;

pub use client::*;
pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use frame::*;
pub use outbound::*;
pub use pending::*;
pub use reassembly::*;
pub use server::*;
pub use transport::Transport;

pub use skein_wire;
pub use skein_wire::{
    ApplicationError, Envelope, ErrorKind, MessageKind, Protocol, SequenceId,
};

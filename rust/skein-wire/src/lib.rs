//! Wire-level types for skein RPC.
//!
//! Everything here is pure data: the [`Envelope`] that heads every message,
//! the [`ApplicationError`] carried by EXCEPTION replies, and the
//! [`Protocol`] capability that encodes envelopes and bodies. No I/O.
//!
//! A message on the wire is an encoded envelope immediately followed by an
//! encoded body. Transports add their own boundaries around whole messages
//! (length prefixes, WebSocket messages, HTTP bodies).

#![forbid(unsafe_code)]

mod codec;
mod envelope;
mod error;

pub use codec::*;
pub use envelope::*;
pub use error::*;

//! Sans-IO fragmentation, sequencing, and reliability engine shared by every
//! channel of every connected client.
//!
//! This crate has no socket, no async runtime, and no notion of wall-clock
//! time beyond the `now` values callers pass in - the same split the teacher
//! draws between `aeronet_proto` (this crate's role) and the crate that
//! actually owns a transport (`gamenet-server`'s role here).

#![warn(missing_docs)]

pub mod ack;
pub mod coalesce;
pub mod controller;
pub mod error;
pub mod header;
pub mod sequence_buffer;
pub mod seq;
pub mod varint;

pub use ack::Ack;
pub use controller::{ReceiveOutput, ReliablePacketController, SendOutput};
pub use error::{CoalesceError, RecvError, SendError};
pub use header::{FragmentInfo, PacketHeader};
pub use seq::Seq;

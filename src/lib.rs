//! Device-to-device account transfer over the local network.
//!
//! One device (the source) listens on its wireless interface and shows a
//! pairing code; the other (the destination) dials in, proves it belongs to
//! the same account, and receives every record and attachment over a single
//! framed TCP stream.

pub mod checksum;
pub mod config;
pub mod network;
pub mod pairing;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transfer;

pub use config::TransferConfig;
pub use session::{DestinationSession, FailureReason, SessionState, SourceSession};

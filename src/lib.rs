//! Cancellable background packet operations: send, send/receive correlation
//! and sniffing, all driven through the [`Operation`] lifecycle.

pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod monitor;
pub mod net;
pub mod packet;
pub mod progress;
mod recv;
pub mod send;
pub mod sendrecv;
pub mod sniff;
pub mod state;
pub mod worker;

#[cfg(test)]
mod testing;

pub use capture::StaticContext;
pub use context::Operation;
pub use error::{Error, Result};
pub use packet::MetaPacket;
pub use send::SendContext;
pub use sendrecv::{SendReceiveContext, Stats};
pub use sniff::{SniffContext, StopConditions};
pub use state::State;

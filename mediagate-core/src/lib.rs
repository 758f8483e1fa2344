//! mediagate core: everything between a socket that produces media and a
//! socket (or file) that consumes it.
//!
//! Data flows ingest adapter -> [`bus::FrameBus`] -> output adapters and the
//! recording engine. The [`session::SessionManager`] owns stream lifecycles and
//! is the entry point used by the binary and the protocol listeners.

pub mod bus;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod logging;
pub mod output;
pub mod recording;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod util;

pub use error::{ErrorKind, GatewayError, Result};
pub use frame::{CodecTag, Frame, Protocol, StreamKey, TrackInfo, TrackKind};

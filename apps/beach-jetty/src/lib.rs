//! Rendezvous relay between raw TCP peers and a path-addressable control
//! plane. A peer connects, later announces itself out-of-band, and from then
//! on receives the commands written under its identity and reports output
//! back.

pub mod acceptor;
pub mod cli;
pub mod codec;
pub mod config;
pub mod console;
pub mod control_plane;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod lifecycle;
pub mod pending;
pub mod reaper;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use engine::{RegistrationOutcome, RegistrationRequest, RelayEngine};
pub use error::{RelayError, RelayResult};

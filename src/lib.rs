//! ICMP echo prober: sends echo requests to one host over a raw socket and
//! reports per-probe outcomes and round-trip statistics.

pub mod args;
pub mod config;
pub mod engine;
pub mod error;
pub mod icmp;
pub mod resolve;
pub mod stats;
pub mod supervisor;
pub mod transport;

pub use config::ProbeConfig;
pub use engine::{Engine, ProbeOutcome, run_probe};
pub use error::{DecodeError, ResolveError, TransportError};
pub use icmp::Family;
pub use stats::Statistics;
pub use supervisor::Interrupt;
pub use transport::{Datagram, Transport};

use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::icmp::Family;

/// Failure to parse an inbound ICMP message.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("echo body truncated: expected {expected} bytes, got {actual}")]
    TruncatedEcho { expected: usize, actual: usize },

    #[error("checksum mismatch: carried {carried:#06x}, computed {computed:#06x}")]
    BadChecksum { carried: u16, computed: u16 },
}

/// Errors raised by a raw ICMP socket session.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(
        "failed to open {family} ICMP socket: {source} (raw sockets need root or CAP_NET_RAW)"
    )]
    Open {
        family: Family,
        #[source]
        source: io::Error,
    },

    #[error("unknown network interface {name}: {source}")]
    UnknownInterface {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind socket to interface {name}: {source}")]
    BindInterface {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to set {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Send(#[source] io::Error),

    #[error("receive deadline exceeded")]
    Timeout,

    #[error("{0}")]
    Receive(#[source] io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Errors from turning a host name or address literal into a destination.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("only one -4 or -6 option may be specified")]
    ConflictingFamilies,

    #[error("could not resolve {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no {family} address found for {host}")]
    NoAddress { host: String, family: Family },

    #[error("address {addr} does not match the requested family {family}")]
    FamilyMismatch { addr: IpAddr, family: Family },
}

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::args::Args;
use crate::icmp::Family;

/// Runtime configuration of one probe run
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Name the operator typed, used in the report
    pub target: String,
    /// Resolved address to probe
    pub destination: IpAddr,
    /// Interface to pin the socket to
    pub interface: Option<String>,
    /// TTL / hop limit of outgoing probes
    pub ttl: u8,
    /// Number of probes to send
    pub count: u64,
    /// Pause between probes
    pub interval: Duration,
    /// How long to wait for each reply
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: "127.0.0.1".to_string(),
            destination: IpAddr::V4(Ipv4Addr::LOCALHOST),
            interface: None,
            ttl: 64,
            count: 5,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(4),
        }
    }
}

impl ProbeConfig {
    pub fn new(args: &Args, destination: IpAddr) -> Self {
        Self {
            target: args.target.clone(),
            destination,
            interface: args.iface.clone(),
            ttl: args.ttl,
            count: args.count,
            interval: args.interval_duration(),
            timeout: args.timeout_duration(),
        }
    }

    pub fn family(&self) -> Family {
        Family::of(&self.destination)
    }
}

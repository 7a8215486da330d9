use anyhow::{Result, anyhow, bail};
use clap::Parser;
use std::time::Duration;

use crate::resolve::AddressPreference;

/// Send ICMP ECHO_REQUEST to a network host and report round-trip times
#[derive(Parser, Debug, Clone)]
#[command(name = "pinger")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "Raw sockets need root privileges or CAP_NET_RAW.")]
pub struct Args {
    /// Host name or IP address to probe
    pub target: String,

    /// Use IPv4 for name resolution
    #[arg(short = '4', long = "ipv4")]
    pub ipv4: bool,

    /// Use IPv6 for name resolution
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Network interface to send from
    #[arg(short = 'I', long = "iface")]
    pub iface: Option<String>,

    /// Time to live / hop limit of outgoing probes
    #[arg(short = 't', long = "ttl", default_value = "64", value_parser = clap::value_parser!(u8).range(1..))]
    pub ttl: u8,

    /// Stop after sending this many probes
    #[arg(short = 'c', long = "count", default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    pub count: u64,

    /// Seconds between probes
    #[arg(short = 'i', long = "interval", default_value = "1.0")]
    pub interval: f64,

    /// Seconds to wait for each reply
    #[arg(short = 'W', long = "timeout", default_value = "4.0")]
    pub timeout: f64,
}

/// Upper bound for `-i` and `-W`
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

impl Args {
    pub fn validate(&self) -> Result<()> {
        seconds("interval", self.interval)?;
        let timeout = seconds("timeout", self.timeout)?;
        if timeout.is_zero() {
            bail!("invalid timeout: {}", self.timeout);
        }
        Ok(())
    }

    pub fn preference(&self) -> AddressPreference {
        AddressPreference {
            prefer_v4: self.ipv4,
            prefer_v6: self.ipv6,
        }
    }

    /// Values `validate` would reject fall back to zero or `MAX_WAIT`.
    pub fn interval_duration(&self) -> Duration {
        clamp_seconds(self.interval)
    }

    pub fn timeout_duration(&self) -> Duration {
        clamp_seconds(self.timeout)
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    let duration =
        Duration::try_from_secs_f64(value).map_err(|_| anyhow!("invalid {}: {}", name, value))?;
    if duration > MAX_WAIT {
        bail!(
            "invalid {}: {} (at most {} seconds)",
            name,
            value,
            MAX_WAIT.as_secs()
        );
    }
    Ok(duration)
}

fn clamp_seconds(value: f64) -> Duration {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) => duration.min(MAX_WAIT),
        Err(_) if value > 0.0 => MAX_WAIT,
        Err(_) => Duration::ZERO,
    }
}

//! The probe loop.
//!
//! Strictly one probe in flight: request `n + 1` is only sent once the
//! outcome of request `n` is known.

use std::fmt;
use std::io::{self, Write};
use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::error::{DecodeError, TransportError};
use crate::icmp::{self, Discovery, EchoRequest, Family, Message, MessageKind, PAYLOAD_LEN};
use crate::stats::Statistics;
use crate::supervisor::{Interrupt, POLL_SLICE, deadline_after};
use crate::transport::{Datagram, IcmpV4Socket, IcmpV6Socket, Transport};

/// What happened to one probe.
#[derive(Debug)]
pub enum ProbeOutcome {
    Success {
        bytes: usize,
        peer: IpAddr,
        sequence: u16,
        hop_limit: u8,
        rtt_ms: f64,
    },
    Timeout,
    Unreachable {
        peer: IpAddr,
    },
    TimeExceeded {
        peer: IpAddr,
    },
    /// IPv6 neighbor / router discovery, neither a reply nor a failure
    Informational {
        peer: IpAddr,
        kind: Discovery,
    },
    Unclassified {
        peer: IpAddr,
        icmp_type: u8,
    },
    ParseError(DecodeError),
    SendError(TransportError),
    ReceiveError(TransportError),
}

impl ProbeOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success { .. } | Self::Informational { .. })
    }

    /// The console line for this outcome.
    pub fn report(&self, sequence: u16, family: Family) -> Report<'_> {
        Report {
            outcome: self,
            sequence,
            family,
        }
    }
}

/// Display adapter producing one console line.
pub struct Report<'a> {
    outcome: &'a ProbeOutcome,
    sequence: u16,
    family: Family,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seq = self.sequence;
        match self.outcome {
            ProbeOutcome::Success {
                bytes,
                peer,
                sequence,
                hop_limit,
                rtt_ms,
            } => write!(
                f,
                "{} bytes from {}: icmp_seq={} ttl={} time={:.3} ms",
                bytes, peer, sequence, hop_limit, rtt_ms
            ),
            ProbeOutcome::Timeout => write!(f, "Request timeout for icmp_seq {}", seq),
            ProbeOutcome::Unreachable { peer } => write!(
                f,
                "From {} icmp_seq={}: Destination Host Unreachable",
                peer, seq
            ),
            ProbeOutcome::TimeExceeded { peer } => {
                let what = match self.family {
                    Family::V4 => "Time To Live Exceeded",
                    Family::V6 => "Hop Limit Exceeded",
                };
                write!(f, "From {} icmp_seq={}: {}", peer, seq, what)
            }
            ProbeOutcome::Informational { peer, kind } => write!(
                f,
                "From {} icmp_seq={}: IPv6 specific information: {}",
                peer, seq, kind
            ),
            ProbeOutcome::Unclassified { peer, icmp_type } => {
                write!(f, "From {} icmp_seq={}: ICMP type: {}", peer, seq, icmp_type)
            }
            ProbeOutcome::ParseError(e) => write!(f, "Error parsing ICMP response: {}", e),
            ProbeOutcome::SendError(e) => write!(f, "Error sending ICMP packet: {}", e),
            ProbeOutcome::ReceiveError(e) => write!(f, "Error reading ICMP response: {}", e),
        }
    }
}

/// Drives probes over a [`Transport`] and writes the report to `out`.
pub struct Engine<T: Transport, W: Write> {
    transport: T,
    out: W,
    config: ProbeConfig,
    identifier: u16,
    interrupt: Interrupt,
    stats: Statistics,
}

impl<T: Transport, W: Write> Engine<T, W> {
    pub fn new(
        transport: T,
        out: W,
        config: ProbeConfig,
        identifier: u16,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            transport,
            out,
            config,
            identifier,
            interrupt,
            stats: Statistics::new(),
        }
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Runs every probe, then writes the summary. Stops early, still writing
    /// the summary, once the interrupt is raised.
    pub fn run(mut self) -> io::Result<(Statistics, T)> {
        for index in 0..self.config.count {
            if self.interrupt.is_raised() {
                break;
            }
            // The wire field wraps, the count does not
            let sequence = index as u16;
            let Some(outcome) = self.probe(sequence) else {
                break;
            };
            writeln!(self.out, "{}", outcome.report(sequence, self.transport.family()))?;

            if index + 1 < self.config.count && !self.interrupt.sleep(self.config.interval) {
                break;
            }
        }

        if self.interrupt.is_raised() {
            info!(transmitted = self.stats.transmitted, "run interrupted");
        }
        writeln!(self.out)?;
        write!(self.out, "{}", self.stats.summary(&self.config.target))?;
        self.out.flush()?;
        Ok((self.stats, self.transport))
    }

    /// Sends one probe and settles its outcome, updating the statistics.
    ///
    /// Returns `None` when the interrupt is raised while waiting; that probe
    /// counts as transmitted but gets no outcome.
    pub fn probe(&mut self, sequence: u16) -> Option<ProbeOutcome> {
        let family = self.transport.family();
        // Build the request for this sequence number
        let request = EchoRequest::new(self.identifier, sequence).encode(family);

        // Counted before the send, so a failed send is still a lost probe
        self.stats.record_transmit();
        let outcome = match self.transport.send(self.config.destination, &request) {
            Ok(sent_at) => self.await_reply(sequence, sent_at)?,
            // Nothing on the wire, nothing to wait for
            Err(e) => ProbeOutcome::SendError(e),
        };

        // Fold the outcome into the statistics
        match &outcome {
            ProbeOutcome::Success { rtt_ms, .. } => self.stats.record_latency(*rtt_ms),
            o if o.is_error() => self.stats.record_error(),
            _ => {}
        }
        Some(outcome)
    }

    fn await_reply(&mut self, sequence: u16, sent_at: Instant) -> Option<ProbeOutcome> {
        let family = self.transport.family();
        let deadline = deadline_after(sent_at, self.config.timeout);

        loop {
            if self.interrupt.is_raised() {
                return None;
            }
            // Short slices keep the interrupt responsive
            let slice_end = deadline.min(Instant::now() + POLL_SLICE);

            let datagram = match self.transport.receive_with_deadline(slice_end) {
                Ok(datagram) => datagram,
                // Only the last slice turns into a timeout
                Err(e) if e.is_timeout() => {
                    if slice_end >= deadline {
                        return Some(ProbeOutcome::Timeout);
                    }
                    continue;
                }
                Err(e) => return Some(ProbeOutcome::ReceiveError(e)),
            };

            // Unparseable input settles the probe as an error
            let message = match icmp::decode(family, &datagram.bytes) {
                Ok(message) => message,
                Err(e) => return Some(ProbeOutcome::ParseError(e)),
            };

            // Anything for another probe is dropped and the wait goes on
            match self.classify(sequence, sent_at, &message, &datagram) {
                Some(outcome) => return Some(outcome),
                None => debug!(
                    peer = %datagram.peer,
                    icmp_type = message.icmp_type,
                    echo = ?message.echo,
                    "skipping datagram for another probe"
                ),
            }
        }
    }

    /// `None` for datagrams that belong to some other probe.
    fn classify(
        &self,
        sequence: u16,
        sent_at: Instant,
        message: &Message,
        datagram: &Datagram,
    ) -> Option<ProbeOutcome> {
        let peer = datagram.peer;
        let ours = message.matches(self.identifier, sequence);

        match message.kind {
            // Our own request, looped back, or someone else's
            MessageKind::EchoRequest => None,
            MessageKind::EchoReply => match ours {
                Some(true) => Some(ProbeOutcome::Success {
                    bytes: message.len,
                    peer,
                    sequence,
                    hop_limit: datagram.hop_limit,
                    rtt_ms: datagram
                        .received_at
                        .saturating_duration_since(sent_at)
                        .as_secs_f64()
                        * 1000.0,
                }),
                _ => None,
            },
            // A quote that is not ours means the error is about another probe
            _ if ours == Some(false) => None,
            MessageKind::DestinationUnreachable => Some(ProbeOutcome::Unreachable { peer }),
            MessageKind::TimeExceeded => Some(ProbeOutcome::TimeExceeded { peer }),
            MessageKind::Discovery(kind) => Some(ProbeOutcome::Informational { peer, kind }),
            MessageKind::Other => Some(ProbeOutcome::Unclassified {
                peer,
                icmp_type: message.icmp_type,
            }),
        }
    }
}

/// Runs a complete probe session against `config.destination`.
///
/// Socket or interface failures are fatal and yield a failing exit code
/// without a summary. Per-probe failures never change the exit code.
pub fn run_probe(config: &ProbeConfig, interrupt: Interrupt) -> ExitCode {
    match execute(config, interrupt) {
        Ok(stats) => {
            debug!(?stats, "probe run finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(config: &ProbeConfig, interrupt: Interrupt) -> Result<Statistics> {
    // Tells our replies apart from other ICMP traffic on the socket
    let identifier = std::process::id() as u16;
    let interface = config.interface.as_deref();

    match config.family() {
        Family::V4 => drive(IcmpV4Socket::open(interface)?, config, identifier, interrupt),
        Family::V6 => drive(IcmpV6Socket::open(interface)?, config, identifier, interrupt),
    }
}

fn drive<T: Transport>(
    mut transport: T,
    config: &ProbeConfig,
    identifier: u16,
    interrupt: Interrupt,
) -> Result<Statistics> {
    transport
        .set_hop_limit(config.ttl)
        .context("failed to configure hop limit")?;

    let mut out = io::stdout().lock();
    match &config.interface {
        Some(iface) => writeln!(
            out,
            "PING {} ({}): {} data bytes via {}",
            config.target, config.destination, PAYLOAD_LEN, iface
        )?,
        None => writeln!(
            out,
            "PING {} ({}): {} data bytes",
            config.target, config.destination, PAYLOAD_LEN
        )?,
    }

    let engine = Engine::new(transport, out, config.clone(), identifier, interrupt);
    let (stats, _transport) = engine.run().context("failed to write report")?;
    Ok(stats)
}

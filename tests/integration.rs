//! Integration tests for the send -> receive -> classify -> stats pipeline
//!
//! A scripted transport stands in for the raw socket, so these run without
//! privileges or network access. Latencies are exact: the transport stamps
//! each reply a fixed offset after the send instant it handed out.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use pinger::icmp::{EchoRequest, checksum};
use pinger::{
    Datagram, Engine, Family, Interrupt, ProbeConfig, ProbeOutcome, Statistics, Transport,
    TransportError,
};

const IDENT: u16 = 0x4242;
const TTL: u8 = 57;

fn v4_dest() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
}

fn v6_dest() -> IpAddr {
    "2001:db8::1".parse().unwrap()
}

enum Step {
    /// Echo reply for the probe in flight, after this many ms
    Reply(u64),
    /// Arbitrary ICMP bytes from a peer
    Raw(IpAddr, Vec<u8>),
    Timeout,
    SendFails,
}

struct ScriptedTransport {
    family: Family,
    script: VecDeque<Step>,
    sent: Vec<u16>,
    last_send: Option<(u16, Instant)>,
    hop_limit: u8,
    /// Raise this interrupt once the n-th probe is on the wire
    interrupt_after: Option<(usize, Interrupt)>,
}

impl ScriptedTransport {
    fn new(family: Family, script: Vec<Step>) -> Self {
        Self {
            family,
            script: script.into(),
            sent: Vec::new(),
            last_send: None,
            hop_limit: 64,
            interrupt_after: None,
        }
    }
}

impl Transport for ScriptedTransport {
    fn family(&self) -> Family {
        self.family
    }

    fn set_hop_limit(&mut self, hops: u8) -> Result<(), TransportError> {
        self.hop_limit = hops;
        Ok(())
    }

    fn send(&mut self, _destination: IpAddr, bytes: &[u8]) -> Result<Instant, TransportError> {
        if matches!(self.script.front(), Some(Step::SendFails)) {
            self.script.pop_front();
            return Err(TransportError::Send(std::io::Error::from(
                std::io::ErrorKind::NetworkUnreachable,
            )));
        }
        let sequence = u16::from_be_bytes([bytes[6], bytes[7]]);
        let now = Instant::now();
        self.sent.push(sequence);
        self.last_send = Some((sequence, now));

        if let Some((n, interrupt)) = &self.interrupt_after {
            if self.sent.len() == *n {
                interrupt.raise();
            }
        }
        Ok(now)
    }

    fn receive_with_deadline(&mut self, _deadline: Instant) -> Result<Datagram, TransportError> {
        let (sequence, sent_at) = self.last_send.expect("receive before send");
        match self.script.pop_front() {
            Some(Step::Reply(ms)) => Ok(Datagram {
                bytes: echo_reply(self.family, IDENT, sequence),
                hop_limit: TTL,
                peer: match self.family {
                    Family::V4 => v4_dest(),
                    Family::V6 => v6_dest(),
                },
                received_at: sent_at + Duration::from_millis(ms),
            }),
            Some(Step::Raw(peer, bytes)) => Ok(Datagram {
                bytes,
                hop_limit: TTL,
                peer,
                received_at: sent_at + Duration::from_millis(1),
            }),
            Some(Step::Timeout) | None => Err(TransportError::Timeout),
            Some(Step::SendFails) => panic!("send failure scripted where a reply was expected"),
        }
    }
}

fn with_checksum(mut msg: Vec<u8>) -> Vec<u8> {
    msg[2] = 0;
    msg[3] = 0;
    let csum = checksum(&msg);
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    msg
}

fn echo_reply(family: Family, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut msg = EchoRequest::new(identifier, sequence).encode(family);
    match family {
        Family::V4 => {
            msg[0] = 0;
            with_checksum(msg)
        }
        Family::V6 => {
            msg[0] = 129;
            msg
        }
    }
}

/// ICMPv4 error message quoting an echo request.
fn v4_error_quoting(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut msg = vec![icmp_type, 0, 0, 0, 0, 0, 0, 0];
    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[9] = 1;
    msg.extend_from_slice(&ip);
    msg.extend_from_slice(&EchoRequest::new(identifier, sequence).encode(Family::V4)[..8]);
    with_checksum(msg)
}

fn config(destination: IpAddr, count: u64) -> ProbeConfig {
    ProbeConfig {
        target: "test-host".to_string(),
        destination,
        count,
        interval: Duration::ZERO,
        timeout: Duration::ZERO,
        ..ProbeConfig::default()
    }
}

fn run(
    transport: ScriptedTransport,
    config: ProbeConfig,
    interrupt: Interrupt,
) -> (Statistics, ScriptedTransport, Vec<String>) {
    let mut out = Vec::new();
    let engine = Engine::new(transport, &mut out, config, IDENT, interrupt);
    let (stats, transport) = engine.run().unwrap();
    let lines = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();

    assert!(stats.received + stats.errors <= stats.transmitted);
    (stats, transport, lines)
}

#[test]
fn test_five_probes_with_one_timeout() {
    let script = vec![
        Step::Reply(10),
        Step::Reply(20),
        Step::Timeout,
        Step::Reply(30),
        Step::Reply(40),
    ];
    let transport = ScriptedTransport::new(Family::V4, script);
    let (stats, transport, lines) = run(transport, config(v4_dest(), 5), Interrupt::new());

    assert_eq!(stats.transmitted, 5);
    assert_eq!(stats.received, 4);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.min, 10.0);
    assert_eq!(stats.max, 40.0);
    assert!((stats.finalize().unwrap().mean - 25.0).abs() < 1e-9);
    assert_eq!(stats.loss_percent(), 20.0);
    assert_eq!(transport.sent, vec![0, 1, 2, 3, 4]);

    assert_eq!(
        lines,
        vec![
            "64 bytes from 192.0.2.1: icmp_seq=0 ttl=57 time=10.000 ms",
            "64 bytes from 192.0.2.1: icmp_seq=1 ttl=57 time=20.000 ms",
            "Request timeout for icmp_seq 2",
            "64 bytes from 192.0.2.1: icmp_seq=3 ttl=57 time=30.000 ms",
            "64 bytes from 192.0.2.1: icmp_seq=4 ttl=57 time=40.000 ms",
            "",
            "--- test-host ping statistics ---",
            "5 packets transmitted, 4 received, 1 errors, 20.0% packet loss",
            "round-trip min/avg/max/stddev = 10.000/25.000/40.000/11.180 ms",
        ]
    );
}

#[test]
fn test_garbage_is_a_recoverable_parse_error() {
    let script = vec![
        Step::Reply(5),
        Step::Raw(v4_dest(), vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
        Step::Reply(5),
    ];
    let transport = ScriptedTransport::new(Family::V4, script);
    let (stats, _, lines) = run(transport, config(v4_dest(), 3), Interrupt::new());

    assert_eq!(stats.transmitted, 3);
    assert_eq!(stats.received, 2);
    assert_eq!(stats.errors, 1);
    assert!(lines[1].starts_with("Error parsing ICMP response: "));
    assert!(lines[2].contains("icmp_seq=2"));
}

#[test]
fn test_send_failure_skips_the_receive() {
    let script = vec![Step::SendFails, Step::Reply(3)];
    let transport = ScriptedTransport::new(Family::V4, script);
    let (stats, transport, lines) = run(transport, config(v4_dest(), 2), Interrupt::new());

    // A failed send still counts as transmitted
    assert_eq!(stats.transmitted, 2);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.received, 1);
    assert_eq!(transport.sent, vec![1]);
    assert!(lines[0].starts_with("Error sending ICMP packet: "));
    assert!(lines[1].starts_with("64 bytes from 192.0.2.1: icmp_seq=1 "));
}

#[test]
fn test_interrupt_mid_run_stops_sending() {
    let interrupt = Interrupt::new();
    let mut transport = ScriptedTransport::new(
        Family::V4,
        (0..5).map(|_| Step::Reply(2)).collect(),
    );
    transport.interrupt_after = Some((3, interrupt.clone()));

    let (stats, transport, lines) = run(transport, config(v4_dest(), 5), interrupt);

    assert_eq!(transport.sent, vec![0, 1, 2]);
    assert_eq!(stats.transmitted, 3);
    assert_eq!(stats.received, 2);
    assert_eq!(stats.errors, 0);
    // Two probe lines, nothing for the probe cut short
    assert_eq!(lines.len(), 2 + 4);
    assert_eq!(lines[3], "--- test-host ping statistics ---");
    assert_eq!(
        lines[4],
        "3 packets transmitted, 2 received, 0 errors, 33.3% packet loss"
    );
}

#[test]
fn test_interrupt_before_first_probe() {
    let interrupt = Interrupt::new();
    interrupt.raise();
    let transport = ScriptedTransport::new(Family::V4, vec![Step::Reply(1)]);
    let (stats, transport, lines) = run(transport, config(v4_dest(), 5), interrupt);

    assert!(transport.sent.is_empty());
    assert_eq!(stats.transmitted, 0);
    assert_eq!(
        lines,
        vec![
            "",
            "--- test-host ping statistics ---",
            "0 packets transmitted, 0 received, 0 errors, 0.0% packet loss",
        ]
    );
}

#[test]
fn test_datagrams_for_other_probes_are_skipped() {
    let dest = v4_dest();
    let mut own_request = EchoRequest::new(IDENT, 0).encode(Family::V4);
    own_request = with_checksum(own_request);
    let script = vec![
        // Our own request seen on the socket
        Step::Raw(dest, own_request),
        // Another process' reply
        Step::Raw(dest, echo_reply(Family::V4, IDENT ^ 1, 0)),
        // A late reply for an earlier sequence
        Step::Raw(dest, echo_reply(Family::V4, IDENT, 9)),
        // A router complaining about someone else's probe
        Step::Raw(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            v4_error_quoting(11, IDENT ^ 1, 0),
        ),
        Step::Reply(7),
    ];
    let transport = ScriptedTransport::new(Family::V4, script);
    let (stats, _, lines) = run(transport, config(dest, 1), Interrupt::new());

    assert_eq!(stats.received, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(lines[0], "64 bytes from 192.0.2.1: icmp_seq=0 ttl=57 time=7.000 ms");
}

#[test]
fn test_ipv4_error_replies() {
    let router = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let script = vec![
        Step::Raw(router, v4_error_quoting(11, IDENT, 0)),
        Step::Raw(router, v4_error_quoting(3, IDENT, 1)),
        Step::Raw(router, with_checksum(vec![5, 1, 0, 0, 0, 0, 0, 0])),
    ];
    let transport = ScriptedTransport::new(Family::V4, script);
    let (stats, _, lines) = run(transport, config(v4_dest(), 3), Interrupt::new());

    assert_eq!(stats.received, 0);
    assert_eq!(stats.errors, 3);
    assert_eq!(lines[0], "From 10.0.0.1 icmp_seq=0: Time To Live Exceeded");
    assert_eq!(lines[1], "From 10.0.0.1 icmp_seq=1: Destination Host Unreachable");
    assert_eq!(lines[2], "From 10.0.0.1 icmp_seq=2: ICMP type: 5");
    // No replies, no round-trip line
    assert!(!lines.iter().any(|l| l.starts_with("round-trip")));
    assert_eq!(
        lines.last().unwrap(),
        "3 packets transmitted, 0 received, 3 errors, 100.0% packet loss"
    );
}

#[test]
fn test_ipv6_replies() {
    let router: IpAddr = "fe80::1".parse().unwrap();
    let script = vec![
        Step::Reply(12),
        Step::Raw(router, vec![3, 0, 0, 0, 0, 0, 0, 0]),
        Step::Raw(router, vec![1, 4, 0, 0, 0, 0, 0, 0]),
        Step::Raw(router, vec![136, 0, 0, 0, 0, 0, 0, 0]),
    ];
    let transport = ScriptedTransport::new(Family::V6, script);
    let (stats, _, lines) = run(transport, config(v6_dest(), 4), Interrupt::new());

    assert_eq!(lines[0], "64 bytes from 2001:db8::1: icmp_seq=0 ttl=57 time=12.000 ms");
    assert_eq!(lines[1], "From fe80::1 icmp_seq=1: Hop Limit Exceeded");
    assert_eq!(lines[2], "From fe80::1 icmp_seq=2: Destination Host Unreachable");
    assert_eq!(
        lines[3],
        "From fe80::1 icmp_seq=3: IPv6 specific information: neighbor advertisement"
    );

    // Discovery traffic is neither a reply nor an error
    assert_eq!(stats.transmitted, 4);
    assert_eq!(stats.received, 1);
    assert_eq!(stats.errors, 2);
}

#[test]
fn test_single_probe_outcome() {
    let transport = ScriptedTransport::new(Family::V4, vec![Step::Timeout]);
    let mut out = Vec::new();
    let mut engine = Engine::new(transport, &mut out, config(v4_dest(), 1), IDENT, Interrupt::new());

    let outcome = engine.probe(0).unwrap();
    assert!(matches!(outcome, ProbeOutcome::Timeout));
    assert!(outcome.is_error());
    assert_eq!(engine.stats().transmitted, 1);
    assert_eq!(engine.stats().errors, 1);
    assert_eq!(
        outcome.report(0, Family::V4).to_string(),
        "Request timeout for icmp_seq 0"
    );
}

#[test]
fn test_conflicting_family_flags_are_rejected() {
    use pinger::resolve::{AddressPreference, resolve};

    let both = AddressPreference {
        prefer_v4: true,
        prefer_v6: true,
    };
    let err = resolve("localhost", both).unwrap_err();
    assert!(matches!(err, pinger::ResolveError::ConflictingFamilies));
    assert_eq!(err.to_string(), "only one -4 or -6 option may be specified");
}

#[test]
fn test_timeout_beyond_instant_range() {
    let transport = ScriptedTransport::new(Family::V4, vec![Step::Reply(3)]);
    let config = ProbeConfig {
        timeout: Duration::MAX,
        ..config(v4_dest(), 1)
    };
    let (stats, _, lines) = run(transport, config, Interrupt::new());

    assert_eq!(stats.received, 1);
    assert_eq!(lines[0], "64 bytes from 192.0.2.1: icmp_seq=0 ttl=57 time=3.000 ms");
}

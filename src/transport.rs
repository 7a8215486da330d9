//! Raw ICMP sockets.
//!
//! One socket per run, for one address family. Both variants enable
//! reception of the TTL / hop limit control message so replies can report
//! it, and both can be pinned to a network interface:
//! - Linux: SO_BINDTODEVICE on the socket plus IP_PKTINFO / IPV6_PKTINFO on
//!   every send
//! - macOS: IP_BOUND_IF / IPV6_BOUND_IF

use std::ffi::CString;
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::ptr;
use std::time::{Duration, Instant};

use socket2::{Domain, MaybeUninitSlice, MsgHdrMut, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::icmp::{Family, strip_ipv4_header};

/// TTL reported when the kernel delivers no control message
pub const DEFAULT_HOP_LIMIT: u8 = 64;

const RECV_BUFFER_LEN: usize = 1500;
const CONTROL_BUFFER_LEN: usize = 128;

/// One inbound ICMP message and what the kernel told us about it.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// ICMP message, without any IP header
    pub bytes: Vec<u8>,
    pub hop_limit: u8,
    pub peer: IpAddr,
    pub received_at: Instant,
}

/// Send / receive primitives of a probe session.
pub trait Transport {
    fn family(&self) -> Family;

    /// Sets the TTL (IPv4) or hop limit (IPv6) of every later send.
    fn set_hop_limit(&mut self, hops: u8) -> Result<(), TransportError>;

    /// Sends one datagram and returns the instant the write completed.
    fn send(&mut self, destination: IpAddr, bytes: &[u8]) -> Result<Instant, TransportError>;

    /// Blocks until a datagram arrives or `deadline` passes.
    fn receive_with_deadline(&mut self, deadline: Instant) -> Result<Datagram, TransportError>;
}

/// A named interface and its kernel index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

impl Interface {
    pub fn lookup(name: &str) -> Result<Self, TransportError> {
        let unknown = |source| TransportError::UnknownInterface {
            name: name.to_string(),
            source,
        };
        let c_name = CString::new(name)
            .map_err(|_| unknown(io::Error::from(io::ErrorKind::InvalidInput)))?;
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(unknown(io::Error::last_os_error()));
        }
        Ok(Self {
            name: name.to_string(),
            index,
        })
    }
}

/// Socket state shared by both families.
#[derive(Debug)]
struct RawSocket {
    socket: Socket,
    family: Family,
    interface: Option<Interface>,
}

impl RawSocket {
    fn open(family: Family, interface: Option<&str>) -> Result<Self, TransportError> {
        let (domain, protocol) = match family {
            Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
            Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let socket = Socket::new(domain, Type::RAW, Some(protocol))
            .map_err(|source| TransportError::Open { family, source })?;

        let interface = interface.map(Interface::lookup).transpose()?;
        if let Some(iface) = &interface {
            bind_to_interface(&socket, family, iface).map_err(|source| {
                TransportError::BindInterface {
                    name: iface.name.clone(),
                    source,
                }
            })?;
            debug!(interface = %iface.name, index = iface.index, "socket bound to interface");
        }

        debug!(%family, "raw ICMP socket open");
        Ok(Self {
            socket,
            family,
            interface,
        })
    }

    fn send_plain(&self, destination: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, &SockAddr::from(destination))
    }

    /// Waits for one datagram, returning its length, sender, the TTL / hop
    /// limit control message if the kernel attached one, and when it came in.
    fn receive(
        &self,
        deadline: Instant,
        buffer: &mut [u8],
    ) -> Result<(usize, IpAddr, Option<u8>, Instant), TransportError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            // A zero timeval would mean "block forever"
            self.socket
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                .map_err(TransportError::Receive)?;

            match recv_with_control(&self.socket, self.family, buffer) {
                Ok((len, peer, hop_limit)) => return Ok((len, peer, hop_limit, Instant::now())),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(TransportError::Timeout);
                }
                Err(e) => return Err(TransportError::Receive(e)),
            }
        }
    }
}

fn socket_option(option: &'static str) -> impl FnOnce(io::Error) -> TransportError {
    move |source| TransportError::SocketOption { option, source }
}

// ============================================================================
// IPv4
// ============================================================================

#[cfg(target_os = "linux")]
const IP_RECVTTL: libc::c_int = 12;
#[cfg(not(target_os = "linux"))]
const IP_RECVTTL: libc::c_int = 24;

/// Raw `IPPROTO_ICMP` socket.
#[derive(Debug)]
pub struct IcmpV4Socket {
    raw: RawSocket,
}

impl IcmpV4Socket {
    pub fn open(interface: Option<&str>) -> Result<Self, TransportError> {
        let raw = RawSocket::open(Family::V4, interface)?;
        enable_recv_ttl(&raw.socket).map_err(socket_option("IP_RECVTTL"))?;
        Ok(Self { raw })
    }
}

impl Transport for IcmpV4Socket {
    fn family(&self) -> Family {
        Family::V4
    }

    fn set_hop_limit(&mut self, hops: u8) -> Result<(), TransportError> {
        self.raw
            .socket
            .set_ttl_v4(u32::from(hops))
            .map_err(socket_option("IP_TTL"))
    }

    fn send(&mut self, destination: IpAddr, bytes: &[u8]) -> Result<Instant, TransportError> {
        let sent = match (&self.raw.interface, destination) {
            #[cfg(target_os = "linux")]
            (Some(iface), IpAddr::V4(dst)) => {
                pktinfo::send_v4(&self.raw.socket, dst, iface.index, bytes)
            }
            _ => self.raw.send_plain(SocketAddr::new(destination, 0), bytes),
        };
        sent.map_err(TransportError::Send)?;
        Ok(Instant::now())
    }

    fn receive_with_deadline(&mut self, deadline: Instant) -> Result<Datagram, TransportError> {
        let mut buffer = [0u8; RECV_BUFFER_LEN];
        let (len, peer, hop_limit, received_at) = self.raw.receive(deadline, &mut buffer)?;

        Ok(Datagram {
            bytes: strip_ipv4_header(&buffer[..len]).to_vec(),
            hop_limit: hop_limit.unwrap_or_else(|| missing_hop_limit(Family::V4)),
            peer,
            received_at,
        })
    }
}

/// socket2 has no setter for IP_RECVTTL.
fn enable_recv_ttl(socket: &Socket) -> io::Result<()> {
    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            IP_RECVTTL,
            &enable as *const _ as *const libc::c_void,
            mem::size_of_val(&enable) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ============================================================================
// IPv6
// ============================================================================

/// Raw `IPPROTO_ICMPV6` socket.
#[derive(Debug)]
pub struct IcmpV6Socket {
    raw: RawSocket,
}

impl IcmpV6Socket {
    pub fn open(interface: Option<&str>) -> Result<Self, TransportError> {
        let raw = RawSocket::open(Family::V6, interface)?;
        raw.socket
            .set_recv_hoplimit_v6(true)
            .map_err(socket_option("IPV6_RECVHOPLIMIT"))?;
        Ok(Self { raw })
    }

    /// Link-local destinations are ambiguous without a scope.
    fn scoped(&self, destination: IpAddr) -> SocketAddr {
        match (destination, &self.raw.interface) {
            (IpAddr::V6(v6), Some(iface)) if is_link_local(&v6) => {
                SocketAddr::V6(SocketAddrV6::new(v6, 0, 0, iface.index))
            }
            _ => SocketAddr::new(destination, 0),
        }
    }
}

impl Transport for IcmpV6Socket {
    fn family(&self) -> Family {
        Family::V6
    }

    fn set_hop_limit(&mut self, hops: u8) -> Result<(), TransportError> {
        self.raw
            .socket
            .set_unicast_hops_v6(u32::from(hops))
            .map_err(socket_option("IPV6_UNICAST_HOPS"))
    }

    fn send(&mut self, destination: IpAddr, bytes: &[u8]) -> Result<Instant, TransportError> {
        let target = self.scoped(destination);
        let sent = match (&self.raw.interface, target) {
            #[cfg(target_os = "linux")]
            (Some(iface), SocketAddr::V6(dst)) => {
                pktinfo::send_v6(&self.raw.socket, dst, iface.index, bytes)
            }
            _ => self.raw.send_plain(target, bytes),
        };
        sent.map_err(TransportError::Send)?;
        Ok(Instant::now())
    }

    fn receive_with_deadline(&mut self, deadline: Instant) -> Result<Datagram, TransportError> {
        let mut buffer = [0u8; RECV_BUFFER_LEN];
        let (len, peer, hop_limit, received_at) = self.raw.receive(deadline, &mut buffer)?;

        Ok(Datagram {
            bytes: buffer[..len].to_vec(),
            hop_limit: hop_limit.unwrap_or_else(|| missing_hop_limit(Family::V6)),
            peer,
            received_at,
        })
    }
}

fn missing_hop_limit(family: Family) -> u8 {
    trace!(%family, "no hop limit control message, using default");
    DEFAULT_HOP_LIMIT
}

/// fe80::/10
fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

// ============================================================================
// Socket plumbing
// ============================================================================

/// Control message storage, aligned for `cmsghdr`.
#[repr(C, align(8))]
struct ControlBuffer([MaybeUninit<u8>; CONTROL_BUFFER_LEN]);

impl ControlBuffer {
    fn new() -> Self {
        Self([MaybeUninit::new(0); CONTROL_BUFFER_LEN])
    }
}

fn bind_to_interface(socket: &Socket, family: Family, iface: &Interface) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let _ = family;
        socket.bind_device(Some(iface.name.as_bytes()))
    }

    #[cfg(target_os = "macos")]
    {
        let index = std::num::NonZeroU32::new(iface.index);
        match family {
            Family::V4 => socket.bind_device_by_index_v4(index),
            Family::V6 => socket.bind_device_by_index_v6(index),
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (socket, family, iface);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface binding is only available on Linux and macOS",
        ))
    }
}

/// recvmsg(2) with room for ancillary data.
fn recv_with_control(
    socket: &Socket,
    family: Family,
    buffer: &mut [u8],
) -> io::Result<(usize, IpAddr, Option<u8>)> {
    let mut data = [MaybeUninit::new(0u8); RECV_BUFFER_LEN];
    let mut control = ControlBuffer::new();
    // Overwritten by the kernel with the sender's address
    let mut source = SockAddr::from(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)));

    let mut bufs = [MaybeUninitSlice::new(&mut data)];
    let mut msg = MsgHdrMut::new()
        .with_addr(&mut source)
        .with_buffers(&mut bufs)
        .with_control(&mut control.0);
    let len = socket.recvmsg(&mut msg, 0)?;
    let control_len = msg.control_len();

    let peer = source.as_socket().map(|sa| sa.ip()).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "sender is not an IP address")
    })?;

    let len = len.min(buffer.len());
    for (dst, src) in buffer.iter_mut().zip(&data[..len]) {
        // SAFETY: the buffer was zero-initialised before the call
        *dst = unsafe { src.assume_init() };
    }

    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = control_len as _;
    Ok((len, peer, find_hop_limit(&hdr, family)))
}

/// Whether a control message carries the received TTL / hop limit.
fn is_hop_limit_cmsg(family: Family, level: libc::c_int, kind: libc::c_int) -> bool {
    match family {
        Family::V6 => level == libc::IPPROTO_IPV6 && kind == libc::IPV6_HOPLIMIT,
        // macOS versions differ in which of the two they deliver
        #[cfg(not(target_os = "linux"))]
        Family::V4 => level == libc::IPPROTO_IP && (kind == libc::IP_TTL || kind == IP_RECVTTL),
        #[cfg(target_os = "linux")]
        Family::V4 => level == libc::IPPROTO_IP && kind == libc::IP_TTL,
    }
}

/// Walks the control messages looking for a TTL / hop limit.
fn find_hop_limit(msg: &libc::msghdr, family: Family) -> Option<u8> {
    let header_len = unsafe { libc::CMSG_LEN(0) } as usize;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if is_hop_limit_cmsg(family, hdr.cmsg_level, hdr.cmsg_type) {
            let data = unsafe { libc::CMSG_DATA(cmsg) };
            let data_len = (hdr.cmsg_len as usize).saturating_sub(header_len);
            // An int everywhere except IPv4 on macOS, which sends one byte
            let value = if data_len >= mem::size_of::<libc::c_int>() {
                unsafe { ptr::read_unaligned(data as *const libc::c_int) }
            } else if data_len >= 1 {
                unsafe { *data as libc::c_int }
            } else {
                return None;
            };
            return u8::try_from(value).ok();
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}

/// sendmsg(2) with an interface index in the packet info control message.
#[cfg(target_os = "linux")]
mod pktinfo {
    use std::io::{self, IoSlice};
    use std::mem;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV6};
    use std::ptr;

    use socket2::{MsgHdr, SockAddr, Socket};

    use super::CONTROL_BUFFER_LEN;

    #[repr(C, align(8))]
    struct Control([u8; CONTROL_BUFFER_LEN]);

    pub(super) fn send_v4(
        socket: &Socket,
        destination: Ipv4Addr,
        index: u32,
        bytes: &[u8],
    ) -> io::Result<usize> {
        let info = libc::in_pktinfo {
            ipi_ifindex: index as libc::c_int,
            ipi_spec_dst: libc::in_addr { s_addr: 0 },
            ipi_addr: libc::in_addr { s_addr: 0 },
        };
        send(
            socket,
            SocketAddr::new(IpAddr::V4(destination), 0),
            (libc::IPPROTO_IP, libc::IP_PKTINFO),
            info,
            bytes,
        )
    }

    pub(super) fn send_v6(
        socket: &Socket,
        destination: SocketAddrV6,
        index: u32,
        bytes: &[u8],
    ) -> io::Result<usize> {
        let info = libc::in6_pktinfo {
            ipi6_addr: libc::in6_addr { s6_addr: [0; 16] },
            ipi6_ifindex: index,
        };
        send(
            socket,
            SocketAddr::V6(destination),
            (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO),
            info,
            bytes,
        )
    }

    fn send<T>(
        socket: &Socket,
        destination: SocketAddr,
        (level, kind): (libc::c_int, libc::c_int),
        info: T,
        bytes: &[u8],
    ) -> io::Result<usize> {
        let mut control = Control([0u8; CONTROL_BUFFER_LEN]);
        let space = unsafe { libc::CMSG_SPACE(mem::size_of::<T>() as u32) } as usize;

        // Lay out the single cmsghdr with the libc macros
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
        hdr.msg_controllen = space as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&hdr);
            (*cmsg).cmsg_level = level;
            (*cmsg).cmsg_type = kind;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<T>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut T, info);
        }

        let addr = SockAddr::from(destination);
        let bufs = [IoSlice::new(bytes)];
        let msg = MsgHdr::new()
            .with_addr(&addr)
            .with_buffers(&bufs)
            .with_control(&control.0[..space]);
        socket.sendmsg(&msg, 0)
    }
}

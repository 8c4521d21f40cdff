//! Linux socket setup: `SO_BINDTODEVICE`, `IP_FREEBIND`, and the `IP(V6)_RECVORIGDSTADDR`
//! ancillary-data dance needed to recover (and later fake) a UDP datagram's original destination.
//!
//! `socket2` has no typed wrapper for `IP_FREEBIND`/`IP(V6)_RECVORIGDSTADDR` or for
//! ancillary/control data, so this module drops to raw `libc` `setsockopt`/`recvmsg`/`sendmsg`
//! calls behind a confined `unsafe` boundary, the same approach this pack's transparent-proxy
//! reference implementation (`rabbit-digger-pro`'s tproxy listener) uses for the identical
//! problem.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;

use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::BufferSizes;
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::session::PacketSession;

// Not exposed by the `libc` crate on every target; the kernel's numeric value is stable across
// architectures.
const IPV6_FREEBIND: libc::c_int = 78;

pub(super) fn bind_tcp(
    iface_name: &str,
    port: u16,
    buffers: BufferSizes,
) -> Result<tokio::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| setup_failed("socket", source))?;

    apply_common_options(&socket, iface_name, buffers)?;

    let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    socket
        .bind(&addr.into())
        .map_err(|source| setup_failed("bind", source))?;
    socket
        .listen(1024)
        .map_err(|source| setup_failed("listen", source))?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener).map_err(|source| setup_failed("tokio::from_std", source))
}

pub(super) fn bind_udp(
    iface_name: &str,
    port: u16,
    buffers: BufferSizes,
) -> Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| setup_failed("socket", source))?;

    apply_common_options(&socket, iface_name, buffers)?;

    set_bool_opt(socket.as_raw_fd(), libc::SOL_IP, libc::IP_FREEBIND, "IP_FREEBIND")?;
    set_bool_opt(
        socket.as_raw_fd(),
        libc::SOL_IP,
        libc::IP_RECVORIGDSTADDR,
        "IP_RECVORIGDSTADDR",
    )?;
    set_bool_opt(socket.as_raw_fd(), libc::SOL_IPV6, IPV6_FREEBIND, "IPV6_FREEBIND")?;
    set_bool_opt(
        socket.as_raw_fd(),
        libc::SOL_IPV6,
        libc::IPV6_RECVORIGDSTADDR,
        "IPV6_RECVORIGDSTADDR",
    )?;

    let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    socket
        .bind(&addr.into())
        .map_err(|source| setup_failed("bind", source))?;

    let std_socket: std::net::UdpSocket = socket.into();
    std_socket
        .set_nonblocking(true)
        .map_err(|source| setup_failed("set_nonblocking", source))?;
    tokio::net::UdpSocket::from_std(std_socket).map_err(|source| setup_failed("tokio::from_std", source))
}

fn apply_common_options(socket: &Socket, iface_name: &str, buffers: BufferSizes) -> Result<()> {
    socket
        .set_nonblocking(true)
        .map_err(|source| setup_failed("set_nonblocking", source))?;
    socket
        .set_reuse_address(true)
        .map_err(|source| setup_failed("SO_REUSEADDR", source))?;
    socket
        .set_reuse_port(true)
        .map_err(|source| setup_failed("SO_REUSEPORT", source))?;
    socket
        .bind_device(Some(iface_name.as_bytes()))
        .map_err(|source| setup_failed("SO_BINDTODEVICE", source))?;

    if let Some(size) = buffers.send {
        socket
            .set_send_buffer_size(size)
            .map_err(|source| setup_failed("SO_SNDBUF", source))?;
    }
    if let Some(size) = buffers.recv {
        socket
            .set_recv_buffer_size(size)
            .map_err(|source| setup_failed("SO_RCVBUF", source))?;
    }

    Ok(())
}

fn setup_failed(option: &'static str, source: std::io::Error) -> Error {
    Error::SocketSetupFailed { option, source }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, label: &'static str) -> Result<()> {
    let enable: libc::c_int = 1;
    // SAFETY: `fd` is a valid, open socket owned by the caller for the duration of this call;
    // `enable` is a plain `c_int` whose address and size match what `setsockopt` expects.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &enable as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(setup_failed(label, std::io::Error::last_os_error()));
    }

    Ok(())
}

pub(super) async fn read_datagram(
    socket: &tokio::net::UdpSocket,
    body_pool: &BufferPool,
    oob_pool: &BufferPool,
) -> Result<PacketSession> {
    let fd = socket.as_raw_fd();

    loop {
        socket.readable().await?;

        let mut body = body_pool.pull();
        let mut oob = oob_pool.pull();
        let mut ctrl_count: Option<usize> = None;

        let outcome = socket.try_io(tokio::io::Interest::READABLE, || {
            recv_with_orig_dst(fd, &mut body, &mut oob).map_err(|err| match err {
                RecvError::Io(io_err) => io_err,
                RecvError::BadControlMessage(n) => {
                    ctrl_count = Some(n);
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "bad control message count")
                }
            })
        });

        match outcome {
            Ok((n, raddr, laddr)) => {
                let resp_oob = build_resp_oob(laddr);

                return Ok(PacketSession {
                    laddr,
                    raddr,
                    read_body: body,
                    read_len: n,
                    resp_oob,
                });
            }
            Err(_) if ctrl_count.is_some() => {
                #[allow(clippy::unwrap_used)]
                return Err(Error::BadControlMessage(ctrl_count.unwrap()));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(Error::Io(err)),
        }
    }
}

enum RecvError {
    Io(std::io::Error),
    BadControlMessage(usize),
}

impl From<std::io::Error> for RecvError {
    fn from(err: std::io::Error) -> Self {
        RecvError::Io(err)
    }
}

/// Reads one datagram via `recvmsg`, returning `(len, peer_addr, original_dst_addr)`.
fn recv_with_orig_dst(
    fd: RawFd,
    body: &mut [u8],
    control: &mut [u8],
) -> std::result::Result<(usize, SocketAddr, SocketAddr), RecvError> {
    // SAFETY: all pointers handed to `recvmsg` point into live, appropriately sized buffers owned
    // by this stack frame for the duration of the call; `msg` is zero-initialized before use.
    unsafe {
        let mut peer_storage: libc::sockaddr_storage = mem::zeroed();

        let mut iov = libc::iovec {
            iov_base: body.as_mut_ptr() as *mut libc::c_void,
            iov_len: body.len(),
        };

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = &mut peer_storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(RecvError::Io(std::io::Error::last_os_error()));
        }

        let peer = sockaddr_storage_to_addr(&peer_storage, msg.msg_namelen)
            .map_err(RecvError::Io)?;

        match extract_orig_dst(&msg) {
            Ok(orig_dst) => Ok((n as usize, peer, orig_dst)),
            Err(count) => Err(RecvError::BadControlMessage(count)),
        }
    }
}

/// Walks the control-message list looking for exactly one `IP(V6)_RECVORIGDSTADDR` entry.
///
/// `Err(n)` reports how many matching messages were actually found (0 or ≥2), matching §4.1's
/// "expected 1 ctrl message, got N" failure mode.
///
/// # Safety
/// `msg` must be a `msghdr` just populated by a successful `recvmsg` call, with `msg_control`
/// pointing at a live buffer of at least `msg_controllen` bytes.
unsafe fn extract_orig_dst(msg: &libc::msghdr) -> std::result::Result<SocketAddr, usize> {
    let mut found: Option<SocketAddr> = None;
    let mut count = 0usize;

    // SAFETY: delegated to the caller's precondition on `msg`.
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        // SAFETY: `cmsg` was just checked non-null and was produced by `CMSG_FIRSTHDR`/
        // `CMSG_NXTHDR` walking `msg`'s control buffer.
        let hdr = unsafe { &*cmsg };

        match (hdr.cmsg_level, hdr.cmsg_type) {
            (libc::SOL_IP, libc::IP_RECVORIGDSTADDR) => {
                count += 1;
                // SAFETY: the kernel only attaches this cmsg type with a `sockaddr_in`-sized
                // payload.
                let addr: libc::sockaddr_in =
                    unsafe { ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in) };
                found = Some(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                    u16::from_be(addr.sin_port),
                )));
            }
            (libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR) => {
                count += 1;
                // SAFETY: the kernel only attaches this cmsg type with a `sockaddr_in6`-sized
                // payload.
                let addr: libc::sockaddr_in6 = unsafe {
                    ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in6)
                };
                found = Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(addr.sin6_addr.s6_addr),
                    u16::from_be(addr.sin6_port),
                    u32::from_be(addr.sin6_flowinfo),
                    addr.sin6_scope_id,
                )));
            }
            _ => {}
        }

        // SAFETY: `cmsg` is non-null and still points within `msg`'s control buffer.
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }

    match count {
        1 => found.ok_or(0),
        n => Err(n),
    }
}

fn sockaddr_storage_to_addr(
    storage: &libc::sockaddr_storage,
    _len: libc::socklen_t,
) -> std::io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: `ss_family == AF_INET` guarantees the kernel wrote a `sockaddr_in` here.
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: `ss_family == AF_INET6` guarantees the kernel wrote a `sockaddr_in6` here.
            let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                u32::from_be(addr.sin6_flowinfo),
                addr.sin6_scope_id,
            )))
        }
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "unknown socket address family in msghdr",
        )),
    }
}

/// Builds the packet-info ancillary control message that, attached to the reply write, makes the
/// kernel use `laddr` as the reply's source address.
fn build_resp_oob(laddr: SocketAddr) -> Bytes {
    match laddr {
        SocketAddr::V4(addr) => {
            let pktinfo = libc::in_pktinfo {
                ipi_ifindex: 0,
                ipi_spec_dst: libc::in_addr {
                    s_addr: u32::from(*addr.ip()).to_be(),
                },
                ipi_addr: libc::in_addr { s_addr: 0 },
            };
            Bytes::from(encode_cmsg(libc::SOL_IP, libc::IP_PKTINFO, pktinfo))
        }
        SocketAddr::V6(addr) => {
            let pktinfo = libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                ipi6_ifindex: addr.scope_id(),
            };
            Bytes::from(encode_cmsg(libc::SOL_IPV6, libc::IPV6_PKTINFO, pktinfo))
        }
    }
}

fn encode_cmsg<T>(level: libc::c_int, cmsg_type: libc::c_int, payload: T) -> Vec<u8> {
    // SAFETY: `buf` is sized via `CMSG_SPACE` for exactly one `T`-sized cmsg and is zeroed before
    // the header and payload are written into it through properly aligned raw pointers derived
    // from `CMSG_DATA`/a `*mut cmsghdr` cast of `buf`'s own start.
    unsafe {
        let space = libc::CMSG_SPACE(mem::size_of::<T>() as u32) as usize;
        let mut buf = vec![0u8; space];

        let cmsg_ptr = buf.as_mut_ptr() as *mut libc::cmsghdr;
        (*cmsg_ptr).cmsg_level = level;
        (*cmsg_ptr).cmsg_type = cmsg_type;
        (*cmsg_ptr).cmsg_len = libc::CMSG_LEN(mem::size_of::<T>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg_ptr) as *mut T, payload);

        buf
    }
}

pub(super) async fn write_datagram(
    socket: &tokio::net::UdpSocket,
    body: &[u8],
    dst: SocketAddr,
    oob: Option<&[u8]>,
) -> std::io::Result<usize> {
    let fd = socket.as_raw_fd();

    loop {
        socket.writable().await?;

        match socket.try_io(tokio::io::Interest::WRITABLE, || send_to(fd, body, dst, oob)) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}

fn send_to(fd: RawFd, body: &[u8], dst: SocketAddr, control: Option<&[u8]>) -> std::io::Result<usize> {
    let dst_storage = SockAddr::from(dst);

    // SAFETY: all pointers handed to `sendmsg` point into buffers (`body`, `control`, and the
    // `SockAddr` byte representation) owned by this stack frame for the duration of the call.
    let n = unsafe {
        let mut iov = libc::iovec {
            iov_base: body.as_ptr() as *mut libc::c_void,
            iov_len: body.len(),
        };

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = dst_storage.as_ptr() as *mut libc::c_void;
        msg.msg_namelen = dst_storage.len();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if let Some(ctrl) = control {
            msg.msg_control = ctrl.as_ptr() as *mut libc::c_void;
            msg.msg_controllen = ctrl.len() as _;
        }

        libc::sendmsg(fd, &msg, 0)
    };

    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(n as usize)
}

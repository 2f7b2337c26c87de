//! Marked raw sockets
//!
//! Crafted packets are injected through one `SOCK_RAW / IPPROTO_RAW`
//! socket per family, complete with IP header: `IPPROTO_RAW` implies
//! `IP_HDRINCL` for IPv4, the IPv6 socket sets `IPV6_HDRINCL`
//! explicitly. Every socket carries `SO_MARK` so the firewall can
//! exclude injected packets from the queue and the worker never sees
//! its own output. Requires `CAP_NET_RAW`.

use crate::error::{Error, Result};
use crate::packet::{self, IpFamily};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::os::fd::RawFd;

/// Raw send endpoints, one per family, owned by a single worker
pub struct RawSender {
    v4: Mutex<RawFd>,
    v6: Mutex<RawFd>,
}

impl RawSender {
    /// Open both raw sockets and bind the packet mark to them once.
    pub fn open(mark: u32) -> Result<Self> {
        let v4 = open_raw(libc::AF_INET, mark)?;
        let v6 = match open_raw(libc::AF_INET6, mark) {
            Ok(fd) => fd,
            Err(err) => {
                // v6 may be administratively disabled; v4-only hosts
                // still get a working sender
                tracing::warn!(%err, "IPv6 raw socket unavailable");
                -1
            }
        };
        Ok(Self {
            v4: Mutex::new(v4),
            v6: Mutex::new(v6),
        })
    }

    /// Inject one complete packet; the destination is read out of the
    /// IP header.
    pub fn send(&self, buf: &[u8]) -> Result<()> {
        let family = IpFamily::of(buf)
            .ok_or_else(|| Error::Send("packet without an IP version".into()))?;
        match (family, packet::dst_addr(buf, family)) {
            (IpFamily::V4, IpAddr::V4(dst)) => {
                let addr = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: 0,
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(dst.octets()),
                    },
                    sin_zero: [0; 8],
                };
                let fd = self.v4.lock();
                send_to(
                    *fd,
                    buf,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            (IpFamily::V6, IpAddr::V6(dst)) => {
                let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                addr.sin6_addr = libc::in6_addr {
                    s6_addr: dst.octets(),
                };
                let fd = self.v6.lock();
                if *fd < 0 {
                    return Err(Error::Send("IPv6 sender not available".into()));
                }
                send_to(
                    *fd,
                    buf,
                    &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
            _ => unreachable!("family and destination always agree"),
        }
    }
}

impl Drop for RawSender {
    fn drop(&mut self) {
        for fd in [*self.v4.get_mut(), *self.v6.get_mut()] {
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
        }
    }
}

fn open_raw(family: libc::c_int, mark: u32) -> Result<RawFd> {
    let fd = unsafe { libc::socket(family, libc::SOCK_RAW, libc::IPPROTO_RAW) };
    if fd < 0 {
        return Err(Error::RawSocket(format!(
            "raw socket open failed (requires CAP_NET_RAW): {}",
            std::io::Error::last_os_error()
        )));
    }

    if let Err(err) = set_opt(fd, libc::SOL_SOCKET, libc::SO_MARK, mark) {
        unsafe { libc::close(fd) };
        return Err(Error::RawSocket(format!("SO_MARK failed: {err}")));
    }

    // IPPROTO_RAW implies header-include for IPv4 only; an IPv6 raw
    // socket needs IPV6_HDRINCL or the kernel prepends its own header
    // in front of the one already in the buffer
    if family == libc::AF_INET6 {
        if let Err(err) = set_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_HDRINCL, 1u32) {
            unsafe { libc::close(fd) };
            return Err(Error::RawSocket(format!("IPV6_HDRINCL failed: {err}")));
        }
    }

    Ok(fd)
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: u32) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn send_to(
    fd: RawFd,
    buf: &[u8],
    addr: *const libc::sockaddr,
    addr_len: libc::socklen_t,
) -> Result<()> {
    let ret = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            addr,
            addr_len,
        )
    };
    if ret < 0 {
        return Err(Error::Send(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

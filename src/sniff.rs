//! Packet sniffer — the activity evidence source.
//!
//! A sample opens a raw L2 socket bound to the target interface, attaches a
//! BPF program compiled from the libpcap filter text, and reports whether a
//! matching frame arrived within the wait window. The receive buffer is
//! forced to zero before the filter is attached and only raised afterwards,
//! so frames queued before the filter was active are dropped rather than
//! misread as activity; whatever still slipped in is drained before polling.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// Snap length for filter compilation and the post-attach receive buffer.
/// The sniffer never reads payloads, it only needs headers to match.
pub const MTU: usize = 128;

/// Pseudo-interface meaning "every interface"; sampling skips the device
/// bind for it.
pub const ANY_IFACE: &str = "any";

/// An interface usable for narrowing the sniff filter.
#[derive(Debug, Clone)]
pub struct ChosenIface {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// First non-loopback interface carrying a non-link-local IPv4 address.
pub fn choose_iface() -> Result<Option<ChosenIface>> {
    let devices = pcap::Device::list().map_err(|e| SupervisorError::Sniff(e.to_string()))?;
    for device in devices {
        if device.name == "lo" || device.flags.is_loopback() {
            continue;
        }
        if let Some(addr) = first_ipv4(&device) {
            if !addr.is_link_local() {
                return Ok(Some(ChosenIface { name: device.name, addr }));
            }
        }
    }
    Ok(None)
}

/// Look up a specific interface by name, loopback included. Used when the
/// operator pins the interface instead of letting discovery pick one.
pub fn lookup_iface(name: &str) -> Result<Option<ChosenIface>> {
    let devices = pcap::Device::list().map_err(|e| SupervisorError::Sniff(e.to_string()))?;
    for device in devices {
        if device.name == name {
            return Ok(first_ipv4(&device).map(|addr| ChosenIface { name: device.name, addr }));
        }
    }
    Ok(None)
}

fn first_ipv4(device: &pcap::Device) -> Option<Ipv4Addr> {
    device.addresses.iter().find_map(|address| match address.addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

/// Compose the final filter: narrow to frames destined for us when an
/// address is known, AND in the operator predicate when present.
pub fn compose_filter(addr: Option<Ipv4Addr>, user_filter: &str) -> String {
    match addr {
        Some(ip) if user_filter.is_empty() => format!("dst host {ip}"),
        Some(ip) => format!("(dst host {ip}) and ({user_filter})"),
        None => user_filter.to_string(),
    }
}

/// Compile libpcap filter text against an Ethernet link type.
///
/// Failure here is operator error in the filter text; the caller validates
/// once at startup so sampling never hits it.
pub fn compile_filter(filter: &str) -> Result<pcap::BpfProgram> {
    let cap = pcap::Capture::dead(pcap::Linktype::ETHERNET)
        .map_err(|e| SupervisorError::Sniff(format!("open dead capture: {e}")))?;
    cap.compile(filter, true)
        .map_err(|e| SupervisorError::Sniff(format!("compile filter '{filter}': {e}")))
}

/// Sample the interface: true iff a frame matching the filter arrived
/// within `window`. Blocking; run on a blocking-capable thread.
pub fn sample(iface: &str, filter: &str, window: Duration) -> Result<bool> {
    let program = compile_filter(filter)?;
    let sock = Sock::raw_l2()?;

    // Zero the receive buffer so frames queued before the filter is active
    // get dropped by the kernel instead of surfacing through the filter.
    sock.set_rcvbuf(0)?;
    sock.attach_filter(&program)?;
    if iface != ANY_IFACE {
        sock.bind_to_device(iface)?;
    }
    sock.set_rcvbuf(MTU as libc::c_int)?;
    sock.drain()?;
    sock.poll_in(window)
}

/// Raw AF_PACKET socket, closed on every exit path.
struct Sock(RawFd);

impl Sock {
    fn raw_l2() -> Result<Self> {
        // ETH_P_ALL must be byte-swapped to network order for socket(2).
        let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
        if fd < 0 {
            return Err(last_os_error("socket"));
        }
        Ok(Self(fd))
    }

    fn set_rcvbuf(&self, size: libc::c_int) -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.0,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                std::ptr::addr_of!(size).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(last_os_error("setsockopt(SO_RCVBUF)"));
        }
        Ok(())
    }

    fn attach_filter(&self, program: &pcap::BpfProgram) -> Result<()> {
        let insns = program.get_instructions();
        // bpf_insn and sock_filter share the {u16, u8, u8, u32} layout.
        let prog = libc::sock_fprog {
            len: insns.len() as u16,
            filter: insns.as_ptr() as *mut libc::sock_filter,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.0,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                std::ptr::addr_of!(prog).cast(),
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(last_os_error("setsockopt(SO_ATTACH_FILTER)"));
        }
        Ok(())
    }

    fn bind_to_device(&self, iface: &str) -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.0,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                iface.as_ptr().cast(),
                iface.len() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(last_os_error("setsockopt(SO_BINDTODEVICE)"));
        }
        Ok(())
    }

    /// Non-blocking reads until EAGAIN, discarding anything that arrived
    /// between filter attach and now.
    fn drain(&self) -> Result<()> {
        let mut buf = [0u8; MTU];
        loop {
            let n = unsafe {
                libc::recv(self.0, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_DONTWAIT)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(());
                }
                return Err(SupervisorError::Sniff(format!("recv: {err}")));
            }
        }
    }

    fn poll_in(&self, window: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd { fd: self.0, events: libc::POLLIN, revents: 0 };
        let timeout = libc::c_int::try_from(window.as_millis()).unwrap_or(libc::c_int::MAX);
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if rc < 0 {
            return Err(last_os_error("poll"));
        }
        Ok(rc > 0 && (pfd.revents & libc::POLLIN) != 0)
    }
}

impl Drop for Sock {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn last_os_error(op: &str) -> SupervisorError {
    SupervisorError::Sniff(format!("{op}: {}", io::Error::last_os_error()))
}

pub mod bpf;
pub mod cache;
pub mod handoff;
pub mod mac;
pub mod pcap;
pub mod poll;
pub mod socket;

use std::ffi::CStr;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub use bpf::BpfProgram;
pub use cache::{ArpCache, CacheDelta};
pub use mac::MacAddress;
pub use socket::RawEthSocket;

use crate::error::{Error, Result};

/// A link-level socket the engines send on and receive from.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// `None` blocks until a frame arrives, a zero timeout never blocks.
    /// Returns `Ok(None)` when the timeout elapsed.
    fn recv(&self, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>>;

    /// Descriptor usable with poll(2), if the transport has one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Only deliver frames the program accepts from now on.
    fn attach_filter(&self, _program: &BpfProgram) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport does not support capture filters",
        ))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VirtualIface {
    pub name: String,
    pub hw: MacAddress,
    pub ip: Ipv4Addr,
}

pub fn get_interface_index(name: &str) -> Result<i32> {
    let path = format!("/sys/class/net/{}/ifindex", name);
    fs::read_to_string(path)
        .ok()
        .and_then(|index| index.trim().parse().ok())
        .ok_or_else(|| Error::InterfaceNotFound(name.to_owned()))
}

pub fn get_interface_mac(name: &str) -> Result<MacAddress> {
    let path = format!("/sys/class/net/{}/address", name);
    let address =
        fs::read_to_string(path).map_err(|_| Error::InterfaceNotFound(name.to_owned()))?;
    address
        .trim()
        .parse()
        .map_err(|_| Error::InterfaceNotFound(name.to_owned()))
}

/// First IPv4 address assigned to the interface.
pub fn get_interface_ip(name: &str) -> Option<Ipv4Addr> {
    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return None;
    }

    let mut found = None;
    let mut cursor = addrs;
    while !cursor.is_null() {
        // SAFETY: getifaddrs returned a valid list that lives until freeifaddrs
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        let entry_name = unsafe { CStr::from_ptr(entry.ifa_name) };
        if entry_name.to_bytes() != name.as_bytes() {
            continue;
        }
        if unsafe { (*entry.ifa_addr).sa_family } as i32 != libc::AF_INET {
            continue;
        }
        let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        break;
    }

    unsafe { libc::freeifaddrs(addrs) };
    found
}

/// Every interface the system knows about, sorted by name.
pub fn find_all_devs() -> Result<Vec<VirtualIface>> {
    let mut names: Vec<String> = fs::read_dir("/sys/class/net")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    Ok(names
        .into_iter()
        .map(|name| VirtualIface {
            hw: get_interface_mac(&name).unwrap_or_else(|_| MacAddress::nil()),
            ip: get_interface_ip(&name).unwrap_or(Ipv4Addr::UNSPECIFIED),
            name,
        })
        .collect())
}

/// First interface that is not loopback, for when none was given.
pub fn default_interface() -> Result<String> {
    find_all_devs()?
        .into_iter()
        .find(|iface| iface.name != "lo" && iface.hw.is_unicast())
        .map(|iface| iface.name)
        .ok_or_else(|| Error::InterfaceNotFound(String::from("<default>")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_reported() {
        let err = get_interface_index("no-such-iface0").unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound(name) if name == "no-such-iface0"));
        assert!(get_interface_mac("no-such-iface0").is_err());
        assert_eq!(get_interface_ip("no-such-iface0"), None);
    }
}

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{
    c_void, recvfrom, sendto, sockaddr, sockaddr_ll, socklen_t, AF_PACKET, ETH_P_ALL, SOCK_RAW,
};
use log::info;
use socket2::Socket;

use super::{get_interface_index, BpfProgram, Transport};
use crate::error::Result;

/// AF_PACKET socket bound to one interface.
pub struct RawEthSocket {
    inner: Socket,
    interface_index: i32,
    ignore_outgoing: bool,
}

impl RawEthSocket {
    const PROTO: u16 = (ETH_P_ALL as u16).to_be();
    const SNAPLEN: usize = 65536;

    pub fn open(interface: &str) -> Result<Self> {
        let interface_index = get_interface_index(interface)?;
        let inner = Socket::new(
            AF_PACKET.into(),
            SOCK_RAW.into(),
            Some((Self::PROTO as i32).into()),
        )?;

        let address = Self::link_address(interface_index, &[0; 6]);
        let res = unsafe {
            libc::bind(
                inner.as_raw_fd(),
                &address as *const sockaddr_ll as *const sockaddr,
                std::mem::size_of::<sockaddr_ll>() as u32,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }

        info!("Opened raw socket on {} (index {})", interface, interface_index);
        Ok(Self {
            inner,
            interface_index,
            ignore_outgoing: false,
        })
    }

    /// Drop frames the host itself transmits instead of returning them
    /// from `recv`.
    pub fn ignore_outgoing(mut self, ignore: bool) -> Self {
        self.ignore_outgoing = ignore;
        self
    }

    fn link_address(interface_index: i32, mac: &[u8]) -> sockaddr_ll {
        let mut address = sockaddr_ll {
            sll_family: AF_PACKET as u16,
            sll_protocol: Self::PROTO,
            sll_ifindex: interface_index,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };
        address.sll_addr[..6].copy_from_slice(&mac[..6]);
        address
    }
}

impl Transport for RawEthSocket {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        if frame.len() < 6 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame too short for a destination address",
            ));
        }
        let address = Self::link_address(self.interface_index, &frame[..6]);

        let result = unsafe {
            sendto(
                self.inner.as_raw_fd(),
                frame.as_ptr() as *const c_void,
                frame.len(),
                0,
                &address as *const sockaddr_ll as *const sockaddr,
                std::mem::size_of::<sockaddr_ll>() as u32,
            )
        };

        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn recv(&self, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>> {
        let flags = match timeout {
            Some(t) if t.is_zero() => libc::MSG_DONTWAIT,
            other => {
                self.inner.set_read_timeout(other)?;
                0
            }
        };

        let mut buf = vec![0u8; Self::SNAPLEN];
        loop {
            // SAFETY: sockaddr_ll is plain old data
            let mut address: sockaddr_ll = unsafe { std::mem::zeroed() };
            let mut address_len = std::mem::size_of::<sockaddr_ll>() as socklen_t;
            let n = unsafe {
                recvfrom(
                    self.inner.as_raw_fd(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                    flags,
                    &mut address as *mut sockaddr_ll as *mut sockaddr,
                    &mut address_len,
                )
            };

            if n < 0 {
                let e = io::Error::last_os_error();
                return match e.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => Ok(None),
                    _ => Err(e),
                };
            }
            if self.ignore_outgoing && is_outgoing(&address) {
                continue;
            }
            buf.truncate(n as usize);
            return Ok(Some(buf));
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.inner.as_raw_fd())
    }

    fn attach_filter(&self, program: &BpfProgram) -> io::Result<()> {
        program.attach(&self.inner)
    }
}

fn is_outgoing(address: &sockaddr_ll) -> bool {
    address.sll_pkttype == libc::PACKET_OUTGOING
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_packet_direction() {
        let mut address = RawEthSocket::link_address(1, &[0; 6]);
        address.sll_pkttype = libc::PACKET_OUTGOING;
        assert!(is_outgoing(&address));

        for pkttype in [libc::PACKET_HOST, libc::PACKET_BROADCAST, libc::PACKET_OTHERHOST] {
            address.sll_pkttype = pkttype;
            assert!(!is_outgoing(&address));
        }
    }
}

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddrV4;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};
use tokio::net::UdpSocket;

use crate::bridge::BridgeError;

/// UDP socket with the options both the data and the control socket need
pub fn new_socket() -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // tokio drives the socket, so it must never block
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;

    Ok(socket)
}

/// Join the radome's data group on `nic_addr` and listen on the data port.
///
/// Windows refuses a bind to a group address, so the socket listens on the
/// wildcard address and relies on the group membership alone.
#[cfg(windows)]
fn bind_to_multicast(
    socket: &socket2::Socket,
    addr: &SocketAddrV4,
    nic_addr: &Ipv4Addr,
) -> io::Result<()> {
    socket.join_multicast_v4(addr.ip(), nic_addr)?;

    let socketaddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
    socket.bind(&socket2::SockAddr::from(socketaddr))?;
    log::trace!("Data socket on {} joined {} via {}", socketaddr, addr.ip(), nic_addr);

    Ok(())
}

/// Join the radome's data group on `nic_addr` and listen on the data port.
///
/// The socket binds to the group address itself, so unicast traffic that
/// happens to hit the data port never reaches the sweep assembler.
#[cfg(unix)]
fn bind_to_multicast(
    socket: &socket2::Socket,
    addr: &SocketAddrV4,
    nic_addr: &Ipv4Addr,
) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    multicast_on_nic_only(socket)?;

    let socketaddr = SocketAddr::new(IpAddr::V4(*addr.ip()), addr.port());
    socket.bind(&socket2::SockAddr::from(socketaddr))?;

    socket.join_multicast_v4(addr.ip(), nic_addr)?;

    log::trace!("Data socket on {} joined {} via {}", socketaddr, addr.ip(), nic_addr);

    Ok(())
}

/// Only accept the group on the interface it was joined on. With
/// IP_MULTICAST_ALL left on, Linux also hands the socket the same group when
/// another process joined it on a different NIC.
#[cfg(target_os = "linux")]
fn multicast_on_nic_only(socket: &socket2::Socket) -> io::Result<()> {
    use std::{mem, os::unix::io::AsRawFd};

    let optval: libc::c_int = 0;
    // SAFETY: the descriptor is owned by `socket` and optval outlives the call
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            libc::IP_MULTICAST_ALL,
            &optval as *const _ as *const libc::c_void,
            mem::size_of_val(&optval) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Join the radome's data group and return the socket the ingest loop reads.
///
/// A `recv_buffer` of 0 keeps the operating system default. The kernel may
/// clamp larger requests, which is logged but not an error.
pub fn create_udp_multicast_listen(
    addr: &SocketAddrV4,
    nic_addr: &Ipv4Addr,
    recv_buffer: usize,
) -> io::Result<UdpSocket> {
    let socket: socket2::Socket = new_socket()?;

    if recv_buffer > 0 {
        socket.set_recv_buffer_size(recv_buffer)?;
        let actual = socket.recv_buffer_size()?;
        if actual < recv_buffer {
            log::debug!(
                "Receive buffer for {} is {} bytes, asked for {}",
                addr,
                actual,
                recv_buffer
            );
        }
    }

    bind_to_multicast(&socket, addr, nic_addr)?;

    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

/// Unicast socket connected to the radome's control port
pub fn create_control_socket(radar: &SocketAddrV4, nic_addr: &Ipv4Addr) -> io::Result<UdpSocket> {
    let socket: socket2::Socket = new_socket()?;

    let socketaddr_nic = SocketAddr::new(IpAddr::V4(*nic_addr), 0);
    socket.bind(&socket2::SockAddr::from(socketaddr_nic))?;
    socket.connect(&socket2::SockAddr::from(*radar))?;
    log::trace!("Control socket {} -> {}", socketaddr_nic, radar);

    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

pub fn match_ipv4(addr: &Ipv4Addr, bcast: &Ipv4Addr, netmask: &Ipv4Addr) -> bool {
    let r = addr & netmask;
    let b = bcast & netmask;
    r == b
}

/// Resolve the `--interface` argument, which is either an IPv4 address or
/// the name of a network interface.
pub fn resolve_interface(interface: &str) -> Result<Ipv4Addr, BridgeError> {
    if let Ok(addr) = interface.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    let interfaces =
        NetworkInterface::show().map_err(|e| BridgeError::Enumerate(e.to_string()))?;

    let itf = interfaces
        .iter()
        .find(|itf| itf.name == interface)
        .ok_or_else(|| BridgeError::InterfaceNotFound(interface.to_string()))?;

    itf.addr
        .iter()
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| BridgeError::InterfaceNoV4(interface.to_string()))
}

/// Find the NIC address that is on the same subnet as the radome.
///
/// Returns `None` when no interface matches; callers then let the operating
/// system pick one.
pub fn find_nic_for_radar(radar_ip: &Ipv4Addr) -> Option<Ipv4Addr> {
    let interfaces = NetworkInterface::show().ok()?;

    for itf in &interfaces {
        for addr in &itf.addr {
            if let (IpAddr::V4(nic_ip), Some(IpAddr::V4(netmask))) = (addr.ip(), addr.netmask()) {
                if !nic_ip.is_loopback() && match_ipv4(&nic_ip, radar_ip, &netmask) {
                    log::debug!("Found NIC {} ({}) for radar {}", itf.name, nic_ip, radar_ip);
                    return Some(nic_ip);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_ipv4() {
        let mask = Ipv4Addr::new(255, 255, 0, 0);
        assert!(match_ipv4(
            &Ipv4Addr::new(172, 16, 3, 4),
            &Ipv4Addr::new(172, 16, 2, 0),
            &mask
        ));
        assert!(!match_ipv4(
            &Ipv4Addr::new(172, 17, 2, 0),
            &Ipv4Addr::new(172, 16, 2, 0),
            &mask
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_multicast_on_nic_only() {
        use std::os::unix::io::AsRawFd;

        let socket = new_socket().unwrap();
        multicast_on_nic_only(&socket).unwrap();

        let mut optval: libc::c_int = 1;
        let mut len = std::mem::size_of_val(&optval) as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                libc::SOL_IP,
                libc::IP_MULTICAST_ALL,
                &mut optval as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(ret, 0);
        assert_eq!(optval, 0);
    }

    #[test]
    fn test_resolve_interface_address() {
        assert_eq!(
            resolve_interface("10.1.2.3").unwrap(),
            Ipv4Addr::new(10, 1, 2, 3)
        );
    }

    #[test]
    fn test_resolve_unknown_interface() {
        assert!(matches!(
            resolve_interface("no-such-nic0"),
            Err(BridgeError::InterfaceNotFound(_)) | Err(BridgeError::Enumerate(_))
        ));
    }

    #[tokio::test]
    async fn test_control_socket_is_connected() {
        let radar = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let radar_addr = match radar.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };

        let sock = create_control_socket(&radar_addr, &Ipv4Addr::LOCALHOST).unwrap();
        assert_eq!(sock.peer_addr().unwrap(), SocketAddr::V4(radar_addr));

        sock.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 8];
        let n = radar.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }
}

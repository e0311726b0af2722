//! Host address resolution

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// The address other machines on the network would reach us at.
///
/// Connecting a UDP socket only consults the routing table, no packet is
/// sent. Falls back to loopback when there is no route.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::warn!("Could not determine local address, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

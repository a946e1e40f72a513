//! LAN address discovery for the startup banner.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Address of the interface that routes toward the LAN.
///
/// Connecting a UDP socket sends nothing; it only asks the OS to pick a
/// source address. Falls back to loopback.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Address to advertise: the bound host, or the LAN address for wildcard binds.
pub fn advertised_ip(bind: IpAddr) -> IpAddr {
    if bind.is_unspecified() {
        local_ip()
    } else {
        bind
    }
}

//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Address helpers for the registering side

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::Node;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Route probes, one per RFC 1918 block. Connecting a UDP socket sends
/// nothing; it only makes the kernel pick the outgoing interface.
const PRIVATE_PROBES: [&str; 3] = [
    "10.255.255.254:9",
    "172.31.255.254:9",
    "192.168.255.254:9",
];

/// First private IPv4 address the host routes from
pub fn local_private_ipv4() -> DiscoveryResult<Ipv4Addr> {
    PRIVATE_PROBES
        .iter()
        .filter_map(|probe| route_source(probe))
        .find(Ipv4Addr::is_private)
        .ok_or_else(|| {
            DiscoveryError::Configuration(
                "no private IPv4 address found and no explicit host given".to_string(),
            )
        })
}

fn route_source(probe: &str) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(probe).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

/// Split `host:port`, `:port` or `[v6]:port`
fn split_listen(listen: &str) -> DiscoveryResult<(&str, u16)> {
    let invalid = || DiscoveryError::Configuration(format!("invalid listen address: {}", listen));

    let (host, port) = listen.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host, port))
}

fn is_wildcard(host: &str) -> bool {
    host.is_empty()
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false)
}

/// Address other processes should dial for a server listening on `listen`.
///
/// Wildcard hosts are replaced by the host's private IPv4 address; explicit
/// hosts are kept.
pub fn advertise_address(listen: &str) -> DiscoveryResult<(String, u16)> {
    let (host, port) = split_listen(listen)?;
    if is_wildcard(host) {
        return Ok((local_private_ipv4()?.to_string(), port));
    }
    Ok((host.to_string(), port))
}

/// A fresh node advertising the server listening on `listen`
pub fn advertised_node(listen: &str) -> DiscoveryResult<Node> {
    let (address, port) = advertise_address(listen)?;
    Ok(Node::new(address, port))
}

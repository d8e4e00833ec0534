//! Turning the configured host and port lists into concrete socket
//! addresses: comma-separated lists, wildcard expansion over the local
//! interfaces, DNS names, and positional port alignment.

use crate::smtp::SmtpError;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Expands `hosts` x `ports` into bind addresses.
///
/// Hosts and ports are comma-separated. Ports align positionally with
/// hosts; when hosts outnumber port tokens the last token is reused. A
/// port token may itself be a colon-separated list (`2525:3535`), giving
/// several bindings per host. The literal `*` stands for every local
/// interface address that is neither multicast nor link-local.
pub(crate) fn expand_bindings(hosts: &str, ports: &str) -> Result<Vec<SocketAddr>, SmtpError> {
    let host_tokens: Vec<&str> = hosts.split(',').map(str::trim).collect();
    let port_lists = expand_ports(ports)?;
    if port_lists.is_empty() {
        return Err(SmtpError::Config("no ports configured".to_owned()));
    }

    let mut bindings = Vec::new();
    for (index, host) in host_tokens.iter().enumerate() {
        if host.is_empty() {
            return Err(SmtpError::Config("empty host token".to_owned()));
        }
        let ports = &port_lists[index.min(port_lists.len() - 1)];
        for ip in addresses_for(host)? {
            for port in ports {
                let addr = SocketAddr::new(ip, *port);
                if !bindings.contains(&addr) {
                    bindings.push(addr);
                }
            }
        }
    }
    Ok(bindings)
}

fn expand_ports(ports: &str) -> Result<Vec<Vec<u16>>, SmtpError> {
    let mut lists = Vec::new();
    for token in ports.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(SmtpError::Config("empty port token".to_owned()));
        }
        let mut list = Vec::new();
        for part in token.split(':') {
            let port: u16 = part.trim().parse().map_err(|_| {
                SmtpError::Config(format!("invalid port number {:?}", part))
            })?;
            list.push(port);
        }
        lists.push(list);
    }
    Ok(lists)
}

fn addresses_for(host: &str) -> Result<Vec<IpAddr>, SmtpError> {
    if host == "*" {
        return local_addresses();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    // a name resolves to all of its addresses
    let resolved = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| SmtpError::Config(format!("cannot resolve {:?}: {}", host, e)))?
        .map(|addr| addr.ip())
        .collect::<Vec<_>>();
    if resolved.is_empty() {
        return Err(SmtpError::Config(format!("{:?} has no addresses", host)));
    }
    Ok(resolved)
}

/// Every local interface address worth listening on. Multicast and
/// link-local addresses are skipped, loopback and global ones stay.
fn local_addresses() -> Result<Vec<IpAddr>, SmtpError> {
    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| SmtpError::Config(format!("cannot list interfaces: {}", e)))?;
    let mut addresses = Vec::new();
    for interface in interfaces {
        let ip = interface.ip();
        if ip.is_multicast() || is_link_local(&ip) {
            continue;
        }
        if !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }
    if addresses.is_empty() {
        return Err(SmtpError::Config("no usable interface addresses".to_owned()));
    }
    Ok(addresses)
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        // fe80::/10
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

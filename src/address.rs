use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::{Context, Result, bail};

/// 上游缺省端口。
pub const DEFAULT_DNS_PORT: u16 = 53;

/// 上游服务器地址，配置中写作 `ip` 或 `ip:port`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl ServerAddress {
    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SocketAddr 会给 IPv6 加上方括号
        self.socket_addr().fmt(f)
    }
}

impl FromStr for ServerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_server_address(s)
    }
}

/// Parse `ip`, `ip:port`, bare IPv6 (`::1`) or bracketed IPv6 (`[::1]:5353`).
/// A missing or non-numeric port falls back to 53; an empty host is an error.
pub fn parse_server_address(raw: &str) -> Result<ServerAddress> {
    let raw = raw.trim();
    let (host, port) = split_host_port(raw);
    if host.is_empty() {
        bail!("server address has no host part: {:?}", raw);
    }
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("server address host is not an ip literal: {:?}", raw))?;
    let port = port
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_DNS_PORT);
    Ok(ServerAddress { ip, port })
}

fn split_host_port(raw: &str) -> (&str, Option<&str>) {
    if let Some(rest) = raw.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':')),
            None => (rest, None),
        };
    }
    // 多于一个冒号视为不带端口的 IPv6
    if raw.matches(':').count() > 1 {
        return (raw, None);
    }
    match raw.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (raw, None),
    }
}

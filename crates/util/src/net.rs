//! Bind/join address parsing. A trimmed-down relative of `SocketAddrHelper`
//! that drops the multiaddr machinery the original used for libp2p transports:
//! this core speaks plain UDP/TCP, so `host:port` is all that is needed.

use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::num::NonZeroU16;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketAddrHelper {
    inner: HashSet<SocketAddr>,
}

impl SocketAddrHelper {
    pub fn empty() -> Self {
        Self { inner: HashSet::new() }
    }

    pub fn from_host_string(host_string: &str) -> anyhow::Result<Self> {
        let inner = host_string.to_socket_addrs()?.collect();
        Ok(Self { inner })
    }

    /// Accepts either `host` or `host:port`; appends `default_port` if only a
    /// bare host was given.
    pub fn from_host(host_string: &str, default_port: NonZeroU16) -> anyhow::Result<Self> {
        if let Ok(addr) = host_string.parse::<SocketAddr>() {
            Ok(addr.into())
        } else {
            Ok(Self {
                inner: (host_string, default_port.get()).to_socket_addrs()?.collect(),
            })
        }
    }

    pub fn unspecified(port: u16) -> Self {
        let mut inner = HashSet::new();
        inner.insert(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
        Self { inner }
    }

    pub fn iter(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.inner.iter().copied()
    }

    pub fn first(&self) -> Option<SocketAddr> {
        self.inner.iter().next().copied()
    }
}

impl From<SocketAddr> for SocketAddrHelper {
    fn from(s: SocketAddr) -> Self {
        let mut inner = HashSet::new();
        inner.insert(s);
        Self { inner }
    }
}

impl FromStr for SocketAddrHelper {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::from_host_string(s)
    }
}

impl Display for SocketAddrHelper {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let v = self.inner.iter().map(SocketAddr::to_string).collect::<Vec<_>>().join(", ");
        write!(f, "[{}]", v)
    }
}

impl<'de> Deserialize<'de> for SocketAddrHelper {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<SocketAddrHelper, D::Error> {
        String::deserialize(deserializer)?.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let addr = SocketAddrHelper::from_str("127.0.0.1:7946").unwrap();
        assert_eq!(addr.first(), Some("127.0.0.1:7946".parse().unwrap()));
    }

    #[test]
    fn appends_default_port() {
        let addr = SocketAddrHelper::from_host("127.0.0.1", NonZeroU16::new(7946).unwrap()).unwrap();
        assert_eq!(addr.first(), Some("127.0.0.1:7946".parse().unwrap()));
    }
}

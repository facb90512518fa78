//! Multi-segment peer addresses: `/ip4/127.0.0.1/tcp/8080/p2p/<peer-id>`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::identity::PeerId;

/// Default listen address used by the server when none is configured.
pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/127.0.0.1/tcp/8080";

/// Network host part of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPart {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    /// DNS name; `family` restricts resolution for `/dns4` and `/dns6`.
    Dns { name: String, family: DnsFamily },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsFamily {
    Any,
    V4,
    V6,
}

/// Resolvable locator without a peer identity. Used for listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    host: HostPart,
    port: u16,
}

/// Locator plus the identity expected at the other end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    locator: ListenAddress,
    peer_id: PeerId,
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address must start with '/': {0:?}")]
    MissingLeadingSlash(String),
    #[error("unknown protocol segment {0:?}")]
    UnknownSegment(String),
    #[error("segment {0:?} is missing its value")]
    MissingValue(&'static str),
    #[error("invalid {kind} value {value:?}")]
    InvalidValue { kind: &'static str, value: String },
    #[error("address has no /tcp port")]
    MissingPort,
    #[error("address has no host segment")]
    MissingHost,
    #[error("address has no /p2p peer id")]
    MissingPeerId,
    #[error("unexpected trailing segment {0:?}")]
    Trailing(String),
    #[error("could not resolve {0}")]
    Unresolved(String),
}

impl ListenAddress {
    pub fn new(host: HostPart, port: u16) -> Self {
        Self { host, port }
    }

    pub fn host(&self) -> &HostPart {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Attach a peer identity, producing a dialable address.
    pub fn with_peer(self, peer_id: PeerId) -> PeerAddress {
        PeerAddress {
            locator: self,
            peer_id,
        }
    }

    /// Resolve to one socket address. IP hosts resolve without I/O.
    pub async fn resolve(&self) -> Result<SocketAddr, AddressError> {
        let (name, family) = match &self.host {
            HostPart::Ip4(ip) => return Ok(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            HostPart::Ip6(ip) => return Ok(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            HostPart::Dns { name, family } => (name, *family),
        };
        let candidates = tokio::net::lookup_host((name.as_str(), self.port))
            .await
            .map_err(|_| AddressError::Unresolved(name.clone()))?;
        candidates
            .into_iter()
            .find(|a| match family {
                DnsFamily::Any => true,
                DnsFamily::V4 => a.is_ipv4(),
                DnsFamily::V6 => a.is_ipv6(),
            })
            .ok_or_else(|| AddressError::Unresolved(name.clone()))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => HostPart::Ip4(ip),
            IpAddr::V6(ip) => HostPart::Ip6(ip),
        };
        Self::new(host, addr.port())
    }
}

impl PeerAddress {
    pub fn locator(&self) -> &ListenAddress {
        &self.locator
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

/// Parsed segments shared by both address kinds.
fn parse_segments(s: &str) -> Result<(ListenAddress, Option<PeerId>), AddressError> {
    let rest = s
        .strip_prefix('/')
        .ok_or_else(|| AddressError::MissingLeadingSlash(s.to_string()))?;
    let mut parts = rest.split('/');
    let mut host = None;
    let mut port = None;
    let mut peer_id = None;

    while let Some(proto) = parts.next() {
        if peer_id.is_some() {
            return Err(AddressError::Trailing(proto.to_string()));
        }
        match proto {
            "ip4" => {
                let v = next_value(&mut parts, "ip4")?;
                let ip = v.parse().map_err(|_| invalid("ip4", v))?;
                host = Some(HostPart::Ip4(ip));
            }
            "ip6" => {
                let v = next_value(&mut parts, "ip6")?;
                let ip = v.parse().map_err(|_| invalid("ip6", v))?;
                host = Some(HostPart::Ip6(ip));
            }
            "dns" | "dns4" | "dns6" => {
                let kind = match proto {
                    "dns4" => DnsFamily::V4,
                    "dns6" => DnsFamily::V6,
                    _ => DnsFamily::Any,
                };
                let v = next_value(&mut parts, "dns")?;
                host = Some(HostPart::Dns {
                    name: v.to_string(),
                    family: kind,
                });
            }
            "tcp" => {
                if host.is_none() {
                    return Err(AddressError::MissingHost);
                }
                let v = next_value(&mut parts, "tcp")?;
                port = Some(v.parse::<u16>().map_err(|_| invalid("tcp", v))?);
            }
            "p2p" => {
                if port.is_none() {
                    return Err(AddressError::MissingPort);
                }
                let v = next_value(&mut parts, "p2p")?;
                peer_id = Some(v.parse::<PeerId>().map_err(|_| invalid("p2p", v))?);
            }
            other => return Err(AddressError::UnknownSegment(other.to_string())),
        }
    }

    let host = host.ok_or(AddressError::MissingHost)?;
    let port = port.ok_or(AddressError::MissingPort)?;
    Ok((ListenAddress { host, port }, peer_id))
}

fn next_value<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    kind: &'static str,
) -> Result<&'a str, AddressError> {
    match parts.next() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AddressError::MissingValue(kind)),
    }
}

fn invalid(kind: &'static str, value: &str) -> AddressError {
    AddressError::InvalidValue {
        kind,
        value: value.to_string(),
    }
}

impl FromStr for ListenAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_segments(s.trim())? {
            (locator, None) => Ok(locator),
            (_, Some(id)) => Err(AddressError::Trailing(format!("p2p/{}", id))),
        }
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (locator, peer_id) = parse_segments(s.trim())?;
        let peer_id = peer_id.ok_or(AddressError::MissingPeerId)?;
        Ok(locator.with_peer(peer_id))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            HostPart::Ip4(ip) => write!(f, "/ip4/{}", ip)?,
            HostPart::Ip6(ip) => write!(f, "/ip6/{}", ip)?,
            HostPart::Dns { name, family } => {
                let proto = match family {
                    DnsFamily::Any => "dns",
                    DnsFamily::V4 => "dns4",
                    DnsFamily::V6 => "dns6",
                };
                write!(f, "/{}/{}", proto, name)?
            }
        }
        write!(f, "/tcp/{}", self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p2p/{}", self.locator, self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn parse_peer_address() {
        let id = Keypair::generate().peer_id();
        let text = format!("/ip4/127.0.0.1/tcp/8080/p2p/{}", id);
        let addr: PeerAddress = text.parse().unwrap();
        assert_eq!(addr.peer_id(), id);
        assert_eq!(addr.locator().port(), 8080);
        assert_eq!(
            addr.locator().host(),
            &HostPart::Ip4(Ipv4Addr::new(127, 0, 0, 1))
        );
        assert_eq!(addr.to_string(), text);
    }

    #[test]
    fn parse_listen_address_default() {
        let addr: ListenAddress = DEFAULT_LISTEN_ADDR.parse().unwrap();
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.to_string(), DEFAULT_LISTEN_ADDR);
    }

    #[test]
    fn parse_ip6_and_dns() {
        let addr: ListenAddress = "/ip6/::1/tcp/9000".parse().unwrap();
        assert_eq!(addr.host(), &HostPart::Ip6(Ipv6Addr::LOCALHOST));
        let addr: ListenAddress = "/dns4/localhost/tcp/9000".parse().unwrap();
        assert!(matches!(
            addr.host(),
            HostPart::Dns {
                family: DnsFamily::V4,
                ..
            }
        ));
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "ip4/1.2.3.4/tcp/1".parse::<ListenAddress>(),
            Err(AddressError::MissingLeadingSlash(_))
        ));
        assert!(matches!(
            "/ip4/1.2.3.4".parse::<ListenAddress>(),
            Err(AddressError::MissingPort)
        ));
        assert!(matches!(
            "/ip4/1.2.3.999/tcp/1".parse::<ListenAddress>(),
            Err(AddressError::InvalidValue { kind: "ip4", .. })
        ));
        assert!(matches!(
            "/ip4/1.2.3.4/tcp/70000".parse::<ListenAddress>(),
            Err(AddressError::InvalidValue { kind: "tcp", .. })
        ));
        assert!(matches!(
            "/ip4/1.2.3.4/udp/1".parse::<ListenAddress>(),
            Err(AddressError::UnknownSegment(_))
        ));
        assert!(matches!(
            "/ip4/1.2.3.4/tcp/1".parse::<PeerAddress>(),
            Err(AddressError::MissingPeerId)
        ));
        assert!(matches!(
            "/ip4/1.2.3.4/tcp/1/p2p/QmcdzHmdS4RSnVWw5TxH6veT6YZNgM34bNfPTSARDbpBc1"
                .parse::<PeerAddress>(),
            Err(AddressError::InvalidValue { kind: "p2p", .. })
        ));
    }

    #[test]
    fn trailing_after_peer_id_rejected() {
        let id = Keypair::generate().peer_id();
        let text = format!("/ip4/127.0.0.1/tcp/1/p2p/{}/tcp/2", id);
        assert!(matches!(
            text.parse::<PeerAddress>(),
            Err(AddressError::Trailing(_))
        ));
    }

    #[tokio::test]
    async fn resolve_ip_without_lookup() {
        let addr: ListenAddress = "/ip4/10.0.0.1/tcp/4000".parse().unwrap();
        assert_eq!(
            addr.resolve().await.unwrap(),
            "10.0.0.1:4000".parse::<SocketAddr>().unwrap()
        );
    }
}

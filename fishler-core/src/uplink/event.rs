use std::net::{IpAddr, SocketAddr};

use fishler_common::{FishlerError, SessionId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Port recorded when the advertised source port does not fit in 16 bits.
pub const FALLBACK_PORT: u32 = 55555;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    Password,
    PublicKey,
    KeyboardInteractive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceIp {
    /// Big-endian packed IPv4 address.
    Ipv4(u32),
    Ipv6([u8; 16]),
}

/// One authentication attempt as shipped to the telemetry sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub timestamp_micros: i64,
    pub service_uuid: Uuid,
    pub session_uuid: SessionId,
    pub auth_method: AuthMethod,
    pub username: String,
    pub credential: String,
    pub client_version: String,
    pub fingerprint_hash: String,
    pub source_ip: SourceIp,
    pub source_port: u32,
}

impl From<SocketAddr> for SourceIp {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => SourceIp::Ipv4(u32::from_be_bytes(ip.octets())),
            IpAddr::V6(ip) => SourceIp::Ipv6(ip.octets()),
        }
    }
}

/// Parses a `host:port` string into the event address fields. The host must
/// be a literal IP (IPv6 in brackets); an unparseable port, or one above
/// 65535, is coerced to [`FALLBACK_PORT`].
pub fn parse_net_addr(addr: &str) -> Result<(SourceIp, u32), FishlerError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| FishlerError::BadAddress(addr.to_owned()))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let ip: IpAddr = host
        .parse()
        .map_err(|_| FishlerError::BadAddress(addr.to_owned()))?;

    let mut port: u32 = port.parse().unwrap_or(FALLBACK_PORT);
    if port > u16::MAX as u32 {
        port = FALLBACK_PORT;
    }

    let source_ip = match ip {
        IpAddr::V4(ip) => SourceIp::Ipv4(u32::from_be_bytes(ip.octets())),
        IpAddr::V6(ip) => SourceIp::Ipv6(ip.octets()),
    };
    Ok((source_ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv6_with_port() {
        let (ip, port) = parse_net_addr("[2001:db8::1]:2222").unwrap();
        let SourceIp::Ipv6(octets) = ip else {
            panic!("expected ipv6");
        };
        assert_eq!(octets.len(), 16);
        assert_eq!(&octets[..4], &[0x20, 0x01, 0x0d, 0xb8]);
        assert_eq!(port, 2222);
    }

    #[test]
    fn coerces_out_of_range_port() {
        let (ip, port) = parse_net_addr("203.0.113.5:65536").unwrap();
        assert_eq!(ip, SourceIp::Ipv4(0xCB00_7105));
        assert_eq!(port, FALLBACK_PORT);
    }

    #[test]
    fn rejects_garbage_hosts() {
        assert!(parse_net_addr("not-an-ip:22").is_err());
        assert!(parse_net_addr("no-port-at-all").is_err());
    }
}

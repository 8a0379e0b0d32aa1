//! NAT-PMP wire format (RFC 6886, version byte 0).
//!
//! Covers the three request opcodes a gateway must serve: public address
//! (0), UDP map (1) and TCP map (2). All integers are network byte order.
//! Malformed frames decode to `None` and are never answered.

use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

/// The well-known UDP port NAT-PMP servers listen on.
pub const NATPMP_PORT: u16 = 5351;

/// NAT-PMP identifies its version with a `0` byte.
pub const VERSION: u8 = 0;

/// Response opcode = request opcode + 128.
const RESPONSE_FLAG: u8 = 128;

/// The protocol does not require a large datagram size.
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Operation codes for NAT-PMP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Request the public IP address of the gateway.
    PublicAddress = 0,
    /// Map a UDP port on the gateway.
    MapUdp = 1,
    /// Map a TCP port on the gateway.
    MapTcp = 2,
}

/// Result codes in a NAT-PMP response.
/// See <https://www.rfc-editor.org/rfc/rfc6886#section-3.5>
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    /// Success.
    Success = 0,
    /// The server does not support this version of the protocol.
    UnsupportedVersion = 1,
    /// The server did not grant permission to perform the operation.
    NotAuthorized = 2,
    /// The server is not in a valid network state for the operation.
    NetworkFailure = 3,
    /// The server is lacking resources, such as open ports.
    OutOfResources = 4,
    /// The server does not support the requested operation.
    UnsupportedOpcode = 5,
}

/// Transport protocol of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// The request opcode that maps this protocol.
    pub fn opcode(self) -> Opcode {
        match self {
            Protocol::Udp => Opcode::MapUdp,
            Protocol::Tcp => Opcode::MapTcp,
        }
    }

    /// Name as used on the iptables command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded request frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// 2-byte public address request (opcode 0).
    PublicAddress,
    /// 12-byte mapping request (opcode 1 or 2). A zero lifetime is a
    /// deletion request.
    Map {
        protocol: Protocol,
        internal_port: u16,
        suggested_external_port: u16,
        lifetime: u32,
    },
}

impl Request {
    /// Decode a raw datagram. Returns `None` for anything that must be
    /// silently dropped: short frames, version other than 0, unknown
    /// opcodes, or a mapping request shorter than 12 bytes.
    pub fn parse(data: &[u8]) -> Option<Request> {
        let mut buf = data;
        if buf.remaining() < 2 {
            return None;
        }
        if buf.get_u8() != VERSION {
            return None;
        }

        let opcode = Opcode::try_from(buf.get_u8()).ok()?;
        match opcode {
            Opcode::PublicAddress => Some(Request::PublicAddress),
            Opcode::MapUdp | Opcode::MapTcp => {
                if data.len() < 12 {
                    return None;
                }
                buf.advance(2); // Reserved.
                let internal_port = buf.get_u16();
                let suggested_external_port = buf.get_u16();
                let lifetime = buf.get_u32();
                let protocol = match opcode {
                    Opcode::MapUdp => Protocol::Udp,
                    _ => Protocol::Tcp,
                };
                Some(Request::Map {
                    protocol,
                    internal_port,
                    suggested_external_port,
                    lifetime,
                })
            }
        }
    }

    /// Encode this request to wire bytes (used by client tooling and tests).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.put_u8(VERSION);
        match *self {
            Request::PublicAddress => {
                out.put_u8(Opcode::PublicAddress as u8);
            }
            Request::Map {
                protocol,
                internal_port,
                suggested_external_port,
                lifetime,
            } => {
                out.put_u8(protocol.opcode() as u8);
                out.put_u16(0); // Reserved.
                out.put_u16(internal_port);
                out.put_u16(suggested_external_port);
                out.put_u32(lifetime);
            }
        }
        out
    }
}

/// A response frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response {
    /// 12-byte public address response (opcode 128).
    PublicAddress {
        result: ResultCode,
        epoch: u32,
        external_ip: Ipv4Addr,
    },
    /// 16-byte mapping response (opcode 129 or 130).
    Map {
        protocol: Protocol,
        result: ResultCode,
        epoch: u32,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    },
}

impl Response {
    /// Encode this response to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.put_u8(VERSION);
        match *self {
            Response::PublicAddress {
                result,
                epoch,
                external_ip,
            } => {
                out.put_u8(Opcode::PublicAddress as u8 + RESPONSE_FLAG);
                out.put_u16(result as u16);
                out.put_u32(epoch);
                out.put_slice(&external_ip.octets());
            }
            Response::Map {
                protocol,
                result,
                epoch,
                internal_port,
                external_port,
                lifetime,
            } => {
                out.put_u8(protocol.opcode() as u8 + RESPONSE_FLAG);
                out.put_u16(result as u16);
                out.put_u32(epoch);
                out.put_u16(internal_port);
                out.put_u16(external_port);
                out.put_u32(lifetime);
            }
        }
        out
    }

    /// Decode a response frame (used by client tooling and tests).
    pub fn parse(data: &[u8]) -> Option<Response> {
        let mut buf = data;
        if buf.remaining() < 12 {
            return None;
        }
        if buf.get_u8() != VERSION {
            return None;
        }

        let op = buf.get_u8();
        let opcode = Opcode::try_from(op.checked_sub(RESPONSE_FLAG)?).ok()?;
        let result = ResultCode::try_from(buf.get_u16()).ok()?;
        let epoch = buf.get_u32();

        match opcode {
            Opcode::PublicAddress => {
                let external_ip =
                    Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
                Some(Response::PublicAddress {
                    result,
                    epoch,
                    external_ip,
                })
            }
            Opcode::MapUdp | Opcode::MapTcp => {
                if data.len() < 16 {
                    return None;
                }
                let protocol = match opcode {
                    Opcode::MapUdp => Protocol::Udp,
                    _ => Protocol::Tcp,
                };
                Some(Response::Map {
                    protocol,
                    result,
                    epoch,
                    internal_port: buf.get_u16(),
                    external_port: buf.get_u16(),
                    lifetime: buf.get_u32(),
                })
            }
        }
    }
}

/// Current wall-clock seconds since the Unix epoch, as carried in every
/// response.
pub fn epoch_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_public_address_request() {
        assert_eq!(Request::parse(&[0, 0]), Some(Request::PublicAddress));
    }

    #[test]
    fn test_parse_map_request() {
        let frame = [0, 2, 0, 0, 0, 80, 0x1f, 0x90, 0, 0, 0x0e, 0x10];
        assert_eq!(
            Request::parse(&frame),
            Some(Request::Map {
                protocol: Protocol::Tcp,
                internal_port: 80,
                suggested_external_port: 8080,
                lifetime: 3600,
            })
        );
    }

    #[test]
    fn test_parse_drops_short_frames() {
        assert_eq!(Request::parse(&[]), None);
        assert_eq!(Request::parse(&[0]), None);
        // Map request below its 12-byte minimum
        assert_eq!(Request::parse(&[0, 1, 0, 0, 0, 80, 0x1f, 0x90]), None);
        assert_eq!(Request::parse(&[0, 2, 0, 0, 0, 80, 0x1f, 0x90, 0, 0, 0]), None);
    }

    #[test]
    fn test_parse_drops_bad_version() {
        assert_eq!(Request::parse(&[1, 0]), None);
        assert_eq!(Request::parse(&[2, 2, 0, 0, 0, 80, 0, 80, 0, 0, 0, 60]), None);
    }

    #[test]
    fn test_parse_drops_unknown_opcode() {
        assert_eq!(Request::parse(&[0, 3]), None);
        assert_eq!(Request::parse(&[0, 128]), None);
    }

    #[test]
    fn test_request_round_trip() {
        let requests = [
            Request::PublicAddress,
            Request::Map {
                protocol: Protocol::Udp,
                internal_port: 5000,
                suggested_external_port: 0,
                lifetime: 60,
            },
            Request::Map {
                protocol: Protocol::Tcp,
                internal_port: 443,
                suggested_external_port: 8443,
                lifetime: 0,
            },
        ];
        for req in requests {
            let bytes = req.encode();
            assert_eq!(Request::parse(&bytes), Some(req));
            // decode then encode reproduces the original bytes
            assert_eq!(Request::parse(&bytes).unwrap().encode(), bytes);
        }
    }

    #[test]
    fn test_public_address_response_layout() {
        // Endpoint 203.0.113.5, epoch pinned for reproducibility.
        let resp = Response::PublicAddress {
            result: ResultCode::Success,
            epoch: 1_700_000_000,
            external_ip: Ipv4Addr::new(203, 0, 113, 5),
        };
        let bytes = resp.encode();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &[0, 128, 0, 0]);
        assert_eq!(&bytes[4..8], &1_700_000_000u32.to_be_bytes());
        assert_eq!(&bytes[8..], &[0xcb, 0x00, 0x71, 0x05]);
    }

    #[test]
    fn test_map_response_layout() {
        let resp = Response::Map {
            protocol: Protocol::Tcp,
            result: ResultCode::Success,
            epoch: 1_700_000_000,
            internal_port: 80,
            external_port: 8080,
            lifetime: 3600,
        };
        let bytes = resp.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[1], 130);
        assert_eq!(&bytes[8..10], &80u16.to_be_bytes());
        assert_eq!(&bytes[10..12], &8080u16.to_be_bytes());
        assert_eq!(&bytes[12..], &3600u32.to_be_bytes());
    }

    #[test]
    fn test_response_round_trip() {
        let responses = [
            Response::PublicAddress {
                result: ResultCode::Success,
                epoch: 1_700_000_123,
                external_ip: Ipv4Addr::new(198, 51, 100, 7),
            },
            Response::Map {
                protocol: Protocol::Udp,
                result: ResultCode::OutOfResources,
                epoch: 1_700_000_456,
                internal_port: 5000,
                external_port: 0,
                lifetime: 60,
            },
        ];
        for resp in responses {
            assert_eq!(Response::parse(&resp.encode()), Some(resp));
        }
    }

    #[test]
    fn test_response_parse_rejects_request_opcode() {
        // A request frame is not a response frame.
        let req = Request::Map {
            protocol: Protocol::Tcp,
            internal_port: 80,
            suggested_external_port: 8080,
            lifetime: 3600,
        };
        assert_eq!(Response::parse(&req.encode()), None);
    }
}

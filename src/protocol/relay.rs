//! Messages exchanged between server roles and the relay hub.
//!
//! These ride the plain [`RelayCodec`](crate::core::codec::RelayCodec)
//! framing. Every request that expects an answer carries the session
//! identity, and the answer echoes it back; that identity is the only
//! correlation key, so no caller ever blocks a thread waiting on the hub.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::protocol::opcode::relay as op;

/// Opaque account or character identifier owned by the game layer.
pub type Identity = u32;

/// A reachable server role address. Immutable once published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse an `ip:port` string; only IPv4 is representable in a redirect.
    pub fn parse(address: &str) -> Result<Self> {
        match address.parse::<SocketAddr>() {
            Ok(SocketAddr::V4(v4)) => Ok(Self::from(v4)),
            Ok(SocketAddr::V6(_)) => Err(ProtocolError::ConfigError(format!(
                "Redirect endpoints must be IPv4: '{address}'"
            ))),
            Err(e) => Err(ProtocolError::ConfigError(format!(
                "Invalid endpoint '{address}': {e}"
            ))),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    fn write(&self, msg: &mut Message) {
        msg.put_bytes(&self.ip.octets()).put_u16(self.port);
    }

    fn read(msg: &mut Message) -> Result<Self> {
        let octets = msg.get_bytes(4)?;
        let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        let port = msg.get_u16()?;
        Ok(Self { ip, port })
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Logical identity of a server role instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleId {
    Login,
    Channel { world: u8, channel: u8 },
    Shop,
}

impl RoleId {
    fn write(&self, msg: &mut Message) {
        let (kind, world, channel) = match *self {
            RoleId::Login => (0, 0, 0),
            RoleId::Channel { world, channel } => (1, world, channel),
            RoleId::Shop => (2, 0, 0),
        };
        msg.put_u8(kind).put_u8(world).put_u8(channel);
    }

    fn read(msg: &mut Message) -> Result<Self> {
        let kind = msg.get_u8()?;
        let world = msg.get_u8()?;
        let channel = msg.get_u8()?;
        match kind {
            0 => Ok(RoleId::Login),
            1 => Ok(RoleId::Channel { world, channel }),
            2 => Ok(RoleId::Shop),
            other => Err(ProtocolError::Custom(format!("Unknown role kind {other}"))),
        }
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleId::Login => write!(f, "login"),
            RoleId::Channel { world, channel } => write!(f, "world {world} channel {channel}"),
            RoleId::Shop => write!(f, "shop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    RegisterChannel {
        world_id: u8,
        world_name: String,
        channel_id: u8,
        endpoint: Endpoint,
    },
    RegisterShop {
        endpoint: Endpoint,
    },
    ReportPopulation {
        world_id: u8,
        channel_id: u8,
        population: u32,
    },
    MigrateRequest {
        identity: Identity,
        from: RoleId,
        to: RoleId,
    },
    ClaimAuthority {
        identity: Identity,
        role: RoleId,
    },
    ReleaseAuthority {
        identity: Identity,
    },
    MigrateResult {
        identity: Identity,
        endpoint: Option<Endpoint>,
    },
    AuthorityResult {
        identity: Identity,
        granted: bool,
    },
}

impl RelayMessage {
    pub fn opcode(&self) -> u16 {
        match self {
            RelayMessage::RegisterChannel { .. } => op::REGISTER_CHANNEL,
            RelayMessage::RegisterShop { .. } => op::REGISTER_SHOP,
            RelayMessage::ReportPopulation { .. } => op::REPORT_POPULATION,
            RelayMessage::MigrateRequest { .. } => op::MIGRATE_REQUEST,
            RelayMessage::ClaimAuthority { .. } => op::CLAIM_AUTHORITY,
            RelayMessage::ReleaseAuthority { .. } => op::RELEASE_AUTHORITY,
            RelayMessage::MigrateResult { .. } => op::MIGRATE_RESULT,
            RelayMessage::AuthorityResult { .. } => op::AUTHORITY_RESULT,
        }
    }

    pub fn to_message(&self) -> Result<Message> {
        let mut msg = Message::new(self.opcode());
        match self {
            RelayMessage::RegisterChannel {
                world_id,
                world_name,
                channel_id,
                endpoint,
            } => {
                msg.put_u8(*world_id);
                msg.put_string(world_name)?;
                msg.put_u8(*channel_id);
                endpoint.write(&mut msg);
            }
            RelayMessage::RegisterShop { endpoint } => endpoint.write(&mut msg),
            RelayMessage::ReportPopulation {
                world_id,
                channel_id,
                population,
            } => {
                msg.put_u8(*world_id).put_u8(*channel_id).put_u32(*population);
            }
            RelayMessage::MigrateRequest { identity, from, to } => {
                msg.put_u32(*identity);
                from.write(&mut msg);
                to.write(&mut msg);
            }
            RelayMessage::ClaimAuthority { identity, role } => {
                msg.put_u32(*identity);
                role.write(&mut msg);
            }
            RelayMessage::ReleaseAuthority { identity } => {
                msg.put_u32(*identity);
            }
            RelayMessage::MigrateResult { identity, endpoint } => {
                msg.put_u32(*identity);
                msg.put_bool(endpoint.is_some());
                if let Some(endpoint) = endpoint {
                    endpoint.write(&mut msg);
                }
            }
            RelayMessage::AuthorityResult { identity, granted } => {
                msg.put_u32(*identity).put_bool(*granted);
            }
        }
        Ok(msg)
    }

    pub fn from_message(mut msg: Message) -> Result<Self> {
        let parsed = match msg.opcode() {
            op::REGISTER_CHANNEL => RelayMessage::RegisterChannel {
                world_id: msg.get_u8()?,
                world_name: msg.get_string()?,
                channel_id: msg.get_u8()?,
                endpoint: Endpoint::read(&mut msg)?,
            },
            op::REGISTER_SHOP => RelayMessage::RegisterShop {
                endpoint: Endpoint::read(&mut msg)?,
            },
            op::REPORT_POPULATION => RelayMessage::ReportPopulation {
                world_id: msg.get_u8()?,
                channel_id: msg.get_u8()?,
                population: msg.get_u32()?,
            },
            op::MIGRATE_REQUEST => RelayMessage::MigrateRequest {
                identity: msg.get_u32()?,
                from: RoleId::read(&mut msg)?,
                to: RoleId::read(&mut msg)?,
            },
            op::CLAIM_AUTHORITY => RelayMessage::ClaimAuthority {
                identity: msg.get_u32()?,
                role: RoleId::read(&mut msg)?,
            },
            op::RELEASE_AUTHORITY => RelayMessage::ReleaseAuthority {
                identity: msg.get_u32()?,
            },
            op::MIGRATE_RESULT => {
                let identity = msg.get_u32()?;
                let endpoint = if msg.get_bool()? {
                    Some(Endpoint::read(&mut msg)?)
                } else {
                    None
                };
                RelayMessage::MigrateResult { identity, endpoint }
            }
            op::AUTHORITY_RESULT => RelayMessage::AuthorityResult {
                identity: msg.get_u32()?,
                granted: msg.get_bool()?,
            },
            other => return Err(ProtocolError::UnknownRelayOpcode(other)),
        };
        Ok(parsed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_register_channel_layout() {
        let msg = RelayMessage::RegisterChannel {
            world_id: 0,
            world_name: "Scania".into(),
            channel_id: 2,
            endpoint: Endpoint::new(Ipv4Addr::new(10, 0, 0, 5), 8585),
        }
        .to_message()
        .unwrap();

        assert_eq!(msg.opcode(), op::REGISTER_CHANNEL);
        let mut expected = vec![0u8, 6, 0];
        expected.extend_from_slice(b"Scania");
        expected.extend_from_slice(&[2, 10, 0, 0, 5]);
        expected.extend_from_slice(&8585u16.to_le_bytes());
        assert_eq!(msg.payload(), &expected[..]);
    }

    #[test]
    fn test_migrate_result_without_endpoint() {
        let original = RelayMessage::MigrateResult {
            identity: 77,
            endpoint: None,
        };
        let msg = original.to_message().unwrap();
        assert_eq!(msg.payload(), &[77, 0, 0, 0, 0]);
        assert_eq!(RelayMessage::from_message(msg).unwrap(), original);
    }

    #[test]
    fn test_truncated_request_is_malformed() {
        let msg = Message::with_payload(op::MIGRATE_REQUEST, vec![1, 0, 0, 0, 1]);
        assert!(matches!(
            RelayMessage::from_message(msg),
            Err(ProtocolError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let msg = Message::new(0x7777);
        assert!(matches!(
            RelayMessage::from_message(msg),
            Err(ProtocolError::UnknownRelayOpcode(0x7777))
        ));
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("127.0.0.1:8484").unwrap();
        assert_eq!(endpoint.port, 8484);
        assert!(Endpoint::parse("[::1]:80").is_err());
        assert_eq!(RoleId::Channel { world: 1, channel: 3 }.to_string(), "world 1 channel 3");
    }
}

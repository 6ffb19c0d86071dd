//! Opcodes the core itself understands.
//!
//! Everything else on the client link is a business opcode and is passed
//! through to the game layer once the session state allows it.

/// Client-to-server opcodes handled by the session stage.
pub mod client {
    /// Acknowledges a server `AliveReq`. Payload: `u32` echo.
    pub const ALIVE_ACK: u16 = 10;
    /// Client-initiated keepalive. Payload: `u32` timestamp.
    pub const ALIVE_REQ: u16 = 11;
    /// First message after a hand-off. Payload: `u32` identity.
    pub const MIGRATE_IN: u16 = 20;
}

/// Server-to-client opcodes emitted by the core.
pub mod server {
    /// Redirect to another role: `accepted(bool) [ip(4) port(u16)]`.
    pub const MIGRATE_COMMAND: u16 = 3;
    /// Keepalive probe: `u32` unix seconds.
    pub const ALIVE_REQ: u16 = 4;
}

/// Role-to-hub and hub-to-role opcodes.
pub mod relay {
    pub const REGISTER_CHANNEL: u16 = 0x01;
    pub const REGISTER_SHOP: u16 = 0x02;
    pub const REPORT_POPULATION: u16 = 0x03;
    pub const MIGRATE_REQUEST: u16 = 0x04;
    pub const CLAIM_AUTHORITY: u16 = 0x05;
    pub const RELEASE_AUTHORITY: u16 = 0x06;

    pub const MIGRATE_RESULT: u16 = 0x81;
    pub const AUTHORITY_RESULT: u16 = 0x82;
}

/// How the session stage treats an inbound opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Keepalive,
    MigrateIn,
    Business,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Keepalive,
        MessageKind::MigrateIn,
        MessageKind::Business,
    ];

    pub fn classify(opcode: u16) -> Self {
        match opcode {
            client::ALIVE_ACK | client::ALIVE_REQ => MessageKind::Keepalive,
            client::MIGRATE_IN => MessageKind::MigrateIn,
            _ => MessageKind::Business,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(MessageKind::classify(client::ALIVE_ACK), MessageKind::Keepalive);
        assert_eq!(MessageKind::classify(client::ALIVE_REQ), MessageKind::Keepalive);
        assert_eq!(MessageKind::classify(client::MIGRATE_IN), MessageKind::MigrateIn);
        assert_eq!(MessageKind::classify(0x40), MessageKind::Business);
    }
}

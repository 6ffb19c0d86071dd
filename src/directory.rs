//! # Directory Registry
//!
//! The relay hub's single owned store: which role instances exist, where
//! they can be reached, and which role currently holds authority over each
//! identity.
//!
//! Entries are keyed by the relay connection that registered them. Removing
//! a connection removes everything it registered in the same call, so an
//! entry is reachable exactly while its relay link is open.
//!
//! ## Ownership
//! Each identity has at most one owner. A migration request marks the
//! identity as *pending hand-off* to a target role; only that role may then
//! claim it. A pending hand-off that nobody claims expires.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::relay::{Endpoint, Identity, RoleId};

/// Hub-local id of one relay connection.
pub type ConnId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub world_id: u8,
    pub channel_id: u8,
    pub endpoint: Endpoint,
    pub population: u32,
    conn: ConnId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldEntry {
    pub world_id: u8,
    pub name: String,
    /// Ordered by channel id.
    pub channels: BTreeMap<u8, ChannelEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShopEntry {
    pub endpoint: Endpoint,
    conn: ConnId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingHandoff {
    target: RoleId,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ownership {
    owner: Option<(ConnId, RoleId)>,
    pending: Option<PendingHandoff>,
}

impl Ownership {
    fn is_vacant(&self) -> bool {
        self.owner.is_none() && self.pending.is_none()
    }
}

/// Read-only copy of the registry handed to other tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    pub worlds: Vec<WorldEntry>,
    pub shop: Option<Endpoint>,
    pub owned_identities: usize,
    pub pending_handoffs: usize,
}

impl DirectorySnapshot {
    pub fn total_population(&self) -> u64 {
        self.worlds
            .iter()
            .flat_map(|w| w.channels.values())
            .map(|c| u64::from(c.population))
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct Directory {
    worlds: BTreeMap<u8, WorldEntry>,
    shop: Option<ShopEntry>,
    roles_by_conn: HashMap<ConnId, Vec<RoleId>>,
    owners: HashMap<Identity, Ownership>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    fn owner_conn(&self, role: RoleId) -> Option<ConnId> {
        match role {
            RoleId::Channel { world, channel } => self
                .worlds
                .get(&world)
                .and_then(|w| w.channels.get(&channel))
                .map(|c| c.conn),
            RoleId::Shop => self.shop.as_ref().map(|s| s.conn),
            RoleId::Login => None,
        }
    }

    fn claim_role(&mut self, conn: ConnId, role: RoleId) -> Result<()> {
        if let Some(existing) = self.owner_conn(role) {
            if existing != conn {
                return Err(ProtocolError::Custom(format!(
                    "{role} is already registered by relay connection {existing}"
                )));
            }
            return Ok(());
        }
        self.roles_by_conn.entry(conn).or_default().push(role);
        Ok(())
    }

    pub fn register_channel(
        &mut self,
        conn: ConnId,
        world_id: u8,
        world_name: &str,
        channel_id: u8,
        endpoint: Endpoint,
    ) -> Result<()> {
        self.claim_role(
            conn,
            RoleId::Channel {
                world: world_id,
                channel: channel_id,
            },
        )?;

        let world = self.worlds.entry(world_id).or_insert_with(|| WorldEntry {
            world_id,
            name: world_name.to_string(),
            channels: BTreeMap::new(),
        });
        world.channels.insert(
            channel_id,
            ChannelEntry {
                world_id,
                channel_id,
                endpoint,
                population: 0,
                conn,
            },
        );
        info!(conn, world_id, channel_id, %endpoint, "Channel registered");
        Ok(())
    }

    pub fn register_shop(&mut self, conn: ConnId, endpoint: Endpoint) -> Result<()> {
        self.claim_role(conn, RoleId::Shop)?;
        self.shop = Some(ShopEntry { endpoint, conn });
        info!(conn, %endpoint, "Shop registered");
        Ok(())
    }

    /// Update the advisory population of a channel registered by `conn`.
    pub fn report_population(&mut self, conn: ConnId, world_id: u8, channel_id: u8, population: u32) -> bool {
        match self
            .worlds
            .get_mut(&world_id)
            .and_then(|w| w.channels.get_mut(&channel_id))
        {
            Some(entry) if entry.conn == conn => {
                entry.population = population;
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, role: RoleId) -> Option<Endpoint> {
        match role {
            RoleId::Channel { world, channel } => self
                .worlds
                .get(&world)
                .and_then(|w| w.channels.get(&channel))
                .map(|c| c.endpoint),
            RoleId::Shop => self.shop.as_ref().map(|s| s.endpoint),
            RoleId::Login => None,
        }
    }

    pub fn roles_of(&self, conn: ConnId) -> &[RoleId] {
        self.roles_by_conn.get(&conn).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drop every entry registered by `conn` and every ownership it holds.
    /// Returns the roles that became unreachable.
    pub fn remove_connection(&mut self, conn: ConnId) -> Vec<RoleId> {
        let roles = self.roles_by_conn.remove(&conn).unwrap_or_default();
        for role in &roles {
            match *role {
                RoleId::Channel { world, channel } => {
                    if let Some(entry) = self.worlds.get_mut(&world) {
                        entry.channels.remove(&channel);
                        if entry.channels.is_empty() {
                            self.worlds.remove(&world);
                        }
                    }
                }
                RoleId::Shop => self.shop = None,
                RoleId::Login => {}
            }
        }

        self.owners.retain(|_, ownership| {
            if matches!(ownership.owner, Some((owner, _)) if owner == conn) {
                ownership.owner = None;
            }
            !ownership.is_vacant()
        });

        if !roles.is_empty() {
            info!(conn, roles = ?roles, "Relay connection deregistered");
        }
        roles
    }

    /// Resolve `to` and, on success, mark `identity` as handing off to it.
    ///
    /// A request for an identity owned by another connection is refused.
    pub fn begin_handoff(
        &mut self,
        conn: ConnId,
        identity: Identity,
        from: RoleId,
        to: RoleId,
        now: Instant,
        timeout: Duration,
    ) -> Option<Endpoint> {
        let endpoint = self.lookup(to)?;
        let ownership = self.owners.entry(identity).or_default();
        match ownership.owner {
            Some((owner, _)) if owner != conn => {
                warn!(conn, identity, owner, "Migration requested by a non-owner");
                return None;
            }
            Some(_) => {}
            None => ownership.owner = Some((conn, from)),
        }
        ownership.pending = Some(PendingHandoff {
            target: to,
            deadline: now + timeout,
        });
        debug!(identity, from = %from, to = %to, "Hand-off pending");
        Some(endpoint)
    }

    /// Grant `role` (registered by `conn`) authority over `identity`.
    pub fn claim(&mut self, conn: ConnId, identity: Identity, role: RoleId) -> bool {
        if !self.roles_of(conn).contains(&role) {
            warn!(conn, identity, role = %role, "Authority claim for a role this connection never registered");
            return false;
        }

        let ownership = self.owners.entry(identity).or_default();
        // A held identity is only ever granted through a hand-off aimed at the claimant.
        let granted = ownership.is_vacant() || matches!(ownership.pending, Some(p) if p.target == role);

        if granted {
            ownership.owner = Some((conn, role));
            ownership.pending = None;
        }
        granted
    }

    /// Drop ownership of `identity` if `conn` holds it. A pending hand-off
    /// survives its origin releasing.
    pub fn release(&mut self, conn: ConnId, identity: Identity) -> bool {
        let Some(ownership) = self.owners.get_mut(&identity) else {
            return false;
        };
        if !matches!(ownership.owner, Some((owner, _)) if owner == conn) {
            return false;
        }
        ownership.owner = None;
        if ownership.is_vacant() {
            self.owners.remove(&identity);
        }
        true
    }

    /// Expire pending hand-offs whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Identity> {
        let mut expired = Vec::new();
        self.owners.retain(|identity, ownership| {
            if matches!(ownership.pending, Some(p) if p.deadline <= now) {
                ownership.pending = None;
                expired.push(*identity);
            }
            !ownership.is_vacant()
        });
        expired
    }

    pub fn owner_of(&self, identity: Identity) -> Option<RoleId> {
        self.owners
            .get(&identity)
            .and_then(|o| o.owner)
            .map(|(_, role)| role)
    }

    pub fn pending_target(&self, identity: Identity) -> Option<RoleId> {
        self.owners
            .get(&identity)
            .and_then(|o| o.pending)
            .map(|p| p.target)
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            worlds: self.worlds.values().cloned().collect(),
            shop: self.shop.as_ref().map(|s| s.endpoint),
            owned_identities: self.owners.values().filter(|o| o.owner.is_some()).count(),
            pending_handoffs: self.owners.values().filter(|o| o.pending.is_some()).count(),
        }
    }
}

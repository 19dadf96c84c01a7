//! Tunnel registry with per-identity capacity limits
//!
//! Every tunnel is stored once by id; secondary indexes map subdomain, port and
//! owning session back to that id. Routing-key uniqueness is claimed through the
//! `DashMap` entry API so two concurrent creations can never both win the same key.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ops::RangeInclusive;
use tarmoq_auth::Identity;
use thiserror::Error;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ports::PortPool;
use crate::subdomain::{generate_subdomain, normalize_subdomain, validate_subdomain};
use crate::tunnel::{Tunnel, TunnelId, TunnelKind, TunnelProtocol};
use crate::RouteKey;

/// Attempts at drawing an unused random subdomain before giving up
const MAX_GENERATION_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no available ports")]
    NoAvailablePorts,

    #[error("Subdomain '{0}' is already in use")]
    SubdomainTaken(String),

    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("Could not generate a free subdomain")]
    SubdomainExhausted,

    #[error("Session {0} already owns a tunnel")]
    SessionHasTunnel(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tunnel limit reached: {identity} already has {limit} active {protocol} tunnel(s)")]
    Capacity {
        identity: Identity,
        protocol: TunnelProtocol,
        limit: usize,
    },

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("No tunnel for {0}")]
    NotFound(RouteKey),
}

/// Maximum active tunnels per identity, per protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelLimits {
    pub http: usize,
    pub tcp: usize,
}

impl TunnelLimits {
    pub fn for_protocol(&self, protocol: TunnelProtocol) -> usize {
        match protocol {
            TunnelProtocol::Http => self.http,
            TunnelProtocol::Tcp => self.tcp,
        }
    }
}

impl Default for TunnelLimits {
    fn default() -> Self {
        Self { http: 3, tcp: 1 }
    }
}

pub struct TunnelRegistry {
    tunnels: DashMap<TunnelId, Tunnel>,
    by_subdomain: DashMap<String, TunnelId>,
    by_port: DashMap<u16, TunnelId>,
    by_session: DashMap<String, TunnelId>,
    active_counts: DashMap<(Identity, TunnelProtocol), usize>,
    ports: PortPool,
    limits: TunnelLimits,
}

impl TunnelRegistry {
    pub fn new(port_range: RangeInclusive<u16>, limits: TunnelLimits) -> Self {
        Self {
            tunnels: DashMap::new(),
            by_subdomain: DashMap::new(),
            by_port: DashMap::new(),
            by_session: DashMap::new(),
            active_counts: DashMap::new(),
            ports: PortPool::new(port_range),
            limits,
        }
    }

    /// Provision an HTTP tunnel for `session_id`.
    ///
    /// A requested subdomain is normalised to lowercase and must be free;
    /// otherwise a random one is drawn.
    pub fn create_http(
        &self,
        session_id: &str,
        owner: &Identity,
        requested: Option<&str>,
    ) -> Result<Tunnel, RegistryError> {
        self.reserve_slot(owner, TunnelProtocol::Http)?;

        let tunnel_id = Uuid::new_v4().to_string();
        let claimed = self
            .claim_session(session_id, &tunnel_id)
            .and_then(|_| match requested {
                Some(requested) => self.claim_requested_subdomain(requested, &tunnel_id),
                None => self.claim_generated_subdomain(&tunnel_id),
            });

        let subdomain = match claimed {
            Ok(subdomain) => subdomain,
            Err(e) => {
                self.by_session.remove_if(session_id, |_, id| *id == tunnel_id);
                self.release_slot(owner, TunnelProtocol::Http);
                return Err(e.into());
            }
        };

        let tunnel = Tunnel {
            tunnel_id: tunnel_id.clone(),
            session_id: session_id.to_string(),
            owner: owner.clone(),
            created_at: Utc::now(),
            kind: TunnelKind::Http { subdomain },
        };
        self.tunnels.insert(tunnel_id, tunnel.clone());

        info!(
            "HTTP tunnel {} created for {} on {}",
            tunnel.tunnel_id,
            owner,
            tunnel.route_key()
        );
        Ok(tunnel)
    }

    /// Reserve a TCP tunnel record and a port for `session_id`.
    ///
    /// The caller binds the listener; if that fails it must call
    /// [`deactivate`](Self::deactivate) to roll the reservation back.
    pub fn reserve_tcp(&self, session_id: &str, owner: &Identity) -> Result<Tunnel, RegistryError> {
        self.reserve_slot(owner, TunnelProtocol::Tcp)?;

        let tunnel_id = Uuid::new_v4().to_string();
        if let Err(e) = self.claim_session(session_id, &tunnel_id) {
            self.release_slot(owner, TunnelProtocol::Tcp);
            return Err(e.into());
        }

        let port = match self.ports.acquire() {
            Ok(port) => port,
            Err(e) => {
                self.by_session.remove_if(session_id, |_, id| *id == tunnel_id);
                self.release_slot(owner, TunnelProtocol::Tcp);
                return Err(e.into());
            }
        };
        self.by_port.insert(port, tunnel_id.clone());

        let tunnel = Tunnel {
            tunnel_id: tunnel_id.clone(),
            session_id: session_id.to_string(),
            owner: owner.clone(),
            created_at: Utc::now(),
            kind: TunnelKind::Tcp { port },
        };
        self.tunnels.insert(tunnel_id, tunnel.clone());

        info!(
            "TCP tunnel {} reserved for {} on port {}",
            tunnel.tunnel_id, owner, port
        );
        Ok(tunnel)
    }

    /// Remove a tunnel and release its routing key. Returns `None` if it was
    /// already gone.
    pub fn deactivate(&self, tunnel_id: &str) -> Option<Tunnel> {
        let (_, tunnel) = self.tunnels.remove(tunnel_id)?;

        self.by_session
            .remove_if(&tunnel.session_id, |_, id| id == tunnel_id);

        match &tunnel.kind {
            TunnelKind::Http { subdomain } => {
                self.by_subdomain.remove_if(subdomain, |_, id| id == tunnel_id);
            }
            TunnelKind::Tcp { port } => {
                self.by_port.remove_if(port, |_, id| id == tunnel_id);
                self.ports.release(*port);
            }
        }

        self.release_slot(&tunnel.owner, tunnel.protocol());

        info!("Tunnel {} deactivated ({})", tunnel_id, tunnel.route_key());
        Some(tunnel)
    }

    pub fn get(&self, tunnel_id: &str) -> Result<Tunnel, RegistryError> {
        self.tunnels
            .get(tunnel_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| RegistryError::NotFound(RouteKey::Tunnel(tunnel_id.to_string())))
    }

    /// Case-insensitive lookup of an HTTP tunnel
    pub fn lookup_by_subdomain(&self, subdomain: &str) -> Result<Tunnel, RegistryError> {
        let key = normalize_subdomain(subdomain);
        trace!("Looking up tunnel for subdomain {}", key);

        self.by_subdomain
            .get(&key)
            .and_then(|id| self.tunnels.get(id.value()).map(|t| t.value().clone()))
            .ok_or(RegistryError::NotFound(RouteKey::Subdomain(key)))
    }

    pub fn lookup_by_port(&self, port: u16) -> Result<Tunnel, RegistryError> {
        self.by_port
            .get(&port)
            .and_then(|id| self.tunnels.get(id.value()).map(|t| t.value().clone()))
            .ok_or(RegistryError::NotFound(RouteKey::Port(port)))
    }

    pub fn lookup_by_session(&self, session_id: &str) -> Result<Tunnel, RegistryError> {
        self.by_session
            .get(session_id)
            .and_then(|id| self.tunnels.get(id.value()).map(|t| t.value().clone()))
            .ok_or_else(|| RegistryError::NotFound(RouteKey::Session(session_id.to_string())))
    }

    /// Active tunnels of one protocol held by `identity`
    pub fn active_count(&self, identity: &Identity, protocol: TunnelProtocol) -> usize {
        self.active_counts
            .get(&(identity.clone(), protocol))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Snapshot of all active tunnels
    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.tunnels.iter().map(|t| t.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    pub fn limits(&self) -> TunnelLimits {
        self.limits
    }

    fn reserve_slot(&self, identity: &Identity, protocol: TunnelProtocol) -> Result<(), RegistryError> {
        let limit = self.limits.for_protocol(protocol);
        let mut count = self
            .active_counts
            .entry((identity.clone(), protocol))
            .or_insert(0);

        if *count >= limit {
            debug!(
                "{} refused a {} tunnel: {} of {} in use",
                identity, protocol, *count, limit
            );
            return Err(RegistryError::Capacity {
                identity: identity.clone(),
                protocol,
                limit,
            });
        }

        *count += 1;
        Ok(())
    }

    fn release_slot(&self, identity: &Identity, protocol: TunnelProtocol) {
        let key = (identity.clone(), protocol);
        if let Some(mut count) = self.active_counts.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
        self.active_counts.remove_if(&key, |_, count| *count == 0);
    }

    fn claim_session(&self, session_id: &str, tunnel_id: &str) -> Result<(), AllocationError> {
        match self.by_session.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(AllocationError::SessionHasTunnel(session_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(tunnel_id.to_string());
                Ok(())
            }
        }
    }

    fn claim_requested_subdomain(
        &self,
        requested: &str,
        tunnel_id: &str,
    ) -> Result<String, AllocationError> {
        let subdomain = normalize_subdomain(requested);
        validate_subdomain(&subdomain).map_err(AllocationError::InvalidSubdomain)?;

        match self.by_subdomain.entry(subdomain.clone()) {
            Entry::Occupied(_) => Err(AllocationError::SubdomainTaken(subdomain)),
            Entry::Vacant(slot) => {
                slot.insert(tunnel_id.to_string());
                Ok(subdomain)
            }
        }
    }

    fn claim_generated_subdomain(&self, tunnel_id: &str) -> Result<String, AllocationError> {
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let candidate = generate_subdomain();
            if let Entry::Vacant(slot) = self.by_subdomain.entry(candidate.clone()) {
                slot.insert(tunnel_id.to_string());
                return Ok(candidate);
            }
            trace!("Generated subdomain {} collided, retrying", candidate);
        }

        Err(AllocationError::SubdomainExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TunnelRegistry {
        TunnelRegistry::new(50000..=50009, TunnelLimits::default())
    }

    #[test]
    fn test_create_http_generated_subdomain() {
        let registry = registry();
        let alice = Identity::new("alice");

        let tunnel = registry.create_http("s-1", &alice, None).unwrap();
        let subdomain = tunnel.subdomain().unwrap().to_string();
        assert_eq!(subdomain.len(), 8);

        let found = registry.lookup_by_subdomain(&subdomain).unwrap();
        assert_eq!(found.tunnel_id, tunnel.tunnel_id);
        assert_eq!(
            registry.lookup_by_session("s-1").unwrap().tunnel_id,
            tunnel.tunnel_id
        );
    }

    #[test]
    fn test_requested_subdomain_is_case_insensitive() {
        let registry = registry();
        let alice = Identity::new("alice");

        let tunnel = registry.create_http("s-1", &alice, Some("MyApp")).unwrap();
        assert_eq!(tunnel.subdomain(), Some("myapp"));
        assert!(registry.lookup_by_subdomain("MYAPP").is_ok());
    }

    #[test]
    fn test_requested_subdomain_collision() {
        let registry = registry();
        let alice = Identity::new("alice");
        let bob = Identity::new("bob");

        registry.create_http("s-1", &alice, Some("shop")).unwrap();
        let err = registry.create_http("s-2", &bob, Some("shop")).unwrap_err();

        assert_eq!(
            err,
            RegistryError::Allocation(AllocationError::SubdomainTaken("shop".to_string()))
        );
        // Failed attempt left nothing behind
        assert_eq!(registry.active_count(&bob, TunnelProtocol::Http), 0);
        assert!(registry.lookup_by_session("s-2").is_err());
    }

    #[test]
    fn test_invalid_requested_subdomain() {
        let registry = registry();
        let err = registry
            .create_http("s-1", &Identity::new("alice"), Some("bad_name"))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Allocation(AllocationError::InvalidSubdomain(_))
        ));
    }

    #[test]
    fn test_http_capacity() {
        let registry = registry();
        let alice = Identity::new("alice");

        let existing: Vec<_> = (0..3)
            .map(|i| registry.create_http(&format!("s-{}", i), &alice, None).unwrap())
            .collect();

        let err = registry.create_http("s-3", &alice, None).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Capacity {
                protocol: TunnelProtocol::Http,
                limit: 3,
                ..
            }
        ));

        for tunnel in &existing {
            assert!(registry.get(&tunnel.tunnel_id).is_ok());
        }
        assert_eq!(registry.active_count(&alice, TunnelProtocol::Http), 3);

        // Another identity is unaffected
        assert!(registry
            .create_http("s-4", &Identity::new("bob"), None)
            .is_ok());
    }

    #[test]
    fn test_tcp_capacity_and_port_reuse() {
        let registry = TunnelRegistry::new(50000..=50000, TunnelLimits::default());
        let alice = Identity::new("alice");

        let first = registry.reserve_tcp("s-1", &alice).unwrap();
        assert_eq!(first.port(), Some(50000));
        assert_eq!(registry.lookup_by_port(50000).unwrap().tunnel_id, first.tunnel_id);

        let err = registry.reserve_tcp("s-2", &alice).unwrap_err();
        assert!(matches!(err, RegistryError::Capacity { .. }));

        registry.deactivate(&first.tunnel_id).unwrap();
        assert!(registry.lookup_by_port(50000).is_err());

        let second = registry.reserve_tcp("s-2", &alice).unwrap();
        assert_eq!(second.port(), Some(50000));
    }

    #[test]
    fn test_port_exhaustion_is_allocation_error() {
        let registry = TunnelRegistry::new(50000..=50000, TunnelLimits::default());

        registry.reserve_tcp("s-1", &Identity::new("alice")).unwrap();
        let err = registry
            .reserve_tcp("s-2", &Identity::new("bob"))
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::Allocation(AllocationError::NoAvailablePorts)
        );
        assert_eq!(
            registry.active_count(&Identity::new("bob"), TunnelProtocol::Tcp),
            0
        );
    }

    #[test]
    fn test_session_owns_one_tunnel() {
        let registry = registry();
        let alice = Identity::new("alice");

        registry.create_http("s-1", &alice, None).unwrap();
        let err = registry.reserve_tcp("s-1", &alice).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Allocation(AllocationError::SessionHasTunnel(_))
        ));
        assert_eq!(registry.ports().available(), 10);
    }

    #[test]
    fn test_deactivate_is_idempotent() {
        let registry = registry();
        let alice = Identity::new("alice");
        let tunnel = registry.create_http("s-1", &alice, Some("shop")).unwrap();

        assert!(registry.deactivate(&tunnel.tunnel_id).is_some());
        assert!(registry.deactivate(&tunnel.tunnel_id).is_none());

        assert!(registry.lookup_by_subdomain("shop").is_err());
        assert_eq!(registry.active_count(&alice, TunnelProtocol::Http), 0);

        // Subdomain is reusable
        assert!(registry.create_http("s-2", &alice, Some("shop")).is_ok());
    }

    #[test]
    fn test_lookup_not_found() {
        let registry = registry();
        assert_eq!(
            registry.lookup_by_subdomain("nonexistent").unwrap_err(),
            RegistryError::NotFound(RouteKey::Subdomain("nonexistent".to_string()))
        );
        assert!(registry.lookup_by_port(50001).is_err());
    }
}

//! Lock key construction.
//!
//! Keys are `{environment}:lock:{domain}:{id}`, so two deployments sharing a
//! store never contend on each other's locks.

use std::fmt;

/// Resource domains guarded by distributed locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDomain {
    Reservation,
    Ticket,
    Payment,
    EventInventory,
    Escrow,
    Mint,
}

impl LockDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reservation => "reservation",
            Self::Ticket => "ticket",
            Self::Payment => "payment",
            Self::EventInventory => "event-inventory",
            Self::Escrow => "escrow",
            Self::Mint => "mint",
        }
    }
}

impl fmt::Display for LockDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds namespaced lock keys for one deployment environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    environment: String,
}

impl LockKeys {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn key(&self, domain: LockDomain, id: impl fmt::Display) -> String {
        self.custom(domain.as_str(), id)
    }

    /// Key for a domain not covered by [`LockDomain`].
    pub fn custom(&self, domain: &str, id: impl fmt::Display) -> String {
        format!("{}:lock:{}:{}", self.environment, domain, id)
    }

    pub fn reservation(&self, id: impl fmt::Display) -> String {
        self.key(LockDomain::Reservation, id)
    }

    pub fn ticket(&self, id: impl fmt::Display) -> String {
        self.key(LockDomain::Ticket, id)
    }

    pub fn payment(&self, id: impl fmt::Display) -> String {
        self.key(LockDomain::Payment, id)
    }

    pub fn event_inventory(&self, event_id: impl fmt::Display) -> String {
        self.key(LockDomain::EventInventory, event_id)
    }

    pub fn escrow(&self, id: impl fmt::Display) -> String {
        self.key(LockDomain::Escrow, id)
    }

    pub fn mint(&self, id: impl fmt::Display) -> String {
        self.key(LockDomain::Mint, id)
    }
}

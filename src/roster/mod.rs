//! Replicated participant data.
//!
//! The server owns the roster; clients hold read-only replicas refreshed
//! by explicit `ClientInfoUpdate` / `CompanyInfoUpdate` messages. Tables
//! are dynamically sized but capacity-bounded: inserting past capacity is
//! an explicit error, never a silent truncation.
//!
//! ## Module Structure
//!
//! - `client`: per-connection client records
//! - `company`: per-company financial and asset records
//! - `game_info`: the server/map snapshot consumed by discovery
//! - `gamelog`: bounded log of simulation-affecting changes

pub mod client;
pub mod company;
pub mod game_info;
pub mod gamelog;

pub use client::{ClientRecord, Language};
pub use company::CompanyRecord;
pub use game_info::{GameInfoSnapshot, MapInfo, ServerIdentity};
pub use gamelog::{GameLog, GameLogEntry, GameLogEvent};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric client identifier, unique per connection.
pub type ClientId = u32;

/// Company identifier.
pub type CompanyId = u8;

/// In-simulation date (days since the simulation epoch).
pub type GameDate = u32;

/// Roster capacity and auto-clean configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    /// Maximum connected clients, players and spectators combined.
    pub max_clients: usize,
    /// Maximum companies.
    pub max_companies: usize,
    /// Maximum simultaneous spectators.
    pub max_spectators: usize,
    /// Auto-clean policy for abandoned companies, if enabled.
    pub autoclean: Option<AutocleanPolicy>,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            max_clients: 10,
            max_companies: 8,
            max_spectators: 4,
            autoclean: None,
        }
    }
}

/// Removes or unprotects companies left without controlling clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutocleanPolicy {
    /// Months after which an unprotected empty company is removed.
    pub unprotected_months: u16,
    /// Months after which a password-protected empty company loses its
    /// password (and becomes eligible for removal).
    pub protected_months: u16,
}

/// Roster mutation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RosterError {
    /// A bounded table refused an insertion.
    #[error("{kind} capacity of {capacity} exceeded")]
    CapacityExceeded {
        /// Which table refused.
        kind: &'static str,
        /// Its configured capacity.
        capacity: usize,
    },

    /// A client id is already in use by a connected client.
    #[error("client id {0} already connected")]
    DuplicateClientId(ClientId),

    /// No such connected client.
    #[error("unknown client id {0}")]
    UnknownClient(ClientId),

    /// A client referenced a company that does not exist.
    #[error("unknown company id {0}")]
    UnknownCompany(CompanyId),
}

/// Server-owned tables of companies and connected clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterTables {
    companies: BTreeMap<CompanyId, CompanyRecord>,
    clients: BTreeMap<ClientId, ClientRecord>,
}

impl RosterTables {
    /// Empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connected clients, in id order.
    pub fn clients(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    /// Companies, in id order.
    pub fn companies(&self) -> impl Iterator<Item = &CompanyRecord> {
        self.companies.values()
    }

    /// Companies with their ids, in id order.
    pub fn companies_with_ids(&self) -> impl Iterator<Item = (CompanyId, &CompanyRecord)> {
        self.companies.iter().map(|(id, company)| (*id, company))
    }

    /// Look up a connected client.
    pub fn client(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    /// Look up a company.
    pub fn company(&self, id: CompanyId) -> Option<&CompanyRecord> {
        self.companies.get(&id)
    }

    /// Mutable company access (server-side bookkeeping only).
    pub fn company_mut(&mut self, id: CompanyId) -> Option<&mut CompanyRecord> {
        self.companies.get_mut(&id)
    }

    /// Number of connected clients playing a company.
    pub fn player_count(&self) -> usize {
        self.clients.values().filter(|c| c.plays_as.is_some()).count()
    }

    /// Number of connected spectators.
    pub fn spectator_count(&self) -> usize {
        self.clients.values().filter(|c| c.plays_as.is_none()).count()
    }

    /// Total connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of companies.
    pub fn company_count(&self) -> usize {
        self.companies.len()
    }

    /// Lowest client id not currently in use. Ids start at 1; 0 is
    /// reserved for "not yet assigned" on the wire.
    pub fn allocate_client_id(&self) -> ClientId {
        let mut id = 1;
        while self.clients.contains_key(&id) {
            id += 1;
        }
        id
    }

    /// Lowest free company id.
    pub fn allocate_company_id(&self) -> CompanyId {
        let mut id = 0;
        while self.companies.contains_key(&id) {
            id += 1;
        }
        id
    }

    /// Add a client record on successful join.
    ///
    /// Fails without touching the tables if the id is taken, the company
    /// reference dangles, or a capacity would be exceeded.
    pub fn register_client(
        &mut self,
        record: ClientRecord,
        config: &RosterConfig,
    ) -> Result<(), RosterError> {
        if self.clients.contains_key(&record.id) {
            return Err(RosterError::DuplicateClientId(record.id));
        }
        if let Some(company) = record.plays_as {
            if !self.companies.contains_key(&company) {
                return Err(RosterError::UnknownCompany(company));
            }
        }
        if self.clients.len() >= config.max_clients {
            return Err(RosterError::CapacityExceeded {
                kind: "client",
                capacity: config.max_clients,
            });
        }
        if record.plays_as.is_none() && self.spectator_count() >= config.max_spectators {
            return Err(RosterError::CapacityExceeded {
                kind: "spectator",
                capacity: config.max_spectators,
            });
        }

        self.clients.insert(record.id, record);
        self.rebuild_controllers();
        Ok(())
    }

    /// Remove a client record on disconnect.
    ///
    /// Synchronous with the disconnect: company controller lists are
    /// rebuilt in the same call, so no other client ever observes a ghost
    /// entry.
    pub fn remove_client(&mut self, id: ClientId) -> Option<ClientRecord> {
        let removed = self.clients.remove(&id);
        if removed.is_some() {
            self.rebuild_controllers();
        }
        removed
    }

    /// Found a new company, returning its id.
    pub fn found_company(
        &mut self,
        record: CompanyRecord,
        config: &RosterConfig,
    ) -> Result<CompanyId, RosterError> {
        if self.companies.len() >= config.max_companies {
            return Err(RosterError::CapacityExceeded {
                kind: "company",
                capacity: config.max_companies,
            });
        }
        let id = self.allocate_company_id();
        self.companies.insert(id, record);
        Ok(id)
    }

    /// Liquidate a company. Clients playing it become spectators.
    pub fn liquidate_company(&mut self, id: CompanyId) -> Result<CompanyRecord, RosterError> {
        let removed = self
            .companies
            .remove(&id)
            .ok_or(RosterError::UnknownCompany(id))?;
        for client in self.clients.values_mut() {
            if client.plays_as == Some(id) {
                client.plays_as = None;
            }
        }
        Ok(removed)
    }

    /// Move a client to a company or to spectating.
    pub fn assign_company(
        &mut self,
        client: ClientId,
        company: Option<CompanyId>,
    ) -> Result<(), RosterError> {
        if let Some(company) = company {
            if !self.companies.contains_key(&company) {
                return Err(RosterError::UnknownCompany(company));
            }
        }
        let record = self
            .clients
            .get_mut(&client)
            .ok_or(RosterError::UnknownClient(client))?;
        record.plays_as = company;
        self.rebuild_controllers();
        Ok(())
    }

    /// Monthly auto-clean pass.
    ///
    /// Empty companies accumulate `months_empty`; unprotected ones past
    /// the threshold are removed, protected ones past theirs lose their
    /// password. Returns the removed company ids.
    pub fn autoclean_pass(&mut self, policy: AutocleanPolicy) -> Vec<CompanyId> {
        let mut removed = Vec::new();

        for (id, company) in self.companies.iter_mut() {
            if company.controllers.is_empty() {
                company.months_empty += 1;
                if company.protected() && company.months_empty >= policy.protected_months {
                    company.clear_password();
                }
                if !company.protected() && company.months_empty >= policy.unprotected_months {
                    removed.push(*id);
                }
            } else {
                company.months_empty = 0;
            }
        }

        for id in &removed {
            self.companies.remove(id);
        }
        removed
    }

    /// Apply a replicated client record, inserting or overwriting.
    ///
    /// Replica-side only: the server already enforced capacities, so the
    /// update is applied as-is.
    pub fn apply_client_update(&mut self, record: ClientRecord) {
        self.clients.insert(record.id, record);
        self.rebuild_controllers();
    }

    /// Apply a replicated company record, inserting or overwriting.
    pub fn apply_company_update(&mut self, id: CompanyId, record: CompanyRecord) {
        self.companies.insert(id, record);
        self.rebuild_controllers();
    }

    /// Copy for replication, with every company password stripped.
    pub fn replicated(&self) -> Self {
        Self {
            companies: self
                .companies
                .iter()
                .map(|(id, company)| (*id, company.replicated()))
                .collect(),
            clients: self.clients.clone(),
        }
    }

    /// Check the roster invariants.
    ///
    /// Used when applying a downloaded snapshot: a replica that fails this
    /// check is structurally corrupt.
    pub fn validate(&self) -> Result<(), RosterError> {
        for client in self.clients.values() {
            if let Some(company) = client.plays_as {
                if !self.companies.contains_key(&company) {
                    return Err(RosterError::UnknownCompany(company));
                }
            }
        }
        Ok(())
    }

    fn rebuild_controllers(&mut self) {
        for company in self.companies.values_mut() {
            company.controllers.clear();
        }
        for client in self.clients.values() {
            if let Some(id) = client.plays_as {
                if let Some(company) = self.companies.get_mut(&id) {
                    company.controllers.push(client.name.clone());
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RosterConfig {
        RosterConfig {
            max_clients: 4,
            max_companies: 2,
            max_spectators: 2,
            autoclean: None,
        }
    }

    fn client(id: ClientId, plays_as: Option<CompanyId>) -> ClientRecord {
        ClientRecord {
            id,
            name: format!("client-{id}"),
            language: Language::English,
            plays_as,
            address: "127.0.0.1".into(),
            join_date: 1000,
            unique_id: format!("uid-{id}"),
        }
    }

    #[test]
    fn test_register_and_remove_client() {
        let mut roster = RosterTables::new();
        roster.register_client(client(1, None), &config()).unwrap();
        assert_eq!(roster.client_count(), 1);
        assert_eq!(roster.spectator_count(), 1);

        assert!(roster.remove_client(1).is_some());
        assert_eq!(roster.client_count(), 0);
        assert!(roster.remove_client(1).is_none());
    }

    #[test]
    fn test_duplicate_client_id_rejected() {
        let mut roster = RosterTables::new();
        roster.register_client(client(1, None), &config()).unwrap();
        let err = roster.register_client(client(1, None), &config()).unwrap_err();
        assert_eq!(err, RosterError::DuplicateClientId(1));
    }

    #[test]
    fn test_client_capacity_bounded() {
        let cfg = RosterConfig { max_clients: 1, ..config() };
        let mut roster = RosterTables::new();
        roster.register_client(client(1, None), &cfg).unwrap();
        let err = roster.register_client(client(2, None), &cfg).unwrap_err();
        assert!(matches!(err, RosterError::CapacityExceeded { kind: "client", .. }));
    }

    #[test]
    fn test_spectator_capacity_bounded() {
        let cfg = RosterConfig { max_spectators: 1, ..config() };
        let mut roster = RosterTables::new();
        roster.register_client(client(1, None), &cfg).unwrap();
        let err = roster.register_client(client(2, None), &cfg).unwrap_err();
        assert!(matches!(err, RosterError::CapacityExceeded { kind: "spectator", .. }));
    }

    #[test]
    fn test_dangling_company_reference_rejected() {
        let mut roster = RosterTables::new();
        let err = roster.register_client(client(1, Some(0)), &config()).unwrap_err();
        assert_eq!(err, RosterError::UnknownCompany(0));
    }

    #[test]
    fn test_company_capacity_bounded() {
        let cfg = RosterConfig { max_companies: 1, ..config() };
        let mut roster = RosterTables::new();
        roster
            .found_company(CompanyRecord::new("First", 1950), &cfg)
            .unwrap();
        let err = roster
            .found_company(CompanyRecord::new("Second", 1951), &cfg)
            .unwrap_err();
        assert!(matches!(err, RosterError::CapacityExceeded { kind: "company", .. }));
    }

    #[test]
    fn test_liquidation_moves_players_to_spectating() {
        let mut roster = RosterTables::new();
        let company = roster
            .found_company(CompanyRecord::new("Acme", 1950), &config())
            .unwrap();
        roster.register_client(client(1, Some(company)), &config()).unwrap();

        roster.liquidate_company(company).unwrap();
        assert_eq!(roster.client(1).unwrap().plays_as, None);
        roster.validate().unwrap();
    }

    #[test]
    fn test_controllers_follow_membership() {
        let mut roster = RosterTables::new();
        let company = roster
            .found_company(CompanyRecord::new("Acme", 1950), &config())
            .unwrap();
        roster.register_client(client(1, Some(company)), &config()).unwrap();
        roster.register_client(client(2, Some(company)), &config()).unwrap();

        let names = &roster.company(company).unwrap().controllers;
        assert_eq!(names, &vec!["client-1".to_string(), "client-2".to_string()]);

        roster.remove_client(1);
        assert_eq!(
            roster.company(company).unwrap().controllers,
            vec!["client-2".to_string()]
        );
    }

    #[test]
    fn test_autoclean_removes_abandoned_company() {
        let policy = AutocleanPolicy { unprotected_months: 3, protected_months: 6 };
        let mut roster = RosterTables::new();
        let company = roster
            .found_company(CompanyRecord::new("Ghost", 1950), &config())
            .unwrap();

        for _ in 0..2 {
            assert!(roster.autoclean_pass(policy).is_empty());
        }
        assert_eq!(roster.autoclean_pass(policy), vec![company]);
        assert_eq!(roster.company_count(), 0);
    }

    #[test]
    fn test_autoclean_unprotects_before_removing() {
        let policy = AutocleanPolicy { unprotected_months: 12, protected_months: 2 };
        let mut roster = RosterTables::new();
        let mut record = CompanyRecord::new("Guarded", 1950);
        record.set_password("secret");
        let company = roster.found_company(record, &config()).unwrap();

        roster.autoclean_pass(policy);
        assert!(roster.company(company).unwrap().protected());
        roster.autoclean_pass(policy);
        assert!(!roster.company(company).unwrap().protected());
    }

    #[test]
    fn test_autoclean_resets_when_occupied() {
        let policy = AutocleanPolicy { unprotected_months: 2, protected_months: 2 };
        let mut roster = RosterTables::new();
        let company = roster
            .found_company(CompanyRecord::new("Busy", 1950), &config())
            .unwrap();
        roster.autoclean_pass(policy);

        roster.register_client(client(1, Some(company)), &config()).unwrap();
        roster.autoclean_pass(policy);
        assert_eq!(roster.company(company).unwrap().months_empty, 0);

        // Abandoned again: the counter restarts from zero.
        roster.remove_client(1);
        assert!(roster.autoclean_pass(policy).is_empty());
        assert_eq!(roster.autoclean_pass(policy), vec![company]);
    }

    #[test]
    fn test_id_allocation_reuses_lowest() {
        let mut roster = RosterTables::new();
        roster.register_client(client(1, None), &config()).unwrap();
        roster.register_client(client(2, None), &config()).unwrap();
        roster.remove_client(1);
        assert_eq!(roster.allocate_client_id(), 1);
    }

    #[test]
    fn test_invariants_after_event_sequences() {
        // Join/leave/found/liquidate in a loop; invariants must hold at
        // every step.
        let cfg = RosterConfig {
            max_clients: 8,
            max_companies: 4,
            max_spectators: 8,
            autoclean: None,
        };
        let mut roster = RosterTables::new();

        for round in 0..4u32 {
            let company = roster
                .found_company(CompanyRecord::new(format!("co-{round}"), 1950), &cfg)
                .unwrap();
            let a = roster.allocate_client_id();
            roster.register_client(client(a, Some(company)), &cfg).unwrap();
            let b = roster.allocate_client_id();
            assert_ne!(a, b);
            roster.register_client(client(b, None), &cfg).unwrap();
            roster.validate().unwrap();

            roster.remove_client(a);
            roster.liquidate_company(company).unwrap();
            roster.validate().unwrap();
            roster.remove_client(b);
        }
        assert_eq!(roster.client_count(), 0);
        assert_eq!(roster.company_count(), 0);
    }
}

//! Company records.

use serde::{Deserialize, Serialize};

use crate::{STATION_CATEGORIES, VEHICLE_CATEGORIES};

/// A company as replicated to every client.
///
/// Financial fields are plain counters maintained by the simulation; the
/// sync core only replicates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    /// Display name.
    pub name: String,
    /// Whether joining this company requires a password.
    pub use_password: bool,
    /// The password itself. Never replicated to clients; the wire form
    /// strips it and keeps only `use_password`.
    pub password: String,
    /// Year the company was founded.
    pub founded_year: u32,
    /// Total asset value.
    pub value: i64,
    /// Cash on hand.
    pub money: i64,
    /// Income over the last accounting period.
    pub income: i64,
    /// Performance score.
    pub performance: u16,
    /// Vehicle counts per category.
    pub vehicle_counts: [u16; VEHICLE_CATEGORIES],
    /// Station counts per category.
    pub station_counts: [u16; STATION_CATEGORIES],
    /// Names of the clients currently controlling this company. Derived
    /// from the client table; rebuilt on every membership change.
    pub controllers: Vec<String>,
    /// Consecutive months without any controlling client.
    pub months_empty: u16,
}

impl CompanyRecord {
    /// Fresh company with zeroed counters.
    pub fn new(name: impl Into<String>, founded_year: u32) -> Self {
        Self {
            name: name.into(),
            use_password: false,
            password: String::new(),
            founded_year,
            value: 0,
            money: 0,
            income: 0,
            performance: 0,
            vehicle_counts: [0; VEHICLE_CATEGORIES],
            station_counts: [0; STATION_CATEGORIES],
            controllers: Vec::new(),
            months_empty: 0,
        }
    }

    /// Whether the company is password-protected.
    pub fn protected(&self) -> bool {
        self.use_password
    }

    /// Set or replace the company password.
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
        self.use_password = !self.password.is_empty();
    }

    /// Remove password protection.
    pub fn clear_password(&mut self) {
        self.password.clear();
        self.use_password = false;
    }

    /// Wire copy with the password stripped.
    pub fn replicated(&self) -> Self {
        Self {
            password: String::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_flag_tracks_password() {
        let mut company = CompanyRecord::new("Acme", 1950);
        assert!(!company.protected());

        company.set_password("secret");
        assert!(company.protected());

        company.clear_password();
        assert!(!company.protected());
        assert!(company.password.is_empty());
    }

    #[test]
    fn test_replicated_strips_password() {
        let mut company = CompanyRecord::new("Acme", 1950);
        company.set_password("secret");

        let wire = company.replicated();
        assert!(wire.password.is_empty());
        // The flag survives so clients know a password is needed.
        assert!(wire.use_password);
    }
}

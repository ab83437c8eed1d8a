//! Destination routing for the relay.
//!
//! Handles:
//! - Mapping external identifiers (party names, aliases) to logical parties
//! - Defaulting missing or unknown destinations
//! - Finding the other side of a two-party conversation

use std::collections::HashMap;

use crate::config::RoutingConfig;

/// Resolved routing table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    parties: Vec<String>,
    /// Lowercased external name -> party.
    names: HashMap<String, String>,
    fallback: String,
}

impl RoutingTable {
    /// Build from validated configuration.
    pub fn from_config(config: &RoutingConfig) -> Self {
        let mut names = HashMap::new();
        for party in &config.parties {
            names.insert(party.to_lowercase(), party.clone());
        }
        for (alias, party) in &config.aliases {
            names
                .entry(alias.trim().to_lowercase())
                .or_insert_with(|| party.clone());
        }

        Self {
            parties: config.parties.clone(),
            names,
            fallback: config.fallback.clone(),
        }
    }

    /// The logical parties.
    pub fn parties(&self) -> &[String] {
        &self.parties
    }

    /// Party used for missing or unknown destinations.
    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Resolve an external name to a party, case-insensitively.
    ///
    /// # Examples
    ///
    /// ```
    /// use autsys_relay::config::RoutingConfig;
    /// use autsys_relay::core::RoutingTable;
    ///
    /// let table = RoutingTable::from_config(&RoutingConfig::default());
    /// assert_eq!(table.resolve(" Client "), Some("mobile"));
    /// assert_eq!(table.resolve("stranger"), None);
    /// ```
    pub fn resolve(&self, external: &str) -> Option<&str> {
        self.names
            .get(&external.trim().to_lowercase())
            .map(String::as_str)
    }

    /// The other party of a two-party relay.
    pub fn peer_of(&self, party: &str) -> Option<&str> {
        if !self.parties.iter().any(|p| p == party) {
            return None;
        }
        self.parties
            .iter()
            .find(|p| p.as_str() != party)
            .map(String::as_str)
    }

    /// Resolve the sender. Unknown names are kept verbatim as legacy origins.
    pub fn resolve_origin(&self, from: Option<&str>) -> Option<String> {
        let from = from.map(str::trim).filter(|f| !f.is_empty())?;
        Some(
            self.resolve(from)
                .map(str::to_string)
                .unwrap_or_else(|| from.to_string()),
        )
    }

    /// Resolve the recipient.
    ///
    /// A missing destination goes to the peer of a known sender, otherwise
    /// to the fallback. An unknown destination goes to the fallback.
    pub fn resolve_destination(&self, to: Option<&str>, origin: Option<&str>) -> &str {
        match to.map(str::trim).filter(|t| !t.is_empty()) {
            Some(to) => self.resolve(to).unwrap_or_else(|| {
                tracing::debug!("Unknown destination '{}', using {}", to, self.fallback);
                self.fallback.as_str()
            }),
            None => origin
                .and_then(|o| self.peer_of(o))
                .unwrap_or(self.fallback.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::from_config(&RoutingConfig::default())
    }

    #[test]
    fn test_resolve_parties_and_aliases() {
        let table = table();

        assert_eq!(table.resolve("mobile"), Some("mobile"));
        assert_eq!(table.resolve("CORE"), Some("core"));
        assert_eq!(table.resolve("app"), Some("mobile"));
        assert_eq!(table.resolve("backend"), Some("core"));
        assert_eq!(table.resolve("nobody"), None);
    }

    #[test]
    fn test_peer_of() {
        let table = table();

        assert_eq!(table.peer_of("mobile"), Some("core"));
        assert_eq!(table.peer_of("core"), Some("mobile"));
        assert_eq!(table.peer_of("app"), None);
    }

    #[test]
    fn test_resolve_destination() {
        let table = table();

        assert_eq!(table.resolve_destination(Some("client"), None), "mobile");
        assert_eq!(table.resolve_destination(Some("mars"), Some("mobile")), "core");
        assert_eq!(table.resolve_destination(None, Some("core")), "mobile");
        assert_eq!(table.resolve_destination(Some("  "), Some("mobile")), "core");
        assert_eq!(table.resolve_destination(None, Some("legacy_app")), "core");
        assert_eq!(table.resolve_destination(None, None), "core");
    }

    #[test]
    fn test_resolve_origin() {
        let table = table();

        assert_eq!(table.resolve_origin(Some("Client")).as_deref(), Some("mobile"));
        assert_eq!(
            table.resolve_origin(Some("freja_app")).as_deref(),
            Some("freja_app")
        );
        assert_eq!(table.resolve_origin(Some(" ")), None);
        assert_eq!(table.resolve_origin(None), None);
    }
}

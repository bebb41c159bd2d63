//! Scopes and per-peer watermarks.

use crate::error::{CoreError, CoreResult};
use crate::schema::SyncSet;
use crate::value::SyncValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named set of tables synchronized together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncScope {
    /// Scope name.
    pub name: String,
    /// Schema version of the set.
    pub version: String,
    /// Tables, relations and filters.
    pub setup: SyncSet,
}

impl SyncScope {
    /// Creates a scope at version `1`.
    pub fn new(name: impl Into<String>, setup: SyncSet) -> Self {
        Self {
            name: name.into(),
            version: "1".into(),
            setup,
        }
    }

    /// Sets the schema version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// A bound filter parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncParameter {
    /// Parameter name.
    pub name: String,
    /// Bound value.
    pub value: SyncValue,
}

/// Filter parameter values supplied by a client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncParameters(Vec<SyncParameter>);

impl SyncParameters {
    /// No parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a parameter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<SyncValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Adds or replaces a parameter.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<SyncValue>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value,
            None => self.0.push(SyncParameter { name, value }),
        }
    }

    /// Looks up a parameter value.
    pub fn get(&self, name: &str) -> Option<&SyncValue> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Returns true if no parameter is bound.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the bound parameters.
    pub fn iter(&self) -> impl Iterator<Item = &SyncParameter> {
        self.0.iter()
    }

    /// Order-insensitive equality.
    pub fn same_bindings(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().all(|p| other.get(&p.name) == Some(&p.value))
    }
}

/// Per-peer, per-scope synchronization record.
///
/// Both watermarks move together: the record is written as a whole,
/// after everything else produced by the session has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeInfoClient {
    /// Client peer identifier.
    pub id: Uuid,
    /// Scope name.
    pub scope_name: String,
    /// Filter parameter bindings of this client.
    pub parameters: SyncParameters,
    /// True until the first successful session.
    pub is_new_scope: bool,
    /// Local timestamp captured before the last successful selection.
    pub last_sync_timestamp: i64,
    /// Server timestamp returned by the last successful session.
    pub last_server_sync_timestamp: i64,
    /// Wall clock time of the last successful session.
    pub last_sync: Option<DateTime<Utc>>,
    /// Duration of the last successful session in milliseconds.
    pub last_sync_duration_ms: u64,
}

impl ScopeInfoClient {
    /// Creates the record for a first sync attempt.
    pub fn new(id: Uuid, scope_name: impl Into<String>, parameters: SyncParameters) -> Self {
        Self {
            id,
            scope_name: scope_name.into(),
            parameters,
            is_new_scope: true,
            last_sync_timestamp: 0,
            last_server_sync_timestamp: 0,
            last_sync: None,
            last_sync_duration_ms: 0,
        }
    }

    /// Lower bound for selecting this peer's local changes.
    ///
    /// `None` for a new scope, which selects every live row.
    pub fn local_watermark(&self) -> Option<i64> {
        (!self.is_new_scope).then_some(self.last_sync_timestamp)
    }

    /// Lower bound for selecting the server's changes for this peer.
    pub fn server_watermark(&self) -> Option<i64> {
        (!self.is_new_scope).then_some(self.last_server_sync_timestamp)
    }

    /// Returns true if `other` is the record for the same peer and bindings.
    pub fn same_key(&self, other: &Self) -> bool {
        self.id == other.id
            && self.scope_name == other.scope_name
            && self.parameters.same_bindings(&other.parameters)
    }

    /// Advances both watermarks after a successful session.
    pub fn advance(
        &mut self,
        local_timestamp: i64,
        server_timestamp: i64,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> CoreResult<()> {
        for (current, proposed) in [
            (self.last_sync_timestamp, local_timestamp),
            (self.last_server_sync_timestamp, server_timestamp),
        ] {
            if proposed < current {
                return Err(CoreError::WatermarkRegression {
                    scope: self.scope_name.clone(),
                    current,
                    proposed,
                });
            }
        }
        self.last_sync_timestamp = local_timestamp;
        self.last_server_sync_timestamp = server_timestamp;
        self.is_new_scope = false;
        self.last_sync = Some(completed_at);
        self.last_sync_duration_ms = duration_ms;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_defaults() {
        let info = ScopeInfoClient::new(Uuid::new_v4(), "default", SyncParameters::new());
        assert!(info.is_new_scope);
        assert_eq!(info.last_sync_timestamp, 0);
        assert_eq!(info.local_watermark(), None);
        assert_eq!(info.server_watermark(), None);
    }

    #[test]
    fn advance_moves_forward_only() {
        let mut info = ScopeInfoClient::new(Uuid::new_v4(), "default", SyncParameters::new());
        info.advance(10, 40, Utc::now(), 5).unwrap();
        assert!(!info.is_new_scope);
        assert_eq!(info.local_watermark(), Some(10));
        assert_eq!(info.server_watermark(), Some(40));

        let err = info.advance(9, 41, Utc::now(), 5).unwrap_err();
        assert!(matches!(err, CoreError::WatermarkRegression { current: 10, proposed: 9, .. }));
        assert_eq!(info.last_server_sync_timestamp, 40);

        info.advance(10, 40, Utc::now(), 1).unwrap();
        assert_eq!(info.last_sync_timestamp, 10);
    }

    #[test]
    fn parameters_bindings() {
        let a = SyncParameters::new().with("CustomerID", 5i64).with("Region", "EU");
        let b = SyncParameters::new().with("Region", "EU").with("CustomerID", 5i64);
        assert!(a.same_bindings(&b));
        assert_eq!(a.get("CustomerID"), Some(&SyncValue::Integer(5)));

        let mut c = a.clone();
        c.set("CustomerID", 6i64);
        assert!(!a.same_bindings(&c));
    }

    #[test]
    fn record_key() {
        let id = Uuid::new_v4();
        let a = ScopeInfoClient::new(id, "default", SyncParameters::new().with("P", 1i64));
        let b = ScopeInfoClient::new(id, "default", SyncParameters::new().with("P", 1i64));
        let c = ScopeInfoClient::new(id, "default", SyncParameters::new().with("P", 2i64));
        assert!(a.same_key(&b));
        assert!(!a.same_key(&c));
    }
}

//! Conflict detection and resolution.
//!
//! A conflict is raised when the target refuses to write an incoming
//! row: the existing row was changed after the session's lower bound by
//! someone other than the sender, or a unique constraint got in the way.
//! Resolutions are expressed from the server's point of view and mapped
//! to concrete actions by the side applying the batch.

use crate::error::BoxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tidemark_core::{RowState, SyncRow, SyncTable, TableName};
use uuid::Uuid;

/// Role of a peer in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncSide {
    /// The peer that starts sessions.
    Client,
    /// The hub peer.
    Server,
}

impl fmt::Display for SyncSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncSide::Client => f.write_str("client"),
            SyncSide::Server => f.write_str("server"),
        }
    }
}

/// How the incoming and the local row disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    /// Incoming upsert, local live row.
    RemoteExistsLocalExists,
    /// Incoming upsert, local row missing.
    RemoteExistsLocalNotExists,
    /// Incoming upsert, local tombstone.
    RemoteExistsLocalIsDeleted,
    /// Incoming delete, local live row.
    RemoteIsDeletedLocalExists,
    /// Incoming delete, local tombstone.
    RemoteIsDeletedLocalIsDeleted,
    /// Incoming delete, no local row.
    RemoteIsDeletedLocalNotExists,
    /// A unique constraint refused the write.
    UniqueKeyConstraint,
}

impl ConflictType {
    /// Classifies a refused write from the incoming state and the local row state.
    pub fn classify(remote: RowState, local: Option<RowState>) -> Self {
        match (remote, local) {
            (RowState::Modified, Some(RowState::Modified)) => ConflictType::RemoteExistsLocalExists,
            (RowState::Modified, Some(RowState::Deleted)) => {
                ConflictType::RemoteExistsLocalIsDeleted
            }
            (RowState::Modified, None) => ConflictType::RemoteExistsLocalNotExists,
            (RowState::Deleted, Some(RowState::Modified)) => {
                ConflictType::RemoteIsDeletedLocalExists
            }
            (RowState::Deleted, Some(RowState::Deleted)) => {
                ConflictType::RemoteIsDeletedLocalIsDeleted
            }
            (RowState::Deleted, None) => ConflictType::RemoteIsDeletedLocalNotExists,
        }
    }

    /// Returns true for disagreements that need no decision: both sides
    /// agree the row is gone.
    pub fn is_auto_resolved(&self) -> bool {
        matches!(
            self,
            ConflictType::RemoteIsDeletedLocalIsDeleted | ConflictType::RemoteIsDeletedLocalNotExists
        )
    }
}

/// A conflict raised while applying one row.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    /// Kind of disagreement.
    pub kind: ConflictType,
    /// Table.
    pub table: TableName,
    /// Incoming row.
    pub remote_row: SyncRow,
    /// Current local image, if any.
    pub local_row: Option<SyncRow>,
    /// Resolution (if any).
    pub resolution: Option<ConflictResolution>,
}

impl SyncConflict {
    /// Creates a new conflict.
    pub fn new(
        kind: ConflictType,
        table: TableName,
        remote_row: SyncRow,
        local_row: Option<SyncRow>,
    ) -> Self {
        Self {
            kind,
            table,
            remote_row,
            local_row,
            resolution: None,
        }
    }

    /// Returns true if both sides updated the row.
    pub fn is_update_conflict(&self) -> bool {
        self.kind == ConflictType::RemoteExistsLocalExists
    }

    /// Returns true if one side updated the row and the other deleted it.
    pub fn is_update_delete_conflict(&self) -> bool {
        matches!(
            self.kind,
            ConflictType::RemoteExistsLocalIsDeleted | ConflictType::RemoteIsDeletedLocalExists
        )
    }

    /// Resolves the conflict with the given resolution.
    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolution = Some(resolution);
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Resolution for a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// The server's version is kept.
    ServerWins,
    /// The client's version is kept.
    ClientWins,
    /// A merged row replaces both versions on the applying side.
    MergeRow(SyncRow),
    /// The whole apply is rolled back.
    Rollback,
}

/// Built-in resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictResolutionPolicy {
    /// Server always wins.
    #[default]
    ServerWins,
    /// Client always wins.
    ClientWins,
}

impl ConflictResolutionPolicy {
    /// Resolution this policy picks for any conflict.
    pub fn resolution(&self) -> ConflictResolution {
        match self {
            ConflictResolutionPolicy::ServerWins => ConflictResolution::ServerWins,
            ConflictResolutionPolicy::ClientWins => ConflictResolution::ClientWins,
        }
    }
}

/// Decides how a conflict ends.
///
/// Closures of the form `Fn(&SyncConflict) -> Result<ConflictResolution, BoxError>`
/// implement this trait. A resolver error is treated as
/// [`ConflictResolution::Rollback`].
pub trait ConflictResolver: Send + Sync {
    /// Picks the resolution of a conflict.
    fn resolve(&self, conflict: &SyncConflict) -> Result<ConflictResolution, BoxError>;
}

impl ConflictResolver for ConflictResolutionPolicy {
    fn resolve(&self, _conflict: &SyncConflict) -> Result<ConflictResolution, BoxError> {
        Ok(self.resolution())
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&SyncConflict) -> Result<ConflictResolution, BoxError> + Send + Sync,
{
    fn resolve(&self, conflict: &SyncConflict) -> Result<ConflictResolution, BoxError> {
        self(conflict)
    }
}

/// What the applying side does with a resolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConflictAction {
    /// Leave the local row untouched.
    KeepLocal,
    /// Write `row` bypassing the conflict check, recording `writer`.
    ForceWrite {
        row: SyncRow,
        writer: Option<Uuid>,
    },
}

/// Maps a non-rollback resolution to the action of the applying side.
///
/// `sender` is the peer the incoming row came from. Merged rows are
/// recorded as local edits so they flow back to the sender.
pub(crate) fn action_for(
    side: SyncSide,
    resolution: ConflictResolution,
    incoming: &SyncRow,
    sender: Option<Uuid>,
) -> Option<ConflictAction> {
    let incoming_wins = ConflictAction::ForceWrite {
        row: incoming.clone(),
        writer: sender,
    };
    match (side, resolution) {
        (SyncSide::Server, ConflictResolution::ServerWins)
        | (SyncSide::Client, ConflictResolution::ClientWins) => Some(ConflictAction::KeepLocal),
        (SyncSide::Server, ConflictResolution::ClientWins)
        | (SyncSide::Client, ConflictResolution::ServerWins) => Some(incoming_wins),
        (_, ConflictResolution::MergeRow(row)) => Some(ConflictAction::ForceWrite { row, writer: None }),
        (_, ConflictResolution::Rollback) => None,
    }
}

/// Checks that a merged row can replace the incoming one.
pub(crate) fn validate_merged_row(
    table: &SyncTable,
    incoming: &SyncRow,
    merged: &SyncRow,
) -> Result<(), String> {
    merged.validate(table).map_err(|e| format!("invalid merged row: {e}"))?;
    let pk = table.primary_key_indices().map_err(|e| e.to_string())?;
    if merged.key(&pk) != incoming.key(&pk) {
        return Err("merged row changes the primary key".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::{ColumnType, SyncColumn, SyncValue};

    fn customer() -> SyncTable {
        SyncTable::new(
            "Customer",
            vec![
                SyncColumn::new("Id", ColumnType::Integer),
                SyncColumn::new("Name", ColumnType::Text),
            ],
            &["Id"],
        )
    }

    #[test]
    fn classification() {
        use RowState::{Deleted, Modified};
        assert_eq!(
            ConflictType::classify(Modified, Some(Modified)),
            ConflictType::RemoteExistsLocalExists
        );
        assert_eq!(
            ConflictType::classify(Modified, Some(Deleted)),
            ConflictType::RemoteExistsLocalIsDeleted
        );
        assert_eq!(
            ConflictType::classify(Deleted, Some(Modified)),
            ConflictType::RemoteIsDeletedLocalExists
        );
        assert!(ConflictType::classify(Deleted, Some(Deleted)).is_auto_resolved());
        assert!(ConflictType::classify(Deleted, None).is_auto_resolved());
        assert!(!ConflictType::classify(Modified, None).is_auto_resolved());
    }

    #[test]
    fn conflict_kinds() {
        let row = SyncRow::modified(vec![1i64.into(), "a".into()]);
        let uu = SyncConflict::new(
            ConflictType::RemoteExistsLocalExists,
            TableName::new("Customer"),
            row.clone(),
            Some(row.clone()),
        );
        assert!(uu.is_update_conflict());
        assert!(!uu.is_update_delete_conflict());

        let mut ud = SyncConflict::new(
            ConflictType::RemoteIsDeletedLocalExists,
            TableName::new("Customer"),
            SyncRow::deleted(vec![1i64.into(), "a".into()]),
            Some(row),
        );
        assert!(ud.is_update_delete_conflict());
        assert!(!ud.is_resolved());
        ud.resolve(ConflictResolution::ClientWins);
        assert!(ud.is_resolved());
    }

    #[test]
    fn actions_mirror_between_sides() {
        let incoming = SyncRow::modified(vec![1i64.into(), "remote".into()]);
        let sender = Some(Uuid::new_v4());

        assert_eq!(
            action_for(SyncSide::Server, ConflictResolution::ServerWins, &incoming, sender),
            Some(ConflictAction::KeepLocal)
        );
        assert_eq!(
            action_for(SyncSide::Client, ConflictResolution::ClientWins, &incoming, sender),
            Some(ConflictAction::KeepLocal)
        );
        assert_eq!(
            action_for(SyncSide::Server, ConflictResolution::ClientWins, &incoming, sender),
            Some(ConflictAction::ForceWrite {
                row: incoming.clone(),
                writer: sender
            })
        );
        assert_eq!(
            action_for(SyncSide::Client, ConflictResolution::ServerWins, &incoming, sender),
            Some(ConflictAction::ForceWrite {
                row: incoming.clone(),
                writer: sender
            })
        );

        let merged = SyncRow::modified(vec![1i64.into(), "merged".into()]);
        assert_eq!(
            action_for(
                SyncSide::Server,
                ConflictResolution::MergeRow(merged.clone()),
                &incoming,
                sender
            ),
            Some(ConflictAction::ForceWrite {
                row: merged,
                writer: None
            })
        );
        assert_eq!(
            action_for(SyncSide::Client, ConflictResolution::Rollback, &incoming, sender),
            None
        );
    }

    #[test]
    fn closures_are_resolvers() {
        let resolver = |conflict: &SyncConflict| -> Result<ConflictResolution, BoxError> {
            if conflict.is_update_conflict() {
                Ok(ConflictResolution::ClientWins)
            } else {
                Err("unexpected conflict".into())
            }
        };
        let row = SyncRow::modified(vec![1i64.into(), "a".into()]);
        let conflict = SyncConflict::new(
            ConflictType::RemoteExistsLocalExists,
            TableName::new("Customer"),
            row.clone(),
            Some(row),
        );
        assert_eq!(resolver.resolve(&conflict).unwrap(), ConflictResolution::ClientWins);
        assert_eq!(
            ConflictResolutionPolicy::ServerWins.resolve(&conflict).unwrap(),
            ConflictResolution::ServerWins
        );
    }

    #[test]
    fn merged_row_validation() {
        let table = customer();
        let incoming = SyncRow::modified(vec![1i64.into(), "remote".into()]);
        assert!(validate_merged_row(
            &table,
            &incoming,
            &SyncRow::modified(vec![1i64.into(), "merged".into()])
        )
        .is_ok());
        assert!(validate_merged_row(&table, &incoming, &SyncRow::modified(vec![1i64.into()])).is_err());
        assert!(validate_merged_row(
            &table,
            &incoming,
            &SyncRow::modified(vec![2i64.into(), "merged".into()])
        )
        .is_err());
        let mistyped = validate_merged_row(&table, &incoming, &SyncRow::modified(vec![1i64.into(), 42i64.into()]));
        assert!(mistyped.unwrap_err().contains("does not accept"));
        let null_name = validate_merged_row(&table, &incoming, &SyncRow::modified(vec![1i64.into(), SyncValue::Null]));
        assert!(null_name.unwrap_err().contains("not nullable"));
    }
}

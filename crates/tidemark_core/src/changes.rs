//! Selection and apply counters.

use crate::row::RowState;
use crate::schema::TableName;
use serde::{Deserialize, Serialize};

/// Rows selected from one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangesSelected {
    /// Table.
    pub table: TableName,
    /// Modified rows.
    pub upserts: u64,
    /// Deleted rows.
    pub deletes: u64,
}

impl TableChangesSelected {
    /// Zeroed counters for a table.
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            upserts: 0,
            deletes: 0,
        }
    }

    /// Counts one row.
    pub fn record(&mut self, state: RowState) {
        match state {
            RowState::Modified => self.upserts += 1,
            RowState::Deleted => self.deletes += 1,
        }
    }

    /// Total rows.
    pub fn total(&self) -> u64 {
        self.upserts + self.deletes
    }
}

/// Rows selected from every table of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseChangesSelected {
    /// Per-table counters, in dependency order.
    pub tables: Vec<TableChangesSelected>,
}

impl DatabaseChangesSelected {
    /// Counters of one table.
    pub fn table(&self, table: &TableName) -> Option<&TableChangesSelected> {
        self.tables.iter().find(|t| &t.table == table)
    }

    /// All selected rows.
    pub fn total_changes_selected(&self) -> u64 {
        self.tables.iter().map(TableChangesSelected::total).sum()
    }

    /// Selected modified rows.
    pub fn total_upserts(&self) -> u64 {
        self.tables.iter().map(|t| t.upserts).sum()
    }

    /// Selected deleted rows.
    pub fn total_deletes(&self) -> u64 {
        self.tables.iter().map(|t| t.deletes).sum()
    }
}

/// Outcome counters for one table and row state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangesApplied {
    /// Table.
    pub table: TableName,
    /// Row state the counters refer to.
    pub state: RowState,
    /// Rows written to the target.
    pub applied: u64,
    /// Rows that could not be written.
    pub failed: u64,
    /// Conflicts resolved without failing the apply.
    pub resolved_conflicts: u64,
}

impl TableChangesApplied {
    /// Zeroed counters.
    pub fn new(table: TableName, state: RowState) -> Self {
        Self {
            table,
            state,
            applied: 0,
            failed: 0,
            resolved_conflicts: 0,
        }
    }
}

/// Outcome counters for a whole apply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseChangesApplied {
    /// Per table and state counters, in apply order.
    pub tables: Vec<TableChangesApplied>,
}

impl DatabaseChangesApplied {
    /// Counters for a table and state, created on first use.
    pub fn entry(&mut self, table: &TableName, state: RowState) -> &mut TableChangesApplied {
        let position = self
            .tables
            .iter()
            .position(|t| &t.table == table && t.state == state);
        let index = match position {
            Some(index) => index,
            None => {
                self.tables.push(TableChangesApplied::new(table.clone(), state));
                self.tables.len() - 1
            }
        };
        &mut self.tables[index]
    }

    /// Adds another set of counters into this one.
    pub fn merge(&mut self, other: &DatabaseChangesApplied) {
        for t in &other.tables {
            let entry = self.entry(&t.table, t.state);
            entry.applied += t.applied;
            entry.failed += t.failed;
            entry.resolved_conflicts += t.resolved_conflicts;
        }
    }

    /// Counters of one table summed over both states.
    pub fn table_totals(&self, table: &TableName) -> (u64, u64, u64) {
        self.tables
            .iter()
            .filter(|t| &t.table == table)
            .fold((0, 0, 0), |(a, f, r), t| {
                (a + t.applied, f + t.failed, r + t.resolved_conflicts)
            })
    }

    /// Rows written.
    pub fn total_applied_changes(&self) -> u64 {
        self.tables.iter().map(|t| t.applied).sum()
    }

    /// Rows that failed.
    pub fn total_applied_changes_failed(&self) -> u64 {
        self.tables.iter().map(|t| t.failed).sum()
    }

    /// Conflicts resolved.
    pub fn total_resolved_conflicts(&self) -> u64 {
        self.tables.iter().map(|t| t.resolved_conflicts).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selected_totals() {
        let mut customers = TableChangesSelected::new(TableName::new("Customer"));
        customers.record(RowState::Modified);
        customers.record(RowState::Modified);
        customers.record(RowState::Deleted);
        let selected = DatabaseChangesSelected {
            tables: vec![customers, TableChangesSelected::new(TableName::new("Orders"))],
        };
        assert_eq!(selected.total_changes_selected(), 3);
        assert_eq!(selected.total_upserts(), 2);
        assert_eq!(selected.total_deletes(), 1);
        assert_eq!(selected.table(&TableName::new("Orders")).map(|t| t.total()), Some(0));
    }

    #[test]
    fn applied_merge() {
        let table = TableName::new("Customer");
        let mut a = DatabaseChangesApplied::default();
        a.entry(&table, RowState::Modified).applied = 2;
        let mut b = DatabaseChangesApplied::default();
        b.entry(&table, RowState::Modified).applied = 1;
        b.entry(&table, RowState::Modified).resolved_conflicts = 1;
        b.entry(&table, RowState::Deleted).failed = 1;

        a.merge(&b);
        assert_eq!(a.tables.len(), 2);
        assert_eq!(a.total_applied_changes(), 3);
        assert_eq!(a.total_resolved_conflicts(), 1);
        assert_eq!(a.total_applied_changes_failed(), 1);
        assert_eq!(a.table_totals(&table), (3, 1, 1));
    }
}

//! Property-based test generators using proptest.
//!
//! Strategies produce edits over the `Customer` table; applying them
//! keeps the unique `Email` column valid because the address is
//! derived from the key.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tidemark_core::{MemoryStore, SyncValue};

/// Strategy for customer keys, drawn from a small range so edits collide.
pub fn customer_id_strategy() -> impl Strategy<Value = i64> {
    1i64..=32
}

/// Strategy for customer names.
pub fn customer_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{0,11}").expect("Invalid regex")
}

/// Strategy for a set of customers keyed by id.
pub fn customer_set_strategy(max: usize) -> impl Strategy<Value = BTreeMap<i64, String>> {
    prop::collection::btree_map(customer_id_strategy(), customer_name_strategy(), 0..max)
}

/// A local edit on the `Customer` table.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Insert or update a customer
    Upsert {
        /// Customer id
        id: i64,
        /// New name
        name: String,
    },
    /// Delete a customer
    Delete {
        /// Customer id
        id: i64,
    },
}

impl Edit {
    /// Customer id touched by the edit.
    pub fn id(&self) -> i64 {
        match self {
            Edit::Upsert { id, .. } | Edit::Delete { id } => *id,
        }
    }
}

/// Strategy for a single edit.
pub fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (customer_id_strategy(), customer_name_strategy())
            .prop_map(|(id, name)| Edit::Upsert { id, name }),
        1 => customer_id_strategy().prop_map(|id| Edit::Delete { id }),
    ]
}

/// Strategy for a sequence of edits.
pub fn edit_sequence_strategy(min_edits: usize, max_edits: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(edit_strategy(), min_edits..max_edits)
}

/// Customer row values for `id` with an explicit name.
pub fn named_customer_row(id: i64, name: &str) -> Vec<SyncValue> {
    vec![
        id.into(),
        name.into(),
        format!("customer{id}@example.com").into(),
    ]
}

/// Applies edits to `store` as local writes.
pub fn apply_edits(store: &MemoryStore, edits: &[Edit]) {
    for edit in edits {
        match edit {
            Edit::Upsert { id, name } => {
                store
                    .upsert("Customer", named_customer_row(*id, name))
                    .expect("Failed to upsert customer");
            }
            Edit::Delete { id } => {
                store
                    .delete("Customer", vec![(*id).into()])
                    .expect("Failed to delete customer");
            }
        }
    }
}

/// The live `Customer` rows expected after applying `edits` to `initial`.
pub fn expected_customers(initial: &BTreeMap<i64, String>, edits: &[Edit]) -> BTreeMap<i64, String> {
    let mut rows = initial.clone();
    for edit in edits {
        match edit {
            Edit::Upsert { id, name } => {
                rows.insert(*id, name.clone());
            }
            Edit::Delete { id } => {
                rows.remove(id);
            }
        }
    }
    rows
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

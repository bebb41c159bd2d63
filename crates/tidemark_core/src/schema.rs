//! Table, relation and filter declarations for a sync set.

use crate::error::{CoreError, CoreResult};
use crate::value::SyncValue;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    /// Table name.
    pub name: String,
    /// Optional schema (namespace) name.
    pub schema: Option<String>,
}

impl TableName {
    /// Creates an unqualified table name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
        }
    }

    /// Creates a schema-qualified table name.
    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: Some(schema.into()),
        }
    }

    /// Checks that the name and schema can be used as file name parts.
    pub fn validate(&self) -> CoreResult<()> {
        for part in std::iter::once(self.name.as_str()).chain(self.schema.as_deref()) {
            if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\', '\0']) {
                return Err(CoreError::invalid_schema(format!("invalid table name '{self}'")));
            }
        }
        Ok(())
    }

    /// Parses `schema.name` or `name`.
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::with_schema(schema, name),
            None => Self::new(qualified),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl From<&str> for TableName {
    fn from(qualified: &str) -> Self {
        Self::parse(qualified)
    }
}

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Boolean.
    Boolean,
    /// 64-bit integer.
    Integer,
    /// Floating point.
    Real,
    /// Exact decimal.
    Decimal,
    /// Text.
    Text,
    /// Binary.
    Blob,
    /// UTC timestamp.
    DateTime,
    /// Unique identifier.
    Guid,
}

impl ColumnType {
    /// Returns true if `value` may be stored in a column of this type.
    pub fn accepts(&self, value: &SyncValue) -> bool {
        matches!(
            (self, value),
            (_, SyncValue::Null)
                | (ColumnType::Boolean, SyncValue::Boolean(_))
                | (ColumnType::Integer, SyncValue::Integer(_))
                | (ColumnType::Real, SyncValue::Real(_))
                | (ColumnType::Decimal, SyncValue::Decimal(_))
                | (ColumnType::Text, SyncValue::Text(_))
                | (ColumnType::Blob, SyncValue::Blob(_))
                | (ColumnType::DateTime, SyncValue::DateTime(_))
                | (ColumnType::Guid, SyncValue::Guid(_))
        )
    }
}

/// A column of a synchronized table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncColumn {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub column_type: ColumnType,
    /// Whether `NULL` is allowed.
    pub nullable: bool,
}

impl SyncColumn {
    /// Creates a non-nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    /// Marks the column nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Which way a table's changes may flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Client and server exchange changes.
    #[default]
    Bidirectional,
    /// Only client changes are sent to the server.
    UploadOnly,
    /// Only server changes are sent to the client.
    DownloadOnly,
}

impl SyncDirection {
    /// Returns true if client changes are uploaded.
    pub fn allows_upload(&self) -> bool {
        !matches!(self, SyncDirection::DownloadOnly)
    }

    /// Returns true if server changes are downloaded.
    pub fn allows_download(&self) -> bool {
        !matches!(self, SyncDirection::UploadOnly)
    }
}

/// A table taking part in synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
    /// Table name.
    pub name: TableName,
    /// Columns in row order.
    pub columns: Vec<SyncColumn>,
    /// Primary key column names.
    pub primary_keys: Vec<String>,
    /// Columns carrying a single-column unique constraint.
    pub unique_columns: Vec<String>,
    /// Allowed change direction.
    pub direction: SyncDirection,
}

impl SyncTable {
    /// Creates a table declaration.
    pub fn new(name: impl Into<TableName>, columns: Vec<SyncColumn>, primary_keys: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_keys: primary_keys.iter().map(|s| (*s).to_string()).collect(),
            unique_columns: Vec::new(),
            direction: SyncDirection::Bidirectional,
        }
    }

    /// Declares a unique column.
    #[must_use]
    pub fn with_unique(mut self, column: impl Into<String>) -> Self {
        self.unique_columns.push(column.into());
        self
    }

    /// Sets the sync direction.
    #[must_use]
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Positions of the primary key columns, in key order.
    pub fn primary_key_indices(&self) -> CoreResult<Vec<usize>> {
        self.primary_keys
            .iter()
            .map(|pk| {
                self.column_index(pk).ok_or_else(|| {
                    CoreError::invalid_schema(format!(
                        "primary key column {pk} not declared on {}",
                        self.name
                    ))
                })
            })
            .collect()
    }

    /// Validates the declaration.
    pub fn validate(&self) -> CoreResult<()> {
        self.name.validate()?;
        if self.columns.is_empty() {
            return Err(CoreError::invalid_schema(format!(
                "table {} declares no columns",
                self.name
            )));
        }
        if self.primary_keys.is_empty() {
            return Err(CoreError::invalid_schema(format!(
                "table {} declares no primary key",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(CoreError::invalid_schema(format!(
                    "column {} declared twice on {}",
                    column.name, self.name
                )));
            }
        }
        self.primary_key_indices()?;
        for unique in &self.unique_columns {
            if self.column_index(unique).is_none() {
                return Err(CoreError::invalid_schema(format!(
                    "unique column {unique} not declared on {}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Column names in row order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// A foreign key between two tables of the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRelation {
    /// Relation name.
    pub name: String,
    /// Referencing table.
    pub child: TableName,
    /// Referencing columns.
    pub child_columns: Vec<String>,
    /// Referenced table.
    pub parent: TableName,
    /// Referenced columns.
    pub parent_columns: Vec<String>,
}

impl SyncRelation {
    /// Creates a single-column relation.
    pub fn new(
        name: impl Into<String>,
        child: impl Into<TableName>,
        child_column: impl Into<String>,
        parent: impl Into<TableName>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            child: child.into(),
            child_columns: vec![child_column.into()],
            parent: parent.into(),
            parent_columns: vec![parent_column.into()],
        }
    }
}

/// Binds a filtered column to a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterClause {
    /// Column compared.
    pub column: String,
    /// Parameter supplying the value.
    pub parameter: String,
}

/// A parameter a filter expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParameter {
    /// Parameter name.
    pub name: String,
    /// Expected type.
    pub column_type: ColumnType,
    /// Value used when the client supplies none.
    pub default_value: Option<SyncValue>,
}

/// Row filter on one table: every clause must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFilter {
    /// Filtered table.
    pub table: TableName,
    /// Equality clauses.
    pub clauses: Vec<FilterClause>,
    /// Declared parameters.
    pub parameters: Vec<FilterParameter>,
}

impl SyncFilter {
    /// Creates a filter with no clauses.
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            clauses: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Adds `column = @parameter` with a parameter of the given type.
    #[must_use]
    pub fn with_equals(
        mut self,
        column: impl Into<String>,
        parameter: impl Into<String>,
        column_type: ColumnType,
    ) -> Self {
        let parameter = parameter.into();
        self.clauses.push(FilterClause {
            column: column.into(),
            parameter: parameter.clone(),
        });
        self.parameters.push(FilterParameter {
            name: parameter,
            column_type,
            default_value: None,
        });
        self
    }

    /// Sets the default value of a declared parameter.
    #[must_use]
    pub fn with_default(mut self, parameter: &str, value: SyncValue) -> Self {
        if let Some(p) = self.parameters.iter_mut().find(|p| p.name == parameter) {
            p.default_value = Some(value);
        }
        self
    }
}

/// The tables, relations and filters of a scope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncSet {
    /// Tables in declaration order.
    pub tables: Vec<SyncTable>,
    /// Foreign keys between tables.
    pub relations: Vec<SyncRelation>,
    /// Row filters.
    pub filters: Vec<SyncFilter>,
}

impl SyncSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table.
    #[must_use]
    pub fn with_table(mut self, table: SyncTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Adds a relation.
    #[must_use]
    pub fn with_relation(mut self, relation: SyncRelation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Adds a filter.
    #[must_use]
    pub fn with_filter(mut self, filter: SyncFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Looks up a table.
    pub fn table(&self, name: &TableName) -> Option<&SyncTable> {
        self.tables.iter().find(|t| &t.name == name)
    }

    /// Filter declared for a table, if any.
    pub fn filter_for(&self, name: &TableName) -> Option<&SyncFilter> {
        self.filters.iter().find(|f| &f.table == name)
    }

    /// Validates tables, relations and filters.
    pub fn validate(&self) -> CoreResult<()> {
        let mut names = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !names.insert(&table.name) {
                return Err(CoreError::invalid_schema(format!(
                    "table {} declared twice",
                    table.name
                )));
            }
        }
        for relation in &self.relations {
            for (table, columns) in [
                (&relation.child, &relation.child_columns),
                (&relation.parent, &relation.parent_columns),
            ] {
                let declared = self.table(table).ok_or_else(|| {
                    CoreError::invalid_schema(format!(
                        "relation {} references unknown table {table}",
                        relation.name
                    ))
                })?;
                if let Some(missing) = columns.iter().find(|c| declared.column_index(c).is_none()) {
                    return Err(CoreError::invalid_schema(format!(
                        "relation {} references unknown column {table}.{missing}",
                        relation.name
                    )));
                }
            }
        }
        for filter in &self.filters {
            let declared = self.table(&filter.table).ok_or_else(|| {
                CoreError::invalid_schema(format!("filter on unknown table {}", filter.table))
            })?;
            for clause in &filter.clauses {
                if declared.column_index(&clause.column).is_none() {
                    return Err(CoreError::invalid_schema(format!(
                        "filter on {} references unknown column {}",
                        filter.table, clause.column
                    )));
                }
                if !filter.parameters.iter().any(|p| p.name == clause.parameter) {
                    return Err(CoreError::invalid_schema(format!(
                        "filter on {} uses undeclared parameter {}",
                        filter.table, clause.parameter
                    )));
                }
            }
        }
        Ok(())
    }

    /// Tables in referential-dependency order: parents before children.
    ///
    /// Declaration order breaks ties. Self references are ignored; any
    /// other cycle is rejected.
    pub fn ordered_tables(&self) -> CoreResult<Vec<&SyncTable>> {
        let position: HashMap<&TableName, usize> = self
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (&t.name, i))
            .collect();

        let mut pending_parents = vec![0usize; self.tables.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.tables.len()];
        let mut seen_edges = HashSet::new();
        for relation in &self.relations {
            let (Some(&child), Some(&parent)) =
                (position.get(&relation.child), position.get(&relation.parent))
            else {
                continue;
            };
            if child == parent || !seen_edges.insert((parent, child)) {
                continue;
            }
            pending_parents[child] += 1;
            children[parent].push(child);
        }

        let mut ordered = Vec::with_capacity(self.tables.len());
        let mut done = vec![false; self.tables.len()];
        while ordered.len() < self.tables.len() {
            // Lowest declared position among tables whose parents are placed.
            let Some(next) = (0..self.tables.len()).find(|&i| !done[i] && pending_parents[i] == 0)
            else {
                let remaining: Vec<String> = (0..self.tables.len())
                    .filter(|&i| !done[i])
                    .map(|i| self.tables[i].name.to_string())
                    .collect();
                return Err(CoreError::CyclicRelations {
                    tables: remaining.join(", "),
                });
            };
            done[next] = true;
            for &child in &children[next] {
                pending_parents[child] -= 1;
            }
            ordered.push(&self.tables[next]);
        }
        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> SyncTable {
        SyncTable::new(
            name,
            vec![
                SyncColumn::new("Id", ColumnType::Integer),
                SyncColumn::new("ParentId", ColumnType::Integer).nullable(),
            ],
            &["Id"],
        )
    }

    #[test]
    fn table_name_parsing() {
        assert_eq!(TableName::parse("dbo.Customer"), TableName::with_schema("dbo", "Customer"));
        assert_eq!(TableName::parse("Customer").to_string(), "Customer");
        assert_eq!(TableName::with_schema("sales", "Orders").to_string(), "sales.Orders");
    }

    #[test]
    fn table_names_must_be_usable_in_file_names() {
        assert!(table("Customer").validate().is_ok());
        assert!(TableName::with_schema("sales", "Orders").validate().is_ok());
        for bad in ["../Customer", "a/b", "a\\b", "..", ""] {
            let err = table(bad).validate().unwrap_err();
            assert!(matches!(err, CoreError::InvalidSchema { .. }), "{bad:?} accepted");
        }
        assert!(TableName::with_schema("..", "Orders").validate().is_err());
    }

    #[test]
    fn ordered_tables_places_parents_first() {
        let set = SyncSet::new()
            .with_table(table("OrderLine"))
            .with_table(table("Orders"))
            .with_table(table("Customer"))
            .with_relation(SyncRelation::new("FK_Line_Order", "OrderLine", "ParentId", "Orders", "Id"))
            .with_relation(SyncRelation::new("FK_Order_Customer", "Orders", "ParentId", "Customer", "Id"));

        let names: Vec<String> = set
            .ordered_tables()
            .unwrap()
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(names, vec!["Customer", "Orders", "OrderLine"]);
    }

    #[test]
    fn ordered_tables_keeps_declaration_order_without_relations() {
        let set = SyncSet::new().with_table(table("B")).with_table(table("A"));
        let names: Vec<&str> = set
            .ordered_tables()
            .unwrap()
            .iter()
            .map(|t| t.name.name.as_str())
            .collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn ordered_tables_ignores_self_reference() {
        let set = SyncSet::new()
            .with_table(table("Employee"))
            .with_relation(SyncRelation::new("FK_Manager", "Employee", "ParentId", "Employee", "Id"));
        assert_eq!(set.ordered_tables().unwrap().len(), 1);
    }

    #[test]
    fn ordered_tables_rejects_cycles() {
        let set = SyncSet::new()
            .with_table(table("A"))
            .with_table(table("B"))
            .with_relation(SyncRelation::new("FK_A_B", "A", "ParentId", "B", "Id"))
            .with_relation(SyncRelation::new("FK_B_A", "B", "ParentId", "A", "Id"));
        let err = set.ordered_tables().unwrap_err();
        assert!(matches!(err, CoreError::CyclicRelations { .. }));
    }

    #[test]
    fn validate_rejects_unknown_columns() {
        let set = SyncSet::new()
            .with_table(table("Orders"))
            .with_filter(SyncFilter::new("Orders").with_equals("CustomerID", "CustomerID", ColumnType::Integer));
        assert!(set.validate().is_err());

        let bad_pk = SyncTable::new("T", vec![SyncColumn::new("A", ColumnType::Text)], &["B"]);
        assert!(bad_pk.validate().is_err());
    }

    #[test]
    fn column_type_accepts() {
        assert!(ColumnType::Integer.accepts(&SyncValue::Integer(1)));
        assert!(ColumnType::Integer.accepts(&SyncValue::Null));
        assert!(!ColumnType::Integer.accepts(&SyncValue::from("1")));
    }

    #[test]
    fn direction_flags() {
        assert!(SyncDirection::Bidirectional.allows_upload());
        assert!(SyncDirection::Bidirectional.allows_download());
        assert!(!SyncDirection::DownloadOnly.allows_upload());
        assert!(!SyncDirection::UploadOnly.allows_download());
    }
}

//! Named values produced and consumed by pipeline blocks.
//!
//! A variable is either a single scalar value or a table of ordered rows.
//! Template resolution looks variables up by `name` within one agent's
//! scope, so names must be unique per owner; `id` is the persistence key.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One table row: a mapping from column name to cell value.
///
/// Rows are sparse; a row may populate any subset of the declared columns.
/// Insertion order of cells is preserved so serialized rows stay stable.
pub type Row = IndexMap<String, Value>;

/// Discriminant for the two variable shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Scalar,
    Table,
}

impl VariableKind {
    pub fn label(self) -> &'static str {
        match self {
            VariableKind::Scalar => "scalar",
            VariableKind::Table => "table",
        }
    }
}

/// The payload of a variable, tagged by kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariableValue {
    /// A single value, replaced wholesale on update.
    Scalar {
        #[serde(default)]
        value: Value,
    },
    /// An ordered sequence of rows under a declared set of columns.
    ///
    /// `columns` is the superset of keys ever written, independent of which
    /// rows currently populate them.
    Table {
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        rows: Vec<Row>,
    },
}

impl VariableValue {
    /// An empty payload of the given kind.
    pub fn empty(kind: VariableKind) -> Self {
        match kind {
            VariableKind::Scalar => VariableValue::Scalar { value: Value::Null },
            VariableKind::Table => VariableValue::Table {
                columns: Vec::new(),
                rows: Vec::new(),
            },
        }
    }

    pub fn kind(&self) -> VariableKind {
        match self {
            VariableValue::Scalar { .. } => VariableKind::Scalar,
            VariableValue::Table { .. } => VariableKind::Table,
        }
    }
}

/// A named value owned by one agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Stable identity used for persistence and update/delete calls.
    pub id: String,
    /// Resolution name; unique among the owner agent's variables.
    pub name: String,
    /// Id of the agent whose scope this variable belongs to.
    pub owner_agent_id: String,
    /// Scalar or table payload, serialized with a `kind` tag.
    #[serde(flatten)]
    pub value: VariableValue,
}

impl Variable {
    pub fn kind(&self) -> VariableKind {
        self.value.kind()
    }

    /// The scalar payload, if this is a scalar variable.
    pub fn scalar_value(&self) -> Option<&Value> {
        match &self.value {
            VariableValue::Scalar { value } => Some(value),
            VariableValue::Table { .. } => None,
        }
    }

    /// Declared columns, if this is a table variable.
    pub fn columns(&self) -> Option<&[String]> {
        match &self.value {
            VariableValue::Table { columns, .. } => Some(columns),
            VariableValue::Scalar { .. } => None,
        }
    }

    /// Rows in order, if this is a table variable.
    pub fn rows(&self) -> Option<&[Row]> {
        match &self.value {
            VariableValue::Table { rows, .. } => Some(rows),
            VariableValue::Scalar { .. } => None,
        }
    }

    /// True when this is a table and `column` is among its declared columns.
    ///
    /// Membership is checked against the declared column list, not row data,
    /// so a declared-but-empty column still counts.
    pub fn table_has_column(&self, column: &str) -> bool {
        self.columns()
            .is_some_and(|columns| columns.iter().any(|c| c == column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip_with_kind_tag() {
        let json = r#"{
            "id": "var-1",
            "name": "analysis",
            "owner_agent_id": "agent-1",
            "kind": "scalar",
            "value": "X"
        }"#;

        let var: Variable = serde_json::from_str(json).expect("deserialize Variable");
        assert_eq!(var.kind(), VariableKind::Scalar);
        assert_eq!(var.scalar_value(), Some(&Value::String("X".into())));

        let back = serde_json::to_value(&var).expect("serialize Variable");
        assert_eq!(back["kind"], "scalar");
        assert_eq!(back["value"], "X");
    }

    #[test]
    fn table_defaults_to_empty_columns_and_rows() {
        let json = r#"{
            "id": "var-2",
            "name": "sales",
            "owner_agent_id": "agent-1",
            "kind": "table"
        }"#;

        let var: Variable = serde_json::from_str(json).expect("deserialize table");
        assert_eq!(var.kind(), VariableKind::Table);
        assert_eq!(var.columns(), Some(&[][..]));
        assert_eq!(var.rows().map(<[Row]>::len), Some(0));
    }

    #[test]
    fn column_membership_ignores_row_data() {
        let mut var = Variable {
            id: "var-3".into(),
            name: "sales".into(),
            owner_agent_id: "agent-1".into(),
            value: VariableValue::Table {
                columns: vec!["id".into()],
                rows: Vec::new(),
            },
        };
        assert!(var.table_has_column("id"));
        assert!(!var.table_has_column("total"));

        if let VariableValue::Table { columns, .. } = &mut var.value {
            columns.push("total".into());
        }
        assert!(var.table_has_column("total"));
    }

    #[test]
    fn scalar_never_has_columns() {
        let var = Variable {
            id: "var-4".into(),
            name: "note".into(),
            owner_agent_id: "agent-1".into(),
            value: VariableValue::Scalar {
                value: Value::String("hi".into()),
            },
        };
        assert!(var.columns().is_none());
        assert!(!var.table_has_column("anything"));
    }
}

//! Sync rules
//!
//! A rule describes how rows from one source table are applied to one
//! sink: column mapping, soft-delete handling, filter conditions, and
//! the sync mode. Rules are grouped by `<database>_<table>`; one event
//! may match several rules.

use std::collections::HashMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PorterError;
use crate::event::Row;

/// How rule output lands in the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Projected post-image becomes a whole row in the target
    Copy,
    /// Projected post-image becomes a nested object under the join field
    Join,
    /// A single column's value is added to / removed from a set field
    Inner,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Copy => "copy",
            SyncMode::Join => "join",
            SyncMode::Inner => "inner",
        }
    }
}

/// Boolean tree of row filters. Keys are `"and"` / `"or"`; a map with
/// both keys conjoins the groups.
pub type ConditionTree = HashMap<String, Vec<FilterCondition>>;

/// One filter node: a comparison leaf, a nested subtree, or both
/// (conjoined)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub column: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub children: ConditionTree,
}

const CONDITION_AND: &str = "and";
const CONDITION_OR: &str = "or";

/// Per-table synchronization rule
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRule {
    /// Source database
    pub database: String,
    /// Source table
    pub table: String,
    /// Primary-key column name in the source table
    pub primary_key: String,
    /// Columns whose values key the record mutex
    pub lock_columns: Vec<String>,
    /// Column mapping, source name to target name
    pub columns: HashMap<String, String>,
    /// Soft-delete column; `None` disables soft-delete handling
    pub soft_delete_field: Option<String>,
    /// Value of the soft-delete column meaning "not deleted"
    pub un_soft_delete_value: String,
    /// Row filter; rows failing it are not synced
    pub data_conditions: Option<ConditionTree>,
    /// Raw target string, kept for re-serialization
    pub target: String,
    /// Sink kind parsed from the target (`table`, `search`, ...)
    pub sink_kind: String,
    /// Sink instance (connection name) parsed from the target
    pub sink_instance: String,
    /// Target database, present only in the three-part form
    pub target_database: Option<String>,
    /// Target table or index
    pub target_table: String,
    /// Sync mode
    pub sync_mode: SyncMode,
    /// Field receiving nested/element values in JOIN and INNER modes
    pub join_field: Option<String>,
    /// Constant fields merged into every written record
    pub extra_fields: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct WireRule {
    database: String,
    table: String,
    primary_key: String,
    #[serde(default)]
    lock_columns: Vec<String>,
    columns: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soft_delete_field: Option<String>,
    #[serde(default)]
    un_soft_delete_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_conditions: Option<ConditionTree>,
    target: String,
    sync_type: SyncMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    target_extra_params: HashMap<String, String>,
}

/// Splits `<kind>:<instance>.<database>.<table>` (or the two-part
/// `<kind>:<instance>.<dataset>` form). Anything else fails rule loading.
fn parse_target(target: &str) -> Result<(String, String, Option<String>, String), PorterError> {
    let invalid = || PorterError::InvalidTarget {
        target: target.to_string(),
    };

    let (kind, rest) = target.split_once(':').ok_or_else(invalid)?;
    if kind.is_empty() {
        return Err(invalid());
    }

    let parts: Vec<&str> = rest.split('.').collect();
    match parts.as_slice() {
        [instance, database, table]
            if !instance.is_empty() && !database.is_empty() && !table.is_empty() =>
        {
            Ok((
                kind.to_string(),
                instance.to_string(),
                Some(database.to_string()),
                table.to_string(),
            ))
        }
        [instance, dataset] if !instance.is_empty() && !dataset.is_empty() => Ok((
            kind.to_string(),
            instance.to_string(),
            None,
            dataset.to_string(),
        )),
        _ => Err(invalid()),
    }
}

impl<'de> Deserialize<'de> for SyncRule {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = WireRule::deserialize(deserializer)?;
        let (sink_kind, sink_instance, target_database, target_table) =
            parse_target(&wire.target).map_err(|e| D::Error::custom(e.to_string()))?;

        Ok(SyncRule {
            database: wire.database,
            table: wire.table,
            primary_key: wire.primary_key,
            lock_columns: wire.lock_columns,
            columns: wire.columns,
            soft_delete_field: wire.soft_delete_field,
            un_soft_delete_value: wire.un_soft_delete_value,
            data_conditions: wire.data_conditions,
            target: wire.target,
            sink_kind,
            sink_instance,
            target_database,
            target_table,
            sync_mode: wire.sync_type,
            join_field: wire.join_field_name,
            extra_fields: wire.target_extra_params,
        })
    }
}

impl Serialize for SyncRule {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        WireRule {
            database: self.database.clone(),
            table: self.table.clone(),
            primary_key: self.primary_key.clone(),
            lock_columns: self.lock_columns.clone(),
            columns: self.columns.clone(),
            soft_delete_field: self.soft_delete_field.clone(),
            un_soft_delete_value: self.un_soft_delete_value.clone(),
            data_conditions: self.data_conditions.clone(),
            target: self.target.clone(),
            sync_type: self.sync_mode,
            join_field_name: self.join_field.clone(),
            target_extra_params: self.extra_fields.clone(),
        }
        .serialize(serializer)
    }
}

impl SyncRule {
    /// Group key under which this rule is registered
    pub fn rule_key(&self) -> String {
        format!("{}_{}", self.database, self.table)
    }

    /// Source column mapped onto the join field (INNER mode only)
    pub fn join_column(&self) -> Option<&str> {
        let join_field = self.join_field.as_deref()?;
        self.columns
            .iter()
            .find(|(_, target)| target.as_str() == join_field)
            .map(|(local, _)| local.as_str())
    }

    /// Evaluates the filter conditions against a row. No conditions
    /// means every row passes. Pure over `row`.
    pub fn matches(&self, row: &Row) -> bool {
        match &self.data_conditions {
            Some(tree) => evaluate_tree(tree, row),
            None => true,
        }
    }
}

fn evaluate_tree(tree: &ConditionTree, row: &Row) -> bool {
    for (group, conditions) in tree {
        let holds = match group.as_str() {
            CONDITION_AND => conditions.iter().all(|c| evaluate_condition(c, row)),
            CONDITION_OR => conditions.iter().any(|c| evaluate_condition(c, row)),
            _ => false,
        };
        if !holds {
            return false;
        }
    }

    true
}

fn evaluate_condition(condition: &FilterCondition, row: &Row) -> bool {
    if !condition.column.is_empty() {
        // A named column absent from the row fails the leaf
        let Some(value) = row.get(&condition.column) else {
            return false;
        };
        if !compare_values(value, &condition.value, &condition.operator) {
            return false;
        }
    }

    if !condition.children.is_empty() {
        return evaluate_tree(&condition.children, row);
    }

    true
}

/// Lexicographic string comparison, matching the wire representation
/// where all row values are strings
fn compare_values(first: &str, second: &str, operator: &str) -> bool {
    match operator {
        ">" => first > second,
        "<" => first < second,
        "=" => first == second,
        "!=" => first != second,
        ">=" => first >= second,
        "<=" => first <= second,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_three_part_target() {
        let raw = r#"{"database":"t","table":"u","primary_key":"id",
            "columns":{"id":"id"},"target":"table:main.shop.users","sync_type":"copy"}"#;
        let rule: SyncRule = serde_json::from_str(raw).unwrap();

        assert_eq!(rule.sink_kind, "table");
        assert_eq!(rule.sink_instance, "main");
        assert_eq!(rule.target_database.as_deref(), Some("shop"));
        assert_eq!(rule.target_table, "users");
    }

    #[test]
    fn test_parse_two_part_target() {
        let raw = r#"{"database":"t","table":"u","primary_key":"id",
            "columns":{"id":"id"},"target":"search:main.users","sync_type":"join",
            "join_field_name":"profile"}"#;
        let rule: SyncRule = serde_json::from_str(raw).unwrap();

        assert_eq!(rule.sink_kind, "search");
        assert!(rule.target_database.is_none());
        assert_eq!(rule.target_table, "users");
    }

    #[test]
    fn test_malformed_targets_fail_loading() {
        for target in ["users", "table:", "table:main", "table:a.b.c.d", ":main.users"] {
            let raw = format!(
                r#"{{"database":"t","table":"u","primary_key":"id",
                    "columns":{{}},"target":"{target}","sync_type":"copy"}}"#
            );
            assert!(
                serde_json::from_str::<SyncRule>(&raw).is_err(),
                "{target} should be rejected"
            );
        }
    }

    #[test]
    fn test_and_conditions() {
        let tree: ConditionTree = serde_json::from_str(
            r#"{"and":[{"column":"age","operator":">=","value":"18"},
                       {"column":"status","operator":"=","value":"1"}]}"#,
        )
        .unwrap();

        assert!(evaluate_tree(&tree, &row(&[("age", "20"), ("status", "1")])));
        assert!(!evaluate_tree(&tree, &row(&[("age", "10"), ("status", "1")])));
        // Named column absent from the row evaluates false
        assert!(!evaluate_tree(&tree, &row(&[("age", "20")])));
    }

    #[test]
    fn test_or_conditions_with_children() {
        let tree: ConditionTree = serde_json::from_str(
            r#"{"or":[{"column":"vip","operator":"=","value":"1"},
                      {"children":{"and":[{"column":"age","operator":">","value":"30"}]}}]}"#,
        )
        .unwrap();

        assert!(evaluate_tree(&tree, &row(&[("vip", "1"), ("age", "20")])));
        assert!(evaluate_tree(&tree, &row(&[("vip", "0"), ("age", "40")])));
        assert!(!evaluate_tree(&tree, &row(&[("vip", "0"), ("age", "20")])));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let tree: ConditionTree = serde_json::from_str(
            r#"{"and":[{"column":"age","operator":">=","value":"18"}]}"#,
        )
        .unwrap();
        let data = row(&[("age", "20")]);

        for _ in 0..16 {
            assert_eq!(evaluate_tree(&tree, &data), evaluate_tree(&tree, &data));
        }
    }

    #[test]
    fn test_join_column_lookup() {
        let raw = r#"{"database":"t","table":"u","primary_key":"id",
            "columns":{"id":"id","tag":"tags"},"target":"search:main.users",
            "sync_type":"inner","join_field_name":"tags"}"#;
        let rule: SyncRule = serde_json::from_str(raw).unwrap();

        assert_eq!(rule.join_column(), Some("tag"));
    }
}

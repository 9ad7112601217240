//! Reply side-channel: loose `data` entries plus `mod`/`del` sync sections
//! the client applies to its local copy of game state.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Describes how rows of one synced collection are keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRule {
    name: String,
    primary_key: Option<String>,
    direct_key: Option<String>,
}

impl SyncRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: None,
            direct_key: None,
        }
    }

    /// Rows are keyed by this field.
    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = Some(key.into());
        self
    }

    /// Only this field of each row is sent, instead of the whole row.
    pub fn with_direct_key(mut self, key: impl Into<String>) -> Self {
        self.direct_key = Some(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub fn direct_key(&self) -> Option<&str> {
        self.direct_key.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachments {
    rules: BTreeMap<String, SyncRule>,
    data: Map<String, Value>,
    modified: Map<String, Value>,
    deleted: BTreeMap<String, Vec<Value>>,
}

fn row_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Attachments {
    pub fn data(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Records changed rows under `rule`.
    ///
    /// With a primary key, rows are stored in an object keyed by that field
    /// (later rows with the same key win). Without one, the section is
    /// replaced by the last row. Non-object rows are ignored.
    pub fn modify(&mut self, rule: &SyncRule, rows: impl IntoIterator<Item = Value>) {
        for row in rows {
            let Value::Object(row) = row else { continue };
            match rule.primary_key() {
                Some(pk) => {
                    let Some(id) = row.get(pk).map(row_key) else {
                        continue;
                    };
                    let entry = match rule.direct_key() {
                        Some(dk) => row.get(dk).cloned().unwrap_or(Value::Null),
                        None => Value::Object(row),
                    };
                    let section = self
                        .modified
                        .entry(rule.name().to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !section.is_object() {
                        *section = Value::Object(Map::new());
                    }
                    if let Value::Object(section) = section {
                        section.insert(id, entry);
                    }
                }
                None => {
                    self.modified
                        .insert(rule.name().to_string(), Value::Object(row));
                }
            }
        }
        self.remember(rule);
    }

    /// Records deleted rows under `rule` by primary key.
    pub fn delete(&mut self, rule: &SyncRule, rows: impl IntoIterator<Item = Value>) {
        let Some(pk) = rule.primary_key() else {
            return;
        };
        let ids = self.deleted.entry(rule.name().to_string()).or_default();
        ids.extend(rows.into_iter().filter_map(|row| row.get(pk).cloned()));
        self.remember(rule);
    }

    fn remember(&mut self, rule: &SyncRule) {
        self.rules
            .entry(rule.name().to_string())
            .or_insert_with(|| rule.clone());
    }

    /// Folds `other` into `self`.
    ///
    /// Keyed `mod` sections merge row by row, unkeyed ones are replaced, and
    /// `del` ids are appended.
    pub fn join(&mut self, other: Attachments) -> &mut Self {
        let Attachments {
            rules,
            data,
            modified,
            deleted,
        } = other;

        self.data.extend(data);

        for (name, section) in modified {
            let keyed = rules
                .get(&name)
                .and_then(SyncRule::primary_key)
                .is_some();
            let replaced = match (keyed, self.modified.get_mut(&name), section) {
                (true, Some(Value::Object(mine)), Value::Object(theirs)) => {
                    mine.extend(theirs);
                    None
                }
                (_, _, section) => Some(section),
            };
            if let Some(section) = replaced {
                self.modified.insert(name, section);
            }
        }

        for (name, ids) in deleted {
            self.deleted.entry(name).or_default().extend(ids);
        }

        for (name, rule) in rules {
            self.rules.entry(name).or_insert(rule);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Renders the non-empty sections as `data`, `mod` and `del` keys.
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut out = Map::new();
        if !self.data.is_empty() {
            out.insert("data".into(), Value::Object(self.data.clone()));
        }
        if !self.modified.is_empty() {
            out.insert("mod".into(), Value::Object(self.modified.clone()));
        }
        if !self.deleted.is_empty() {
            let deleted = self
                .deleted
                .iter()
                .map(|(name, ids)| (name.clone(), Value::Array(ids.clone())))
                .collect();
            out.insert("del".into(), Value::Object(deleted));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heroes() -> SyncRule {
        SyncRule::new("hero").with_primary_key("id")
    }

    #[test]
    fn keyed_rows_are_grouped_by_primary_key() {
        let mut att = Attachments::default();
        att.modify(
            &heroes(),
            [json!({"id": 1, "hp": 10}), json!({"id": 2, "hp": 20})],
        );
        att.modify(&heroes(), [json!({"id": 1, "hp": 15})]);

        assert_eq!(
            Value::Object(att.to_json_map()),
            json!({"mod": {"hero": {"1": {"id": 1, "hp": 15}, "2": {"id": 2, "hp": 20}}}})
        );
    }

    #[test]
    fn direct_key_keeps_a_single_field() {
        let rule = SyncRule::new("items")
            .with_primary_key("item")
            .with_direct_key("count");
        let mut att = Attachments::default();
        att.modify(&rule, [json!({"item": "potion", "count": 3, "slot": 9})]);
        assert_eq!(
            Value::Object(att.to_json_map()),
            json!({"mod": {"items": {"potion": 3}}})
        );
    }

    #[test]
    fn unkeyed_section_is_replaced() {
        let rule = SyncRule::new("profile");
        let mut att = Attachments::default();
        att.modify(&rule, [json!({"name": "a"}), json!({"name": "b"})]);
        assert_eq!(
            Value::Object(att.to_json_map()),
            json!({"mod": {"profile": {"name": "b"}}})
        );
    }

    #[test]
    fn delete_collects_ids() {
        let mut att = Attachments::default();
        att.delete(&heroes(), [json!({"id": 4}), json!({"id": 5}), json!({"hp": 1})]);
        att.delete(&SyncRule::new("unkeyed"), [json!({"id": 1})]);
        assert_eq!(
            Value::Object(att.to_json_map()),
            json!({"del": {"hero": [4, 5]}})
        );
    }

    #[test]
    fn join_merges_sections() {
        let mut left = Attachments::default();
        left.modify(&heroes(), [json!({"id": 1, "hp": 10})]);
        left.delete(&heroes(), [json!({"id": 7})]);

        let mut right = Attachments::default();
        right.modify(&heroes(), [json!({"id": 2, "hp": 20})]);
        right.delete(&heroes(), [json!({"id": 8})]);
        right.data("gold", 5);

        left.join(right);
        assert_eq!(
            Value::Object(left.to_json_map()),
            json!({
                "data": {"gold": 5},
                "mod": {"hero": {"1": {"id": 1, "hp": 10}, "2": {"id": 2, "hp": 20}}},
                "del": {"hero": [7, 8]}
            })
        );
    }

    #[test]
    fn empty_attachments_render_nothing() {
        let att = Attachments::default();
        assert!(att.is_empty());
        assert!(att.to_json_map().is_empty());
    }
}

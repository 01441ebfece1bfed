//! Typed query selectors compiled to SQL over `json_extract`.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::store::error::StoreError;

/// Comparison operator for a selector condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

/// One field condition.
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub cmp: Cmp,
    pub value: Value,
}

/// A conjunction of field conditions. Soft-deleted documents are excluded
/// unless `include_deleted` is set.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    conditions: Vec<Condition>,
    include_deleted: bool,
}

/// Sort order for `find`.
#[derive(Debug, Clone)]
pub struct SortSpec {
    pub field: String,
    pub ascending: bool,
}

impl SortSpec {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            ascending: true,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            ascending: false,
        }
    }
}

impl Selector {
    /// Match every live document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: &str, cmp: Cmp, value: Value) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            cmp,
            value,
        });
        self
    }

    pub fn eq(self, field: &str, value: Value) -> Self {
        self.field(field, Cmp::Eq, value)
    }

    pub fn gt(self, field: &str, value: Value) -> Self {
        self.field(field, Cmp::Gt, value)
    }

    pub fn gte(self, field: &str, value: Value) -> Self {
        self.field(field, Cmp::Gte, value)
    }

    pub fn lt(self, field: &str, value: Value) -> Self {
        self.field(field, Cmp::Lt, value)
    }

    pub fn lte(self, field: &str, value: Value) -> Self {
        self.field(field, Cmp::Lte, value)
    }

    pub fn in_values(self, field: &str, values: Vec<Value>) -> Self {
        self.field(field, Cmp::In, Value::Array(values))
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Compile to a SQL WHERE clause plus bound parameters.
    pub fn to_sql(&self) -> Result<(String, Vec<SqlValue>), StoreError> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if !self.include_deleted {
            clauses.push("deleted = 0".to_string());
        }

        for cond in &self.conditions {
            let expr = field_expr(&cond.field)?;
            match cond.cmp {
                Cmp::In => {
                    let values = cond.value.as_array().cloned().unwrap_or_default();
                    if values.is_empty() {
                        // IN () matches nothing
                        clauses.push("0 = 1".to_string());
                        continue;
                    }
                    let marks = vec!["?"; values.len()].join(", ");
                    clauses.push(format!("{expr} IN ({marks})"));
                    for v in &values {
                        params.push(to_sql_value(v));
                    }
                }
                cmp => {
                    let op = match cmp {
                        Cmp::Eq => "=",
                        Cmp::Ne => "!=",
                        Cmp::Gt => ">",
                        Cmp::Gte => ">=",
                        Cmp::Lt => "<",
                        Cmp::Lte => "<=",
                        Cmp::In => unreachable!(),
                    };
                    clauses.push(format!("{expr} {op} ?"));
                    params.push(to_sql_value(&cond.value));
                }
            }
        }

        let clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        Ok((clause, params))
    }
}

/// SQL expression for a document field. Replication-relevant fields live in
/// real columns; everything else goes through `json_extract`.
pub fn field_expr(field: &str) -> Result<String, StoreError> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidField(field.to_string()));
    }
    Ok(match field {
        "id" => "id".to_string(),
        "updatedAt" => "updated_at".to_string(),
        "deleted" => "deleted".to_string(),
        _ => format!("json_extract(body, '$.{field}')"),
    })
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn compiles_column_and_json_fields() {
        let sel = Selector::all()
            .eq("known", json!(true))
            .gte("updatedAt", json!(100));
        let (clause, params) = sel.to_sql().unwrap();
        assert_eq!(
            clause,
            "deleted = 0 AND json_extract(body, '$.known') = ? AND updated_at >= ?"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn empty_in_matches_nothing() {
        let sel = Selector::all().in_values("id", vec![]);
        let (clause, params) = sel.to_sql().unwrap();
        assert!(clause.contains("0 = 1"));
        assert!(params.is_empty());
    }

    #[test]
    fn rejects_injection_fields() {
        assert!(field_expr("a'; DROP TABLE x; --").is_err());
        assert!(field_expr("").is_err());
    }
}

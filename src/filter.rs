use std::fmt;
use std::str::FromStr;

use rusqlite::types::{ToSql, Value as SqlValue};
use serde_json::Value;

use crate::error::CsdmError;
use crate::storage::{Dataset, SwathStore, TABLE_2D, TABLE_3D};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimensionality {
    TwoD,
    ThreeD,
    Any,
}

impl FromStr for Dimensionality {
    type Err = CsdmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "2d" => Ok(Dimensionality::TwoD),
            "3d" => Ok(Dimensionality::ThreeD),
            "" | "any" => Ok(Dimensionality::Any),
            other => Err(CsdmError::InvalidFilter(format!(
                "unknown dimensionality `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "=",
            Operator::Ne => "!=",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Operator {
    type Err = CsdmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::Ne),
            other => Err(CsdmError::InvalidFilter(format!("unknown operator `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldPredicate {
    pub field: String,
    pub dimensionality: Dimensionality,
    pub operator: Operator,
    pub threshold: SqlValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterSpec {
    RawQuery(String),
    FieldPredicates(Vec<FieldPredicate>),
}

impl FilterSpec {
    /// Reads the request form: a query string, `{"sql": "..."}`, or
    /// `{field: [dimensionality, operator, threshold]}` with the dimensionality optional.
    pub fn from_value(value: &Value) -> Result<Self, CsdmError> {
        match value {
            Value::Null => Ok(FilterSpec::FieldPredicates(Vec::new())),
            Value::String(sql) => Ok(FilterSpec::RawQuery(sql.clone())),
            Value::Object(map) => {
                if let Some(sql) = map.get("sql") {
                    let sql = sql.as_str().ok_or_else(|| {
                        CsdmError::InvalidFilter("`sql` must be a string".to_string())
                    })?;
                    return Ok(FilterSpec::RawQuery(sql.to_string()));
                }
                if map.contains_key("python") {
                    return Err(CsdmError::InvalidFilter(
                        "script filters are not supported".to_string(),
                    ));
                }
                map.iter()
                    .map(|(field, criterion)| parse_predicate(field, criterion))
                    .collect::<Result<Vec<_>, _>>()
                    .map(FilterSpec::FieldPredicates)
            }
            other => Err(CsdmError::InvalidFilter(format!(
                "unsupported criteria shape: {other}"
            ))),
        }
    }

    /// Dimensionality shared by every predicate, if there is exactly one.
    pub fn uniform_dimensionality(&self) -> Option<Dimensionality> {
        let FilterSpec::FieldPredicates(predicates) = self else {
            return None;
        };
        let first = predicates.first()?.dimensionality;
        predicates
            .iter()
            .all(|predicate| predicate.dimensionality == first)
            .then_some(first)
    }
}

fn parse_predicate(field: &str, criterion: &Value) -> Result<FieldPredicate, CsdmError> {
    if field.trim().is_empty() {
        return Err(CsdmError::InvalidFilter("empty field name".to_string()));
    }
    let parts = criterion.as_array().ok_or_else(|| {
        CsdmError::InvalidFilter(format!("criterion for `{field}` must be a list"))
    })?;
    let (dimensionality, operator, threshold) = match parts.as_slice() {
        [dimensionality, operator, threshold] => (
            dimensionality
                .as_str()
                .ok_or_else(|| CsdmError::InvalidFilter(format!("bad dimensionality for `{field}`")))?
                .parse()?,
            operator,
            threshold,
        ),
        [operator, threshold] => (Dimensionality::Any, operator, threshold),
        _ => {
            return Err(CsdmError::InvalidFilter(format!(
                "criterion for `{field}` needs an operator and a threshold"
            )));
        }
    };
    let operator = operator
        .as_str()
        .ok_or_else(|| CsdmError::InvalidFilter(format!("bad operator for `{field}`")))?
        .parse()?;
    let threshold = match threshold {
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => SqlValue::Real(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => {
            return Err(CsdmError::InvalidFilter(format!(
                "threshold for `{field}` must be a number or string, got {other}"
            )));
        }
    };
    Ok(FieldPredicate {
        field: field.to_string(),
        dimensionality,
        operator,
        threshold,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanSource {
    Table(&'static str),
    Joined,
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub source: PlanSource,
}

impl QueryPlan {
    pub fn bound(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|param| param as &dyn ToSql).collect()
    }
}

pub fn quote_ident(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_')
        && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if simple {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

pub struct QueryEngine {
    key_columns: Vec<String>,
}

impl QueryEngine {
    pub fn new(key_columns: Vec<String>) -> Self {
        Self { key_columns }
    }

    pub fn plan(
        &self,
        spec: &FilterSpec,
        columns: &[String],
        limit: Option<usize>,
    ) -> Result<QueryPlan, CsdmError> {
        match spec {
            FilterSpec::RawQuery(sql) => {
                let sql = sql.trim().trim_end_matches(';').trim();
                if sql.is_empty() {
                    return Err(CsdmError::InvalidFilter("empty query".to_string()));
                }
                Ok(match limit {
                    Some(rows) => QueryPlan {
                        sql: format!("SELECT * FROM ({sql}) LIMIT ?1"),
                        params: vec![SqlValue::Integer(rows as i64)],
                        source: PlanSource::Raw,
                    },
                    None => QueryPlan {
                        sql: sql.to_string(),
                        params: Vec::new(),
                        source: PlanSource::Raw,
                    },
                })
            }
            FilterSpec::FieldPredicates(predicates) => {
                let source = match spec.uniform_dimensionality() {
                    Some(Dimensionality::TwoD) => PlanSource::Table(TABLE_2D),
                    Some(Dimensionality::ThreeD) => PlanSource::Table(TABLE_3D),
                    _ => PlanSource::Joined,
                };
                let from = match &source {
                    PlanSource::Table(table) => table.to_string(),
                    _ => self.join_clause()?,
                };
                let select = if columns.is_empty() || columns.iter().any(|column| column == "*") {
                    "*".to_string()
                } else {
                    columns
                        .iter()
                        .map(|column| self.column_ref(column, &source))
                        .collect::<Vec<_>>()
                        .join(", ")
                };

                let mut sql = format!("SELECT {select} FROM {from}");
                let mut params = Vec::new();
                let clauses = predicates
                    .iter()
                    .enumerate()
                    .map(|(index, predicate)| {
                        params.push(predicate.threshold.clone());
                        format!(
                            "{} {} ?{}",
                            self.column_ref(&predicate.field, &source),
                            predicate.operator,
                            index + 1
                        )
                    })
                    .collect::<Vec<_>>();
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                if let Some(rows) = limit {
                    params.push(SqlValue::Integer(rows as i64));
                    sql.push_str(&format!(" LIMIT ?{}", params.len()));
                }
                Ok(QueryPlan {
                    sql,
                    params,
                    source,
                })
            }
        }
    }

    /// Key columns exist in both record classes, so a join reads them from the 2D side.
    fn column_ref(&self, column: &str, source: &PlanSource) -> String {
        let is_key = self
            .key_columns
            .iter()
            .any(|key| key.eq_ignore_ascii_case(column));
        if *source == PlanSource::Joined && is_key {
            format!("{TABLE_2D}.{}", quote_ident(column))
        } else {
            quote_ident(column)
        }
    }

    fn join_clause(&self) -> Result<String, CsdmError> {
        if self.key_columns.is_empty() {
            return Err(CsdmError::InvalidFilter(
                "joining record classes requires key columns".to_string(),
            ));
        }
        let on = self
            .key_columns
            .iter()
            .map(|key| {
                let key = quote_ident(key);
                format!("{TABLE_3D}.{key} = {TABLE_2D}.{key}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        Ok(format!("{TABLE_3D} JOIN {TABLE_2D} ON {on}"))
    }

    pub fn filter(
        &self,
        store: &SwathStore,
        spec: &FilterSpec,
        columns: &[String],
    ) -> Result<Dataset, CsdmError> {
        let plan = self.plan(spec, columns, None)?;
        tracing::debug!(sql = %plan.sql, "executing filter");
        store.query(&plan.sql, &plan.bound())
    }

    pub fn preview(
        &self,
        store: &SwathStore,
        spec: &FilterSpec,
        columns: &[String],
        rows: usize,
    ) -> Result<Dataset, CsdmError> {
        let plan = self.plan(spec, columns, Some(rows))?;
        store.query(&plan.sql, &plan.bound())
    }

    /// Irreversibly replaces the filtered table with the filter result.
    ///
    /// `into` is required when the plan does not read a single record class.
    pub fn materialize(
        &self,
        store: &SwathStore,
        spec: &FilterSpec,
        columns: &[String],
        into: Option<&str>,
    ) -> Result<usize, CsdmError> {
        let plan = self.plan(spec, columns, None)?;
        let target = match (into, &plan.source) {
            (Some(table), _) => table,
            (None, PlanSource::Table(table)) => table,
            (None, _) => {
                return Err(CsdmError::InvalidFilter(
                    "materializing a joined or raw query needs an explicit target table"
                        .to_string(),
                ));
            }
        };
        if target != TABLE_2D && target != TABLE_3D {
            return Err(CsdmError::InvalidFilter(format!(
                "cannot materialize into `{target}`"
            )));
        }
        tracing::info!(table = target, sql = %plan.sql, "materializing filter result");
        store.replace_table(target, &plan.sql, &plan.bound())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn engine() -> QueryEngine {
        QueryEngine::new(crate::config::default_key_columns())
    }

    #[test]
    fn three_d_predicate_binds_threshold() {
        let spec = FilterSpec::from_value(&json!({"Height": ["3d", ">=", 1200]})).unwrap();
        let plan = engine().plan(&spec, &["*".to_string()], None).unwrap();
        assert_eq!(plan.sql, "SELECT * FROM footprint_3d WHERE Height >= ?1");
        assert_eq!(plan.params, vec![SqlValue::Integer(1200)]);
        assert_eq!(plan.source, PlanSource::Table(TABLE_3D));
        assert!(!plan.sql.contains("1200"));
    }

    #[test]
    fn mixed_dimensionality_joins_on_keys() {
        let spec = FilterSpec::from_value(&json!({
            "Height": ["3d", ">=", 1200],
            "SurfaceHeightBin": ["2d", "<", 80.5]
        }))
        .unwrap();
        let plan = engine().plan(&spec, &[], None).unwrap();
        assert!(plan.sql.starts_with(
            "SELECT * FROM footprint_3d JOIN footprint_2d ON footprint_3d.Latitude = footprint_2d.Latitude AND"
        ));
        assert!(plan.sql.ends_with("WHERE Height >= ?1 AND SurfaceHeightBin < ?2"));
        assert_eq!(plan.source, PlanSource::Joined);
    }

    #[test]
    fn joined_key_columns_are_qualified() {
        let spec = FilterSpec::FieldPredicates(Vec::new());
        let columns = vec!["Latitude".to_string(), "Height".to_string()];
        let plan = engine().plan(&spec, &columns, None).unwrap();
        assert!(plan.sql.starts_with("SELECT footprint_2d.Latitude, Height FROM footprint_3d JOIN"));
    }

    #[test]
    fn two_element_criterion_means_any_dimensionality() {
        let spec = FilterSpec::from_value(&json!({"Height": ["<=", 0]})).unwrap();
        assert_eq!(spec.uniform_dimensionality(), Some(Dimensionality::Any));
        let plan = engine().plan(&spec, &[], None).unwrap();
        assert_eq!(plan.source, PlanSource::Joined);
    }

    #[test]
    fn raw_query_runs_verbatim_and_bounded_for_preview() {
        let spec = FilterSpec::from_value(&json!({"sql": "SELECT Height FROM footprint_3d;"}))
            .unwrap();
        let full = engine().plan(&spec, &[], None).unwrap();
        assert_eq!(full.sql, "SELECT Height FROM footprint_3d");
        let bounded = engine().plan(&spec, &[], Some(10)).unwrap();
        assert_eq!(bounded.sql, "SELECT * FROM (SELECT Height FROM footprint_3d) LIMIT ?1");
        assert_eq!(bounded.params, vec![SqlValue::Integer(10)]);
    }

    #[test]
    fn field_names_are_quoted_not_interpolated() {
        let spec = FilterSpec::from_value(&json!({"Sigma-Zero": ["2d", ">", 1]})).unwrap();
        let plan = engine()
            .plan(&spec, &["Sigma-Zero".to_string()], Some(5))
            .unwrap();
        assert_eq!(
            plan.sql,
            "SELECT \"Sigma-Zero\" FROM footprint_2d WHERE \"Sigma-Zero\" > ?1 LIMIT ?2"
        );
    }

    #[test]
    fn invalid_criteria_are_rejected() {
        assert_matches!(
            FilterSpec::from_value(&json!({"Height": ["4d", ">", 1]})),
            Err(CsdmError::InvalidFilter(_))
        );
        assert_matches!(
            FilterSpec::from_value(&json!({"Height": ["3d", "LIKE", 1]})),
            Err(CsdmError::InvalidFilter(_))
        );
        assert_matches!(
            FilterSpec::from_value(&json!({"python": "print(1)"})),
            Err(CsdmError::InvalidFilter(_))
        );
    }

    #[test]
    fn materializing_a_join_needs_a_target() {
        let temp = tempfile::tempdir().unwrap();
        let store = SwathStore::new(&temp.path().join("store.sqlite3"));
        let spec = FilterSpec::FieldPredicates(Vec::new());
        assert_matches!(
            engine().materialize(&store, &spec, &[], None),
            Err(CsdmError::InvalidFilter(_))
        );
    }
}

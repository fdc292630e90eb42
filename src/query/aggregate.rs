use std::collections::HashMap;

use crate::core::{AttributeKind, Result, StackError, Value};
use crate::query::Predicate;

/// Aggregate functions supported by the property-query facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Sum,
    Average,
    StdDev,
    Count,
    Min,
    Max,
    Median,
}

impl AggregateFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Average => "average",
            Self::StdDev => "stddev",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
        }
    }

    /// Kind of the computed column given the kind of its input attribute.
    pub fn result_kind(&self, input: AttributeKind) -> AttributeKind {
        match self {
            Self::Count => AttributeKind::Integer,
            Self::Average | Self::StdDev | Self::Median => AttributeKind::Float,
            Self::Sum | Self::Min | Self::Max => input,
        }
    }

    /// Apply to a column of values. NULLs are skipped; an all-NULL or empty
    /// column yields NULL (except `Count`, which yields zero).
    pub fn apply(&self, values: &[Value]) -> Result<Value> {
        let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
        if let Self::Count = self {
            return Ok(Value::Integer(present.len() as i64));
        }
        if present.is_empty() {
            return Ok(Value::Null);
        }
        match self {
            Self::Sum => {
                if present.iter().all(|v| matches!(v, Value::Integer(_))) {
                    let mut total = 0i64;
                    for v in &present {
                        if let Some(n) = v.as_i64() {
                            total += n;
                        }
                    }
                    Ok(Value::Integer(total))
                } else {
                    Ok(Value::Float(numeric_column(&present)?.iter().sum()))
                }
            }
            Self::Average => {
                let column = numeric_column(&present)?;
                Ok(Value::Float(column.iter().sum::<f64>() / column.len() as f64))
            }
            Self::StdDev => {
                let column = numeric_column(&present)?;
                let mean = column.iter().sum::<f64>() / column.len() as f64;
                let variance = column
                    .iter()
                    .map(|x| {
                        let d = x - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / column.len() as f64;
                Ok(Value::Float(variance.sqrt()))
            }
            Self::Median => {
                let mut column = numeric_column(&present)?;
                column.sort_by(|a, b| a.total_cmp(b));
                let mid = column.len() / 2;
                let median = if column.len() % 2 == 1 {
                    column[mid]
                } else {
                    (column[mid - 1] + column[mid]) / 2.0
                };
                Ok(Value::Float(median))
            }
            Self::Min => {
                let mut best = present[0];
                for v in &present[1..] {
                    if v.compare(best)? == std::cmp::Ordering::Less {
                        best = v;
                    }
                }
                Ok((*best).clone())
            }
            Self::Max => {
                let mut best = present[0];
                for v in &present[1..] {
                    if v.compare(best)? == std::cmp::Ordering::Greater {
                        best = v;
                    }
                }
                Ok((*best).clone())
            }
            Self::Count => unreachable!(),
        }
    }
}

fn numeric_column(values: &[&Value]) -> Result<Vec<f64>> {
    values
        .iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                StackError::TypeMismatch(format!(
                    "aggregate input must be numeric, found {}",
                    v.type_name()
                ))
            })
        })
        .collect()
}

/// One output column of a property query: either a raw attribute or an
/// aggregate over a key path.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectTarget {
    Key(String),
    Aggregate {
        function: AggregateFunction,
        key_path: String,
        alias: Option<String>,
    },
}

impl SelectTarget {
    pub fn key(name: impl Into<String>) -> Self {
        Self::Key(name.into())
    }

    pub fn aggregate(function: AggregateFunction, key_path: impl Into<String>) -> Self {
        Self::Aggregate {
            function,
            key_path: key_path.into(),
            alias: None,
        }
    }

    pub fn aliased(
        function: AggregateFunction,
        key_path: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self::Aggregate {
            function,
            key_path: key_path.into(),
            alias: Some(alias.into()),
        }
    }

    /// Column name in the result rows.
    pub fn column_name(&self) -> String {
        match self {
            Self::Key(name) => name.clone(),
            Self::Aggregate {
                function,
                key_path,
                alias,
            } => alias
                .clone()
                .unwrap_or_else(|| format!("{}_{}", function.name(), key_path.replace('.', "_"))),
        }
    }
}

/// Dictionary-result query: grouped aggregates over an entity's rows.
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub select: Vec<SelectTarget>,
    pub group_by: Vec<String>,
    pub having: Option<Predicate>,
}

impl AggregateQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            select: Vec::new(),
            group_by: Vec::new(),
            having: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn select(mut self, target: SelectTarget) -> Self {
        self.select.push(target);
        self
    }

    pub fn group_by(mut self, key: impl Into<String>) -> Self {
        self.group_by.push(key.into());
        self
    }

    /// Filter applied to grouped rows, evaluated against the output columns.
    pub fn having(mut self, predicate: Predicate) -> Self {
        self.having = Some(predicate);
        self
    }
}

/// One row of an aggregate result, keyed by column name.
pub type AggregateRow = HashMap<String, Value>;

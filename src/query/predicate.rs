use std::cmp::Ordering;

use crate::core::{ObjectData, Result, StackError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Right-hand side of a comparison: a constant, or another key on the same
/// object (key-to-key comparison).
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Key(String),
}

/// Predicate tree consumed by the fetch layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        key: String,
        op: CompareOp,
        operand: Operand,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Eq, value)
    }

    pub fn ne(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Ne, value)
    }

    pub fn lt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Lt, value)
    }

    pub fn le(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Le, value)
    }

    pub fn gt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Gt, value)
    }

    pub fn ge(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Ge, value)
    }

    pub fn compare(key: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            key: key.into(),
            op,
            operand: Operand::Value(value.into()),
        }
    }

    /// Compare two keys of the same object, e.g. `shipped == ordered`.
    pub fn key_eq(key: impl Into<String>, other: impl Into<String>) -> Self {
        Self::Compare {
            key: key.into(),
            op: CompareOp::Eq,
            operand: Operand::Key(other.into()),
        }
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Self::And(predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Self::Or(predicates)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    /// Evaluate against one object's data. Missing attributes read as NULL.
    /// Ordered comparisons involving NULL never match; equality against NULL
    /// matches unset attributes.
    pub fn evaluate(&self, data: &ObjectData) -> Result<bool> {
        match self {
            Self::Compare { key, op, operand } => {
                let lhs = data.get(key).cloned().unwrap_or(Value::Null);
                let rhs = match operand {
                    Operand::Value(v) => v.clone(),
                    Operand::Key(other) => data.get(other).cloned().unwrap_or(Value::Null),
                };
                evaluate_compare(&lhs, *op, &rhs)
            }
            Self::And(children) => {
                for child in children {
                    if !child.evaluate(data)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or(children) => {
                for child in children {
                    if child.evaluate(data)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(child) => Ok(!child.evaluate(data)?),
        }
    }

    /// Flatten an AND-of-equalities into `(key, operand)` pairs.
    ///
    /// This is the inverse mapping `fetch_or_create` relies on to seed a new
    /// instance from its predicate, and it is only unambiguous for
    /// conjunctions of equality comparisons; every other shape is rejected.
    pub fn equality_pairs(&self) -> Result<Vec<(String, Operand)>> {
        match self {
            Self::Compare {
                key,
                op: CompareOp::Eq,
                operand,
            } => Ok(vec![(key.clone(), operand.clone())]),
            Self::Compare { op, .. } => Err(StackError::UnsupportedPredicateShape(format!(
                "only equality comparisons can seed a new instance, found {:?}",
                op
            ))),
            Self::And(children) => {
                let mut pairs = Vec::with_capacity(children.len());
                for child in children {
                    pairs.extend(child.equality_pairs()?);
                }
                Ok(pairs)
            }
            Self::Or(_) => Err(StackError::UnsupportedPredicateShape(
                "OR branches cannot seed a new instance".into(),
            )),
            Self::Not(_) => Err(StackError::UnsupportedPredicateShape(
                "negations cannot seed a new instance".into(),
            )),
        }
    }
}

fn evaluate_compare(lhs: &Value, op: CompareOp, rhs: &Value) -> Result<bool> {
    match op {
        CompareOp::Eq => Ok(lhs == rhs),
        CompareOp::Ne => Ok(lhs != rhs),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            if lhs.is_null() || rhs.is_null() {
                return Ok(false);
            }
            let ordering = lhs.compare(rhs)?;
            Ok(match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
                _ => unreachable!(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, age: i64) -> ObjectData {
        let mut data = ObjectData::new();
        data.insert("name".into(), name.into());
        data.insert("age".into(), age.into());
        data
    }

    #[test]
    fn test_equality_and_range() {
        let data = row("a", 3);
        assert!(Predicate::eq("name", "a").evaluate(&data).unwrap());
        assert!(Predicate::gt("age", 2i64).evaluate(&data).unwrap());
        assert!(!Predicate::ge("age", 4i64).evaluate(&data).unwrap());
    }

    #[test]
    fn test_missing_attribute_reads_null() {
        let data = row("a", 3);
        assert!(Predicate::eq("nickname", Value::Null).evaluate(&data).unwrap());
        // Ordered comparison against an unset attribute never matches.
        assert!(!Predicate::gt("nickname", 0i64).evaluate(&data).unwrap());
    }

    #[test]
    fn test_and_or_not() {
        let data = row("a", 3);
        let p = Predicate::and(vec![Predicate::eq("name", "a"), Predicate::lt("age", 10i64)]);
        assert!(p.evaluate(&data).unwrap());
        let q = Predicate::or(vec![Predicate::eq("name", "z"), Predicate::eq("age", 3i64)]);
        assert!(q.evaluate(&data).unwrap());
        assert!(!Predicate::not(q).evaluate(&data).unwrap());
    }

    #[test]
    fn test_key_to_key() {
        let mut data = ObjectData::new();
        data.insert("a".into(), 5i64.into());
        data.insert("b".into(), 5i64.into());
        assert!(Predicate::key_eq("a", "b").evaluate(&data).unwrap());
    }

    #[test]
    fn test_equality_pairs_general_conjunction() {
        let p = Predicate::and(vec![
            Predicate::eq("name", "x"),
            Predicate::and(vec![Predicate::eq("age", 5i64), Predicate::eq("active", true)]),
        ]);
        let pairs = p.equality_pairs().unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0, "name");
        assert_eq!(pairs[2].0, "active");
    }

    #[test]
    fn test_equality_pairs_rejects_other_shapes() {
        assert!(Predicate::gt("age", 1i64).equality_pairs().is_err());
        assert!(
            Predicate::or(vec![Predicate::eq("a", 1i64), Predicate::eq("b", 2i64)])
                .equality_pairs()
                .is_err()
        );
        let mixed = Predicate::and(vec![Predicate::eq("a", 1i64), Predicate::ne("b", 2i64)]);
        assert!(matches!(
            mixed.equality_pairs().unwrap_err(),
            StackError::UnsupportedPredicateShape(_)
        ));
    }
}

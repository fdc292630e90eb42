use std::cmp::Ordering;

use crate::core::{ObjectData, Result, Value};

/// One level of a multi-key sort. Descriptors earlier in the list win;
/// later ones only break ties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }

    fn compare(&self, a: &ObjectData, b: &ObjectData) -> Result<Ordering> {
        let left = a.get(&self.key).unwrap_or(&Value::Null);
        let right = b.get(&self.key).unwrap_or(&Value::Null);
        let ordering = left.compare(right)?;
        Ok(if self.ascending {
            ordering
        } else {
            ordering.reverse()
        })
    }
}

/// Sort rows in place by a descriptor chain. `sort_by` cannot carry a
/// `Result` out of the comparator, so type errors are parked in a cell and
/// surfaced after the sort finishes.
pub fn sort_rows<T>(
    rows: &mut [T],
    descriptors: &[SortDescriptor],
    data_of: impl Fn(&T) -> &ObjectData,
) -> Result<()> {
    if descriptors.is_empty() {
        return Ok(());
    }
    let mut failure: Option<crate::core::StackError> = None;
    rows.sort_by(|a, b| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        for descriptor in descriptors {
            match descriptor.compare(data_of(a), data_of(b)) {
                Ok(Ordering::Equal) => continue,
                Ok(other) => return other,
                Err(err) => {
                    failure = Some(err);
                    return Ordering::Equal;
                }
            }
        }
        Ordering::Equal
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

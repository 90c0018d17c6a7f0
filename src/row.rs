//! Rows, fields and column selections.
//!
//! A [`Row`] is a fixed-arity sequence of typed [`Field`] slots. Stages
//! address columns through a [`Selection`]: an ordered list of 1-based slot
//! indices, or a boolean mask over all slots. Selections are validated when
//! a pipeline is composed, so operators can project without re-checking
//! bounds on every row.

use std::fmt;
use std::hash::{Hash, Hasher};

use anyhow::{Result, bail};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// A single column value.
///
/// Numeric fields compare and hash through [`OrderedFloat`], so rows with
/// `f64` key columns can be grouped in hash tables like any other key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Field {
    Str(String),
    Num(f64),
    Int(i64),
    Bool(bool),
}

impl Field {
    /// Numeric view of the field; integer fields widen to `f64`.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Field::Num(x) => Some(*x),
            Field::Int(x) => Some(*x as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Field::Str(a), Field::Str(b)) => a == b,
            (Field::Num(a), Field::Num(b)) => OrderedFloat(*a) == OrderedFloat(*b),
            (Field::Int(a), Field::Int(b)) => a == b,
            (Field::Bool(a), Field::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Field {}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Field::Str(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Field::Num(x) => {
                1u8.hash(state);
                OrderedFloat(*x).hash(state);
            }
            Field::Int(x) => {
                2u8.hash(state);
                x.hash(state);
            }
            Field::Bool(x) => {
                3u8.hash(state);
                x.hash(state);
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Str(s) => write!(f, "{s}"),
            Field::Num(x) => write!(f, "{x}"),
            Field::Int(x) => write!(f, "{x}"),
            Field::Bool(x) => write!(f, "{x}"),
        }
    }
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        Field::Str(s.to_string())
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self {
        Field::Str(s)
    }
}

impl From<f64> for Field {
    fn from(x: f64) -> Self {
        Field::Num(x)
    }
}

impl From<i64> for Field {
    fn from(x: i64) -> Self {
        Field::Int(x)
    }
}

impl From<bool> for Field {
    fn from(x: bool) -> Self {
        Field::Bool(x)
    }
}

/// A row of column values.
pub type Row = Vec<Field>;

/// Render a row the way sinks write it: whitespace-separated columns.
pub fn format_row(row: &[Field]) -> String {
    let mut s = String::new();
    for (i, f) in row.iter().enumerate() {
        if i > 0 {
            s.push(' ');
        }
        s.push_str(&f.to_string());
    }
    s
}

/// An ordered choice of columns out of a row.
///
/// Internally a selection is a list of 1-based indices. The empty selection
/// is valid and projects every row to the empty subrow, which hashes and
/// compares equal to itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    cols: Vec<usize>,
}

impl Selection {
    /// Selection from explicit 1-based indices.
    pub fn cols(cols: impl Into<Vec<usize>>) -> Self {
        Self { cols: cols.into() }
    }

    /// The empty selection (no columns).
    pub fn empty() -> Self {
        Self { cols: Vec::new() }
    }

    /// Identity selection over `arity` columns.
    pub fn identity(arity: usize) -> Self {
        Self {
            cols: (1..=arity).collect(),
        }
    }

    /// Build a selection from raw values, detecting the mask form.
    ///
    /// If every value is 0 or 1 and there are exactly `arity` of them, the
    /// values are a boolean mask over all slots; otherwise they are 1-based
    /// indices.
    pub fn from_spec(vals: &[usize], arity: usize) -> Self {
        let is_mask = vals.len() == arity && !vals.is_empty() && vals.iter().all(|&v| v <= 1);
        if is_mask {
            Self {
                cols: vals
                    .iter()
                    .enumerate()
                    .filter(|&(_, &v)| v == 1)
                    .map(|(i, _)| i + 1)
                    .collect(),
            }
        } else {
            Self {
                cols: vals.to_vec(),
            }
        }
    }

    /// Complement: all columns of `arity` not selected, in index order.
    pub fn complement(&self, arity: usize) -> Self {
        Self {
            cols: (1..=arity).filter(|i| !self.cols.contains(i)).collect(),
        }
    }

    /// Number of selected columns.
    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// The selected 1-based indices.
    pub fn indices(&self) -> &[usize] {
        &self.cols
    }

    /// A selection is sane for an arity iff all indices are in bounds and
    /// none repeats.
    pub fn check(&self, arity: usize) -> Result<()> {
        for (i, &c) in self.cols.iter().enumerate() {
            if c == 0 || c > arity {
                bail!("column index {c} out of bounds for rows of {arity} column(s)");
            }
            if self.cols[..i].contains(&c) {
                bail!("column index {c} selected more than once");
            }
        }
        Ok(())
    }

    /// Project a row to the selected subrow.
    pub fn project(&self, row: &[Field]) -> Row {
        self.cols.iter().map(|&c| row[c - 1].clone()).collect()
    }

    /// Project by reference, avoiding clones for read-only uses.
    pub fn project_ref<'a>(&self, row: &'a [Field]) -> Vec<&'a Field> {
        self.cols.iter().map(|&c| &row[c - 1]).collect()
    }
}

/// Concatenate two rows.
pub fn concat(a: &[Field], b: &[Field]) -> Row {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

/// Hash a projected subrow (given by reference) to a bucket value.
pub fn hash_key(fields: &[&Field]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut h = DefaultHasher::new();
    for f in fields {
        f.hash(&mut h);
    }
    h.finish()
}

/// Hash an owned subrow.
pub fn hash_row(fields: &[Field]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut h = DefaultHasher::new();
    for f in fields {
        f.hash(&mut h);
    }
    h.finish()
}

/// Shorthand for building a row out of anything convertible to fields.
#[macro_export]
macro_rules! row {
    ($($x:expr),* $(,)?) => {
        vec![$($crate::row::Field::from($x)),*]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_detection() {
        // length == arity and all 0/1 reads as a mask
        let s = Selection::from_spec(&[1, 0, 1], 3);
        assert_eq!(s.indices(), &[1, 3]);
        // otherwise plain indices
        let s = Selection::from_spec(&[1, 3], 3);
        assert_eq!(s.indices(), &[1, 3]);
        let s = Selection::from_spec(&[2], 3);
        assert_eq!(s.indices(), &[2]);
    }

    #[test]
    fn sanity() {
        assert!(Selection::cols(vec![1, 2]).check(2).is_ok());
        assert!(Selection::cols(vec![3]).check(2).is_err());
        assert!(Selection::cols(vec![1, 1]).check(2).is_err());
        assert!(Selection::empty().check(0).is_ok());
    }

    #[test]
    fn empty_selection_projects_empty() {
        let r = row!["a", 1.5];
        let s = Selection::empty();
        assert!(s.project(&r).is_empty());
        assert_eq!(hash_row(&s.project(&r)), hash_row(&[]));
    }

    #[test]
    fn num_fields_group() {
        use std::collections::HashMap;
        let mut m: HashMap<Row, usize> = HashMap::new();
        *m.entry(row![1.0]).or_default() += 1;
        *m.entry(row![1.0]).or_default() += 1;
        *m.entry(row![2.0]).or_default() += 1;
        assert_eq!(m.len(), 2);
        assert_eq!(m[&row![1.0]], 2);
    }
}

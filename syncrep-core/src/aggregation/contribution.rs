// syncrep-core/src/aggregation/contribution.rs

//! Per-parameter deltas and round-tagged contributions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::parameters::ParameterLayout;

/// Row updates for a sparse parameter.
///
/// Row indices are unique within one delta and kept in the order given.
/// Deserialization goes through [`SparseDelta::new`] and so rejects
/// repeated rows too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SparseDeltaRepr")]
pub struct SparseDelta {
    rows: Vec<(usize, Vec<f32>)>,
}

#[derive(Deserialize)]
struct SparseDeltaRepr {
    rows: Vec<(usize, Vec<f32>)>,
}

impl TryFrom<SparseDeltaRepr> for SparseDelta {
    type Error = RuntimeError;

    fn try_from(repr: SparseDeltaRepr) -> Result<Self> {
        Self::new(repr.rows)
    }
}

impl SparseDelta {
    /// Creates a sparse delta, rejecting repeated row indices.
    pub fn new(rows: Vec<(usize, Vec<f32>)>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for (index, _) in &rows {
            if !seen.insert(*index) {
                return Err(RuntimeError::parameter(
                    "<sparse>",
                    format!("row {} appears more than once in one delta", index),
                ));
            }
        }
        Ok(Self { rows })
    }

    // Callers guarantee the indices are already unique.
    pub(crate) fn from_sorted_unique(rows: Vec<(usize, Vec<f32>)>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[(usize, Vec<f32>)] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<(usize, Vec<f32>)> {
        self.rows
    }
}

/// An update to one parameter: dense or sparse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    Dense(Vec<f32>),
    Sparse(SparseDelta),
}

impl Delta {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    /// Tags this delta with the round it was computed against.
    pub fn tag(self, round: u64) -> Contribution {
        Contribution { round, delta: self }
    }

    /// Multiplies every element by `factor`.
    #[must_use]
    pub fn scaled(self, factor: f32) -> Self {
        match self {
            Self::Dense(mut values) => {
                values.iter_mut().for_each(|v| *v *= factor);
                Self::Dense(values)
            }
            Self::Sparse(delta) => {
                let rows = delta
                    .into_rows()
                    .into_iter()
                    .map(|(index, mut row)| {
                        row.iter_mut().for_each(|v| *v *= factor);
                        (index, row)
                    })
                    .collect();
                Self::Sparse(SparseDelta { rows })
            }
        }
    }

    /// Checks that this delta can be applied to a parameter with `layout`.
    pub fn check_layout(&self, name: &str, layout: ParameterLayout) -> Result<()> {
        match (self, layout) {
            (Self::Dense(values), ParameterLayout::Dense { len }) => {
                if values.len() != len {
                    return Err(RuntimeError::parameter(
                        name,
                        format!("dense delta has {} elements, expected {}", values.len(), len),
                    ));
                }
            }
            (Self::Sparse(delta), ParameterLayout::Sparse { num_rows, row_width }) => {
                for (index, row) in delta.rows() {
                    if *index >= num_rows {
                        return Err(RuntimeError::parameter(
                            name,
                            format!("row {} out of range ({} rows)", index, num_rows),
                        ));
                    }
                    if row.len() != row_width {
                        return Err(RuntimeError::parameter(
                            name,
                            format!(
                                "row {} has width {}, expected {}",
                                index,
                                row.len(),
                                row_width
                            ),
                        ));
                    }
                }
            }
            (Self::Dense(_), ParameterLayout::Sparse { .. }) => {
                return Err(RuntimeError::parameter(name, "dense delta for a sparse parameter"));
            }
            (Self::Sparse(_), ParameterLayout::Dense { .. }) => {
                return Err(RuntimeError::parameter(name, "sparse delta for a dense parameter"));
            }
        }
        Ok(())
    }
}

/// A delta tagged with the round of the token its replica consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub round: u64,
    pub delta: Delta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_rejects_duplicate_rows() {
        let result = SparseDelta::new(vec![(1, vec![0.1]), (1, vec![0.2])]);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_rejects_duplicate_rows() {
        let ok: SparseDelta = toml::from_str("rows = [[0, [0.5]], [2, [0.25]]]").unwrap();
        assert_eq!(ok.len(), 2);

        let repeated: std::result::Result<SparseDelta, _> =
            toml::from_str("rows = [[1, [0.5]], [1, [0.25]]]");
        assert!(repeated.is_err());
    }

    #[test]
    fn test_check_layout() {
        let dense = ParameterLayout::Dense { len: 2 };
        let sparse = ParameterLayout::Sparse { num_rows: 2, row_width: 1 };

        assert!(Delta::Dense(vec![1.0, 2.0]).check_layout("w", dense).is_ok());
        assert!(Delta::Dense(vec![1.0]).check_layout("w", dense).is_err());
        assert!(Delta::Dense(vec![1.0]).check_layout("w", sparse).is_err());

        let row1 = Delta::Sparse(SparseDelta::new(vec![(1, vec![0.5])]).unwrap());
        assert!(row1.check_layout("emb", sparse).is_ok());
        assert!(row1.check_layout("emb", dense).is_err());

        let out_of_range = Delta::Sparse(SparseDelta::new(vec![(2, vec![0.5])]).unwrap());
        let err = out_of_range.check_layout("emb", sparse).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let too_wide = Delta::Sparse(SparseDelta::new(vec![(0, vec![0.5, 0.5])]).unwrap());
        assert!(too_wide.check_layout("emb", sparse).is_err());
    }

    #[test]
    fn test_scaled() {
        let dense = Delta::Dense(vec![1.0, -2.0]).scaled(-0.5);
        assert_eq!(dense, Delta::Dense(vec![-0.5, 1.0]));

        let sparse = Delta::Sparse(SparseDelta::new(vec![(3, vec![2.0])]).unwrap()).scaled(2.0);
        match sparse {
            Delta::Sparse(d) => assert_eq!(d.rows(), &[(3, vec![4.0])]),
            Delta::Dense(_) => panic!("expected sparse delta"),
        }
    }

    #[test]
    fn test_tag() {
        let contribution = Delta::Dense(vec![0.1]).tag(7);
        assert_eq!(contribution.round, 7);
        assert!(!contribution.delta.is_sparse());
    }
}

// syncrep-core/src/parameters/set.rs

//! Named shared parameters and their layouts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregation::Delta;
use crate::error::{Result, RuntimeError};

/// A dense, row-major tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseTensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl DenseTensor {
    /// Creates a tensor, checking that `values` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(RuntimeError::parameter(
                "<dense>",
                format!(
                    "shape {:?} holds {} elements, got {}",
                    shape,
                    expected,
                    values.len()
                ),
            ));
        }
        Ok(Self { shape, values })
    }

    /// A rank-0 tensor holding one value.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            values: vec![value],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// A table of equally wide rows, updated row by row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseTable {
    row_width: usize,
    rows: Vec<Vec<f32>>,
}

impl SparseTable {
    /// Creates a table; every row must have the same width.
    pub fn new(rows: Vec<Vec<f32>>) -> Result<Self> {
        let row_width = rows.first().map(Vec::len).unwrap_or(0);
        if let Some((index, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != row_width) {
            return Err(RuntimeError::parameter(
                "<sparse>",
                format!(
                    "row {} has width {}, expected {}",
                    index,
                    row.len(),
                    row_width
                ),
            ));
        }
        Ok(Self { row_width, rows })
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }
}

/// Shape information an accumulator needs to validate deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterLayout {
    Dense { len: usize },
    Sparse { num_rows: usize, row_width: usize },
}

impl ParameterLayout {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse { .. })
    }
}

/// One shared value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Parameter {
    Dense(DenseTensor),
    Sparse(SparseTable),
}

impl Parameter {
    pub fn layout(&self) -> ParameterLayout {
        match self {
            Self::Dense(t) => ParameterLayout::Dense { len: t.values.len() },
            Self::Sparse(t) => ParameterLayout::Sparse {
                num_rows: t.rows.len(),
                row_width: t.row_width,
            },
        }
    }

    /// Returns the dense values, if this is a dense parameter.
    pub fn as_dense(&self) -> Option<&DenseTensor> {
        match self {
            Self::Dense(t) => Some(t),
            Self::Sparse(_) => None,
        }
    }

    /// Returns the sparse table, if this is a sparse parameter.
    pub fn as_sparse(&self) -> Option<&SparseTable> {
        match self {
            Self::Sparse(t) => Some(t),
            Self::Dense(_) => None,
        }
    }

    /// Adds `delta` in place. The delta must match this parameter's layout.
    fn add(&mut self, name: &str, delta: &Delta) -> Result<()> {
        delta.check_layout(name, self.layout())?;
        match (self, delta) {
            (Self::Dense(t), Delta::Dense(d)) => {
                for (v, dv) in t.values.iter_mut().zip(d) {
                    *v += dv;
                }
            }
            (Self::Sparse(t), Delta::Sparse(d)) => {
                for (index, row_delta) in d.rows() {
                    for (v, dv) in t.rows[*index].iter_mut().zip(row_delta) {
                        *v += dv;
                    }
                }
            }
            _ => return Err(RuntimeError::parameter(name, "mismatched delta kind")),
        }
        Ok(())
    }
}

/// The full set of named parameters shared by every replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    params: BTreeMap<String, Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, param: Parameter) -> Self {
        self.insert(name, param);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, param: Parameter) -> Option<Parameter> {
        self.params.insert(name.into(), param)
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    /// Layout of every parameter, keyed by name.
    pub fn layouts(&self) -> BTreeMap<String, ParameterLayout> {
        self.params
            .iter()
            .map(|(name, p)| (name.clone(), p.layout()))
            .collect()
    }

    /// Returns a copy of this set with every delta added.
    ///
    /// Either every delta applies or an error is returned and `self` is
    /// untouched.
    pub fn with_deltas(&self, deltas: &BTreeMap<String, Delta>) -> Result<Self> {
        let mut next = self.clone();
        for (name, delta) in deltas {
            let param = next
                .params
                .get_mut(name)
                .ok_or_else(|| RuntimeError::parameter(name.as_str(), "not present in parameter set"))?;
            param.add(name, delta)?;
        }
        Ok(next)
    }
}

use std::slice::ChunksExact;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// A batch of points, stored row major with one row per point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    dim: usize,
    data: Vec<f64>,
}

impl Batch {
    pub fn zeros(len: usize, dim: usize) -> Self {
        assert!(dim > 0, "points need at least one coordinate");
        Self {
            dim,
            data: vec![0f64; len * dim],
        }
    }

    pub fn from_vec(dim: usize, data: Vec<f64>) -> Result<Self> {
        if dim == 0 {
            return Err(FlowError::InvalidSettings(
                "points need at least one coordinate".into(),
            ));
        }
        if data.len() % dim != 0 {
            return Err(FlowError::Shape {
                what: "batch data",
                expected: data.len() - data.len() % dim,
                found: data.len(),
            });
        }
        Ok(Self { dim, data })
    }

    pub fn from_rows<R: AsRef<[f64]>>(dim: usize, rows: impl IntoIterator<Item = R>) -> Result<Self> {
        let mut data = vec![];
        for row in rows {
            let row = row.as_ref();
            if row.len() != dim {
                return Err(FlowError::Shape {
                    what: "batch row",
                    expected: dim,
                    found: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::from_vec(dim, data)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    pub fn rows(&self) -> ChunksExact<'_, f64> {
        self.data.chunks_exact(self.dim)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// True if every coordinate lies in `[0, 1)`.
    pub fn in_unit_cube(&self) -> bool {
        self.data.iter().all(|x| (0f64..1f64).contains(x))
    }

    pub(crate) fn check_dim(&self, dim: usize) -> Result<()> {
        if self.dim != dim {
            return Err(FlowError::Shape {
                what: "point dimension",
                expected: dim,
                found: self.dim,
            });
        }
        Ok(())
    }
}

use ndarray::Array2;

use super::Dim;
use super::error::CscError;

/// Compressed Sparse Column matrix with a real and an imaginary value plane.
/// - column pointers are the indices of the start and end of each column
/// - row indices are the indices of the rows of the structural non zeros
/// - `values` / `imag` share the same pattern; `imag` is only written by AC stamps
#[derive(Debug, Clone, PartialEq)]
pub struct CscMatrix {
    pub dim: Dim,
    /// Column pointers, len = ncols + 1
    pub column_pointers: Vec<usize>,
    /// Row indices, len = nnz
    pub row_indices: Vec<usize>,
    /// Real parts, len = nnz
    pub values: Vec<f64>,
    /// Imaginary parts, len = nnz
    pub imag: Vec<f64>,
}

impl CscMatrix {
    /// number of structural non zero values
    pub fn nnz(&self) -> usize {
        self.row_indices.len()
    }

    pub fn check_invariants(&self) -> Result<(), CscError> {
        if self.column_pointers.len() != self.dim.ncols + 1 {
            return Err(CscError::InvalidColumnPointersLength {
                expected: self.dim.ncols + 1,
                actual: self.column_pointers.len(),
            });
        }
        let first = self.column_pointers.first().copied().unwrap_or(1);
        if first != 0 {
            return Err(CscError::InvalidColumnPointers {
                index: 0,
                expected: 0,
                actual: first,
            });
        }
        let last = self.column_pointers.last().copied().unwrap_or(0);
        if last != self.nnz() {
            return Err(CscError::InvalidColumnPointers {
                index: self.dim.ncols,
                expected: self.nnz(),
                actual: last,
            });
        }
        if self.row_indices.len() != self.values.len() || self.values.len() != self.imag.len() {
            return Err(CscError::PlaneLengthMismatch {
                values: self.values.len().min(self.imag.len()),
                pattern: self.row_indices.len(),
            });
        }
        // per-column sorted & in-range
        for j in 0..self.dim.ncols {
            let (start, end) = (self.column_pointers[j], self.column_pointers[j + 1]);
            if start > end || end > self.nnz() {
                return Err(CscError::InvalidColumnPointers {
                    index: j,
                    expected: start,
                    actual: end,
                });
            }
            let mut prev = None;
            for &r in &self.row_indices[start..end] {
                if r >= self.dim.nrows {
                    return Err(CscError::OutOfBoundsIndex {
                        index: r,
                        max: self.dim.nrows,
                    });
                }
                if let Some(p) = prev
                    && r <= p
                {
                    return Err(CscError::UnsortedColumn {
                        column: j,
                        previous: p,
                        row: r,
                    });
                }
                prev = Some(r);
            }
        }
        Ok(())
    }

    /// Position of `(row, col)` in the value arrays, if it is part of the pattern.
    pub fn find(&self, row: usize, col: usize) -> Option<usize> {
        if col >= self.dim.ncols {
            return None;
        }
        let (start, end) = (self.column_pointers[col], self.column_pointers[col + 1]);
        self.row_indices[start..end]
            .binary_search(&row)
            .ok()
            .map(|offset| start + offset)
    }

    /// (row, col) of every structural entry, column-major.
    pub fn pattern(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.nnz());
        for j in 0..self.dim.ncols {
            let (start, end) = (self.column_pointers[j], self.column_pointers[j + 1]);
            out.extend(self.row_indices[start..end].iter().map(|&r| (r, j)));
        }
        out
    }

    pub fn clear(&mut self) {
        self.values.fill(0.0);
        self.imag.fill(0.0);
    }

    /// Expand the real and imaginary planes into dense matrices.
    pub fn to_dense(&self) -> (Array2<f64>, Array2<f64>) {
        let mut re = Array2::<f64>::zeros((self.dim.nrows, self.dim.ncols));
        let mut im = Array2::<f64>::zeros((self.dim.nrows, self.dim.ncols));
        for j in 0..self.dim.ncols {
            for p in self.column_pointers[j]..self.column_pointers[j + 1] {
                let i = self.row_indices[p];
                re[[i, j]] = self.values[p];
                im[[i, j]] = self.imag[p];
            }
        }
        (re, im)
    }
}

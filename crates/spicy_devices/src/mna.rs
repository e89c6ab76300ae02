use ndarray::{Array1, Array2};
use num_complex::Complex64;

use crate::config::MatrixLayout;
use crate::error::{DeviceError, DeviceResult};
use crate::sparse::builder::{EntryMapping, MatrixBuilder};
use crate::sparse::csc::CscMatrix;

/// A write location in the MNA matrix, acquired once at setup.
///
/// The meaning of the index depends on the layout:
/// - **Sparse**: position in the CSC value arrays (nnz index), resolved through the
///   pattern builder's `EntryMapping`.
/// - **Dense**: row-major linear index `row * dim + col`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixEntry(pub(crate) usize);

/// Collects the cells devices will write before the system exists.
pub enum PatternBuilder {
    Sparse(MatrixBuilder),
    Dense { dim: usize },
}

/// Maps the temporary indices handed out by [`PatternBuilder::acquire`] to final entries.
pub enum EntryResolver {
    Sparse(EntryMapping),
    Identity,
}

impl EntryResolver {
    pub fn resolve(&self, temp: usize) -> MatrixEntry {
        match self {
            Self::Sparse(mapping) => MatrixEntry(mapping.get(temp)),
            Self::Identity => MatrixEntry(temp),
        }
    }
}

impl PatternBuilder {
    pub fn new(dim: usize, layout: MatrixLayout) -> Self {
        match layout {
            MatrixLayout::Sparse => Self::Sparse(MatrixBuilder::new(dim, dim)),
            MatrixLayout::Dense => Self::Dense { dim },
        }
    }

    /// Reserve `(row, col)` and return a temporary index for it.
    pub fn acquire(&mut self, row: usize, col: usize) -> DeviceResult<usize> {
        match self {
            Self::Sparse(builder) => Ok(builder.push(col, row)?),
            Self::Dense { dim } => {
                if row >= *dim || col >= *dim {
                    return Err(DeviceError::MissingPatternEntry { row, col });
                }
                Ok(row * *dim + col)
            }
        }
    }

    pub fn build(self) -> DeviceResult<(MnaSystem, EntryResolver)> {
        match self {
            Self::Sparse(builder) => {
                let dim = builder.dim().nrows;
                let (matrix, mapping) = builder.build_csc_pattern()?;
                Ok((
                    MnaSystem::Sparse(SparseMna::new(matrix, dim)),
                    EntryResolver::Sparse(mapping),
                ))
            }
            Self::Dense { dim } => Ok((
                MnaSystem::Dense(DenseMna::new(dim)),
                EntryResolver::Identity,
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SparseMna {
    matrix: CscMatrix,
    rhs: Vec<f64>,
    rhs_imag: Vec<f64>,
    touched: Option<Vec<bool>>,
}

impl SparseMna {
    fn new(matrix: CscMatrix, dim: usize) -> Self {
        Self {
            matrix,
            rhs: vec![0.0; dim],
            rhs_imag: vec![0.0; dim],
            touched: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DenseMna {
    dim: usize,
    // Modified nodal analysis matrix
    // [G, B]
    // [C, D]
    m: Array2<f64>,
    m_imag: Array2<f64>,
    s: Array1<f64>,
    s_imag: Array1<f64>,
    touched: Option<Vec<bool>>,
}

impl DenseMna {
    fn new(dim: usize) -> Self {
        Self {
            dim,
            m: Array2::<f64>::zeros((dim, dim)),
            m_imag: Array2::<f64>::zeros((dim, dim)),
            s: Array1::<f64>::zeros(dim),
            s_imag: Array1::<f64>::zeros(dim),
            touched: None,
        }
    }
}

/// The global MNA system shared by every instance during one analysis run.
///
/// Devices only ever add into it through entries they acquired at setup.
#[derive(Debug, Clone)]
pub enum MnaSystem {
    Sparse(SparseMna),
    Dense(DenseMna),
}

impl MnaSystem {
    pub fn dim(&self) -> usize {
        match self {
            Self::Sparse(mna) => mna.rhs.len(),
            Self::Dense(mna) => mna.dim,
        }
    }

    fn touch(touched: &mut Option<Vec<bool>>, index: usize) {
        if let Some(touched) = touched {
            touched[index] = true;
        }
    }

    pub fn entry_mut(&mut self, entry: MatrixEntry) -> &mut f64 {
        match self {
            Self::Sparse(mna) => {
                Self::touch(&mut mna.touched, entry.0);
                &mut mna.matrix.values[entry.0]
            }
            Self::Dense(mna) => {
                Self::touch(&mut mna.touched, entry.0);
                &mut mna.m[[entry.0 / mna.dim, entry.0 % mna.dim]]
            }
        }
    }

    pub fn entry_imag_mut(&mut self, entry: MatrixEntry) -> &mut f64 {
        match self {
            Self::Sparse(mna) => {
                Self::touch(&mut mna.touched, entry.0);
                &mut mna.matrix.imag[entry.0]
            }
            Self::Dense(mna) => {
                Self::touch(&mut mna.touched, entry.0);
                &mut mna.m_imag[[entry.0 / mna.dim, entry.0 % mna.dim]]
            }
        }
    }

    pub fn rhs_mut(&mut self, row: usize) -> &mut f64 {
        match self {
            Self::Sparse(mna) => &mut mna.rhs[row],
            Self::Dense(mna) => &mut mna.s[row],
        }
    }

    pub fn rhs_imag_mut(&mut self, row: usize) -> &mut f64 {
        match self {
            Self::Sparse(mna) => &mut mna.rhs_imag[row],
            Self::Dense(mna) => &mut mna.s_imag[row],
        }
    }

    pub fn rhs(&self) -> Vec<f64> {
        match self {
            Self::Sparse(mna) => mna.rhs.clone(),
            Self::Dense(mna) => mna.s.to_vec(),
        }
    }

    pub fn rhs_imag(&self) -> Vec<f64> {
        match self {
            Self::Sparse(mna) => mna.rhs_imag.clone(),
            Self::Dense(mna) => mna.s_imag.to_vec(),
        }
    }

    /// Value at `(row, col)`; zero for cells outside the pattern.
    pub fn get(&self, row: usize, col: usize) -> Complex64 {
        match self {
            Self::Sparse(mna) => mna
                .matrix
                .find(row, col)
                .map(|p| Complex64::new(mna.matrix.values[p], mna.matrix.imag[p]))
                .unwrap_or_default(),
            Self::Dense(mna) => {
                if row >= mna.dim || col >= mna.dim {
                    return Complex64::default();
                }
                Complex64::new(mna.m[[row, col]], mna.m_imag[[row, col]])
            }
        }
    }

    /// Zero matrix and RHS values; the pattern and bound entries stay valid.
    pub fn clear(&mut self) {
        match self {
            Self::Sparse(mna) => {
                mna.matrix.clear();
                mna.rhs.fill(0.0);
                mna.rhs_imag.fill(0.0);
            }
            Self::Dense(mna) => {
                mna.m.fill(0.0);
                mna.m_imag.fill(0.0);
                mna.s.fill(0.0);
                mna.s_imag.fill(0.0);
            }
        }
    }

    /// A system with the same pattern and every value zeroed.
    pub fn zeroed_like(&self) -> Self {
        let mut copy = self.clone();
        copy.clear();
        match &mut copy {
            Self::Sparse(mna) => mna.touched = None,
            Self::Dense(mna) => mna.touched = None,
        }
        copy
    }

    /// Start recording which cells are written (resets any previous record).
    pub fn record_touches(&mut self) {
        match self {
            Self::Sparse(mna) => mna.touched = Some(vec![false; mna.matrix.nnz()]),
            Self::Dense(mna) => mna.touched = Some(vec![false; mna.dim * mna.dim]),
        }
    }

    /// Sorted `(row, col)` cells written since [`record_touches`](Self::record_touches).
    pub fn touched_cells(&self) -> Vec<(usize, usize)> {
        let mut cells: Vec<(usize, usize)> = match self {
            Self::Sparse(mna) => {
                let Some(touched) = &mna.touched else {
                    return Vec::new();
                };
                // pattern() is in value-array order
                mna.matrix
                    .pattern()
                    .into_iter()
                    .zip(touched)
                    .filter(|(_, t)| **t)
                    .map(|(cell, _)| cell)
                    .collect()
            }
            Self::Dense(mna) => {
                let Some(touched) = &mna.touched else {
                    return Vec::new();
                };
                touched
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| **t)
                    .map(|(i, _)| (i / mna.dim, i % mna.dim))
                    .collect()
            }
        };
        cells.sort_unstable();
        cells
    }

    /// Dense copies of the real and imaginary matrix planes.
    pub fn to_dense(&self) -> (Array2<f64>, Array2<f64>) {
        match self {
            Self::Sparse(mna) => mna.matrix.to_dense(),
            Self::Dense(mna) => (mna.m.clone(), mna.m_imag.clone()),
        }
    }

    /// Structural entries as `(row, col)`; for the dense layout every cell.
    pub fn pattern(&self) -> Vec<(usize, usize)> {
        match self {
            Self::Sparse(mna) => mna.matrix.pattern(),
            Self::Dense(mna) => (0..mna.dim * mna.dim)
                .map(|i| (i / mna.dim, i % mna.dim))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sparse(MatrixLayout::Sparse)]
    #[case::dense(MatrixLayout::Dense)]
    fn acquired_entries_write_through(#[case] layout: MatrixLayout) {
        let mut builder = PatternBuilder::new(2, layout);
        let a = builder.acquire(0, 0).unwrap();
        let b = builder.acquire(0, 1).unwrap();
        let c = builder.acquire(0, 0).unwrap();
        let (mut mna, resolver) = builder.build().unwrap();

        *mna.entry_mut(resolver.resolve(a)) += 1.5;
        *mna.entry_mut(resolver.resolve(c)) += 1.5;
        *mna.entry_imag_mut(resolver.resolve(b)) -= 2.0;
        *mna.rhs_mut(1) += 4.0;

        assert_eq!(mna.get(0, 0), Complex64::new(3.0, 0.0));
        assert_eq!(mna.get(0, 1), Complex64::new(0.0, -2.0));
        assert_eq!(mna.get(1, 1), Complex64::new(0.0, 0.0));
        assert_eq!(mna.rhs(), vec![0.0, 4.0]);

        mna.clear();
        assert_eq!(mna.get(0, 0), Complex64::new(0.0, 0.0));
        assert_eq!(mna.rhs(), vec![0.0, 0.0]);
    }

    #[rstest]
    #[case::sparse(MatrixLayout::Sparse)]
    #[case::dense(MatrixLayout::Dense)]
    fn touched_cells_are_recorded(#[case] layout: MatrixLayout) {
        let mut builder = PatternBuilder::new(3, layout);
        let a = builder.acquire(2, 1).unwrap();
        let b = builder.acquire(0, 2).unwrap();
        let (mut mna, resolver) = builder.build().unwrap();

        assert!(mna.touched_cells().is_empty());
        mna.record_touches();
        *mna.entry_mut(resolver.resolve(a)) += 0.0;
        *mna.entry_imag_mut(resolver.resolve(b)) += 1.0;
        assert_eq!(mna.touched_cells(), vec![(0, 2), (2, 1)]);
    }

    #[test]
    fn dense_rejects_out_of_range() {
        let mut builder = PatternBuilder::new(2, MatrixLayout::Dense);
        assert_eq!(
            builder.acquire(2, 0),
            Err(DeviceError::MissingPatternEntry { row: 2, col: 0 })
        );
    }
}

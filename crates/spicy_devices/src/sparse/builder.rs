use super::Dim;
use super::csc::CscMatrix;
use super::error::CscError;

/// Maps the entry index returned by [`MatrixBuilder::push`] to its final position in
/// the CSC value arrays.
#[derive(Debug, Clone)]
pub struct EntryMapping(Vec<usize>);

impl EntryMapping {
    pub fn get(&self, index: usize) -> usize {
        self.0[index]
    }
}

/// Collects `(column, row)` coordinates at setup and compresses them into a
/// canonical CSC pattern.
///
/// Duplicate coordinates share one structural entry, so two devices touching the same
/// cell end up writing into the same value slot.
#[derive(Debug)]
pub struct MatrixBuilder {
    dim: Dim,
    /// `(column, row)` in push order; the position is the entry index.
    coords: Vec<(usize, usize)>,
}

impl MatrixBuilder {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            dim: Dim { nrows, ncols },
            coords: Vec::new(),
        }
    }

    pub fn dim(&self) -> Dim {
        self.dim
    }

    /// Records a coordinate and returns its entry index.
    pub fn push(&mut self, column: usize, row: usize) -> Result<usize, CscError> {
        for (index, max) in [(column, self.dim.ncols), (row, self.dim.nrows)] {
            if index >= max {
                return Err(CscError::OutOfBoundsIndex { index, max });
            }
        }
        self.coords.push((column, row));
        Ok(self.coords.len() - 1)
    }

    pub fn build_csc_pattern(self) -> Result<(CscMatrix, EntryMapping), CscError> {
        let mut order: Vec<usize> = (0..self.coords.len()).collect();
        order.sort_by_key(|&entry| self.coords[entry]);

        let mut column_pointers = vec![0usize; self.dim.ncols + 1];
        let mut row_indices = Vec::with_capacity(order.len());
        let mut mapping = vec![0usize; order.len()];
        let mut previous = None;
        for entry in order {
            let (column, row) = self.coords[entry];
            if previous != Some((column, row)) {
                column_pointers[column + 1] += 1;
                row_indices.push(row);
                previous = Some((column, row));
            }
            mapping[entry] = row_indices.len() - 1;
        }
        for j in 0..self.dim.ncols {
            column_pointers[j + 1] += column_pointers[j];
        }

        let nnz = row_indices.len();
        let a = CscMatrix {
            dim: self.dim,
            column_pointers,
            row_indices,
            values: vec![0.0; nnz],
            imag: vec![0.0; nnz],
        };
        a.check_invariants()?;
        Ok((a, EntryMapping(mapping)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_share_one_entry() {
        // pattern of
        // [ x . x
        //   . x .
        //   x . x ] with (2,2) pushed twice
        let mut b = MatrixBuilder::new(3, 3);
        let e00 = b.push(0, 0).unwrap();
        let e20 = b.push(2, 0).unwrap();
        let e11 = b.push(1, 1).unwrap();
        let e02 = b.push(0, 2).unwrap();
        let e22 = b.push(2, 2).unwrap();
        let e22_again = b.push(2, 2).unwrap();

        let (a, mapping) = b.build_csc_pattern().unwrap();
        assert_eq!(a.nnz(), 5);
        assert_eq!(a.column_pointers, vec![0, 2, 3, 5]);
        assert_eq!(a.row_indices, vec![0, 2, 1, 0, 2]);
        assert_eq!(mapping.get(e22), mapping.get(e22_again));
        assert_eq!(a.find(0, 0), Some(mapping.get(e00)));
        assert_eq!(a.find(0, 2), Some(mapping.get(e20)));
        assert_eq!(a.find(1, 1), Some(mapping.get(e11)));
        assert_eq!(a.find(2, 0), Some(mapping.get(e02)));
        assert_eq!(a.find(1, 0), None);
    }

    #[test]
    fn empty_pattern_is_valid() {
        let (a, _) = MatrixBuilder::new(2, 2).build_csc_pattern().unwrap();
        assert_eq!(a.nnz(), 0);
        assert_eq!(a.column_pointers, vec![0, 0, 0]);
    }

    #[test]
    fn push_out_of_bounds() {
        let mut b = MatrixBuilder::new(2, 2);
        assert_eq!(
            b.push(2, 0),
            Err(CscError::OutOfBoundsIndex { index: 2, max: 2 })
        );
    }
}

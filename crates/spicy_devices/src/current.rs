//! Per-instance record of "current out of node X" as a linear combination of node
//! voltages minus a bias term.
//!
//! Every stamp a device writes into the global MNA system is also written here, so a
//! terminal current can be read back after the solve without re-evaluating the device:
//!
//! ```text
//! i(row) = Σ cell(row, col) · V[col] − rhs(row)
//! ```
//!
//! Rows, the cells inside a row, and the RHS list are kept sorted by index. Ground
//! (index 0) is never materialized: reads and writes to it go to a scratch cell.
use num_complex::Complex64;

use crate::nodes::NodeIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CurrentCell {
    pub real: f64,
    pub imag: f64,
}

impl CurrentCell {
    fn clear(&mut self) {
        self.real = 0.0;
        self.imag = 0.0;
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    col: usize,
    cell: CurrentCell,
}

#[derive(Debug, Clone, PartialEq)]
struct Row {
    index: usize,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq)]
struct Bias {
    row: usize,
    cell: CurrentCell,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentMatrix {
    rows: Vec<Row>,
    rhs: Vec<Bias>,
    ground: CurrentCell,
}

fn voltage_at(voltages: &[f64], index: usize) -> f64 {
    voltages.get(index).copied().unwrap_or(0.0)
}

impl CurrentMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write-through access to `(row, col)`, created in sort position if absent.
    pub fn cell_mut(&mut self, row: NodeIndex, col: NodeIndex) -> &mut CurrentCell {
        if row.is_ground() || col.is_ground() {
            self.ground.clear();
            return &mut self.ground;
        }

        let r = match self.rows.binary_search_by_key(&row.0, |r| r.index) {
            Ok(r) => r,
            Err(r) => {
                self.rows.insert(
                    r,
                    Row {
                        index: row.0,
                        entries: Vec::new(),
                    },
                );
                r
            }
        };

        let entries = &mut self.rows[r].entries;
        let c = match entries.binary_search_by_key(&col.0, |e| e.col) {
            Ok(c) => c,
            Err(c) => {
                entries.insert(
                    c,
                    Entry {
                        col: col.0,
                        cell: CurrentCell::default(),
                    },
                );
                c
            }
        };
        &mut entries[c].cell
    }

    /// Write-through access to the bias term of `row`.
    pub fn rhs_mut(&mut self, row: NodeIndex) -> &mut CurrentCell {
        if row.is_ground() {
            self.ground.clear();
            return &mut self.ground;
        }
        let b = match self.rhs.binary_search_by_key(&row.0, |b| b.row) {
            Ok(b) => b,
            Err(b) => {
                self.rhs.insert(
                    b,
                    Bias {
                        row: row.0,
                        cell: CurrentCell::default(),
                    },
                );
                b
            }
        };
        &mut self.rhs[b].cell
    }

    /// Zero every value, keeping the structure for the next stamp pass.
    pub fn clear(&mut self) {
        for row in &mut self.rows {
            for entry in &mut row.entries {
                entry.cell.clear();
            }
        }
        for bias in &mut self.rhs {
            bias.cell.clear();
        }
        self.ground.clear();
    }

    fn row(&self, row: NodeIndex) -> Option<&Row> {
        self.rows
            .binary_search_by_key(&row.0, |r| r.index)
            .ok()
            .map(|r| &self.rows[r])
    }

    pub fn get(&self, row: NodeIndex, col: NodeIndex) -> Option<CurrentCell> {
        let row = self.row(row)?;
        row.entries
            .binary_search_by_key(&col.0, |e| e.col)
            .ok()
            .map(|c| row.entries[c].cell)
    }

    pub fn rhs(&self, row: NodeIndex) -> Option<CurrentCell> {
        self.rhs
            .binary_search_by_key(&row.0, |b| b.row)
            .ok()
            .map(|b| self.rhs[b].cell)
    }

    /// Current leaving `row` into the device for the real solution `voltages`
    /// (indexed by node, slot 0 is ground).
    ///
    /// A row that holds only a bias term, such as the terminal of an independent
    /// current source, still evaluates to `-rhs`. The result is zero only when
    /// neither the row nor its bias was ever stamped.
    pub fn evaluate_real(&self, row: NodeIndex, voltages: &[f64]) -> f64 {
        let sum: f64 = self
            .row(row)
            .map(|r| {
                r.entries
                    .iter()
                    .map(|e| e.cell.real * voltage_at(voltages, e.col))
                    .sum::<f64>()
            })
            .unwrap_or(0.0);
        sum - self.rhs(row).map(|b| b.real).unwrap_or(0.0)
    }

    /// Complex counterpart of [`evaluate_real`](Self::evaluate_real) for an AC solution,
    /// with the same treatment of bias-only rows.
    pub fn evaluate_complex(&self, row: NodeIndex, real: &[f64], imag: &[f64]) -> Complex64 {
        let sum = self.row(row).map_or(Complex64::new(0.0, 0.0), |r| {
            r.entries.iter().fold(Complex64::new(0.0, 0.0), |acc, e| {
                let v = Complex64::new(voltage_at(real, e.col), voltage_at(imag, e.col));
                acc + Complex64::new(e.cell.real, e.cell.imag) * v
            })
        });
        let bias = self
            .rhs(row)
            .map(|b| Complex64::new(b.real, b.imag))
            .unwrap_or_default();
        sum - bias
    }

    /// Every materialized `(row, col)` pair in row-major order.
    pub fn occupied(&self) -> Vec<(NodeIndex, NodeIndex)> {
        self.rows
            .iter()
            .flat_map(|r| {
                r.entries
                    .iter()
                    .map(move |e| (NodeIndex(r.index), NodeIndex(e.col)))
            })
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rhs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn n(i: usize) -> NodeIndex {
        NodeIndex(i)
    }

    fn stamp_conductance(m: &mut CurrentMatrix, a: usize, b: usize, g: f64) {
        m.cell_mut(n(a), n(a)).real += g;
        m.cell_mut(n(a), n(b)).real -= g;
        m.cell_mut(n(b), n(a)).real -= g;
        m.cell_mut(n(b), n(b)).real += g;
    }

    #[test]
    fn two_terminal_conductance() {
        let mut m = CurrentMatrix::new();
        stamp_conductance(&mut m, 1, 2, 2.0);

        assert_eq!(m.get(n(1), n(1)).unwrap().real, 2.0);
        assert_eq!(m.get(n(1), n(2)).unwrap().real, -2.0);
        assert_eq!(m.get(n(2), n(1)).unwrap().real, -2.0);
        assert_eq!(m.get(n(2), n(2)).unwrap().real, 2.0);

        // slot 0 is ground
        let v = [0.0, 3.0, 1.0];
        assert_eq!(m.evaluate_real(n(1), &v), 4.0);
        assert_eq!(m.evaluate_real(n(2), &v), -4.0);
    }

    #[test]
    fn bias_term_is_subtracted() {
        let mut m = CurrentMatrix::new();
        m.cell_mut(n(1), n(1)).real += 0.5;
        m.rhs_mut(n(1)).real -= 1e-3;
        assert!((m.evaluate_real(n(1), &[0.0, 2.0]) - 1.001).abs() < 1e-15);
    }

    #[test]
    fn clear_zeroes_without_dropping_structure() {
        let mut m = CurrentMatrix::new();
        stamp_conductance(&mut m, 1, 3, 5.0);
        m.rhs_mut(n(3)).real += 2.0;
        let before = m.occupied();

        m.clear();

        assert_eq!(m.occupied(), before);
        for row in 0..5 {
            assert_eq!(m.evaluate_real(n(row), &[1.0, 7.0, -3.0, 11.0, 2.0]), 0.0);
        }
        assert_eq!(m.rhs(n(3)), Some(CurrentCell::default()));
    }

    #[test]
    fn repeated_stamps_accumulate() {
        let mut once = CurrentMatrix::new();
        let mut twice = CurrentMatrix::new();
        let g = 0.1;
        stamp_conductance(&mut once, 1, 2, 2.0 * g);
        stamp_conductance(&mut twice, 1, 2, g);
        stamp_conductance(&mut twice, 1, 2, g);

        let v = [0.0, 1.25, -0.5];
        assert_eq!(once.occupied(), twice.occupied());
        assert_eq!(once.evaluate_real(n(1), &v), twice.evaluate_real(n(1), &v));
    }

    #[test]
    fn ground_is_absorbed() {
        let mut m = CurrentMatrix::new();
        m.cell_mut(n(0), n(2)).real += 9.0;
        m.cell_mut(n(2), n(0)).real += 9.0;
        m.rhs_mut(n(0)).real += 9.0;
        assert!(m.is_empty());

        m.cell_mut(n(2), n(2)).real += 1.0;
        m.cell_mut(n(2), n(0)).real -= 1.0;
        assert_eq!(m.occupied(), vec![(n(2), n(2))]);
        assert_eq!(m.evaluate_real(n(2), &[0.0, 0.0, 3.0]), 3.0);
        assert_eq!(m.evaluate_real(n(0), &[0.0, 0.0, 3.0]), 0.0);
    }

    #[test]
    fn rows_and_columns_stay_sorted() {
        let mut m = CurrentMatrix::new();
        for (r, c) in [(4, 2), (1, 9), (4, 1), (2, 2), (4, 7), (1, 3)] {
            m.cell_mut(n(r), n(c)).real += 1.0;
        }
        let occupied = m.occupied();
        let mut sorted = occupied.clone();
        sorted.sort();
        assert_eq!(occupied, sorted);
        assert_eq!(m.row_count(), 3);
    }

    #[rstest]
    #[case::forward(&[0, 1, 2, 3, 4])]
    #[case::reverse(&[4, 3, 2, 1, 0])]
    #[case::interleaved(&[2, 0, 4, 1, 3])]
    #[case::scrambled(&[3, 1, 0, 4, 2])]
    fn topology_does_not_depend_on_stamp_order(#[case] order: &[usize]) {
        let triples = [
            (1, 1, 0.5),
            (3, 1, -0.25),
            (1, 3, -0.25),
            (1, 1, 1.5),
            (2, 3, 4.0),
        ];

        let mut reference = CurrentMatrix::new();
        for &(r, c, v) in &triples {
            reference.cell_mut(n(r), n(c)).real += v;
        }

        let mut permuted = CurrentMatrix::new();
        for &i in order {
            let (r, c, v) = triples[i];
            permuted.cell_mut(n(r), n(c)).real += v;
        }

        assert_eq!(permuted.occupied(), reference.occupied());
        for (r, c) in reference.occupied() {
            let a = reference.get(r, c).unwrap().real;
            let b = permuted.get(r, c).unwrap().real;
            assert!((a - b).abs() <= 4.0 * f64::EPSILON * a.abs().max(1.0));
        }
    }

    #[test]
    fn bias_only_row() {
        let mut m = CurrentMatrix::new();
        m.rhs_mut(n(2)).real -= 1e-3;
        assert_eq!(m.evaluate_real(n(2), &[0.0, 5.0, 5.0]), 1e-3);
        assert_eq!(m.row_count(), 0);
    }

    #[test]
    fn complex_evaluation() {
        // admittance g + jB between node 1 and ground
        let mut m = CurrentMatrix::new();
        let cell = m.cell_mut(n(1), n(1));
        cell.real += 2.0;
        cell.imag += 3.0;

        // (2 + 3j)(1 + 1j) = -1 + 5j
        let i = m.evaluate_complex(n(1), &[0.0, 1.0], &[0.0, 1.0]);
        assert_eq!(i, Complex64::new(-1.0, 5.0));
        assert_eq!(
            m.evaluate_complex(n(5), &[0.0, 1.0], &[0.0, 1.0]),
            Complex64::new(0.0, 0.0)
        );
    }

    #[test]
    fn absent_row_reads_zero() {
        let m = CurrentMatrix::new();
        assert_eq!(m.evaluate_real(n(3), &[1.0; 4]), 0.0);
        assert_eq!(m.get(n(3), n(3)), None);
    }
}

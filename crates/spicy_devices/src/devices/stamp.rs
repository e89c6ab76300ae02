//! Cached MNA write locations of one instance and the writer every stamp goes through.
use num_complex::Complex64;

use super::adjoint::AdjointMirror;
use crate::current::CurrentMatrix;
use crate::error::{DeviceError, DeviceResult};
use crate::mna::{EntryResolver, MatrixEntry, MnaSystem, PatternBuilder};
use crate::nodes::{NodeIndex, NodeMapping};

/// Matrix cells an instance writes, acquired once at setup.
///
/// Cells are addressed by *local* node positions (index into the node list the
/// device returned from setup). Cells touching ground keep a slot but no entry.
#[derive(Debug, Clone, Default)]
pub struct StampSlots {
    nodes: Vec<NodeIndex>,
    cells: Vec<(usize, usize)>,
    /// local `(row, col)` → slot, row-major over `nodes.len()²`
    lookup: Vec<Option<usize>>,
    /// MNA row of each local node
    rows: Vec<Option<usize>>,
    temp: Vec<Option<usize>>,
    entries: Vec<Option<MatrixEntry>>,
    bound: bool,
}

impl StampSlots {
    pub fn new(nodes: Vec<NodeIndex>, topology: &[(usize, usize)]) -> Self {
        let n = nodes.len();
        let mut lookup = vec![None; n * n];
        let mut cells = Vec::with_capacity(topology.len());
        for &(row, col) in topology {
            let at = row * n + col;
            if row < n && col < n && lookup[at].is_none() {
                lookup[at] = Some(cells.len());
                cells.push((row, col));
            }
        }
        Self {
            nodes,
            cells,
            lookup,
            ..Self::default()
        }
    }

    pub fn nodes(&self) -> &[NodeIndex] {
        &self.nodes
    }

    pub fn node(&self, local: usize) -> NodeIndex {
        self.nodes.get(local).copied().unwrap_or(NodeIndex::GROUND)
    }

    /// Local `(row, col)` pairs in slot order.
    pub fn cells(&self) -> &[(usize, usize)] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn slot(&self, row: usize, col: usize) -> Option<usize> {
        let n = self.nodes.len();
        if row >= n || col >= n {
            return None;
        }
        self.lookup[row * n + col]
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn entry(&self, slot: usize) -> Option<MatrixEntry> {
        self.entries.get(slot).copied().flatten()
    }

    /// MNA row of local node `local`, `None` for ground.
    pub fn row(&self, local: usize) -> Option<usize> {
        self.rows.get(local).copied().flatten()
    }

    /// Reserve every non-ground cell in the pattern under construction.
    pub fn bind(&mut self, nodes: &NodeMapping, builder: &mut PatternBuilder) -> DeviceResult<()> {
        self.rows = self
            .nodes
            .iter()
            .map(|&node| nodes.mna_index(node))
            .collect::<DeviceResult<_>>()?;
        self.temp = self
            .cells
            .iter()
            .map(|&(r, c)| match (self.rows[r], self.rows[c]) {
                (Some(row), Some(col)) => builder.acquire(row, col).map(Some),
                _ => Ok(None),
            })
            .collect::<DeviceResult<_>>()?;
        Ok(())
    }

    /// Map the temporary indices from [`bind`](Self::bind) to final entries.
    pub fn finalize(&mut self, resolver: &EntryResolver) {
        self.entries = self
            .temp
            .drain(..)
            .map(|temp| temp.map(|t| resolver.resolve(t)))
            .collect();
        self.bound = true;
    }
}

/// Writes one stamp to the global system, the instance's current matrix and, when
/// enabled, its adjoint mirror.
pub struct Stamper<'a> {
    instance: &'a str,
    slots: &'a StampSlots,
    mna: &'a mut MnaSystem,
    current: &'a mut CurrentMatrix,
    adjoint: Option<&'a mut AdjointMirror>,
}

impl<'a> Stamper<'a> {
    pub fn new(
        instance: &'a str,
        slots: &'a StampSlots,
        mna: &'a mut MnaSystem,
        current: &'a mut CurrentMatrix,
        adjoint: Option<&'a mut AdjointMirror>,
    ) -> Self {
        Self {
            instance,
            slots,
            mna,
            current,
            adjoint,
        }
    }

    fn slot(&self, row: usize, col: usize) -> DeviceResult<usize> {
        self.slots
            .slot(row, col)
            .ok_or_else(|| DeviceError::UnboundSlot {
                instance: self.instance.to_string(),
                row: self.slots.node(row).get(),
                col: self.slots.node(col).get(),
            })
    }

    /// Add `value` to the real part of local cell `(row, col)`.
    pub fn add(&mut self, row: usize, col: usize, value: f64) -> DeviceResult<()> {
        self.add_complex(row, col, Complex64::new(value, 0.0))
    }

    pub fn add_complex(&mut self, row: usize, col: usize, value: Complex64) -> DeviceResult<()> {
        let slot = self.slot(row, col)?;
        if let Some(entry) = self.slots.entry(slot) {
            *self.mna.entry_mut(entry) += value.re;
            if value.im != 0.0 {
                *self.mna.entry_imag_mut(entry) += value.im;
            }
        }
        let cell = self
            .current
            .cell_mut(self.slots.node(row), self.slots.node(col));
        cell.real += value.re;
        cell.imag += value.im;
        if let Some(adjoint) = self.adjoint.as_deref_mut() {
            adjoint.add(slot, value);
        }
        Ok(())
    }

    pub fn add_rhs(&mut self, local: usize, value: f64) {
        self.add_rhs_complex(local, Complex64::new(value, 0.0));
    }

    pub fn add_rhs_complex(&mut self, local: usize, value: Complex64) {
        if let Some(row) = self.slots.row(local) {
            *self.mna.rhs_mut(row) += value.re;
            if value.im != 0.0 {
                *self.mna.rhs_imag_mut(row) += value.im;
            }
        }
        let cell = self.current.rhs_mut(self.slots.node(local));
        cell.real += value.re;
        cell.imag += value.im;
        if let Some(adjoint) = self.adjoint.as_deref_mut() {
            adjoint.add_rhs(local, value);
        }
    }

    /// Conductance `g` between local nodes `a` and `b`.
    pub fn conductance(&mut self, a: usize, b: usize, g: f64) -> DeviceResult<()> {
        self.admittance(a, b, Complex64::new(g, 0.0))
    }

    pub fn admittance(&mut self, a: usize, b: usize, y: Complex64) -> DeviceResult<()> {
        self.add_complex(a, a, y)?;
        self.add_complex(b, b, y)?;
        self.add_complex(a, b, -y)?;
        self.add_complex(b, a, -y)
    }

    /// Current `gm * (V(cp) - V(cn))` flowing from `op` through the device to `on`.
    pub fn transconductance(
        &mut self,
        op: usize,
        on: usize,
        cp: usize,
        cn: usize,
        gm: f64,
    ) -> DeviceResult<()> {
        self.add(op, cp, gm)?;
        self.add(op, cn, -gm)?;
        self.add(on, cp, -gm)?;
        self.add(on, cn, gm)
    }

    /// Constant current `i` flowing from `a` through the device to `b`.
    pub fn current(&mut self, a: usize, b: usize, i: f64) {
        self.add_rhs(a, -i);
        self.add_rhs(b, i);
    }
}

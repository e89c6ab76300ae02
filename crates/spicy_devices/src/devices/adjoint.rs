use num_complex::Complex64;

use super::stamp::StampSlots;
use crate::mna::MnaSystem;

/// Per-instance copy of the most recent stamp, one value per bound slot and one
/// per local RHS node.
///
/// Cleared at the start of every stamp pass, so it always holds exactly the last
/// pass written to the primary system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjointMirror {
    values: Vec<Complex64>,
    rhs: Vec<Complex64>,
}

impl AdjointMirror {
    pub fn new(slots: usize, nodes: usize) -> Self {
        Self {
            values: vec![Complex64::default(); slots],
            rhs: vec![Complex64::default(); nodes],
        }
    }

    pub fn for_slots(slots: &StampSlots) -> Self {
        Self::new(slots.len(), slots.nodes().len())
    }

    pub fn clear(&mut self) {
        self.values.fill(Complex64::default());
        self.rhs.fill(Complex64::default());
    }

    pub fn add(&mut self, slot: usize, value: Complex64) {
        if let Some(v) = self.values.get_mut(slot) {
            *v += value;
        }
    }

    pub fn add_rhs(&mut self, local: usize, value: Complex64) {
        if let Some(v) = self.rhs.get_mut(local) {
            *v += value;
        }
    }

    pub fn value(&self, slot: usize) -> Complex64 {
        self.values.get(slot).copied().unwrap_or_default()
    }

    pub fn rhs(&self, local: usize) -> Complex64 {
        self.rhs.get(local).copied().unwrap_or_default()
    }

    /// Add the mirrored values into `mna` through the instance's bound entries.
    pub fn scatter(&self, slots: &StampSlots, mna: &mut MnaSystem) {
        for (slot, value) in self.values.iter().enumerate() {
            if let Some(entry) = slots.entry(slot) {
                *mna.entry_mut(entry) += value.re;
                *mna.entry_imag_mut(entry) += value.im;
            }
        }
        for (local, value) in self.rhs.iter().enumerate() {
            if let Some(row) = slots.row(local) {
                *mna.rhs_mut(row) += value.re;
                *mna.rhs_imag_mut(row) += value.im;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_keeps_size() {
        let mut mirror = AdjointMirror::new(3, 2);
        mirror.add(2, Complex64::new(1.0, -1.0));
        mirror.add_rhs(0, Complex64::new(4.0, 0.0));
        mirror.clear();
        assert_eq!(mirror, AdjointMirror::new(3, 2));
    }

    #[test]
    fn out_of_range_writes_are_ignored() {
        let mut mirror = AdjointMirror::new(1, 1);
        mirror.add(5, Complex64::new(1.0, 0.0));
        mirror.add_rhs(5, Complex64::new(1.0, 0.0));
        assert_eq!(mirror, AdjointMirror::new(1, 1));
        assert_eq!(mirror.value(5), Complex64::default());
    }
}

use num_complex::Complex64;

use super::model::{Device, DeviceKind, QueryValue};
use super::stamp::Stamper;
use crate::error::{DeviceError, DeviceResult};
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{AnalysisMode, CircuitState, StateHistory, StateSlot};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InductorModel {
    /// Inductance used by instances that do not give one (H).
    pub inductance: Option<f64>,
}

/// Inductor with its own branch-current unknown.
///
/// Local nodes: `[p, n, branch]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Inductor {
    pub positive: NodeIndex,
    pub negative: NodeIndex,
    pub inductance: Option<f64>,
    /// Initial current; re-derived from the operating point unless given through
    /// [`with_ic`](Self::with_ic).
    pub ic: Option<f64>,
    ic_given: bool,
    branch: NodeIndex,
    value: f64,
    flux: StateSlot,
}

impl Inductor {
    pub fn new(positive: NodeIndex, negative: NodeIndex, inductance: f64) -> Self {
        Self {
            positive,
            negative,
            inductance: Some(inductance),
            ic: None,
            ic_given: false,
            branch: NodeIndex::GROUND,
            value: inductance,
            flux: StateSlot(0),
        }
    }

    pub fn with_ic(mut self, ic: f64) -> Self {
        self.ic = Some(ic);
        self.ic_given = true;
        self
    }

    pub fn branch(&self) -> NodeIndex {
        self.branch
    }

    fn stamp_incidence(stamp: &mut Stamper<'_>) -> DeviceResult<()> {
        stamp.add(0, 2, 1.0)?;
        stamp.add(1, 2, -1.0)?;
        stamp.add(2, 0, 1.0)?;
        stamp.add(2, 1, -1.0)
    }
}

impl Device for Inductor {
    type Model = InductorModel;
    const KIND: DeviceKind = DeviceKind::Inductor;

    fn terminals(&self) -> &'static [&'static str] {
        &["p", "n"]
    }

    fn setup(
        &mut self,
        name: &str,
        model: &InductorModel,
        nodes: &mut NodeMapping,
        states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>> {
        let inductance = self.inductance.or(model.inductance).unwrap_or(0.0);
        if inductance < 0.0 {
            return Err(DeviceError::InvalidParameter {
                instance: name.to_string(),
                parameter: "l",
                reason: format!("inductance must not be negative, got {inductance}"),
            });
        }
        self.value = inductance;
        self.branch = nodes.branch(name);
        self.flux = states.allocate(2);
        Ok(vec![self.positive, self.negative, self.branch])
    }

    fn topology(&self) -> Vec<(usize, usize)> {
        vec![(0, 2), (1, 2), (2, 0), (2, 1), (2, 2)]
    }

    fn load(
        &mut self,
        _model: &InductorModel,
        ckt: &mut CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        let current = match self.ic {
            Some(ic) if ckt.initial_transient && ckt.use_initial_conditions => ic,
            _ => ckt.voltage(self.branch),
        };
        ckt.states.set(0, self.flux, self.value * current);

        // short circuit at DC
        let (req, veq) = if ckt.mode == AnalysisMode::Transient {
            ckt.integrate_charge(self.flux, self.value)
        } else {
            (0.0, 0.0)
        };
        Self::stamp_incidence(stamp)?;
        stamp.add(2, 2, -req)?;
        stamp.add_rhs(2, veq);
        Ok(())
    }

    fn ac_load(
        &self,
        _model: &InductorModel,
        ckt: &CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        Self::stamp_incidence(stamp)?;
        stamp.add_complex(2, 2, Complex64::new(0.0, -ckt.omega * self.value))
    }

    fn charges(&self) -> Vec<StateSlot> {
        vec![self.flux]
    }

    fn initial_conditions(&mut self, ckt: &CircuitState) {
        if !self.ic_given {
            self.ic = Some(ckt.voltage(self.branch));
        }
    }

    fn query(&self, _model: &InductorModel, ckt: &CircuitState, parameter: &str) -> Option<QueryValue> {
        match parameter {
            "l" | "inductance" => Some(QueryValue::Real(self.value)),
            "flux" => Some(QueryValue::Real(ckt.states.get(0, self.flux))),
            "i" => Some(QueryValue::Real(ckt.voltage(self.branch))),
            "v" => Some(QueryValue::Real(ckt.voltage_diff(self.positive, self.negative))),
            "ic" => self.ic.map(QueryValue::Real),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatrixLayout;
    use crate::devices::testing::Bench;
    use crate::devices::{Devices, Model};

    const A: NodeIndex = NodeIndex(1);
    // the branch unknown comes right after the single external node
    const BRANCH: NodeIndex = NodeIndex(2);

    fn single(inductor: Inductor) -> Bench {
        let mut devices = Devices::new(MatrixLayout::Sparse);
        devices.node("a");
        devices.add_model(Model::new("lmod", InductorModel::default()).with_instance("L1", inductor));
        Bench::new(devices)
    }

    #[test]
    fn branch_unknown_is_registered() {
        let bench = single(Inductor::new(A, NodeIndex::GROUND, 1e-3));
        assert_eq!(bench.devices.nodes().get("L1#branch"), Some(BRANCH));
        assert_eq!(bench.ckt.solution.len(), 3);
    }

    #[test]
    fn short_at_dc() {
        let mut bench = single(Inductor::new(A, NodeIndex::GROUND, 1e-3));
        bench.set(BRANCH, 0.25);
        bench.load();
        let (m, _) = bench.mna.to_dense();
        assert_eq!(m[[0, 1]], 1.0);
        assert_eq!(m[[1, 0]], 1.0);
        assert_eq!(m[[1, 1]], 0.0);
        assert_eq!(bench.real("L1", "flux"), 0.25e-3);
        // branch current leaves the positive terminal into the inductor
        assert_eq!(bench.real("L1", "i(p)"), 0.25);
    }

    #[test]
    fn transient_companion() {
        let mut bench = single(Inductor::new(A, NodeIndex::GROUND, 1e-3));
        bench.set(BRANCH, 1.0);
        bench.load();
        bench.begin_transient(1e-6);
        bench.load();
        // req = L / h
        assert!((bench.mna.get(1, 1).re + 1e3).abs() < 1e-9);
    }

    #[test]
    fn ac_and_dc_share_topology() {
        let mut bench = single(Inductor::new(A, NodeIndex::GROUND, 1e-3));
        let (dc, ac) = bench.touched_by_both_passes();
        assert_eq!(dc, ac);
        assert_eq!(dc, vec![(0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn initial_current_follows_the_branch_unless_given() {
        let mut bench = single(Inductor::new(A, NodeIndex::GROUND, 1e-3));
        for current in [0.1, 0.2] {
            bench.set(BRANCH, current);
            bench.devices.initial_conditions(&bench.ckt);
            assert_eq!(bench.real("L1", "ic"), current);
        }

        let mut given = single(Inductor::new(A, NodeIndex::GROUND, 1e-3).with_ic(0.5));
        given.set(BRANCH, 0.2);
        given.devices.initial_conditions(&given.ckt);
        assert_eq!(given.real("L1", "ic"), 0.5);
    }

    #[test]
    fn ac_reactance() {
        let mut bench = single(Inductor::new(A, NodeIndex::GROUND, 1e-3));
        bench.ac_load(1e3);
        assert_eq!(bench.mna.get(1, 1), Complex64::new(0.0, -1.0));
    }
}

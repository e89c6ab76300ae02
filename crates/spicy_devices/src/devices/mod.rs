pub mod adjoint;
pub mod bjt;
pub mod capacitor;
pub mod diode;
pub mod inductor;
pub mod limit;
pub mod model;
pub mod mosfet;
pub mod resistor;
pub mod sources;
pub mod stamp;

use tracing::{debug, debug_span};

use crate::config::MatrixLayout;
use crate::error::{DeviceError, DeviceResult};
use crate::mna::{MnaSystem, PatternBuilder};
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{CircuitState, StateHistory};

pub use bjt::{Bjt, BjtModel, BjtPolarity};
pub use capacitor::{Capacitor, CapacitorModel};
pub use diode::{Diode, DiodeModel};
pub use inductor::{Inductor, InductorModel};
pub use model::{BackupMode, Device, DeviceKind, DeviceModel, Instance, Model, QueryValue};
pub use mosfet::{Mosfet, MosfetChannel, MosfetModel};
pub use resistor::{Resistor, ResistorModel};
pub use sources::{CurrentSource, SourceModel, VoltageSource, Waveform};

/// Every model of a circuit, dispatched in insertion order.
///
/// Typical driver loop:
///
/// 1. register nodes with [`node`](Self::node), add models, call [`setup`](Self::setup);
/// 2. per Newton iteration clear the returned [`MnaSystem`], [`load`](Self::load),
///    solve, check [`converged`](Self::converged);
/// 3. per accepted time point [`truncate`](Self::truncate) to pick the next step.
#[derive(Debug, Default)]
pub struct Devices {
    nodes: NodeMapping,
    models: Vec<Box<dyn DeviceModel>>,
    layout: MatrixLayout,
    adjoint: bool,
    pattern: Option<MnaSystem>,
}

impl Devices {
    pub fn new(layout: MatrixLayout) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    /// Index of the named circuit node, registering it on first use.
    pub fn node(&mut self, name: &str) -> NodeIndex {
        self.nodes.node(name)
    }

    pub fn nodes(&self) -> &NodeMapping {
        &self.nodes
    }

    pub fn add_model<D: Device>(&mut self, model: Model<D>) {
        self.models.push(Box::new(model));
    }

    pub fn models(&self) -> impl Iterator<Item = &dyn DeviceModel> {
        self.models.iter().map(|m| m.as_ref())
    }

    /// Mirror every stamp into per-instance adjoint storage.
    pub fn enable_adjoint(&mut self, enabled: bool) {
        self.adjoint = enabled;
        if self.pattern.is_some() {
            for model in &mut self.models {
                model.set_adjoint(enabled);
            }
        }
    }

    /// Allocate internal unknowns and state, then build the MNA pattern and bind
    /// every instance to it. Returns the zeroed system the driver stamps into.
    pub fn setup(&mut self, ckt: &mut CircuitState) -> DeviceResult<MnaSystem> {
        let _span = debug_span!("setup", layout = ?self.layout).entered();

        ckt.states = StateHistory::new();
        for model in &mut self.models {
            model.setup(&mut self.nodes, &mut ckt.states)?;
        }

        let mut builder = PatternBuilder::new(self.nodes.len(), self.layout);
        for model in &mut self.models {
            model.bind(&self.nodes, &mut builder)?;
        }
        let (mna, resolver) = builder.build()?;

        let adjoint = self.adjoint || ckt.tolerances.adjoint;
        self.adjoint = adjoint;
        for model in &mut self.models {
            model.finalize(&resolver, adjoint);
        }

        ckt.resize(self.nodes.len());
        self.pattern = Some(mna.zeroed_like());
        debug!(
            unknowns = self.nodes.len(),
            states = ckt.states.len(),
            adjoint,
            "circuit bound to MNA system"
        );
        Ok(mna)
    }

    pub fn load(&mut self, mna: &mut MnaSystem, ckt: &mut CircuitState) -> DeviceResult<()> {
        for model in &mut self.models {
            model.load(mna, ckt)?;
        }
        Ok(())
    }

    pub fn ac_load(&mut self, mna: &mut MnaSystem, ckt: &CircuitState) -> DeviceResult<()> {
        for model in &mut self.models {
            model.ac_load(mna, ckt)?;
        }
        Ok(())
    }

    /// Shrink `step` to the smallest step any charge element allows.
    pub fn truncate(&self, ckt: &CircuitState, step: &mut f64) {
        let proposed = *step;
        for model in &self.models {
            model.truncate(ckt, step);
        }
        if *step < proposed {
            debug!(proposed, step = *step, "time step truncated");
        }
    }

    /// Largest local truncation error over the circuit for a step of `h`.
    pub fn truncation_error(&self, ckt: &CircuitState, h: f64) -> f64 {
        self.models
            .iter()
            .map(|m| m.truncation_error(ckt, h))
            .fold(0.0, f64::max)
    }

    pub fn initial_conditions(&mut self, ckt: &CircuitState) {
        for model in &mut self.models {
            model.initial_conditions(ckt);
        }
    }

    pub fn converged(&self, ckt: &CircuitState) -> bool {
        self.models.iter().all(|m| m.converged(ckt))
    }

    pub fn query(
        &self,
        instance: &str,
        parameter: &str,
        ckt: &CircuitState,
    ) -> DeviceResult<QueryValue> {
        self.models
            .iter()
            .find_map(|m| m.query(instance, parameter, ckt))
            .unwrap_or_else(|| Err(DeviceError::UnknownInstance(instance.to_string())))
    }

    pub fn backup(&mut self, mode: BackupMode) -> DeviceResult<()> {
        self.models.iter_mut().try_for_each(|m| m.backup(mode))
    }

    /// The last stamp of every instance gathered into a fresh system with the same
    /// pattern. `None` before setup or with mirroring off.
    pub fn adjoint_system(&self) -> Option<MnaSystem> {
        if !self.adjoint {
            return None;
        }
        let mut mna = self.pattern.as_ref()?.zeroed_like();
        for model in &self.models {
            model.scatter_adjoint(&mut mna);
        }
        Some(mna)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Bench;
    use super::*;
    use crate::config::{IntegrationMethod, Tolerances};
    use num_complex::Complex64;

    fn divider(layout: MatrixLayout) -> Devices {
        let mut devices = Devices::new(layout);
        let a = devices.node("a");
        let b = devices.node("b");
        devices.add_model(
            Model::new("r", ResistorModel::default())
                .with_instance("R1", Resistor::new(a, b, 1e3))
                .with_instance("R2", Resistor::new(b, NodeIndex::GROUND, 1e3)),
        );
        devices.add_model(
            Model::new("v", SourceModel::default())
                .with_instance("V1", VoltageSource::new(a, NodeIndex::GROUND, 2.0)),
        );
        devices
    }

    #[test]
    fn load_before_setup_is_fatal() {
        let mut devices = divider(MatrixLayout::Sparse);
        let mut other = Devices::new(MatrixLayout::Sparse);
        let mut ckt = CircuitState::new(Tolerances::default(), IntegrationMethod::Trapezoidal);
        let mut mna = other.setup(&mut ckt).unwrap();
        assert_eq!(
            devices.load(&mut mna, &mut ckt),
            Err(DeviceError::NotSetUp {
                instance: "R1".into()
            })
        );
    }

    #[test]
    fn dense_and_sparse_layouts_agree() {
        let mut sparse = Bench::new(divider(MatrixLayout::Sparse));
        let mut dense = Bench::new(divider(MatrixLayout::Dense));
        sparse.load();
        dense.load();

        let (s, _) = sparse.mna.to_dense();
        let (d, _) = dense.mna.to_dense();
        assert_eq!(s, d);
        assert_eq!(sparse.mna.rhs(), dense.mna.rhs());
        assert_eq!(dense.mna.rhs(), vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn queries_route_to_the_owning_model() {
        let mut bench = Bench::new(divider(MatrixLayout::Sparse));
        let (a, b) = (NodeIndex(1), NodeIndex(2));
        bench.set(a, 2.0);
        bench.set(b, 1.0);
        bench.load();

        assert_eq!(bench.real("R2", "i(p)"), 1e-3);
        assert_eq!(
            bench.devices.query("R9", "i(p)", &bench.ckt),
            Err(DeviceError::UnknownInstance("R9".into()))
        );
        assert_eq!(
            bench.devices.query("R1", "bogus", &bench.ckt),
            Err(DeviceError::UnknownParameter {
                device: "resistor",
                instance: "R1".into(),
                parameter: "bogus".into()
            })
        );
    }

    #[test]
    fn adjoint_system_mirrors_latest_pass() {
        let mut devices = divider(MatrixLayout::Sparse);
        devices.enable_adjoint(true);
        let mut bench = Bench::new(devices);

        bench.load();
        let adjoint = bench.devices.adjoint_system().unwrap();
        assert_eq!(adjoint.to_dense(), bench.mna.to_dense());
        assert_eq!(adjoint.rhs(), bench.mna.rhs());

        bench.ac_load(1e3);
        let adjoint = bench.devices.adjoint_system().unwrap();
        assert_eq!(adjoint.to_dense(), bench.mna.to_dense());
        assert_eq!(adjoint.get(0, 0), Complex64::new(1e-3, 0.0));
    }

    #[test]
    fn adjoint_is_off_by_default() {
        let bench = Bench::new(divider(MatrixLayout::Dense));
        assert!(bench.devices.adjoint_system().is_none());
    }
}

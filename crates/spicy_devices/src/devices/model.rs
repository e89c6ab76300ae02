//! Device plugin contract and the generic model/instance containers built on it.
use std::fmt;

use num_complex::Complex64;
use tracing::{debug, trace};

use super::adjoint::AdjointMirror;
use super::stamp::{StampSlots, Stamper};
use crate::current::CurrentMatrix;
use crate::error::{DeviceError, DeviceResult};
use crate::mna::{EntryResolver, MnaSystem, PatternBuilder};
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{AnalysisMode, CircuitState, StateHistory, StateSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Resistor,
    Capacitor,
    Inductor,
    VoltageSource,
    CurrentSource,
    Diode,
    Bjt,
    Mosfet,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Resistor => "resistor",
            DeviceKind::Capacitor => "capacitor",
            DeviceKind::Inductor => "inductor",
            DeviceKind::VoltageSource => "voltage source",
            DeviceKind::CurrentSource => "current source",
            DeviceKind::Diode => "diode",
            DeviceKind::Bjt => "bjt",
            DeviceKind::Mosfet => "mosfet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryValue {
    Real(f64),
    Complex(Complex64),
    Integer(i64),
}

impl QueryValue {
    pub fn real(self) -> Option<f64> {
        match self {
            QueryValue::Real(v) => Some(v),
            QueryValue::Integer(v) => Some(v as f64),
            QueryValue::Complex(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// snapshot the operating point
    Save,
    /// roll back to the last snapshot
    Restore,
    /// drop the snapshot
    Clear,
}

/// One device type.
///
/// Local node positions used by [`topology`](Device::topology) and the stamper refer
/// to the node list returned by [`setup`](Device::setup); external terminals come
/// first, in the order of [`terminals`](Device::terminals).
pub trait Device: Clone + fmt::Debug + 'static {
    /// Parameters shared by every instance of one model.
    type Model: Clone + fmt::Debug + 'static;

    const KIND: DeviceKind;

    fn terminals(&self) -> &'static [&'static str];

    /// Validate parameters, create internal unknowns and allocate state slots.
    fn setup(
        &mut self,
        name: &str,
        model: &Self::Model,
        nodes: &mut NodeMapping,
        states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>>;

    /// Every local `(row, col)` cell `load` or `ac_load` may write.
    fn topology(&self) -> Vec<(usize, usize)>;

    /// DC/transient stamp around the solution in `ckt`.
    fn load(
        &mut self,
        model: &Self::Model,
        ckt: &mut CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()>;

    /// Small-signal stamp at `ckt.omega` around the last operating point.
    fn ac_load(
        &self,
        model: &Self::Model,
        ckt: &CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()>;

    /// Charge/flux state slots subject to truncation control.
    fn charges(&self) -> Vec<StateSlot> {
        Vec::new()
    }

    /// Shrink `step` to what the local truncation error allows. Never grows it.
    fn truncate(&self, ckt: &CircuitState, step: &mut f64) {
        for q in self.charges() {
            *step = step.min(ckt.truncation_step(q));
        }
    }

    /// Fill initial conditions the user left unset from the solution.
    fn initial_conditions(&mut self, _ckt: &CircuitState) {}

    fn converged(&self, _model: &Self::Model, _ckt: &CircuitState) -> bool {
        true
    }

    /// Terminal currents from the operating point, in [`terminals`](Device::terminals)
    /// order, positive into the device. Answers `i(<terminal>)` when several terminals
    /// sit on ground and the current matrix cannot tell them apart.
    fn terminal_currents(&self, _model: &Self::Model, _ckt: &CircuitState) -> Option<Vec<f64>> {
        None
    }

    /// Device-specific read-back; `parameter` is lowercase.
    fn query(&self, model: &Self::Model, ckt: &CircuitState, parameter: &str) -> Option<QueryValue>;
}

#[derive(Debug, Clone)]
pub struct Instance<D: Device> {
    name: String,
    device: D,
    slots: StampSlots,
    current: CurrentMatrix,
    adjoint: Option<AdjointMirror>,
    snapshot: Option<D>,
    last_pass: Option<AnalysisMode>,
}

impl<D: Device> Instance<D> {
    pub fn new(name: impl Into<String>, device: D) -> Self {
        Self {
            name: name.into(),
            device,
            slots: StampSlots::default(),
            current: CurrentMatrix::new(),
            adjoint: None,
            snapshot: None,
            last_pass: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn slots(&self) -> &StampSlots {
        &self.slots
    }

    pub fn current(&self) -> &CurrentMatrix {
        &self.current
    }

    pub fn adjoint(&self) -> Option<&AdjointMirror> {
        self.adjoint.as_ref()
    }

    pub fn setup(
        &mut self,
        model: &D::Model,
        nodes: &mut NodeMapping,
        states: &mut StateHistory,
    ) -> DeviceResult<()> {
        let local = self.device.setup(&self.name, model, nodes, states)?;
        self.slots = StampSlots::new(local, &self.device.topology());
        self.current = CurrentMatrix::new();
        self.last_pass = None;
        Ok(())
    }

    pub fn bind(&mut self, nodes: &NodeMapping, builder: &mut PatternBuilder) -> DeviceResult<()> {
        self.slots.bind(nodes, builder)
    }

    pub fn finalize(&mut self, resolver: &EntryResolver, adjoint: bool) {
        self.slots.finalize(resolver);
        self.set_adjoint(adjoint);
    }

    pub fn set_adjoint(&mut self, enabled: bool) {
        self.adjoint = enabled.then(|| AdjointMirror::for_slots(&self.slots));
    }

    fn ensure_bound(&self) -> DeviceResult<()> {
        if self.slots.is_bound() {
            Ok(())
        } else {
            Err(DeviceError::NotSetUp {
                instance: self.name.clone(),
            })
        }
    }

    pub fn load(
        &mut self,
        model: &D::Model,
        mna: &mut MnaSystem,
        ckt: &mut CircuitState,
    ) -> DeviceResult<()> {
        self.ensure_bound()?;
        self.current.clear();
        if let Some(adjoint) = &mut self.adjoint {
            adjoint.clear();
        }
        let mut stamp = Stamper::new(
            &self.name,
            &self.slots,
            mna,
            &mut self.current,
            self.adjoint.as_mut(),
        );
        self.device.load(model, ckt, &mut stamp)?;
        self.last_pass = Some(ckt.mode);
        Ok(())
    }

    pub fn ac_load(
        &mut self,
        model: &D::Model,
        mna: &mut MnaSystem,
        ckt: &CircuitState,
    ) -> DeviceResult<()> {
        self.ensure_bound()?;
        self.current.clear();
        if let Some(adjoint) = &mut self.adjoint {
            adjoint.clear();
        }
        let mut stamp = Stamper::new(
            &self.name,
            &self.slots,
            mna,
            &mut self.current,
            self.adjoint.as_mut(),
        );
        self.device.ac_load(model, ckt, &mut stamp)?;
        self.last_pass = Some(AnalysisMode::Ac);
        Ok(())
    }

    pub fn backup(&mut self, mode: BackupMode) -> DeviceResult<()> {
        match mode {
            BackupMode::Save => self.snapshot = Some(self.device.clone()),
            BackupMode::Restore => {
                let snapshot = self.snapshot.as_ref().ok_or_else(|| DeviceError::NoSnapshot {
                    instance: self.name.clone(),
                })?;
                self.device = snapshot.clone();
            }
            BackupMode::Clear => self.snapshot = None,
        }
        Ok(())
    }

    /// Current flowing from terminal `local` into the device, read back from the
    /// current matrix. Complex after an AC pass.
    ///
    /// A grounded terminal is resolved by KCL over the others. When more than one
    /// terminal is grounded the device's own operating-point currents are used; after
    /// an AC pass, or for devices without them, that is a [`DeviceError::SharedGround`].
    pub fn terminal_current(
        &self,
        model: &D::Model,
        local: usize,
        ckt: &CircuitState,
    ) -> DeviceResult<QueryValue> {
        let ac = self.last_pass == Some(AnalysisMode::Ac);
        let terminals = self.device.terminals();
        let grounded = (0..terminals.len())
            .filter(|&k| self.slots.node(k).is_ground())
            .count();
        if grounded > 1 && self.slots.node(local).is_ground() {
            return (!ac)
                .then(|| self.device.terminal_currents(model, ckt))
                .flatten()
                .and_then(|currents| currents.get(local).copied())
                .map(QueryValue::Real)
                .ok_or_else(|| DeviceError::SharedGround {
                    instance: self.name.clone(),
                    terminal: terminals[local].to_string(),
                });
        }

        let at = |index: usize| -> Complex64 {
            let node = self.slots.node(index);
            if ac {
                self.current
                    .evaluate_complex(node, &ckt.solution, &ckt.solution_imag)
            } else {
                Complex64::new(self.current.evaluate_real(node, &ckt.solution), 0.0)
            }
        };

        // ground rows are never stored; the terminal currents sum to zero
        let value = if self.slots.node(local).is_ground() {
            -(0..terminals.len())
                .filter(|&other| other != local)
                .map(&at)
                .sum::<Complex64>()
        } else {
            at(local)
        };

        Ok(if ac {
            QueryValue::Complex(value)
        } else {
            QueryValue::Real(value.re)
        })
    }

    pub fn query(
        &self,
        model: &D::Model,
        ckt: &CircuitState,
        parameter: &str,
    ) -> DeviceResult<QueryValue> {
        let unknown = || DeviceError::UnknownParameter {
            device: D::KIND.name(),
            instance: self.name.clone(),
            parameter: parameter.to_string(),
        };

        let lower = parameter.to_ascii_lowercase();
        if let Some(terminal) = lower.strip_prefix("i(").and_then(|t| t.strip_suffix(')')) {
            let local = self
                .device
                .terminals()
                .iter()
                .position(|t| t.eq_ignore_ascii_case(terminal))
                .ok_or_else(unknown)?;
            self.ensure_bound()?;
            return self.terminal_current(model, local, ckt);
        }

        self.device
            .query(model, ckt, &lower)
            .ok_or_else(unknown)
    }
}

/// Shared parameters of one device type plus its instances, in insertion order.
#[derive(Debug, Clone)]
pub struct Model<D: Device> {
    name: String,
    params: D::Model,
    instances: Vec<Instance<D>>,
}

impl<D: Device> Model<D> {
    pub fn new(name: impl Into<String>, params: D::Model) -> Self {
        Self {
            name: name.into(),
            params,
            instances: Vec::new(),
        }
    }

    pub fn with_instance(mut self, name: impl Into<String>, device: D) -> Self {
        self.add_instance(name, device);
        self
    }

    pub fn add_instance(&mut self, name: impl Into<String>, device: D) {
        self.instances.push(Instance::new(name, device));
    }

    pub fn params(&self) -> &D::Model {
        &self.params
    }

    pub fn instances(&self) -> &[Instance<D>] {
        &self.instances
    }

    pub fn instance(&self, name: &str) -> Option<&Instance<D>> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut Instance<D>> {
        self.instances.iter_mut().find(|i| i.name == name)
    }
}

/// Object-safe view of a [`Model`], as held by the registry.
pub trait DeviceModel: fmt::Debug {
    fn name(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    fn instance_names(&self) -> Vec<&str>;

    fn setup(&mut self, nodes: &mut NodeMapping, states: &mut StateHistory) -> DeviceResult<()>;
    fn bind(&mut self, nodes: &NodeMapping, builder: &mut PatternBuilder) -> DeviceResult<()>;
    fn finalize(&mut self, resolver: &EntryResolver, adjoint: bool);
    fn set_adjoint(&mut self, enabled: bool);

    fn load(&mut self, mna: &mut MnaSystem, ckt: &mut CircuitState) -> DeviceResult<()>;
    fn ac_load(&mut self, mna: &mut MnaSystem, ckt: &CircuitState) -> DeviceResult<()>;
    fn truncate(&self, ckt: &CircuitState, step: &mut f64);
    /// Largest local truncation error over every charge for a step of `h`.
    fn truncation_error(&self, ckt: &CircuitState, h: f64) -> f64;
    fn initial_conditions(&mut self, ckt: &CircuitState);
    fn converged(&self, ckt: &CircuitState) -> bool;
    fn backup(&mut self, mode: BackupMode) -> DeviceResult<()>;

    /// `None` when `instance` does not belong to this model.
    fn query(
        &self,
        instance: &str,
        parameter: &str,
        ckt: &CircuitState,
    ) -> Option<DeviceResult<QueryValue>>;

    fn scatter_adjoint(&self, mna: &mut MnaSystem);
}

impl<D: Device> DeviceModel for Model<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        D::KIND
    }

    fn instance_names(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.name()).collect()
    }

    fn setup(&mut self, nodes: &mut NodeMapping, states: &mut StateHistory) -> DeviceResult<()> {
        for instance in &mut self.instances {
            instance.setup(&self.params, nodes, states)?;
        }
        debug!(
            model = %self.name,
            kind = D::KIND.name(),
            instances = self.instances.len(),
            "model set up"
        );
        Ok(())
    }

    fn bind(&mut self, nodes: &NodeMapping, builder: &mut PatternBuilder) -> DeviceResult<()> {
        self.instances
            .iter_mut()
            .try_for_each(|instance| instance.bind(nodes, builder))
    }

    fn finalize(&mut self, resolver: &EntryResolver, adjoint: bool) {
        for instance in &mut self.instances {
            instance.finalize(resolver, adjoint);
        }
    }

    fn set_adjoint(&mut self, enabled: bool) {
        for instance in &mut self.instances {
            instance.set_adjoint(enabled);
        }
    }

    fn load(&mut self, mna: &mut MnaSystem, ckt: &mut CircuitState) -> DeviceResult<()> {
        for instance in &mut self.instances {
            instance.load(&self.params, mna, ckt)?;
        }
        Ok(())
    }

    fn ac_load(&mut self, mna: &mut MnaSystem, ckt: &CircuitState) -> DeviceResult<()> {
        for instance in &mut self.instances {
            instance.ac_load(&self.params, mna, ckt)?;
        }
        Ok(())
    }

    fn truncate(&self, ckt: &CircuitState, step: &mut f64) {
        for instance in &self.instances {
            let before = *step;
            instance.device.truncate(ckt, step);
            if *step < before {
                trace!(instance = %instance.name, step = *step, "step limited by truncation error");
            }
        }
    }

    fn truncation_error(&self, ckt: &CircuitState, h: f64) -> f64 {
        self.instances
            .iter()
            .flat_map(|i| i.device.charges())
            .map(|q| ckt.local_truncation_error(q, h))
            .fold(0.0, f64::max)
    }

    fn initial_conditions(&mut self, ckt: &CircuitState) {
        for instance in &mut self.instances {
            instance.device.initial_conditions(ckt);
        }
    }

    fn converged(&self, ckt: &CircuitState) -> bool {
        self.instances
            .iter()
            .all(|i| i.device.converged(&self.params, ckt))
    }

    fn backup(&mut self, mode: BackupMode) -> DeviceResult<()> {
        self.instances
            .iter_mut()
            .try_for_each(|instance| instance.backup(mode))
    }

    fn query(
        &self,
        instance: &str,
        parameter: &str,
        ckt: &CircuitState,
    ) -> Option<DeviceResult<QueryValue>> {
        self.instance(instance)
            .map(|i| i.query(&self.params, ckt, parameter))
    }

    fn scatter_adjoint(&self, mna: &mut MnaSystem) {
        for instance in &self.instances {
            if let Some(adjoint) = &instance.adjoint {
                adjoint.scatter(&instance.slots, mna);
            }
        }
    }
}

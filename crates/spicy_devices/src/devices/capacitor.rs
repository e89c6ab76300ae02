use num_complex::Complex64;

use super::model::{Device, DeviceKind, QueryValue};
use super::stamp::Stamper;
use crate::error::{DeviceError, DeviceResult};
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{AnalysisMode, CircuitState, StateHistory, StateSlot};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapacitorModel {
    /// Capacitance used by instances that do not give one (F).
    pub capacitance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capacitor {
    pub positive: NodeIndex,
    pub negative: NodeIndex,
    pub capacitance: Option<f64>,
    pub m: f64,
    /// Initial voltage; re-derived from the operating point unless given through
    /// [`with_ic`](Self::with_ic).
    pub ic: Option<f64>,
    ic_given: bool,
    value: f64,
    charge: StateSlot,
}

impl Capacitor {
    pub fn new(positive: NodeIndex, negative: NodeIndex, capacitance: f64) -> Self {
        Self {
            positive,
            negative,
            capacitance: Some(capacitance),
            m: 1.0,
            ic: None,
            ic_given: false,
            value: capacitance,
            charge: StateSlot(0),
        }
    }

    pub fn with_ic(mut self, ic: f64) -> Self {
        self.ic = Some(ic);
        self.ic_given = true;
        self
    }
}

impl Device for Capacitor {
    type Model = CapacitorModel;
    const KIND: DeviceKind = DeviceKind::Capacitor;

    fn terminals(&self) -> &'static [&'static str] {
        &["p", "n"]
    }

    fn setup(
        &mut self,
        name: &str,
        model: &CapacitorModel,
        _nodes: &mut NodeMapping,
        states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>> {
        let capacitance = self.capacitance.or(model.capacitance).unwrap_or(0.0);
        if capacitance < 0.0 {
            return Err(DeviceError::InvalidParameter {
                instance: name.to_string(),
                parameter: "c",
                reason: format!("capacitance must not be negative, got {capacitance}"),
            });
        }
        self.value = capacitance * self.m;
        self.charge = states.allocate(2);
        Ok(vec![self.positive, self.negative])
    }

    fn topology(&self) -> Vec<(usize, usize)> {
        vec![(0, 0), (0, 1), (1, 0), (1, 1)]
    }

    fn load(
        &mut self,
        _model: &CapacitorModel,
        ckt: &mut CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        let v = match self.ic {
            Some(ic) if ckt.initial_transient && ckt.use_initial_conditions => ic,
            _ => ckt.voltage_diff(self.positive, self.negative),
        };
        ckt.states.set(0, self.charge, self.value * v);

        // open circuit at DC
        let (geq, ceq) = if ckt.mode == AnalysisMode::Transient {
            ckt.integrate_charge(self.charge, self.value)
        } else {
            (0.0, 0.0)
        };
        stamp.conductance(0, 1, geq)?;
        stamp.current(0, 1, ceq);
        Ok(())
    }

    fn ac_load(
        &self,
        _model: &CapacitorModel,
        ckt: &CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        stamp.admittance(0, 1, Complex64::new(0.0, ckt.omega * self.value))
    }

    fn charges(&self) -> Vec<StateSlot> {
        vec![self.charge]
    }

    fn initial_conditions(&mut self, ckt: &CircuitState) {
        if !self.ic_given {
            self.ic = Some(ckt.voltage_diff(self.positive, self.negative));
        }
    }

    fn query(&self, _model: &CapacitorModel, ckt: &CircuitState, parameter: &str) -> Option<QueryValue> {
        match parameter {
            "c" | "capacitance" => Some(QueryValue::Real(self.value)),
            "q" | "charge" => Some(QueryValue::Real(ckt.states.get(0, self.charge))),
            "i" => Some(QueryValue::Real(ckt.states.get(0, self.charge.offset(1)))),
            "ic" => self.ic.map(QueryValue::Real),
            _ => None,
        }
    }
}

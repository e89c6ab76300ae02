use super::model::{Device, DeviceKind, QueryValue};
use super::stamp::Stamper;
use crate::error::{DeviceError, DeviceResult};
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{CircuitState, StateHistory};

#[derive(Debug, Clone, PartialEq)]
pub struct ResistorModel {
    /// Resistance used by instances that do not give one (Ohms).
    pub resistance: Option<f64>,
    /// First-order temperature coefficient.
    pub tc1: f64,
    /// Second-order temperature coefficient.
    pub tc2: f64,
    /// Temperature the nominal value was measured at (K).
    pub tnom: f64,
}

impl Default for ResistorModel {
    fn default() -> Self {
        Self {
            resistance: None,
            tc1: 0.0,
            tc2: 0.0,
            tnom: 300.15,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resistor {
    pub positive: NodeIndex,
    pub negative: NodeIndex,
    /// Instance value (Ohms); overrides the model.
    pub resistance: Option<f64>,
    /// Optional AC override value (Ohms). If not provided, defaults to the DC value.
    pub ac: Option<f64>,
    /// Multiplier; replicates the resistor in parallel.
    pub m: f64,
    nominal: f64,
}

impl Resistor {
    pub fn new(positive: NodeIndex, negative: NodeIndex, resistance: f64) -> Self {
        Self {
            positive,
            negative,
            resistance: Some(resistance),
            ac: None,
            m: 1.0,
            nominal: resistance,
        }
    }

    /// Resistor whose value comes from its model.
    pub fn from_model(positive: NodeIndex, negative: NodeIndex) -> Self {
        Self {
            resistance: None,
            ..Self::new(positive, negative, 0.0)
        }
    }

    fn temperature_factor(model: &ResistorModel, ckt: &CircuitState) -> f64 {
        let dt = ckt.tolerances.temperature - model.tnom;
        1.0 + model.tc1 * dt + model.tc2 * dt * dt
    }

    fn resistance(&self, model: &ResistorModel, ckt: &CircuitState) -> f64 {
        self.nominal * Self::temperature_factor(model, ckt) / self.m
    }

    fn conductance(&self, model: &ResistorModel, ckt: &CircuitState) -> f64 {
        1.0 / self.resistance(model, ckt)
    }
}

impl Device for Resistor {
    type Model = ResistorModel;
    const KIND: DeviceKind = DeviceKind::Resistor;

    fn terminals(&self) -> &'static [&'static str] {
        &["p", "n"]
    }

    fn setup(
        &mut self,
        name: &str,
        model: &ResistorModel,
        _nodes: &mut NodeMapping,
        _states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>> {
        let resistance = self.resistance.or(model.resistance).ok_or_else(|| {
            DeviceError::InvalidParameter {
                instance: name.to_string(),
                parameter: "r",
                reason: "no resistance given on the instance or its model".into(),
            }
        })?;
        if !(resistance > 0.0) {
            return Err(DeviceError::InvalidParameter {
                instance: name.to_string(),
                parameter: "r",
                reason: format!("resistance must be positive, got {resistance}"),
            });
        }
        self.nominal = resistance;
        Ok(vec![self.positive, self.negative])
    }

    fn topology(&self) -> Vec<(usize, usize)> {
        vec![(0, 0), (0, 1), (1, 0), (1, 1)]
    }

    fn load(
        &mut self,
        model: &ResistorModel,
        ckt: &mut CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        stamp.conductance(0, 1, self.conductance(model, ckt))
    }

    fn ac_load(
        &self,
        model: &ResistorModel,
        ckt: &CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        let g = match self.ac {
            Some(ac) => 1.0 / (ac * Self::temperature_factor(model, ckt) / self.m),
            None => self.conductance(model, ckt),
        };
        stamp.conductance(0, 1, g)
    }

    fn query(&self, model: &ResistorModel, ckt: &CircuitState, parameter: &str) -> Option<QueryValue> {
        let g = self.conductance(model, ckt);
        let v = ckt.voltage_diff(self.positive, self.negative);
        match parameter {
            "r" | "resistance" => Some(QueryValue::Real(self.resistance(model, ckt))),
            "g" | "conductance" => Some(QueryValue::Real(g)),
            "i" => Some(QueryValue::Real(g * v)),
            "p" => Some(QueryValue::Real(g * v * v)),
            _ => None,
        }
    }
}

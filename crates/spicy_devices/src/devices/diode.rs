//! Junction diode with optional series resistance and depletion/diffusion charge.
//!
//! With `rs > 0` the junction sits behind an internal node `<name>#pos`; otherwise the
//! internal position aliases the anode. Local nodes: `[anode, cathode, anode']`.
use num_complex::Complex64;

use super::limit::{pnjlim, vcrit};
use super::model::{Device, DeviceKind, QueryValue};
use super::stamp::Stamper;
use crate::error::{DeviceError, DeviceResult};
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{AnalysisMode, CircuitState, StateHistory, StateSlot};

#[derive(Debug, Clone, PartialEq)]
pub struct DiodeModel {
    /// saturation current (A)
    pub is: f64,
    /// emission coefficient
    pub n: f64,
    /// series resistance (Ohms)
    pub rs: f64,
    /// zero-bias junction capacitance (F)
    pub cjo: f64,
    /// junction potential (V)
    pub vj: f64,
    /// grading coefficient
    pub m: f64,
    /// transit time (s)
    pub tt: f64,
    /// forward-bias depletion capacitance coefficient
    pub fc: f64,
}

impl Default for DiodeModel {
    fn default() -> Self {
        Self {
            is: 1e-14,
            n: 1.0,
            rs: 0.0,
            cjo: 0.0,
            vj: 1.0,
            m: 0.5,
            tt: 0.0,
            fc: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct OperatingPoint {
    vd: f64,
    id: f64,
    gd: f64,
    cap: f64,
    limited: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diode {
    pub anode: NodeIndex,
    pub cathode: NodeIndex,
    pub area: f64,
    /// start from a zero junction voltage instead of the critical voltage
    pub off: bool,
    /// Initial junction voltage; re-derived from the operating point unless given
    /// through [`with_ic`](Self::with_ic).
    pub ic: Option<f64>,
    ic_given: bool,
    internal: NodeIndex,
    charge: StateSlot,
    op: OperatingPoint,
}

impl Diode {
    pub fn new(anode: NodeIndex, cathode: NodeIndex) -> Self {
        Self {
            anode,
            cathode,
            area: 1.0,
            off: false,
            ic: None,
            ic_given: false,
            internal: anode,
            charge: StateSlot(0),
            op: OperatingPoint::default(),
        }
    }

    pub fn with_ic(mut self, ic: f64) -> Self {
        self.ic = Some(ic);
        self.ic_given = true;
        self
    }

    pub fn internal(&self) -> NodeIndex {
        self.internal
    }

    fn series_conductance(&self, model: &DiodeModel) -> f64 {
        if model.rs > 0.0 {
            self.area / model.rs
        } else {
            0.0
        }
    }

    /// Shockley current and conductance with `gmin` in parallel and a smooth cubic
    /// tail in deep reverse bias.
    pub(crate) fn junction(is: f64, vt: f64, gmin: f64, vd: f64) -> (f64, f64) {
        if vd >= -3.0 * vt {
            let e = (vd / vt).exp();
            (is * (e - 1.0) + gmin * vd, is * e / vt + gmin)
        } else {
            let arg = 3.0 * vt / (vd * std::f64::consts::E);
            let arg = arg * arg * arg;
            (-is * (1.0 + arg) + gmin * vd, is * 3.0 * arg / vd + gmin)
        }
    }

    /// Stored charge and its small-signal capacitance at `vd`.
    fn stored_charge(&self, model: &DiodeModel, vd: f64, id: f64, gd: f64) -> (f64, f64) {
        let cjo = model.cjo * self.area;
        let (mut q, mut c) = (0.0, 0.0);
        if cjo > 0.0 {
            let fcv = model.fc * model.vj;
            if vd < fcv {
                let arg = 1.0 - vd / model.vj;
                let sarg = (-model.m * arg.ln()).exp();
                q = model.vj * cjo * (1.0 - arg * sarg) / (1.0 - model.m);
                c = cjo * sarg;
            } else {
                // linear extrapolation of the capacitance above fc·vj
                let f1 = model.vj * (1.0 - (1.0 - model.fc).powf(1.0 - model.m)) / (1.0 - model.m);
                let f2 = (1.0 - model.fc).powf(1.0 + model.m);
                let f3 = 1.0 - model.fc * (1.0 + model.m);
                let czof2 = cjo / f2;
                q = cjo * f1
                    + czof2 * (f3 * (vd - fcv) + (vd * vd - fcv * fcv) / (2.0 * model.vj));
                c = czof2 * (f3 + model.m * vd / model.vj);
            }
        }
        (q + model.tt * id, c + model.tt * gd)
    }

    fn invalid(name: &str, parameter: &'static str, reason: String) -> DeviceError {
        DeviceError::InvalidParameter {
            instance: name.to_string(),
            parameter,
            reason,
        }
    }
}

impl Device for Diode {
    type Model = DiodeModel;
    const KIND: DeviceKind = DeviceKind::Diode;

    fn terminals(&self) -> &'static [&'static str] {
        &["a", "k"]
    }

    fn setup(
        &mut self,
        name: &str,
        model: &DiodeModel,
        nodes: &mut NodeMapping,
        states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>> {
        if !(model.is > 0.0) {
            return Err(Self::invalid(name, "is", format!("must be positive, got {}", model.is)));
        }
        if !(model.n > 0.0) {
            return Err(Self::invalid(name, "n", format!("must be positive, got {}", model.n)));
        }
        if model.rs < 0.0 {
            return Err(Self::invalid(name, "rs", format!("must not be negative, got {}", model.rs)));
        }
        if !(model.vj > 0.0) || !(0.0..1.0).contains(&model.m) || !(0.0..1.0).contains(&model.fc) {
            return Err(Self::invalid(
                name,
                "cjo",
                format!("need vj > 0 and 0 <= m, fc < 1 (vj={}, m={}, fc={})", model.vj, model.m, model.fc),
            ));
        }
        if !(self.area > 0.0) {
            return Err(Self::invalid(name, "area", format!("must be positive, got {}", self.area)));
        }

        self.internal = if model.rs > 0.0 {
            nodes.internal(name, "pos")
        } else {
            self.anode
        };
        self.charge = states.allocate(2);
        self.op = OperatingPoint::default();
        Ok(vec![self.anode, self.cathode, self.internal])
    }

    fn topology(&self) -> Vec<(usize, usize)> {
        vec![(0, 0), (1, 1), (2, 2), (0, 2), (2, 0), (1, 2), (2, 1)]
    }

    fn load(
        &mut self,
        model: &DiodeModel,
        ckt: &mut CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        let vt = model.n * ckt.tolerances.thermal_voltage();
        let is = model.is * self.area;
        let vcrit = vcrit(vt, is);

        let (vd, limited) = if ckt.init_junction {
            (if self.off { 0.0 } else { vcrit }, false)
        } else if ckt.initial_transient && ckt.use_initial_conditions {
            (self.ic.unwrap_or(0.0), false)
        } else {
            let proposed = ckt.voltage_diff(self.internal, self.cathode);
            pnjlim(proposed, self.op.vd, vt, vcrit)
        };

        let (id, gd) = Self::junction(is, vt, ckt.tolerances.gmin, vd);
        let (q, cap) = self.stored_charge(model, vd, id, gd);
        ckt.states.set(0, self.charge, q);

        let (mut id_total, mut gd_total) = (id, gd);
        if ckt.mode == AnalysisMode::Transient {
            let (geq, _) = ckt.integrate_charge(self.charge, cap);
            gd_total += geq;
            id_total += ckt.states.get(0, self.charge.offset(1));
        }
        self.op = OperatingPoint {
            vd,
            id,
            gd,
            cap,
            limited,
        };

        stamp.conductance(0, 2, self.series_conductance(model))?;
        stamp.conductance(2, 1, gd_total)?;
        stamp.current(2, 1, id_total - gd_total * vd);
        Ok(())
    }

    fn ac_load(
        &self,
        model: &DiodeModel,
        ckt: &CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        stamp.conductance(0, 2, self.series_conductance(model))?;
        stamp.admittance(2, 1, Complex64::new(self.op.gd, ckt.omega * self.op.cap))
    }

    fn charges(&self) -> Vec<StateSlot> {
        vec![self.charge]
    }

    fn initial_conditions(&mut self, ckt: &CircuitState) {
        if !self.ic_given {
            self.ic = Some(ckt.voltage_diff(self.anode, self.cathode));
        }
    }

    fn converged(&self, _model: &DiodeModel, ckt: &CircuitState) -> bool {
        if self.op.limited {
            return false;
        }
        let delvd = ckt.voltage_diff(self.internal, self.cathode) - self.op.vd;
        let cdhat = self.op.id + self.op.gd * delvd;
        let tol = ckt.tolerances.reltol * cdhat.abs().max(self.op.id.abs()) + ckt.tolerances.abstol;
        (cdhat - self.op.id).abs() <= tol
    }

    fn query(&self, _model: &DiodeModel, ckt: &CircuitState, parameter: &str) -> Option<QueryValue> {
        match parameter {
            "vd" => Some(QueryValue::Real(self.op.vd)),
            "id" => Some(QueryValue::Real(self.op.id)),
            "gd" => Some(QueryValue::Real(self.op.gd)),
            "cd" => Some(QueryValue::Real(self.op.cap)),
            "q" | "charge" => Some(QueryValue::Real(ckt.states.get(0, self.charge))),
            "off" => Some(QueryValue::Integer(self.off as i64)),
            "ic" => self.ic.map(QueryValue::Real),
            _ => None,
        }
    }
}

//! Level 1 (Shichman-Hodges) MOSFET with bulk junction diodes and constant
//! overlap capacitances.
//!
//! Voltages and currents are evaluated in the channel-normalized domain, where a
//! PMOS looks like an NMOS; the drain and source swap roles whenever `vds < 0`.
//! Local nodes: `[d, g, s, b]`.
use num_complex::Complex64;

use super::diode::Diode;
use super::limit::{fetlim, limvds, pnjlim, vcrit};
use super::model::{Device, DeviceKind, QueryValue};
use super::stamp::Stamper;
use crate::error::{DeviceError, DeviceResult};
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{AnalysisMode, CircuitState, StateHistory, StateSlot};

const D: usize = 0;
const G: usize = 1;
const S: usize = 2;
const B: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MosfetChannel {
    #[default]
    N,
    P,
}

impl MosfetChannel {
    fn sign(self) -> f64 {
        match self {
            MosfetChannel::N => 1.0,
            MosfetChannel::P => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MosfetModel {
    pub channel: MosfetChannel,
    /// zero-bias threshold voltage (V), negative for an enhancement PMOS
    pub vto: f64,
    /// transconductance parameter (A/V²)
    pub kp: f64,
    /// body-effect coefficient (√V)
    pub gamma: f64,
    /// surface potential (V)
    pub phi: f64,
    /// channel-length modulation (1/V)
    pub lambda: f64,
    /// bulk junction saturation current (A)
    pub is: f64,
    /// gate-source overlap capacitance per width (F/m)
    pub cgso: f64,
    /// gate-drain overlap capacitance per width (F/m)
    pub cgdo: f64,
    /// gate-bulk overlap capacitance per length (F/m)
    pub cgbo: f64,
}

impl Default for MosfetModel {
    fn default() -> Self {
        Self {
            channel: MosfetChannel::N,
            vto: 0.0,
            kp: 2e-5,
            gamma: 0.0,
            phi: 0.6,
            lambda: 0.0,
            is: 1e-14,
            cgso: 0.0,
            cgdo: 0.0,
            cgbo: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OperatingPoint {
    vgs: f64,
    vds: f64,
    vbs: f64,
    /// +1 when the drain is the high side, -1 when drain and source swapped
    mode: f64,
    cdrain: f64,
    cd: f64,
    cbs: f64,
    gbs: f64,
    cbd: f64,
    gbd: f64,
    gm: f64,
    gds: f64,
    gmbs: f64,
    von: f64,
    vdsat: f64,
    limited: bool,
}

impl Default for OperatingPoint {
    fn default() -> Self {
        Self {
            vgs: 0.0,
            vds: 0.0,
            vbs: 0.0,
            mode: 1.0,
            cdrain: 0.0,
            cd: 0.0,
            cbs: 0.0,
            gbs: 0.0,
            cbd: 0.0,
            gbd: 0.0,
            gm: 0.0,
            gds: 0.0,
            gmbs: 0.0,
            von: 0.0,
            vdsat: 0.0,
            limited: false,
        }
    }
}

impl OperatingPoint {
    /// Effective (drain, source) local positions for the present mode.
    fn channel_ends(&self) -> (usize, usize) {
        if self.mode > 0.0 {
            (D, S)
        } else {
            (S, D)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mosfet {
    pub drain: NodeIndex,
    pub gate: NodeIndex,
    pub source: NodeIndex,
    pub bulk: NodeIndex,
    /// channel width (m)
    pub w: f64,
    /// channel length (m)
    pub l: f64,
    pub off: bool,
    /// Initial Vds, Vgs and Vbs; re-derived from the operating point unless given
    /// through [`with_ic`](Self::with_ic).
    pub ic_vds: Option<f64>,
    pub ic_vgs: Option<f64>,
    pub ic_vbs: Option<f64>,
    ic_given: bool,
    qgs: StateSlot,
    qgd: StateSlot,
    qgb: StateSlot,
    op: OperatingPoint,
}

impl Mosfet {
    pub fn new(drain: NodeIndex, gate: NodeIndex, source: NodeIndex, bulk: NodeIndex) -> Self {
        Self {
            drain,
            gate,
            source,
            bulk,
            w: 1e-4,
            l: 1e-4,
            off: false,
            ic_vds: None,
            ic_vgs: None,
            ic_vbs: None,
            ic_given: false,
            qgs: StateSlot(0),
            qgd: StateSlot(0),
            qgb: StateSlot(0),
            op: OperatingPoint::default(),
        }
    }

    pub fn with_size(mut self, w: f64, l: f64) -> Self {
        self.w = w;
        self.l = l;
        self
    }

    pub fn with_ic(mut self, vds: f64, vgs: f64, vbs: f64) -> Self {
        self.ic_vds = Some(vds);
        self.ic_vgs = Some(vgs);
        self.ic_vbs = Some(vbs);
        self.ic_given = true;
        self
    }

    fn beta(&self, model: &MosfetModel) -> f64 {
        model.kp * self.w / self.l
    }

    fn overlap(&self, model: &MosfetModel) -> [(usize, f64, StateSlot); 3] {
        [
            (S, model.cgso * self.w, self.qgs),
            (D, model.cgdo * self.w, self.qgd),
            (B, model.cgbo * self.l, self.qgb),
        ]
    }

    /// Normalized `(vgs, vds, vbs)` at the present solution.
    fn terminal_voltages(&self, model: &MosfetModel, ckt: &CircuitState) -> (f64, f64, f64) {
        let sign = model.channel.sign();
        (
            sign * ckt.voltage_diff(self.gate, self.source),
            sign * ckt.voltage_diff(self.drain, self.source),
            sign * ckt.voltage_diff(self.bulk, self.source),
        )
    }

    /// Pick the voltages to linearize around and whether any limiter kicked in.
    fn next_voltages(&self, model: &MosfetModel, ckt: &CircuitState) -> (f64, f64, f64, bool) {
        let sign = model.channel.sign();
        if ckt.init_junction {
            return if self.off {
                (0.0, 0.0, 0.0, false)
            } else {
                (sign * model.vto, 0.0, -1.0, false)
            };
        }
        if ckt.initial_transient && ckt.use_initial_conditions {
            return (
                sign * self.ic_vgs.unwrap_or(0.0),
                sign * self.ic_vds.unwrap_or(0.0),
                sign * self.ic_vbs.unwrap_or(0.0),
                false,
            );
        }

        let (vgs_new, vds_new, vbs_new) = self.terminal_voltages(model, ckt);
        let old = &self.op;
        let von = old.von;
        let (mut vgs, mut vds) = (vgs_new, vds_new);
        if old.vds >= 0.0 {
            let vgd = vgs - vds;
            vgs = fetlim(vgs, old.vgs, von);
            vds = limvds(vgs - vgd, old.vds);
        } else {
            let vgd = fetlim(vgs - vds, old.vgs - old.vds, von);
            vds = -limvds(-(vgs - vgd), -old.vds);
            vgs = vgd + vds;
        }

        let vt = ckt.tolerances.thermal_voltage();
        let vcrit = vcrit(vt, model.is);
        let (vbs, junction_limited) = if vds >= 0.0 {
            pnjlim(vbs_new, old.vbs, vt, vcrit)
        } else {
            let (vbd, limited) = pnjlim(vbs_new - vds, old.vbs - old.vds, vt, vcrit);
            (vbd + vds, limited)
        };

        // vgs and vds are rebuilt through vgd, so compare with a rounding margin
        let moved = |a: f64, b: f64| (a - b).abs() > 1e-12 * a.abs().max(b.abs()).max(1.0);
        let limited = junction_limited || moved(vgs, vgs_new) || moved(vds, vds_new);
        (vgs, vds, vbs, limited)
    }

    /// Shichman-Hodges drain current in the normal-mode frame.
    ///
    /// Returns `(cdrain, gm, gds, gmbs, von, vdsat)`.
    fn channel(&self, model: &MosfetModel, vgs: f64, vds: f64, vbs: f64) -> (f64, f64, f64, f64, f64, f64) {
        let sign = model.channel.sign();
        let phi = model.phi;
        let sqrt_phi = phi.sqrt();
        let sarg = if vbs <= 0.0 {
            (phi - vbs).sqrt()
        } else {
            (sqrt_phi - vbs / (2.0 * sqrt_phi)).max(0.0)
        };
        let von = sign * model.vto + model.gamma * (sarg - sqrt_phi);
        let vgst = vgs - von;
        let vdsat = vgst.max(0.0);
        let arg = if sarg > 0.0 { model.gamma / (2.0 * sarg) } else { 0.0 };

        if vgst <= 0.0 {
            // cutoff
            return (0.0, 0.0, 0.0, 0.0, von, vdsat);
        }
        let beta = self.beta(model);
        let betap = beta * (1.0 + model.lambda * vds);
        let (cdrain, gm, gds) = if vgst <= vds {
            // saturation
            (
                betap * vgst * vgst / 2.0,
                betap * vgst,
                model.lambda * beta * vgst * vgst / 2.0,
            )
        } else {
            // linear
            (
                betap * vds * (vgst - vds / 2.0),
                betap * vds,
                betap * (vgst - vds) + model.lambda * beta * vds * (vgst - vds / 2.0),
            )
        };
        (cdrain, gm, gds, gm * arg, von, vdsat)
    }

    fn evaluate(&self, model: &MosfetModel, ckt: &CircuitState, vgs: f64, vds: f64, vbs: f64) -> OperatingPoint {
        let vt = ckt.tolerances.thermal_voltage();
        let gmin = ckt.tolerances.gmin;
        let vbd = vbs - vds;
        let (cbs, gbs) = Diode::junction(model.is, vt, gmin, vbs);
        let (cbd, gbd) = Diode::junction(model.is, vt, gmin, vbd);

        let mode = if vds >= 0.0 { 1.0 } else { -1.0 };
        let (cdrain, gm, gds, gmbs, von, vdsat) = if mode > 0.0 {
            self.channel(model, vgs, vds, vbs)
        } else {
            self.channel(model, vgs - vds, -vds, vbd)
        };

        OperatingPoint {
            vgs,
            vds,
            vbs,
            mode,
            cdrain,
            cd: mode * cdrain - cbd,
            cbs,
            gbs,
            cbd,
            gbd,
            gm,
            gds,
            gmbs,
            von,
            vdsat,
            limited: false,
        }
    }

    fn stamp_conductances(&self, stamp: &mut Stamper<'_>) -> DeviceResult<()> {
        let op = &self.op;
        let (dd, ss) = op.channel_ends();
        stamp.conductance(dd, ss, op.gds)?;
        stamp.transconductance(dd, ss, G, ss, op.gm)?;
        stamp.transconductance(dd, ss, B, ss, op.gmbs)?;
        stamp.conductance(B, S, op.gbs)?;
        stamp.conductance(B, D, op.gbd)
    }
}

impl Device for Mosfet {
    type Model = MosfetModel;
    const KIND: DeviceKind = DeviceKind::Mosfet;

    fn terminals(&self) -> &'static [&'static str] {
        &["d", "g", "s", "b"]
    }

    fn setup(
        &mut self,
        name: &str,
        model: &MosfetModel,
        _nodes: &mut NodeMapping,
        states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>> {
        for (parameter, value) in [
            ("kp", model.kp),
            ("phi", model.phi),
            ("is", model.is),
            ("w", self.w),
            ("l", self.l),
        ] {
            if !(value > 0.0) {
                return Err(DeviceError::InvalidParameter {
                    instance: name.to_string(),
                    parameter,
                    reason: format!("must be positive, got {value}"),
                });
            }
        }
        if model.gamma < 0.0 || model.lambda < 0.0 {
            return Err(DeviceError::InvalidParameter {
                instance: name.to_string(),
                parameter: "gamma",
                reason: format!("gamma and lambda must not be negative ({}, {})", model.gamma, model.lambda),
            });
        }
        self.qgs = states.allocate(2);
        self.qgd = states.allocate(2);
        self.qgb = states.allocate(2);
        self.op = OperatingPoint {
            von: model.channel.sign() * model.vto,
            ..OperatingPoint::default()
        };
        Ok(vec![self.drain, self.gate, self.source, self.bulk])
    }

    fn topology(&self) -> Vec<(usize, usize)> {
        (0..4).flat_map(|r| (0..4).map(move |c| (r, c))).collect()
    }

    fn load(&mut self, model: &MosfetModel, ckt: &mut CircuitState, stamp: &mut Stamper<'_>) -> DeviceResult<()> {
        let sign = model.channel.sign();
        let (vgs, vds, vbs, limited) = self.next_voltages(model, ckt);
        self.op = OperatingPoint {
            limited,
            ..self.evaluate(model, ckt, vgs, vds, vbs)
        };
        let op = self.op;
        let vbd = vbs - vds;

        self.stamp_conductances(stamp)?;
        let (dd, ss) = op.channel_ends();
        let (vgs_eff, vds_eff, vbs_eff) = if op.mode > 0.0 {
            (vgs, vds, vbs)
        } else {
            (vgs - vds, -vds, vbd)
        };
        let ieq = op.cdrain - op.gm * vgs_eff - op.gds * vds_eff - op.gmbs * vbs_eff;
        stamp.current(dd, ss, sign * ieq);
        stamp.current(B, S, sign * (op.cbs - op.gbs * vbs));
        stamp.current(B, D, sign * (op.cbd - op.gbd * vbd));

        let terminals = [self.drain, self.gate, self.source, self.bulk];
        for (other, cap, q) in self.overlap(model) {
            let v = ckt.voltage_diff(self.gate, terminals[other]);
            ckt.states.set(0, q, cap * v);
            let (geq, ceq) = if ckt.mode == AnalysisMode::Transient {
                ckt.integrate_charge(q, cap)
            } else {
                (0.0, 0.0)
            };
            stamp.conductance(G, other, geq)?;
            stamp.current(G, other, ceq);
        }
        Ok(())
    }

    fn ac_load(&self, model: &MosfetModel, ckt: &CircuitState, stamp: &mut Stamper<'_>) -> DeviceResult<()> {
        self.stamp_conductances(stamp)?;
        for (other, cap, _) in self.overlap(model) {
            stamp.admittance(G, other, Complex64::new(0.0, ckt.omega * cap))?;
        }
        Ok(())
    }

    fn charges(&self) -> Vec<StateSlot> {
        vec![self.qgs, self.qgd, self.qgb]
    }

    fn initial_conditions(&mut self, ckt: &CircuitState) {
        if self.ic_given {
            return;
        }
        self.ic_vds = Some(ckt.voltage_diff(self.drain, self.source));
        self.ic_vgs = Some(ckt.voltage_diff(self.gate, self.source));
        self.ic_vbs = Some(ckt.voltage_diff(self.bulk, self.source));
    }

    fn converged(&self, model: &MosfetModel, ckt: &CircuitState) -> bool {
        let op = &self.op;
        if op.limited {
            return false;
        }
        let (vgs, vds, vbs) = self.terminal_voltages(model, ckt);
        let (dvgs, dvds, dvbs) = (vgs - op.vgs, vds - op.vds, vbs - op.vbs);
        let dvbd = dvbs - dvds;
        let dvgd = dvgs - dvds;

        let cdhat = if op.mode > 0.0 {
            op.cd - op.gbd * dvbd + op.gmbs * dvbs + op.gm * dvgs + op.gds * dvds
        } else {
            op.cd - (op.gbd - op.gmbs) * dvbd - op.gm * dvgd + op.gds * dvds
        };
        let cbulk = op.cbs + op.cbd;
        let cbhat = cbulk + op.gbd * dvbd + op.gbs * dvbs;

        let tol = &ckt.tolerances;
        let close = |old: f64, predicted: f64| {
            (predicted - old).abs() <= tol.reltol * predicted.abs().max(old.abs()) + tol.abstol
        };
        close(op.cd, cdhat) && close(cbulk, cbhat)
    }

    fn terminal_currents(&self, model: &MosfetModel, ckt: &CircuitState) -> Option<Vec<f64>> {
        let sign = model.channel.sign();
        let id = sign * self.op.cd;
        let ib = sign * (self.op.cbs + self.op.cbd);
        let mut currents = vec![id, 0.0, -(id + ib), ib];
        if ckt.mode == AnalysisMode::Transient {
            for (other, _, q) in self.overlap(model) {
                let ccap = ckt.states.get(0, q.offset(1));
                currents[G] += ccap;
                currents[other] -= ccap;
            }
        }
        Some(currents)
    }

    fn query(&self, model: &MosfetModel, ckt: &CircuitState, parameter: &str) -> Option<QueryValue> {
        let sign = model.channel.sign();
        let op = &self.op;
        let value = match parameter {
            "vgs" => sign * op.vgs,
            "vds" => sign * op.vds,
            "vbs" => sign * op.vbs,
            "id" => sign * op.cd,
            "ibs" => sign * op.cbs,
            "ibd" => sign * op.cbd,
            "gm" => op.gm,
            "gds" => op.gds,
            "gmbs" => op.gmbs,
            "gbs" => op.gbs,
            "gbd" => op.gbd,
            "von" => sign * op.von,
            "vdsat" => sign * op.vdsat,
            "qgs" => ckt.states.get(0, self.qgs),
            "qgd" => ckt.states.get(0, self.qgd),
            "qgb" => ckt.states.get(0, self.qgb),
            "mode" => return Some(QueryValue::Integer(op.mode as i64)),
            "off" => return Some(QueryValue::Integer(self.off as i64)),
            "icvds" => return self.ic_vds.map(QueryValue::Real),
            "icvgs" => return self.ic_vgs.map(QueryValue::Real),
            "icvbs" => return self.ic_vbs.map(QueryValue::Real),
            _ => return None,
        };
        Some(QueryValue::Real(value))
    }
}

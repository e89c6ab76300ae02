//! Ebers-Moll BJT (NPN/PNP) with constant junction capacitances.
//!
//! Uses base-emitter/base-collector junctions and alpha gains, then
//! linearizes around the current Newton guess. Local nodes: `[c, b, e]`.
use num_complex::Complex64;

use super::diode::Diode;
use super::limit::{pnjlim, vcrit};
use super::model::{Device, DeviceKind, QueryValue};
use super::stamp::Stamper;
use crate::error::{DeviceError, DeviceResult};
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{AnalysisMode, CircuitState, StateHistory, StateSlot};

const C: usize = 0;
const B: usize = 1;
const E: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BjtPolarity {
    #[default]
    Npn,
    Pnp,
}

impl BjtPolarity {
    /// Return +1 for NPN, -1 for PNP.
    ///
    /// This flips the sign of control voltages and resulting currents to
    /// reuse the same Ebers-Moll equations for both polarities.
    fn sign(self) -> f64 {
        match self {
            BjtPolarity::Npn => 1.0,
            BjtPolarity::Pnp => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BjtModel {
    pub polarity: BjtPolarity,
    /// Saturation current (A).
    pub is: f64,
    /// Forward beta; alpha_f = bf / (bf + 1) couples base and collector currents.
    pub bf: f64,
    /// Reverse beta; alpha_r = br / (br + 1) couples base and emitter currents.
    pub br: f64,
    /// Forward emission coefficient.
    pub nf: f64,
    /// Reverse emission coefficient.
    pub nr: f64,
    /// Base-emitter capacitance (F).
    pub cje: f64,
    /// Base-collector capacitance (F).
    pub cjc: f64,
}

impl Default for BjtModel {
    fn default() -> Self {
        Self {
            polarity: BjtPolarity::Npn,
            is: 1e-14,
            bf: 100.0,
            br: 1.0,
            nf: 1.0,
            nr: 1.0,
            cje: 0.0,
            cjc: 0.0,
        }
    }
}

/// Linearization in the polarity-normalized domain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct OperatingPoint {
    vbe: f64,
    vbc: f64,
    ic: f64,
    ib: f64,
    /// ∂Ic/∂vBE
    g_c_be: f64,
    /// ∂Ic/∂vBC
    g_c_bc: f64,
    /// ∂Ib/∂vBE
    g_b_be: f64,
    /// ∂Ib/∂vBC
    g_b_bc: f64,
    limited: bool,
}

impl OperatingPoint {
    /// Node-domain Jacobian, rows and columns in `[c, b, e]` order.
    ///
    /// v_BE = Vb - Ve and v_BC = Vb - Vc, so by the chain rule
    /// ∂I/∂Vb = g_be + g_bc, ∂I/∂Vc = -g_bc, ∂I/∂Ve = -g_be.
    /// The polarity sign appears once on the voltage and once on the
    /// current, so it cancels here. The emitter row follows from KCL.
    fn jacobian(&self) -> [[f64; 3]; 3] {
        let row = |g_be: f64, g_bc: f64| [-g_bc, g_be + g_bc, -g_be];
        let c = row(self.g_c_be, self.g_c_bc);
        let b = row(self.g_b_be, self.g_b_bc);
        let e = [-(c[0] + b[0]), -(c[1] + b[1]), -(c[2] + b[2])];
        [c, b, e]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bjt {
    pub collector: NodeIndex,
    pub base: NodeIndex,
    pub emitter: NodeIndex,
    pub area: f64,
    /// start with both junctions at zero instead of the critical voltage
    pub off: bool,
    /// Initial Vbe and Vce; re-derived from the operating point unless given
    /// through [`with_ic`](Self::with_ic).
    pub ic_vbe: Option<f64>,
    pub ic_vce: Option<f64>,
    ic_given: bool,
    qbe: StateSlot,
    qbc: StateSlot,
    op: OperatingPoint,
}

impl Bjt {
    pub fn new(collector: NodeIndex, base: NodeIndex, emitter: NodeIndex) -> Self {
        Self {
            collector,
            base,
            emitter,
            area: 1.0,
            off: false,
            ic_vbe: None,
            ic_vce: None,
            ic_given: false,
            qbe: StateSlot(0),
            qbc: StateSlot(0),
            op: OperatingPoint::default(),
        }
    }

    pub fn with_ic(mut self, vbe: f64, vce: f64) -> Self {
        self.ic_vbe = Some(vbe);
        self.ic_vce = Some(vce);
        self.ic_given = true;
        self
    }

    /// Ebers-Moll terminal currents at normalized junction voltages.
    ///
    ///   i_c0 =  αF * i_F  -  i_R
    ///   i_b0 = (1-αF)*i_F + (1-αR)*i_R
    ///   i_e0 =  -i_F      +  αR * i_R
    fn linearize(&self, model: &BjtModel, ckt: &CircuitState, vbe: f64, vbc: f64) -> OperatingPoint {
        let vt = ckt.tolerances.thermal_voltage();
        let is = model.is * self.area;
        let gmin = ckt.tolerances.gmin;
        let (i_f, g_f) = Diode::junction(is, model.nf * vt, gmin, vbe);
        let (i_r, g_r) = Diode::junction(is, model.nr * vt, gmin, vbc);

        let alpha_f = model.bf / (model.bf + 1.0);
        let alpha_r = model.br / (model.br + 1.0);

        OperatingPoint {
            vbe,
            vbc,
            ic: alpha_f * i_f - i_r,
            ib: (1.0 - alpha_f) * i_f + (1.0 - alpha_r) * i_r,
            g_c_be: alpha_f * g_f,
            g_c_bc: -g_r,
            g_b_be: (1.0 - alpha_f) * g_f,
            g_b_bc: (1.0 - alpha_r) * g_r,
            limited: false,
        }
    }

    fn junction_voltages(&self, model: &BjtModel, ckt: &CircuitState) -> (f64, f64) {
        let sign = model.polarity.sign();
        (
            sign * ckt.voltage_diff(self.base, self.emitter),
            sign * ckt.voltage_diff(self.base, self.collector),
        )
    }

    fn invalid(name: &str, parameter: &'static str, value: f64) -> DeviceError {
        DeviceError::InvalidParameter {
            instance: name.to_string(),
            parameter,
            reason: format!("must be positive, got {value}"),
        }
    }
}

impl Device for Bjt {
    type Model = BjtModel;
    const KIND: DeviceKind = DeviceKind::Bjt;

    fn terminals(&self) -> &'static [&'static str] {
        &["c", "b", "e"]
    }

    fn setup(
        &mut self,
        name: &str,
        model: &BjtModel,
        _nodes: &mut NodeMapping,
        states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>> {
        for (parameter, value) in [
            ("is", model.is),
            ("bf", model.bf),
            ("br", model.br),
            ("nf", model.nf),
            ("nr", model.nr),
            ("area", self.area),
        ] {
            if !(value > 0.0) {
                return Err(Self::invalid(name, parameter, value));
            }
        }
        if model.cje < 0.0 || model.cjc < 0.0 {
            return Err(DeviceError::InvalidParameter {
                instance: name.to_string(),
                parameter: "cje",
                reason: format!("capacitances must not be negative (cje={}, cjc={})", model.cje, model.cjc),
            });
        }
        self.qbe = states.allocate(2);
        self.qbc = states.allocate(2);
        self.op = OperatingPoint::default();
        Ok(vec![self.collector, self.base, self.emitter])
    }

    fn topology(&self) -> Vec<(usize, usize)> {
        (0..3).flat_map(|r| (0..3).map(move |c| (r, c))).collect()
    }

    fn load(&mut self, model: &BjtModel, ckt: &mut CircuitState, stamp: &mut Stamper<'_>) -> DeviceResult<()> {
        let sign = model.polarity.sign();
        let vt = ckt.tolerances.thermal_voltage();
        let is = model.is * self.area;
        let (vte, vtc) = (model.nf * vt, model.nr * vt);

        let (vbe, vbc, limited) = if ckt.init_junction {
            let vbe = if self.off { 0.0 } else { vcrit(vte, is) };
            (vbe, 0.0, false)
        } else if ckt.initial_transient && ckt.use_initial_conditions {
            let vbe = sign * self.ic_vbe.unwrap_or(0.0);
            let vce = sign * self.ic_vce.unwrap_or(0.0);
            (vbe, vbe - vce, false)
        } else {
            let (vbe, vbc) = self.junction_voltages(model, ckt);
            let (vbe, be_limited) = pnjlim(vbe, self.op.vbe, vte, vcrit(vte, is));
            let (vbc, bc_limited) = pnjlim(vbc, self.op.vbc, vtc, vcrit(vtc, is));
            (vbe, vbc, be_limited || bc_limited)
        };

        self.op = OperatingPoint {
            limited,
            ..self.linearize(model, ckt, vbe, vbc)
        };

        let jac = self.op.jacobian();
        let (vbe_node, vbc_node) = (sign * vbe, sign * vbc);
        let currents = [sign * self.op.ic, sign * self.op.ib, -sign * (self.op.ic + self.op.ib)];
        for (r, row) in jac.iter().enumerate() {
            for (c, &g) in row.iter().enumerate() {
                stamp.add(r, c, g)?;
            }
            // ∂I/∂vBE and ∂I/∂vBC recovered from the node-domain row
            let (g_be, g_bc) = (-row[E], -row[C]);
            stamp.add_rhs(r, -(currents[r] - g_be * vbe_node - g_bc * vbc_node));
        }

        let cje = model.cje * self.area;
        let cjc = model.cjc * self.area;
        ckt.states.set(0, self.qbe, cje * vbe_node);
        ckt.states.set(0, self.qbc, cjc * vbc_node);
        let ((gbe, cbe), (gbc, cbc)) = if ckt.mode == AnalysisMode::Transient {
            (ckt.integrate_charge(self.qbe, cje), ckt.integrate_charge(self.qbc, cjc))
        } else {
            ((0.0, 0.0), (0.0, 0.0))
        };
        stamp.conductance(B, E, gbe)?;
        stamp.current(B, E, cbe);
        stamp.conductance(B, C, gbc)?;
        stamp.current(B, C, cbc);
        Ok(())
    }

    fn ac_load(&self, model: &BjtModel, ckt: &CircuitState, stamp: &mut Stamper<'_>) -> DeviceResult<()> {
        for (r, row) in self.op.jacobian().iter().enumerate() {
            for (c, &g) in row.iter().enumerate() {
                stamp.add(r, c, g)?;
            }
        }
        let omega = ckt.omega * self.area;
        stamp.admittance(B, E, Complex64::new(0.0, omega * model.cje))?;
        stamp.admittance(B, C, Complex64::new(0.0, omega * model.cjc))
    }

    fn charges(&self) -> Vec<StateSlot> {
        vec![self.qbe, self.qbc]
    }

    fn initial_conditions(&mut self, ckt: &CircuitState) {
        if self.ic_given {
            return;
        }
        self.ic_vbe = Some(ckt.voltage_diff(self.base, self.emitter));
        self.ic_vce = Some(ckt.voltage_diff(self.collector, self.emitter));
    }

    fn converged(&self, model: &BjtModel, ckt: &CircuitState) -> bool {
        if self.op.limited {
            return false;
        }
        let (vbe, vbc) = self.junction_voltages(model, ckt);
        let (dvbe, dvbc) = (vbe - self.op.vbe, vbc - self.op.vbc);
        let tol = &ckt.tolerances;
        let close = |old: f64, predicted: f64| {
            (predicted - old).abs() <= tol.reltol * predicted.abs().max(old.abs()) + tol.abstol
        };
        let ic_hat = self.op.ic + self.op.g_c_be * dvbe + self.op.g_c_bc * dvbc;
        let ib_hat = self.op.ib + self.op.g_b_be * dvbe + self.op.g_b_bc * dvbc;
        close(self.op.ic, ic_hat) && close(self.op.ib, ib_hat)
    }

    fn terminal_currents(&self, model: &BjtModel, ckt: &CircuitState) -> Option<Vec<f64>> {
        let sign = model.polarity.sign();
        let mut currents = vec![
            sign * self.op.ic,
            sign * self.op.ib,
            -sign * (self.op.ic + self.op.ib),
        ];
        if ckt.mode == AnalysisMode::Transient {
            for (other, q) in [(E, self.qbe), (C, self.qbc)] {
                let ccap = ckt.states.get(0, q.offset(1));
                currents[B] += ccap;
                currents[other] -= ccap;
            }
        }
        Some(currents)
    }

    fn query(&self, model: &BjtModel, ckt: &CircuitState, parameter: &str) -> Option<QueryValue> {
        let sign = model.polarity.sign();
        let value = match parameter {
            "vbe" => sign * self.op.vbe,
            "vbc" => sign * self.op.vbc,
            "vce" => sign * (self.op.vbe - self.op.vbc),
            "ic" => sign * self.op.ic,
            "ib" => sign * self.op.ib,
            "ie" => -sign * (self.op.ic + self.op.ib),
            "gm" => self.op.g_c_be,
            "gpi" => self.op.g_b_be,
            "qbe" => ckt.states.get(0, self.qbe),
            "qbc" => ckt.states.get(0, self.qbc),
            "off" => return Some(QueryValue::Integer(self.off as i64)),
            "icvbe" => return self.ic_vbe.map(QueryValue::Real),
            "icvce" => return self.ic_vce.map(QueryValue::Real),
            _ => return None,
        };
        Some(QueryValue::Real(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatrixLayout;
    use crate::devices::testing::Bench;
    use crate::devices::{Devices, Model};
    use rstest::rstest;

    const COL: NodeIndex = NodeIndex(1);
    const BASE: NodeIndex = NodeIndex(2);

    /// Grounded-emitter transistor with collector and base nodes.
    fn common_emitter(model: BjtModel, bjt: Bjt) -> Bench {
        let mut devices = Devices::new(MatrixLayout::Sparse);
        devices.node("c");
        devices.node("b");
        devices.add_model(Model::new("qmod", model).with_instance("Q1", bjt));
        Bench::new(devices)
    }

    fn transistor() -> Bjt {
        Bjt::new(COL, BASE, NodeIndex::GROUND)
    }

    fn bias(bench: &mut Bench, sign: f64) {
        bench.set(COL, sign * 5.0);
        bench.set(BASE, sign * 0.65);
        bench.load();
    }

    #[test]
    fn forward_active_gain_is_beta() {
        let mut bench = common_emitter(BjtModel::default(), transistor());
        bias(&mut bench, 1.0);
        let ic = bench.real("Q1", "ic");
        let ib = bench.real("Q1", "ib");
        assert!(ic > 0.0 && ib > 0.0);
        assert!((ic / ib - 100.0).abs() < 1e-2, "{}", ic / ib);
        assert!(bench.devices.converged(&bench.ckt));
    }

    #[rstest]
    #[case::npn(BjtPolarity::Npn, 1.0)]
    #[case::pnp(BjtPolarity::Pnp, -1.0)]
    fn terminal_currents_match_model(#[case] polarity: BjtPolarity, #[case] sign: f64) {
        let model = BjtModel {
            polarity,
            ..BjtModel::default()
        };
        let mut bench = common_emitter(model, transistor());
        bias(&mut bench, sign);

        let ic = bench.real("Q1", "ic");
        let ib = bench.real("Q1", "ib");
        assert_eq!(ic.signum(), sign);
        // the linearized stamp reproduces the model currents at its own point
        assert!((bench.real("Q1", "i(c)") - ic).abs() <= 1e-9 * ic.abs());
        assert!((bench.real("Q1", "i(b)") - ib).abs() <= 1e-9 * ib.abs());
        let ie = bench.real("Q1", "i(e)");
        assert!((ie - bench.real("Q1", "ie")).abs() <= 1e-9 * ie.abs());
        assert!((ic + ib + ie).abs() <= 1e-12 * ic.abs());
    }

    #[test]
    fn collector_and_emitter_on_ground_use_model_currents() {
        let bjt = Bjt::new(NodeIndex::GROUND, BASE, NodeIndex::GROUND);
        let mut bench = common_emitter(BjtModel::default(), bjt);
        bias(&mut bench, 1.0);

        let (ic, ib, ie) = (bench.real("Q1", "ic"), bench.real("Q1", "ib"), bench.real("Q1", "ie"));
        assert_eq!(bench.real("Q1", "i(c)"), ic);
        assert_eq!(bench.real("Q1", "i(e)"), ie);
        assert!((bench.real("Q1", "i(b)") - ib).abs() <= 1e-9 * ib.abs());
        assert!((ic + ib + ie).abs() <= 1e-12 * ib.abs());
    }

    #[test]
    fn jacobian_rows_and_columns_sum_to_zero() {
        let bench = common_emitter(BjtModel::default(), transistor());
        let bjt = transistor();
        let jac = bjt.linearize(&BjtModel::default(), &bench.ckt, 0.7, 0.5).jacobian();
        for r in 0..3 {
            let scale = jac[r][r].abs();
            let row: f64 = jac[r].iter().sum();
            let col: f64 = (0..3).map(|k| jac[k][r]).sum();
            assert!(row.abs() <= 1e-12 * scale, "row {r}");
            assert!(col.abs() <= 1e-12 * scale, "col {r}");
        }
    }

    #[test]
    fn large_step_is_limited() {
        let mut bench = common_emitter(BjtModel::default(), transistor());
        bench.set(COL, 5.0);
        bench.set(BASE, 3.0);
        bench.load();
        assert!(bench.real("Q1", "vbe") < 1.0);
        assert!(!bench.devices.converged(&bench.ckt));
    }

    #[test]
    fn init_junction_starts_at_critical_voltage() {
        let mut bench = common_emitter(BjtModel::default(), transistor());
        bench.ckt.init_junction = true;
        bench.load();
        let vt = bench.ckt.tolerances.thermal_voltage();
        assert_eq!(bench.real("Q1", "vbe"), vcrit(vt, 1e-14));
        assert_eq!(bench.real("Q1", "vbc"), 0.0);
    }

    #[test]
    fn capacitances_share_topology_and_open_at_dc() {
        let model = BjtModel {
            cje: 1e-12,
            cjc: 0.5e-12,
            ..BjtModel::default()
        };
        let mut bench = common_emitter(model, transistor());
        bench.set(COL, 2.0);
        bench.set(BASE, 0.6);
        let (dc, ac) = bench.touched_by_both_passes();
        assert_eq!(dc, ac);
        insta::assert_snapshot!(format!("{dc:?}"), @"[(0, 0), (0, 1), (1, 0), (1, 1)]");
        assert!((bench.real("Q1", "qbe") - 0.6e-12).abs() < 1e-24);
        assert!((bench.real("Q1", "qbc") + 0.7e-12).abs() < 1e-24);
    }

    #[test]
    fn ac_adds_junction_susceptance() {
        let model = BjtModel {
            cje: 1e-12,
            ..BjtModel::default()
        };
        let mut bench = common_emitter(model, transistor());
        bias(&mut bench, 1.0);
        let dc = bench.mna.get(1, 1).re;
        bench.ac_load(1e9);
        let y = bench.mna.get(1, 1);
        assert!((y.re - dc).abs() <= 1e-12 * dc);
        assert!((y.im - 1e-3).abs() < 1e-15);
    }

    #[test]
    fn user_initial_conditions_are_kept() {
        let mut bench = common_emitter(BjtModel::default(), transistor().with_ic(0.7, 1.0));
        bench.set(COL, 3.0);
        bench.set(BASE, 0.6);
        bench.devices.initial_conditions(&bench.ckt);
        assert_eq!(bench.real("Q1", "icvbe"), 0.7);
        assert_eq!(bench.real("Q1", "icvce"), 1.0);

        let mut unset = common_emitter(BjtModel::default(), transistor());
        unset.set(COL, 3.0);
        unset.set(BASE, 0.6);
        unset.devices.initial_conditions(&unset.ckt);
        assert_eq!(unset.real("Q1", "icvce"), 3.0);

        // derived values are refreshed at the next analysis start, given ones are not
        unset.set(COL, 4.0);
        unset.devices.initial_conditions(&unset.ckt);
        assert_eq!(unset.real("Q1", "icvce"), 4.0);
        bench.set(COL, 4.0);
        bench.devices.initial_conditions(&bench.ckt);
        assert_eq!(bench.real("Q1", "icvce"), 1.0);
    }

    #[test]
    fn rejects_non_positive_beta() {
        let mut devices = Devices::new(MatrixLayout::Dense);
        let c = devices.node("c");
        let b = devices.node("b");
        devices.add_model(
            Model::new("qmod", BjtModel { bf: 0.0, ..BjtModel::default() })
                .with_instance("Q1", Bjt::new(c, b, NodeIndex::GROUND)),
        );
        let mut ckt = CircuitState::new(Default::default(), Default::default());
        assert!(matches!(
            devices.setup(&mut ckt),
            Err(DeviceError::InvalidParameter { parameter: "bf", .. })
        ));
    }
}

//! Independent voltage and current sources.
use std::f64::consts::PI;

use num_complex::Complex64;

use super::model::{Device, DeviceKind, QueryValue};
use super::stamp::Stamper;
use crate::error::DeviceResult;
use crate::nodes::{NodeIndex, NodeMapping};
use crate::state::{AnalysisMode, CircuitState, StateHistory};

/// Time-domain value of an independent source.
#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    Dc(f64),
    Pulse {
        v1: f64,
        v2: f64,
        delay: f64,
        rise: f64,
        fall: f64,
        width: f64,
        period: f64,
    },
    Sin {
        offset: f64,
        amplitude: f64,
        frequency: f64,
        delay: f64,
        damping: f64,
    },
}

impl Waveform {
    pub fn value(&self, time: f64) -> f64 {
        match *self {
            Waveform::Dc(v) => v,
            Waveform::Pulse {
                v1,
                v2,
                delay,
                rise,
                fall,
                width,
                period,
            } => {
                let mut t = time - delay;
                if t < 0.0 {
                    return v1;
                }
                if period > 0.0 {
                    t %= period;
                }
                if t < rise {
                    v1 + (v2 - v1) * t / rise
                } else if t < rise + width {
                    v2
                } else if t < rise + width + fall {
                    v2 + (v1 - v2) * (t - rise - width) / fall
                } else {
                    v1
                }
            }
            Waveform::Sin {
                offset,
                amplitude,
                frequency,
                delay,
                damping,
            } => {
                let t = time - delay;
                if t <= 0.0 {
                    offset
                } else {
                    offset + amplitude * (2.0 * PI * frequency * t).sin() * (-t * damping).exp()
                }
            }
        }
    }

    /// Value used for DC and operating-point analyses.
    pub fn dc_value(&self) -> f64 {
        self.value(0.0)
    }
}

/// Independent sources have no shared model parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SourceModel;

fn present_value(waveform: &Waveform, ckt: &CircuitState) -> f64 {
    match ckt.mode {
        AnalysisMode::Transient => waveform.value(ckt.time),
        _ => waveform.dc_value(),
    }
}

/// Local nodes: `[p, n, branch]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageSource {
    pub positive: NodeIndex,
    pub negative: NodeIndex,
    pub waveform: Waveform,
    /// small-signal magnitude
    pub ac_magnitude: f64,
    /// small-signal phase (degrees)
    pub ac_phase: f64,
    branch: NodeIndex,
}

impl VoltageSource {
    pub fn new(positive: NodeIndex, negative: NodeIndex, dc: f64) -> Self {
        Self {
            positive,
            negative,
            waveform: Waveform::Dc(dc),
            ac_magnitude: 0.0,
            ac_phase: 0.0,
            branch: NodeIndex::GROUND,
        }
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    pub fn with_ac(mut self, magnitude: f64, phase: f64) -> Self {
        self.ac_magnitude = magnitude;
        self.ac_phase = phase;
        self
    }

    pub fn branch(&self) -> NodeIndex {
        self.branch
    }

    /// Stamp the B / B^T incidence entries for a voltage-defined element.
    fn stamp_incidence(stamp: &mut Stamper<'_>) -> DeviceResult<()> {
        stamp.add(0, 2, 1.0)?;
        stamp.add(1, 2, -1.0)?;
        stamp.add(2, 0, 1.0)?;
        stamp.add(2, 1, -1.0)
    }
}

impl Device for VoltageSource {
    type Model = SourceModel;
    const KIND: DeviceKind = DeviceKind::VoltageSource;

    fn terminals(&self) -> &'static [&'static str] {
        &["p", "n"]
    }

    fn setup(
        &mut self,
        name: &str,
        _model: &SourceModel,
        nodes: &mut NodeMapping,
        _states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>> {
        self.branch = nodes.branch(name);
        Ok(vec![self.positive, self.negative, self.branch])
    }

    fn topology(&self) -> Vec<(usize, usize)> {
        vec![(0, 2), (1, 2), (2, 0), (2, 1)]
    }

    fn load(
        &mut self,
        _model: &SourceModel,
        ckt: &mut CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        Self::stamp_incidence(stamp)?;
        stamp.add_rhs(2, present_value(&self.waveform, ckt));
        Ok(())
    }

    fn ac_load(
        &self,
        _model: &SourceModel,
        _ckt: &CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        Self::stamp_incidence(stamp)?;
        stamp.add_rhs_complex(
            2,
            Complex64::from_polar(self.ac_magnitude, self.ac_phase.to_radians()),
        );
        Ok(())
    }

    fn query(&self, _model: &SourceModel, ckt: &CircuitState, parameter: &str) -> Option<QueryValue> {
        let v = present_value(&self.waveform, ckt);
        let i = ckt.voltage(self.branch);
        match parameter {
            "v" | "dc" => Some(QueryValue::Real(v)),
            "i" => Some(QueryValue::Real(i)),
            "p" => Some(QueryValue::Real(v * i)),
            "acmag" => Some(QueryValue::Real(self.ac_magnitude)),
            "acphase" => Some(QueryValue::Real(self.ac_phase)),
            _ => None,
        }
    }
}

/// Current flows from `positive` through the source to `negative`.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentSource {
    pub positive: NodeIndex,
    pub negative: NodeIndex,
    pub waveform: Waveform,
    pub ac_magnitude: f64,
    pub ac_phase: f64,
}

impl CurrentSource {
    pub fn new(positive: NodeIndex, negative: NodeIndex, dc: f64) -> Self {
        Self {
            positive,
            negative,
            waveform: Waveform::Dc(dc),
            ac_magnitude: 0.0,
            ac_phase: 0.0,
        }
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    pub fn with_ac(mut self, magnitude: f64, phase: f64) -> Self {
        self.ac_magnitude = magnitude;
        self.ac_phase = phase;
        self
    }
}

impl Device for CurrentSource {
    type Model = SourceModel;
    const KIND: DeviceKind = DeviceKind::CurrentSource;

    fn terminals(&self) -> &'static [&'static str] {
        &["p", "n"]
    }

    fn setup(
        &mut self,
        _name: &str,
        _model: &SourceModel,
        _nodes: &mut NodeMapping,
        _states: &mut StateHistory,
    ) -> DeviceResult<Vec<NodeIndex>> {
        Ok(vec![self.positive, self.negative])
    }

    fn topology(&self) -> Vec<(usize, usize)> {
        Vec::new()
    }

    fn load(
        &mut self,
        _model: &SourceModel,
        ckt: &mut CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        stamp.current(0, 1, present_value(&self.waveform, ckt));
        Ok(())
    }

    fn ac_load(
        &self,
        _model: &SourceModel,
        _ckt: &CircuitState,
        stamp: &mut Stamper<'_>,
    ) -> DeviceResult<()> {
        let phasor = Complex64::from_polar(self.ac_magnitude, self.ac_phase.to_radians());
        stamp.add_rhs_complex(0, -phasor);
        stamp.add_rhs_complex(1, phasor);
        Ok(())
    }

    fn query(&self, _model: &SourceModel, ckt: &CircuitState, parameter: &str) -> Option<QueryValue> {
        let i = present_value(&self.waveform, ckt);
        let v = ckt.voltage_diff(self.positive, self.negative);
        match parameter {
            "i" | "dc" => Some(QueryValue::Real(i)),
            "v" => Some(QueryValue::Real(v)),
            "p" => Some(QueryValue::Real(v * i)),
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
    use rstest::rstest;

    const A: NodeIndex = NodeIndex(1);

    fn pulse() -> Waveform {
        Waveform::Pulse {
            v1: 0.0,
            v2: 5.0,
            delay: 1.0,
            rise: 1.0,
            fall: 2.0,
            width: 3.0,
            period: 10.0,
        }
    }

    #[rstest]
    #[case(0.5, 0.0)]
    #[case(1.5, 2.5)]
    #[case(4.0, 5.0)]
    #[case(6.0, 2.5)]
    #[case(8.0, 0.0)]
    #[case(11.5, 2.5)]
    fn pulse_shape(#[case] time: f64, #[case] expected: f64) {
        assert!((pulse().value(time) - expected).abs() < 1e-12);
    }

    #[test]
    fn sine_starts_at_offset() {
        let sin = Waveform::Sin {
            offset: 1.0,
            amplitude: 2.0,
            frequency: 1.0,
            delay: 0.0,
            damping: 0.0,
        };
        assert_eq!(sin.dc_value(), 1.0);
        assert!((sin.value(0.25) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn voltage_source_stamps_incidence() {
        let mut devices = Devices::new(MatrixLayout::Sparse);
        let a = devices.node("a");
        devices.add_model(
            Model::new("v", SourceModel).with_instance("V1", VoltageSource::new(a, NodeIndex::GROUND, 3.3)),
        );
        let mut bench = Bench::new(devices);
        bench.load();

        let (m, _) = bench.mna.to_dense();
        assert_eq!(m[[0, 1]], 1.0);
        assert_eq!(m[[1, 0]], 1.0);
        assert_eq!(bench.mna.rhs(), vec![0.0, 3.3]);

        // branch current -2 mA: the source delivers 2 mA out of its positive terminal
        bench.ckt.solution[2] = -2e-3;
        assert_eq!(bench.real("V1", "i(p)"), -2e-3);
        assert_eq!(bench.real("V1", "i(n)"), 2e-3);
    }

    #[test]
    fn voltage_source_follows_waveform_in_transient() {
        let mut devices = Devices::new(MatrixLayout::Dense);
        let a = devices.node("a");
        devices.add_model(
            Model::new("v", SourceModel)
                .with_instance("V1", VoltageSource::new(a, NodeIndex::GROUND, 0.0).with_waveform(pulse())),
        );
        let mut bench = Bench::new(devices);
        bench.ckt.mode = AnalysisMode::Transient;
        bench.ckt.time = 4.0;
        bench.load();
        assert_eq!(bench.mna.rhs()[1], 5.0);
        assert_eq!(bench.real("V1", "v"), 5.0);
    }

    #[test]
    fn ac_phasor() {
        let mut devices = Devices::new(MatrixLayout::Sparse);
        let a = devices.node("a");
        devices.add_model(
            Model::new("v", SourceModel)
                .with_instance("V1", VoltageSource::new(a, NodeIndex::GROUND, 1.0).with_ac(2.0, 90.0)),
        );
        let mut bench = Bench::new(devices);
        let (dc, ac) = bench.touched_by_both_passes();
        assert_eq!(dc, ac);
        assert!(bench.mna.rhs()[1].abs() < 1e-15);
        assert!((bench.mna.rhs_imag()[1] - 2.0).abs() < 1e-15);
    }

    #[test]
    fn current_source_drives_rhs() {
        let mut devices = Devices::new(MatrixLayout::Sparse);
        let a = devices.node("a");
        let b = devices.node("b");
        devices.add_model(Model::new("i", SourceModel).with_instance("I1", CurrentSource::new(a, b, 1e-3)));
        let mut bench = Bench::new(devices);
        let (dc, ac) = bench.touched_by_both_passes();
        assert!(dc.is_empty() && ac.is_empty());

        bench.load();
        assert_eq!(bench.mna.rhs(), vec![-1e-3, 1e-3]);
        assert_eq!(bench.real("I1", "i(p)"), 1e-3);
        assert_eq!(bench.real("I1", "i(n)"), -1e-3);
    }
}

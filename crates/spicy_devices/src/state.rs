//! Circuit state consumed by every device call: the last solution, the charge/flux
//! history across time points, integration coefficients and analysis flags.
use num_complex::Complex64;

use crate::config::{IntegrationMethod, Tolerances};
use crate::nodes::NodeIndex;

/// Highest integration order supported (Gear).
pub const MAX_ORDER: usize = 6;
/// Number of state vectors kept: ages `0..=MAX_ORDER + 1`.
const HISTORY: usize = MAX_ORDER + 2;

const TRAP_FACTORS: [f64; 2] = [0.5, 0.083_333_333_3];
const GEAR_FACTORS: [f64; MAX_ORDER] = [
    0.5,
    0.222_222_222_2,
    0.136_363_636_4,
    0.096,
    0.072_992_700_73,
    0.058_309_037_90,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisMode {
    #[default]
    Dc,
    Transient,
    Ac,
}

/// Position of a persisted scalar in the state vectors.
///
/// Charge elements allocate two consecutive slots: the charge and its current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateSlot(pub(crate) usize);

impl StateSlot {
    pub fn offset(self, by: usize) -> StateSlot {
        StateSlot(self.0 + by)
    }
}

/// Rotating state vectors; age 0 is the time point being solved, age 1 the last
/// accepted one, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct StateHistory {
    vectors: Vec<Vec<f64>>,
}

impl Default for StateHistory {
    fn default() -> Self {
        Self {
            vectors: vec![Vec::new(); HISTORY],
        }
    }
}

impl StateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` consecutive slots and return the first.
    pub fn allocate(&mut self, count: usize) -> StateSlot {
        let first = self.len();
        for v in &mut self.vectors {
            v.resize(first + count, 0.0);
        }
        StateSlot(first)
    }

    pub fn len(&self) -> usize {
        self.vectors[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, age: usize, slot: StateSlot) -> f64 {
        self.vectors[age][slot.0]
    }

    pub fn set(&mut self, age: usize, slot: StateSlot, value: f64) {
        self.vectors[age][slot.0] = value;
    }

    /// Copy age 0 into age 1; used on the first transient time point so the
    /// integration formula sees a flat history.
    pub fn seed(&mut self, slot: StateSlot) {
        let value = self.vectors[0][slot.0];
        self.vectors[1][slot.0] = value;
    }

    /// Shift every vector one age back after an accepted time point. Age 0 starts
    /// as a copy of the accepted values.
    pub fn rotate(&mut self) {
        self.vectors.rotate_right(1);
        let (current, older) = self.vectors.split_at_mut(1);
        current[0].copy_from_slice(&older[0]);
    }
}

/// Integration formula coefficients (`ag`) for the current step and order.
#[derive(Debug, Clone, PartialEq)]
pub struct Integrator {
    pub method: IntegrationMethod,
    pub order: usize,
    /// step being taken
    pub delta: f64,
    /// `delta_old[0]` is the current step, `delta_old[1]` the previous one, ...
    pub delta_old: [f64; MAX_ORDER + 2],
    pub ag: [f64; MAX_ORDER + 1],
}

impl Integrator {
    pub fn new(method: IntegrationMethod) -> Self {
        Self {
            method,
            order: 1,
            delta: 0.0,
            delta_old: [0.0; MAX_ORDER + 2],
            ag: [0.0; MAX_ORDER + 1],
        }
    }

    /// Highest order `method` supports.
    pub fn max_order(&self) -> usize {
        match self.method {
            IntegrationMethod::Trapezoidal => 2,
            IntegrationMethod::Gear => MAX_ORDER,
        }
    }

    /// Push a new step onto the step history and recompute the coefficients.
    pub fn set_step(&mut self, delta: f64, order: usize) {
        self.delta_old.rotate_right(1);
        self.delta_old[0] = delta;
        self.delta = delta;
        self.order = order.clamp(1, self.max_order());
        self.compute_coefficients();
    }

    fn compute_coefficients(&mut self) {
        self.ag = [0.0; MAX_ORDER + 1];
        if self.delta <= 0.0 {
            return;
        }
        match self.method {
            IntegrationMethod::Trapezoidal => match self.order {
                1 => {
                    self.ag[0] = 1.0 / self.delta;
                    self.ag[1] = -1.0 / self.delta;
                }
                _ => {
                    let xmu = 0.5;
                    self.ag[0] = 1.0 / self.delta / (1.0 - xmu);
                    self.ag[1] = xmu / (1.0 - xmu);
                }
            },
            IntegrationMethod::Gear => self.gear_coefficients(),
        }
    }

    // Solves the (order+1)² Vandermonde-like system relating past charges to dq/dt.
    fn gear_coefficients(&mut self) {
        let n = self.order + 1;
        let mut mat = [[0.0f64; MAX_ORDER + 1]; MAX_ORDER + 1];
        let mut rhs = [0.0f64; MAX_ORDER + 1];
        rhs[1] = -1.0 / self.delta;

        for cell in mat[0].iter_mut().take(n) {
            *cell = 1.0;
        }
        let mut arg = 0.0;
        for i in 1..n {
            arg += self.delta_old[i - 1];
            let mut arg1 = 1.0;
            for row in mat.iter_mut().take(n).skip(1) {
                arg1 *= arg / self.delta;
                row[i] = arg1;
            }
        }

        // gaussian elimination with partial pivoting
        for k in 0..n {
            let pivot = (k..n)
                .max_by(|&a, &b| mat[a][k].abs().total_cmp(&mat[b][k].abs()))
                .unwrap_or(k);
            mat.swap(k, pivot);
            rhs.swap(k, pivot);
            let diag = mat[k][k];
            if diag == 0.0 {
                return;
            }
            for r in (k + 1)..n {
                let f = mat[r][k] / diag;
                for c in k..n {
                    mat[r][c] -= f * mat[k][c];
                }
                rhs[r] -= f * rhs[k];
            }
        }
        for k in (0..n).rev() {
            let mut acc = rhs[k];
            for c in (k + 1)..n {
                acc -= mat[k][c] * self.ag[c];
            }
            self.ag[k] = acc / mat[k][k];
        }
    }

    /// Current through the charge at `q` (written into slot `q + 1` at age 0).
    pub fn integrate(&self, states: &mut StateHistory, q: StateSlot) -> f64 {
        let ccap = match self.method {
            IntegrationMethod::Trapezoidal => match self.order {
                1 => self.ag[0] * states.get(0, q) + self.ag[1] * states.get(1, q),
                _ => {
                    -states.get(1, q.offset(1)) * self.ag[1]
                        + self.ag[0] * (states.get(0, q) - states.get(1, q))
                }
            },
            IntegrationMethod::Gear => (0..=self.order)
                .map(|age| self.ag[age] * states.get(age, q))
                .sum(),
        };
        states.set(0, q.offset(1), ccap);
        ccap
    }

    fn truncation_factor(&self) -> f64 {
        match self.method {
            IntegrationMethod::Trapezoidal => TRAP_FACTORS[self.order.clamp(1, 2) - 1],
            IntegrationMethod::Gear => GEAR_FACTORS[self.order.clamp(1, MAX_ORDER) - 1],
        }
    }
}

/// Everything a device reads (and the state history it writes) during a call.
///
/// Solution vectors are indexed by [`NodeIndex`]; slot 0 is ground.
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub mode: AnalysisMode,
    /// junction voltages start from their initial guesses instead of the solution
    pub init_junction: bool,
    /// first time point of a transient run
    pub initial_transient: bool,
    /// use device initial conditions instead of an operating point
    pub use_initial_conditions: bool,
    pub tolerances: Tolerances,
    pub solution: Vec<f64>,
    pub solution_imag: Vec<f64>,
    /// angular frequency of the AC point
    pub omega: f64,
    pub time: f64,
    pub states: StateHistory,
    pub integrator: Integrator,
}

impl CircuitState {
    pub fn new(tolerances: Tolerances, method: IntegrationMethod) -> Self {
        Self {
            mode: AnalysisMode::Dc,
            init_junction: false,
            initial_transient: false,
            use_initial_conditions: false,
            tolerances,
            solution: Vec::new(),
            solution_imag: Vec::new(),
            omega: 0.0,
            time: 0.0,
            states: StateHistory::new(),
            integrator: Integrator::new(method),
        }
    }

    /// Size the solution vectors for `unknowns` unknowns plus the ground slot.
    pub fn resize(&mut self, unknowns: usize) {
        self.solution.resize(unknowns + 1, 0.0);
        self.solution_imag.resize(unknowns + 1, 0.0);
    }

    pub fn voltage(&self, node: NodeIndex) -> f64 {
        if node.is_ground() {
            return 0.0;
        }
        self.solution.get(node.0).copied().unwrap_or(0.0)
    }

    pub fn voltage_diff(&self, positive: NodeIndex, negative: NodeIndex) -> f64 {
        self.voltage(positive) - self.voltage(negative)
    }

    pub fn voltage_complex(&self, node: NodeIndex) -> Complex64 {
        if node.is_ground() {
            return Complex64::default();
        }
        Complex64::new(
            self.voltage(node),
            self.solution_imag.get(node.0).copied().unwrap_or(0.0),
        )
    }

    /// Companion model of the charge at `q` with small-signal capacitance `cap`:
    /// returns `(geq, ceq)` where the element current is `geq * v + ceq`.
    pub fn integrate_charge(&mut self, q: StateSlot, cap: f64) -> (f64, f64) {
        if self.initial_transient {
            self.states.seed(q);
        }
        let ccap = self.integrator.integrate(&mut self.states, q);
        if self.initial_transient {
            self.states.seed(q.offset(1));
        }
        let geq = self.integrator.ag[0] * cap;
        let ceq = ccap - self.integrator.ag[0] * self.states.get(0, q);
        (geq, ceq)
    }

    // divided difference of order `order + 1` over the charge history
    fn charge_derivative(&self, q: StateSlot) -> f64 {
        let order = self.integrator.order;
        let delta_old = &self.integrator.delta_old;
        let mut diff = [0.0f64; MAX_ORDER + 2];
        let mut deltmp = [0.0f64; MAX_ORDER + 2];
        for i in 0..=order + 1 {
            diff[i] = self.states.get(i, q);
            deltmp[i] = delta_old[i];
        }

        let mut j = order;
        loop {
            for i in 0..=j {
                if deltmp[i] == 0.0 {
                    return 0.0;
                }
                diff[i] = (diff[i] - diff[i + 1]) / deltmp[i];
            }
            if j == 0 {
                break;
            }
            j -= 1;
            for i in 0..=j {
                deltmp[i] = deltmp[i + 1] + delta_old[i];
            }
        }
        self.integrator.truncation_factor() * diff[0].abs()
    }

    fn charge_tolerance(&self, q: StateSlot) -> f64 {
        let tol = &self.tolerances;
        let ccap = q.offset(1);
        let volttol = tol.abstol
            + tol.reltol
                * self
                    .states
                    .get(0, ccap)
                    .abs()
                    .max(self.states.get(1, ccap).abs());
        let charge = self
            .states
            .get(0, q)
            .abs()
            .max(self.states.get(1, q).abs())
            .max(tol.chgtol);
        let chargetol = if self.integrator.delta > 0.0 {
            tol.reltol * charge / self.integrator.delta
        } else {
            0.0
        };
        volttol.max(chargetol)
    }

    /// Estimated local truncation error of the charge at `q` for a step of `h`.
    ///
    /// Non-decreasing in `h` for a fixed history.
    pub fn local_truncation_error(&self, q: StateSlot, h: f64) -> f64 {
        self.charge_derivative(q) * h.abs().powi(self.integrator.order as i32)
    }

    /// Largest step keeping the truncation error of the charge at `q` within tolerance.
    pub fn truncation_step(&self, q: StateSlot) -> f64 {
        let tol = self.tolerances.trtol * self.charge_tolerance(q);
        let del = tol / self.tolerances.abstol.max(self.charge_derivative(q));
        match self.integrator.order {
            1 => del,
            2 => del.sqrt(),
            order => (del.ln() / order as f64).exp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn trapezoidal_coefficients() {
        let mut integ = Integrator::new(IntegrationMethod::Trapezoidal);
        integ.set_step(1e-3, 1);
        assert!(approx(integ.ag[0], 1e3));
        assert!(approx(integ.ag[1], -1e3));
        integ.set_step(1e-3, 2);
        assert!(approx(integ.ag[0], 2e3));
        assert!(approx(integ.ag[1], 1.0));
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    fn gear_differentiates_polynomials_exactly(#[case] order: usize) {
        let mut integ = Integrator::new(IntegrationMethod::Gear);
        // constant step history
        for _ in 0..=MAX_ORDER {
            integ.set_step(0.1, order);
        }
        // q(t) = t^order sampled at t = 0, -h, -2h, ...: dq/dt(0) = 0 unless order == 1
        let q = |t: f64| t.powi(order as i32) + 2.0 * t;
        let derivative: f64 = (0..=order)
            .map(|age| integ.ag[age] * q(-(age as f64) * 0.1))
            .sum();
        let expected = if order == 1 { 3.0 } else { 2.0 };
        assert!(approx(derivative, expected), "{derivative} != {expected}");
    }

    #[test]
    fn gear_order_one_is_backward_euler() {
        let mut integ = Integrator::new(IntegrationMethod::Gear);
        integ.set_step(2e-6, 1);
        assert!(approx(integ.ag[0], 5e5));
        assert!(approx(integ.ag[1], -5e5));
    }

    #[test]
    fn rotate_shifts_ages() {
        let mut states = StateHistory::new();
        let slot = states.allocate(2);
        states.set(0, slot, 1.0);
        states.rotate();
        states.set(0, slot, 2.0);
        states.rotate();
        assert_eq!(states.get(0, slot), 2.0);
        assert_eq!(states.get(1, slot), 2.0);
        assert_eq!(states.get(2, slot), 1.0);
    }

    fn charge_history(order: usize) -> (CircuitState, StateSlot) {
        let mut ckt = CircuitState::new(Tolerances::default(), IntegrationMethod::Trapezoidal);
        let q = ckt.states.allocate(2);
        for _ in 0..4 {
            ckt.integrator.set_step(1e-6, order);
        }
        // q(t) = 1e-12 * t'^3 with t' in microseconds, newest first
        for age in 0..4 {
            let t = -(age as f64);
            ckt.states.set(age, q, 1e-12 * t * t * t);
        }
        (ckt, q)
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    fn truncation_error_grows_with_step(#[case] order: usize) {
        let (ckt, q) = charge_history(order);
        let mut last = 0.0;
        for h in [1e-9, 1e-8, 1e-7, 1e-6, 1e-5] {
            let err = ckt.local_truncation_error(q, h);
            assert!(err >= last);
            last = err;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn truncation_step_meets_tolerance() {
        let (ckt, q) = charge_history(2);
        let step = ckt.truncation_step(q);
        let budget = ckt.tolerances.trtol * ckt.charge_tolerance(q);
        assert!(step > 0.0);
        assert!(approx(ckt.local_truncation_error(q, step), budget));
    }

    #[test]
    fn flat_history_allows_any_step() {
        let mut ckt = CircuitState::new(Tolerances::default(), IntegrationMethod::Trapezoidal);
        let q = ckt.states.allocate(2);
        ckt.integrator.set_step(1e-6, 1);
        for age in 0..3 {
            ckt.states.set(age, q, 5e-12);
        }
        assert_eq!(ckt.local_truncation_error(q, 1.0), 0.0);
        assert!(ckt.truncation_step(q) > 1e-6);
    }
}

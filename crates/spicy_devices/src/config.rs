use serde::{Deserialize, Serialize};

/// Convergence and step-control tolerances shared by every device.
///
/// Missing fields fall back to the SPICE defaults, so a host can deserialize a partial
/// options block:
///
/// ```
/// let tol: spicy_devices::Tolerances = serde_json::from_str(r#"{ "reltol": 1e-4 }"#).unwrap();
/// assert_eq!(tol.reltol, 1e-4);
/// assert_eq!(tol.abstol, 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    /// relative tolerance
    pub reltol: f64,
    /// absolute current tolerance (A)
    pub abstol: f64,
    /// absolute voltage tolerance (V)
    pub vntol: f64,
    /// charge tolerance (C)
    pub chgtol: f64,
    /// truncation error overestimation factor
    pub trtol: f64,
    /// minimum conductance placed across every junction (S)
    pub gmin: f64,
    /// circuit temperature (K)
    pub temperature: f64,
    /// mirror every stamp into the per-instance adjoint mirror
    pub adjoint: bool,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            reltol: 1e-3,
            abstol: 1e-12,
            vntol: 1e-6,
            chgtol: 1e-14,
            trtol: 7.0,
            gmin: 1e-12,
            temperature: 300.15,
            adjoint: false,
        }
    }
}

impl Tolerances {
    /// kT/q at the circuit temperature.
    pub fn thermal_voltage(&self) -> f64 {
        const BOLTZMANN: f64 = 1.380_649e-23;
        const CHARGE: f64 = 1.602_176_634e-19;
        BOLTZMANN * self.temperature / CHARGE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMethod {
    #[default]
    Trapezoidal,
    Gear,
}

/// Storage layout of the global MNA system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixLayout {
    /// compressed sparse column, pattern built once at setup
    #[default]
    Sparse,
    /// dense row-major, cell index is `row * dim + col`
    Dense,
}

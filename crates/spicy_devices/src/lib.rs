//! Device stamping core for a SPICE-style circuit simulator.
//!
//! Devices bind their matrix cells once at setup and then write every Newton
//! iteration through a [`devices::stamp::Stamper`], which mirrors each write into
//! the instance's sparse current-reconstruction matrix (and optionally into an
//! adjoint mirror). Terminal currents are read back from that matrix instead of
//! being recomputed by each device.
//!
//! ```
//! use spicy_devices::{CircuitState, Devices, MatrixLayout, Model, Resistor, ResistorModel, Tolerances};
//!
//! let mut devices = Devices::new(MatrixLayout::Sparse);
//! let a = devices.node("a");
//! devices.add_model(
//!     Model::new("rmod", ResistorModel::default())
//!         .with_instance("R1", Resistor::new(a, spicy_devices::NodeIndex::GROUND, 1e3)),
//! );
//!
//! let mut ckt = CircuitState::new(Tolerances::default(), Default::default());
//! let mut mna = devices.setup(&mut ckt).unwrap();
//! mna.clear();
//! devices.load(&mut mna, &mut ckt).unwrap();
//! assert_eq!(mna.get(0, 0).re, 1e-3);
//! ```
pub mod config;
pub mod current;
pub mod devices;
pub mod error;
pub mod mna;
pub mod nodes;
pub mod sparse;
pub mod state;

pub use config::{IntegrationMethod, MatrixLayout, Tolerances};
pub use current::CurrentMatrix;
pub use devices::{
    BackupMode, Bjt, BjtModel, BjtPolarity, Capacitor, CapacitorModel, CurrentSource, Device,
    DeviceKind, DeviceModel, Devices, Diode, DiodeModel, Inductor, InductorModel, Instance,
    Model, Mosfet, MosfetChannel, MosfetModel, QueryValue, Resistor, ResistorModel,
    SourceModel, VoltageSource, Waveform,
};
pub use error::{DeviceError, DeviceResult};
pub use mna::MnaSystem;
pub use nodes::{NodeIndex, NodeMapping};
pub use state::{AnalysisMode, CircuitState, StateHistory, StateSlot};

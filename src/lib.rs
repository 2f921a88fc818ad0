//! Deterministic, restartable simulation of a 2-D grid of leaky
//! integrate-and-fire neurons whose connectivity grows and shrinks with
//! activity.
//!
//! ```no_run
//! use growgrid::{Simulation, SimulationConfig};
//!
//! let cfg = SimulationConfig::default().with_grid(10, 10).with_epochs(1.0, 5);
//! let mut sim = Simulation::new(cfg)?;
//! sim.run()?;
//! sim.save_state(&mut std::io::stdout())?;
//! # Ok::<(), growgrid::SimError>(())
//! ```

#[path = "core/checkpoint.rs"]
mod checkpoint;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/delay.rs"]
pub mod delay;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/growth.rs"]
pub mod growth;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/report.rs"]
pub mod report;

#[path = "core/simulation.rs"]
pub mod simulation;

#[path = "core/storage.rs"]
pub mod storage;

pub use config::{
    GrowthParams, NeuronLayout, NeuronParams, SimulationConfig, SynapseKindParams, SynapseParams,
    ValueRange,
};
pub use error::{ConfigError, DelayError, SimError};
pub use growth::GrowthReport;
pub use model::{LifModel, NeuronModel};
pub use network::{NeuronKind, SynapseKind};
pub use simulation::{SimContext, Simulation};

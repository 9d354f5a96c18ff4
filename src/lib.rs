#[path = "core/config.rs"]
pub mod config;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/prng.rs"]
pub mod prng;

pub mod bridge;
pub mod engine;
pub mod trainer;
pub mod viz;

pub use bridge::{ComputeBridge, ComputeService};
pub use config::VizConfig;
pub use error::{Result, VizError};
pub use model::{
    LayerRef, NetworkSnapshot, NetworkTopology, NeuronRef, ProbeCoordinate, Selection, Shared,
    TrainingFlag,
};
pub use trainer::{RunConfig, TargetFunction, Trainer};

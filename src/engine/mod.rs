//! Reference compute service: a small dense network plus the colorizer that
//! turns its activations into the buffers the panels draw.

pub mod colorize;
pub mod network;
pub mod service;

pub use colorize::{Colorizer, LUT_RANGE};
pub use network::{
    Activation, HiddenLayerDefinition, Network, NetworkDefinition, OutputLayerDefinition,
    WeightInit,
};
pub use service::LocalCompute;

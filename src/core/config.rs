//! Visualization settings. Every field has a default so partial JSON files work.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::model::MAX_TILE_SCALE;
use crate::viz::layers::GridLayout;
use crate::viz::legend::LegendSpec;
use crate::viz::scheduler::FlightPolicy;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VizConfig {
    /// Pixel edge of one neuron tile (before device-pixel-ratio scaling).
    pub tile_scale: u32,
    /// Blank band above the first layer row.
    pub padding_top: f64,
    /// Row pitch as a multiple of the tile size.
    pub layer_spacing_factor: f64,
    pub layer_canvas_width: u32,
    pub layer_canvas_height: u32,
    /// Period of the layer grid's render timer.
    pub tick_ms: u64,
    /// Period of the neuron response heatmap's render timer.
    pub response_tick_ms: u64,
    pub response_size: usize,
    pub coord_canvas_size: u32,
    pub flight_policy: FlightPolicy,
    pub legend: LegendConfig,
}

impl Default for VizConfig {
    fn default() -> Self {
        Self {
            tile_scale: 16,
            padding_top: 10.0,
            layer_spacing_factor: 2.5,
            layer_canvas_width: 16 * 128,
            layer_canvas_height: 200,
            tick_ms: 200,
            response_tick_ms: 100,
            response_size: 250,
            coord_canvas_size: 250,
            flight_policy: FlightPolicy::Drop,
            legend: LegendConfig::default(),
        }
    }
}

impl VizConfig {
    pub fn grid_layout(&self) -> GridLayout {
        GridLayout {
            tile_scale: self.tile_scale.clamp(1, MAX_TILE_SCALE),
            padding_top: self.padding_top,
            spacing_factor: self.layer_spacing_factor,
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn response_tick_period(&self) -> Duration {
        Duration::from_millis(self.response_tick_ms.max(1))
    }

    /// Canvas height that fits every row of a network with `hidden_layers` hidden layers.
    pub fn layer_canvas_height_for(&self, hidden_layers: usize) -> u32 {
        let layout = self.grid_layout();
        let rows = hidden_layers + 2;
        let needed = layout.padding_top
            + layout.row_spacing() * (rows - 1) as f64
            + layout.tile_scale as f64
            + layout.padding_top;
        self.layer_canvas_height.max(needed.ceil() as u32)
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LegendConfig {
    pub min: f32,
    pub max: f32,
    pub gradient_width: usize,
    pub gradient_height: usize,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for LegendConfig {
    fn default() -> Self {
        Self {
            min: -2.5,
            max: 2.5,
            gradient_width: 18,
            gradient_height: 260,
            canvas_width: 42,
            canvas_height: 280,
            timeout_ms: 50,
            retry_delay_ms: 250,
            max_attempts: 20,
        }
    }
}

impl LegendConfig {
    pub fn spec(&self) -> LegendSpec {
        LegendSpec {
            range: [self.min, self.max],
            gradient_width: self.gradient_width.max(1),
            gradient_height: self.gradient_height.max(1),
            timeout: Duration::from_millis(self.timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_attempts: self.max_attempts.max(1),
        }
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = VizConfig::from_json_str(r#"{ "tile_scale": 8, "flight_policy": "coalesce" }"#)
            .unwrap();
        assert_eq!(cfg.tile_scale, 8);
        assert_eq!(cfg.flight_policy, FlightPolicy::Coalesce);
        assert_eq!(cfg.tick_ms, 200);
        assert_eq!(cfg.legend, LegendConfig::default());
    }

    #[test]
    fn grid_tile_scale_is_bounded() {
        let cfg = VizConfig::from_json_str(r#"{ "tile_scale": 65536 }"#).unwrap();
        assert_eq!(cfg.grid_layout().tile_scale, MAX_TILE_SCALE);
        let cfg = VizConfig::from_json_str(r#"{ "tile_scale": 0 }"#).unwrap();
        assert_eq!(cfg.grid_layout().tile_scale, 1);
    }

    #[test]
    fn canvas_grows_to_fit_deep_networks() {
        let cfg = VizConfig::default();
        assert_eq!(cfg.layer_canvas_height_for(2), 200);
        // 10 + 40 * 7 + 16 + 10
        assert_eq!(cfg.layer_canvas_height_for(6), 316);
    }
}

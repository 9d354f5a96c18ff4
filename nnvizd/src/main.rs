//! Headless driver: trains a network against a target function while the
//! visualization panels tick, then writes every panel out as a PPM frame.

mod frames;
mod paths;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use nnviz::bridge::ComputeBridge;
use nnviz::config::VizConfig;
use nnviz::engine::LocalCompute;
use nnviz::model::{LayerRef, NeuronRef, ProbeCoordinate, Selection, Shared, TrainingFlag};
use nnviz::trainer::{RunConfig, TargetFunction, Trainer};
use nnviz::viz::{
    BroadcastRegistry, ColorScaleLegend, LayerPanel, LegendState, NeuronResponsePanel,
    PixelCanvas, PointerEvent, PointerKind, SoftSurface,
};
use nnviz::VizError;

use frames::FrameWriter;
use paths::AppPaths;

// ═══════════════════════════════════════════════════════════════════════════
// Errors and configuration
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("bad argument {flag}: {reason}")]
    Arg { flag: String, reason: String },

    #[error("could not determine the {0} directory")]
    NoHomeDir(&'static str),

    #[error("invalid config {path:?}: {source}")]
    Config {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Viz(#[from] VizError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// On-disk config: panel settings plus the training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub viz: VizConfig,
    pub run: RunConfig,
    /// Training is split into this many slices; panels are captured after each.
    pub frames: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            viz: VizConfig::default(),
            run: RunConfig::default(),
            frames: 4,
        }
    }
}

impl DriverConfig {
    /// Reads `path`, or returns defaults when it does not exist.
    fn load(path: &Path) -> Result<Self, DriverError> {
        if !path.exists() {
            info!("No config at {:?}; using defaults", path);
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let config = serde_json::from_str(&text).map_err(|source| DriverError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }
}

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    out: Option<PathBuf>,
    examples: Option<usize>,
    target: Option<TargetFunction>,
    probe: Option<ProbeCoordinate>,
    select: Option<Selection>,
}

fn bad(flag: &str, reason: impl Into<String>) -> DriverError {
    DriverError::Arg {
        flag: flag.to_string(),
        reason: reason.into(),
    }
}

fn parse_probe(v: &str) -> Result<ProbeCoordinate, DriverError> {
    let (x, y) = v.split_once(',').ok_or_else(|| bad("--probe", "expected x,y"))?;
    let x = x.trim().parse::<f32>().map_err(|e| bad("--probe", e.to_string()))?;
    let y = y.trim().parse::<f32>().map_err(|e| bad("--probe", e.to_string()))?;
    Ok(ProbeCoordinate::new(x, y))
}

/// `input:N`, `output:N`, `hK:N` (hidden layer K), or `none`.
fn parse_select(v: &str) -> Result<Selection, DriverError> {
    if v == "none" {
        return Ok(Selection::None);
    }
    let (layer, neuron) = v
        .split_once(':')
        .ok_or_else(|| bad("--select", "expected layer:neuron"))?;
    let neuron = neuron
        .parse::<usize>()
        .map_err(|e| bad("--select", e.to_string()))?;
    let layer = match layer {
        "input" => LayerRef::Input,
        "output" => LayerRef::Output,
        h => match h.strip_prefix('h').and_then(|ix| ix.parse::<usize>().ok()) {
            Some(ix) => LayerRef::Hidden(ix),
            None => return Err(bad("--select", format!("unknown layer {h:?}"))),
        },
    };
    Ok(Selection::Neuron(NeuronRef::new(layer, neuron)))
}

impl Args {
    fn from_env() -> Result<Self, DriverError> {
        let mut parsed = Args::default();
        let mut args = env::args().skip(1);
        while let Some(a) = args.next() {
            let mut value = || args.next().ok_or_else(|| bad(&a, "missing value"));
            match a.as_str() {
                "--config" => parsed.config = Some(PathBuf::from(value()?)),
                "--out" => parsed.out = Some(PathBuf::from(value()?)),
                "--examples" => {
                    let v = value()?;
                    parsed.examples = Some(v.parse().map_err(|_| bad(&a, v))?);
                }
                "--target" => {
                    let v = value()?;
                    parsed.target =
                        Some(TargetFunction::from_label(&v).ok_or_else(|| bad(&a, v))?);
                }
                "--probe" => parsed.probe = Some(parse_probe(&value()?)?),
                "--select" => parsed.select = Some(parse_select(&value()?)?),
                other => warn!("Ignoring unknown argument {}", other),
            }
        }
        Ok(parsed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::from_env()?;
    let paths = AppPaths::new(args.out.clone())?;
    info!("Frames directory: {:?}", paths.frames_dir());

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| paths.config_file().to_path_buf());
    let mut config = DriverConfig::load(&config_path)?;
    if let Some(n) = args.examples {
        config.run.examples = n;
    }
    if let Some(t) = args.target {
        config.run.target = t;
    }

    // Shared state the panels and the trainer coordinate through
    let bridge = ComputeBridge::spawn(LocalCompute::new(config.run.seed))?;
    let training = TrainingFlag::new();
    let registry = BroadcastRegistry::new();
    let initial = args
        .select
        .unwrap_or(Selection::Neuron(NeuronRef::new(LayerRef::Output, 0)));
    let selection = Shared::new(initial);
    let coord = Shared::new(ProbeCoordinate::CENTER);

    let mut trainer = Trainer::new(
        bridge.clone(),
        training.clone(),
        registry.clone(),
        selection.clone(),
        config.run.seed,
    );
    let topology = trainer.reset(config.run.definition.clone()).await?;
    info!("Model ready: {:?}", topology);

    // Mount panels
    let viz = &config.viz;
    let layers = LayerPanel::mount(
        PixelCanvas::new(
            viz.layer_canvas_width as usize,
            viz.layer_canvas_height_for(topology.hidden.len()) as usize,
        ),
        viz,
        bridge.clone(),
        training.clone(),
        registry.clone(),
        coord.clone(),
        selection.clone(),
    )?;
    let response = NeuronResponsePanel::mount(
        PixelCanvas::new(viz.response_size, viz.response_size),
        viz,
        bridge.clone(),
        training.clone(),
        &registry,
        selection.clone(),
    )?;
    let legend = ColorScaleLegend::mount(
        PixelCanvas::new(
            viz.legend.canvas_width as usize,
            viz.legend.canvas_height as usize,
        ),
        viz.legend.spec(),
        bridge.clone(),
    )?;

    let side = viz.coord_canvas_size as f64;
    let surface = Arc::new(SoftSurface::sized(side, side));
    let picker = layers.attach_probe(
        surface.clone(),
        PixelCanvas::new(viz.coord_canvas_size as usize, viz.coord_canvas_size as usize),
    );
    if let Some(probe) = args.probe {
        let (x, y) = (probe.x() as f64 * side, (1.0 - probe.y() as f64) * side);
        surface.emit(PointerEvent::new(PointerKind::Down, x, y));
        surface.emit(PointerEvent::new(PointerKind::Up, x, y));
        info!("Probe set to ({}, {})", probe.x(), probe.y());
    }

    let mut frames = FrameWriter::new(paths);
    let run = &config.run;
    let slices = config.frames.max(1);
    let per_slice = run.examples.div_ceil(slices);
    let mut remaining = run.examples;

    for index in 0..slices {
        if remaining > 0 {
            let n = per_slice.min(remaining);
            let train = trainer.train(run.target, n, run.batch_size, run.learning_rate());
            let report = tokio::select! {
                r = train => r?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Ctrl-C: stopping before slice {}", index);
                    break;
                }
            };
            remaining -= report.examples;
            info!(
                "Slice {}/{}: {} examples, cost {:.5}",
                index + 1,
                slices,
                report.examples,
                report.final_cost
            );
        }

        layers.settled().await;
        response.settled().await;
        layers.with_canvas(|c| frames.write("layers", index, c))?;
        response.with_canvas(|c| frames.write("response", index, c))?;
    }

    match legend.wait().await {
        LegendState::Drawn => {
            legend.with_canvas(|c| frames.write("legend", 0, c))?;
        }
        state => error!("Legend not drawn: {:?}", state),
    }
    picker.with_canvas(|c| frames.write("probe", 0, c))?;

    if let Some(mean) = trainer.costs().mean() {
        info!("Mean batch cost over the run: {:.5}", mean);
    }
    info!("Wrote {} frames", frames.written().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_accepts_every_layer_form() {
        assert_eq!(parse_select("none").unwrap(), Selection::None);
        assert_eq!(
            parse_select("h2:7").unwrap(),
            Selection::Neuron(NeuronRef::new(LayerRef::Hidden(2), 7))
        );
        assert_eq!(
            parse_select("output:0").unwrap(),
            Selection::Neuron(NeuronRef::new(LayerRef::Output, 0))
        );
        assert!(parse_select("deep:1").is_err());
        assert!(parse_select("input").is_err());
    }

    #[test]
    fn probe_is_clamped_like_the_picker() {
        assert_eq!(parse_probe("0.25, 2").unwrap().to_array(), [0.25, 1.0]);
        assert!(parse_probe("0.5").is_err());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: DriverConfig =
            serde_json::from_str(r#"{ "frames": 2, "run": { "target": "xor" } }"#).unwrap();
        assert_eq!(config.frames, 2);
        assert_eq!(config.run.target, TargetFunction::Xor);
        assert_eq!(config.run.batch_size, RunConfig::default().batch_size);
        assert_eq!(config.viz.tile_scale, VizConfig::default().tile_scale);
    }
}

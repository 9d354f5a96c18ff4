//! Stacked neuron-grid panel.
//!
//! Each layer of a snapshot is one row of `tile × tile` squares. Rows are
//! separated by a fixed pitch below a top padding band. Layer sizes always
//! come from the snapshot being drawn, never from configuration, because the
//! topology may have changed while the fetch was in flight.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::broadcast::{BroadcastRegistry, Subscription};
use super::canvas::{Canvas, Rgba};
use super::coord_input::CoordinateInputEngine;
use super::scheduler::{RenderOutcome, RenderPanel, RenderScheduler};
use super::surface::PointerSurface;
use crate::bridge::ComputeBridge;
use crate::config::VizConfig;
use crate::error::{Result, VizError};
use crate::model::{
    LayerRef, NetworkSnapshot, NeuronRef, ProbeCoordinate, Selection, Shared, TrainingFlag,
};

/// Broadcast key of the layer grid.
pub const BROADCAST_KEY: &str = "layers";

const OUTLINE_WIDTH: f64 = 3.0;
const WEIGHT_LINE_WIDTH: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLayout {
    pub tile_scale: u32,
    pub padding_top: f64,
    /// Row pitch in tiles.
    pub spacing_factor: f64,
}

impl Default for GridLayout {
    fn default() -> Self {
        Self {
            tile_scale: 16,
            padding_top: 10.0,
            spacing_factor: 2.5,
        }
    }
}

impl GridLayout {
    pub fn row_spacing(&self) -> f64 {
        self.tile_scale as f64 * self.spacing_factor
    }
}

/// Row geometry recovered from one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerGeometry {
    tile: f64,
    padding_top: f64,
    spacing: f64,
    /// Neuron count per grid row.
    counts: Vec<usize>,
}

impl LayerGeometry {
    pub fn from_snapshot(snapshot: &NetworkSnapshot, layout: &GridLayout) -> Result<Self> {
        let tile = snapshot.tile_scale.max(1) as usize;
        let unit = 4 * tile * tile;
        let counts = snapshot
            .layers()
            .map(|(layer, buf)| {
                if buf.len() % unit != 0 {
                    return Err(VizError::malformed(format!("{layer} color"), buf.len(), unit));
                }
                Ok(buf.len() / unit)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            tile: tile as f64,
            padding_top: layout.padding_top,
            spacing: tile as f64 * layout.spacing_factor,
            counts,
        })
    }

    pub fn hidden_layers(&self) -> usize {
        self.counts.len().saturating_sub(2)
    }

    pub fn neuron_count(&self, layer: LayerRef) -> Option<usize> {
        self.counts.get(layer.row(self.hidden_layers())).copied()
    }

    pub fn contains(&self, neuron: NeuronRef) -> bool {
        if let LayerRef::Hidden(ix) = neuron.layer {
            if ix >= self.hidden_layers() {
                return false;
            }
        }
        self.neuron_count(neuron.layer)
            .is_some_and(|count| neuron.neuron < count)
    }

    fn row_top(&self, row: usize) -> f64 {
        self.padding_top + row as f64 * self.spacing
    }

    /// Maps a canvas pixel offset to the neuron drawn there.
    pub fn hit_test(&self, x: f64, y: f64) -> Option<NeuronRef> {
        if !x.is_finite() || !y.is_finite() || y < self.padding_top || x < 0.0 {
            return None;
        }
        let rel = y - self.padding_top;
        let row = (rel / self.spacing).floor() as usize;
        if rel - row as f64 * self.spacing >= self.tile {
            return None;
        }
        let count = *self.counts.get(row)?;
        let neuron = (x / self.tile).floor() as usize;
        if neuron >= count {
            return None;
        }
        let layer = LayerRef::from_row(row, self.hidden_layers())?;
        Some(NeuronRef::new(layer, neuron))
    }

    /// Top-left corner of a neuron's tile.
    pub fn tile_origin(&self, neuron: NeuronRef) -> Option<(f64, f64)> {
        if !self.contains(neuron) {
            return None;
        }
        let row = neuron.layer.row(self.hidden_layers());
        Some((neuron.neuron as f64 * self.tile, self.row_top(row)))
    }

    pub fn tile_center(&self, neuron: NeuronRef) -> Option<(f64, f64)> {
        let half = self.tile / 2.0;
        self.tile_origin(neuron).map(|(x, y)| (x + half, y + half))
    }
}

/// Splits a weight buffer into one RGBA color per connection.
fn weight_colors(weights: &[u8]) -> Result<&[[u8; 4]]> {
    bytemuck::try_cast_slice(weights)
        .map_err(|_| VizError::malformed("connection weight", weights.len(), 4))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Default,
    Pointer,
}

/// One fetched snapshot together with the selection it was computed for.
#[derive(Debug, Clone)]
pub struct LayerFrame {
    pub selection: Selection,
    pub snapshot: NetworkSnapshot,
}

pub struct LayerCanvasRenderer<C: Canvas> {
    canvas: C,
    layout: GridLayout,
    coord: Shared<ProbeCoordinate>,
    selection: Shared<Selection>,
    geometry: Option<LayerGeometry>,
}

impl<C: Canvas> LayerCanvasRenderer<C> {
    pub fn new(
        canvas: C,
        layout: GridLayout,
        coord: Shared<ProbeCoordinate>,
        selection: Shared<Selection>,
    ) -> Self {
        Self {
            canvas,
            layout,
            coord,
            selection,
            geometry: None,
        }
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }

    /// Geometry of the last drawn snapshot.
    pub fn geometry(&self) -> Option<&LayerGeometry> {
        self.geometry.as_ref()
    }

    pub fn hit_test(&self, x: f64, y: f64) -> Option<NeuronRef> {
        self.geometry.as_ref()?.hit_test(x, y)
    }

    pub fn cursor_at(&self, x: f64, y: f64) -> Cursor {
        match self.hit_test(x, y) {
            Some(_) => Cursor::Pointer,
            None => Cursor::Default,
        }
    }

    pub fn draw(&mut self, frame: &LayerFrame) -> Result<()> {
        let snapshot = &frame.snapshot;
        self.geometry = None;
        let geometry = LayerGeometry::from_snapshot(snapshot, &self.layout)?;
        let tile = snapshot.tile_scale.max(1) as usize;

        for (row, (_, buf)) in snapshot.layers().enumerate() {
            let width = geometry.counts[row] * tile;
            let top = geometry.row_top(row).round() as usize;
            self.canvas.put_rgba(0, top, width, tile, buf)?;
        }

        if let Some(selected) = frame.selection.neuron() {
            self.draw_selection(&geometry, selected, snapshot.weights.as_deref())?;
        }
        self.geometry = Some(geometry);
        Ok(())
    }

    fn draw_selection(
        &mut self,
        geometry: &LayerGeometry,
        selected: NeuronRef,
        weights: Option<&[u8]>,
    ) -> Result<()> {
        let Some((x, y)) = geometry.tile_origin(selected) else {
            debug!(?selected, "selection is not in the drawn snapshot");
            return Ok(());
        };
        let prev = selected.layer.previous(geometry.hidden_layers());
        if let (Some(prev), Some(weights)) = (prev, weights) {
            let colors = weight_colors(weights)?;
            let expected = geometry.neuron_count(prev).unwrap_or(0);
            if colors.len() != expected {
                return Err(VizError::malformed(
                    format!("{} weight", selected.layer),
                    weights.len(),
                    4 * expected,
                ));
            }
            let half = geometry.tile / 2.0;
            let to = (x + half, y + half);
            for (j, c) in colors.iter().enumerate() {
                if let Some(from) = geometry.tile_center(NeuronRef::new(prev, j)) {
                    self.canvas
                        .line(from, to, WEIGHT_LINE_WIDTH, Rgba::rgb(c[0], c[1], c[2]));
                }
            }
        }
        let t = geometry.tile;
        self.canvas
            .stroke_rect(x, y, t, t, OUTLINE_WIDTH, Rgba::HIGHLIGHT);
        Ok(())
    }

    fn draw_placeholder(&mut self) {
        let y = self.layout.padding_top + self.layout.tile_scale as f64;
        self.canvas.fill_text("untrained", 0.0, y, Rgba::LABEL);
    }
}

impl<C: Canvas + 'static> RenderPanel for LayerCanvasRenderer<C> {
    type Request = (ProbeCoordinate, Selection, u32);
    type Frame = LayerFrame;

    fn name(&self) -> &'static str {
        BROADCAST_KEY
    }

    fn request(&mut self) -> Option<Self::Request> {
        Some((self.coord.get(), self.selection.get(), self.layout.tile_scale))
    }

    fn fetch(
        bridge: ComputeBridge,
        (coord, selection, tile_scale): Self::Request,
    ) -> impl Future<Output = Result<Option<LayerFrame>>> + Send + 'static {
        async move {
            let snapshot = bridge.get_viz_data(coord, selection, tile_scale).await?;
            Ok(snapshot.map(|snapshot| LayerFrame {
                selection,
                snapshot,
            }))
        }
    }

    fn present(&mut self, frame: Option<LayerFrame>) -> Result<()> {
        match frame {
            Some(frame) => self.draw(&frame),
            None => {
                self.geometry = None;
                self.draw_placeholder();
                Ok(())
            }
        }
    }

    fn clear(&mut self) {
        self.canvas.clear();
    }
}

/// The mounted layer grid: renderer, scheduler, broadcast registration.
pub struct LayerPanel<C: Canvas + 'static> {
    scheduler: RenderScheduler<LayerCanvasRenderer<C>>,
    selection: Shared<Selection>,
    registry: BroadcastRegistry,
    _subscription: Subscription,
}

impl<C: Canvas + 'static> LayerPanel<C> {
    /// Starts the ticker and registers for broadcasts. Needs a tokio runtime.
    pub fn mount(
        canvas: C,
        config: &VizConfig,
        bridge: ComputeBridge,
        training: TrainingFlag,
        registry: BroadcastRegistry,
        coord: Shared<ProbeCoordinate>,
        selection: Shared<Selection>,
    ) -> Result<Self> {
        let renderer =
            LayerCanvasRenderer::new(canvas, config.grid_layout(), coord, selection.clone());
        let scheduler = RenderScheduler::new(renderer, bridge, training, config.flight_policy)?;
        scheduler.start(config.tick_period());
        let subscription = registry.register(BROADCAST_KEY, scheduler.trigger());
        Ok(Self {
            scheduler,
            selection,
            registry,
            _subscription: subscription,
        })
    }

    /// Pick (or un-pick) the neuron under a canvas offset. Every change is
    /// broadcast so sibling panels redraw too.
    pub fn pointer_down(&self, x: f64, y: f64) -> Selection {
        let hit = self.scheduler.with_panel(|r| r.hit_test(x, y));
        let (previous, next) = self.selection.update(|current| {
            let previous = *current;
            *current = match hit {
                Some(n) => previous.toggled(n),
                None => Selection::None,
            };
            (previous, *current)
        });
        if next != previous {
            debug!(?previous, ?next, "selection changed");
            self.registry.dispatch();
        }
        next
    }

    pub fn pointer_move(&self, x: f64, y: f64) -> Cursor {
        self.scheduler.with_panel(|r| r.cursor_at(x, y))
    }

    /// Attaches a probe picker whose moves force-render this grid.
    pub fn attach_probe<P: Canvas + 'static>(
        &self,
        surface: Arc<dyn PointerSurface>,
        canvas: P,
    ) -> CoordinateInputEngine<P> {
        let coord = self.scheduler.with_panel(|r| r.coord.clone());
        CoordinateInputEngine::acquire(surface, canvas, coord, self.scheduler.trigger())
    }

    pub fn force_render(&self) -> RenderOutcome {
        self.scheduler.force_render()
    }

    pub fn scheduler(&self) -> &RenderScheduler<LayerCanvasRenderer<C>> {
        &self.scheduler
    }

    pub async fn settled(&self) {
        self.scheduler.settled().await
    }

    pub fn with_canvas<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        self.scheduler.with_panel(|r| f(r.canvas()))
    }
}

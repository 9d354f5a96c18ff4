//! Single-neuron response heatmap.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::broadcast::{BroadcastRegistry, Subscription};
use super::canvas::Canvas;
use super::scheduler::{RenderOutcome, RenderPanel, RenderScheduler};
use crate::bridge::ComputeBridge;
use crate::config::VizConfig;
use crate::error::{Result, VizError};
use crate::model::{LayerRef, NeuronRef, Selection, Shared, TrainingFlag};

pub const BROADCAST_KEY: &str = "neuron_response";

/// Draws `size × size` response buffers for the neuron it is asked to show.
///
/// What was asked for and what is on the canvas are tracked apart: a render
/// dropped behind an in-flight fetch leaves the old neuron drawn, and asking
/// for the new one again must still fetch it.
pub struct NeuronResponseRenderer<C: Canvas> {
    canvas: C,
    size: usize,
    requested: Selection,
    drawn: Option<Selection>,
}

impl<C: Canvas> NeuronResponseRenderer<C> {
    /// Starts out asking for the network's output neuron.
    pub fn new(canvas: C, size: usize) -> Self {
        Self {
            canvas,
            size,
            requested: Selection::Neuron(NeuronRef::new(LayerRef::Output, 0)),
            drawn: None,
        }
    }

    pub fn requested(&self) -> Selection {
        self.requested
    }

    /// The selection whose response is on the canvas, if any.
    pub fn displayed(&self) -> Option<Selection> {
        self.drawn
    }

    /// Returns false when `selection` is already asked for and already drawn.
    pub fn set_selection(&mut self, selection: Selection) -> bool {
        let previous = std::mem::replace(&mut self.requested, selection);
        previous != selection || self.drawn != Some(selection)
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }
}

impl<C: Canvas + 'static> RenderPanel for NeuronResponseRenderer<C> {
    type Request = (Selection, usize);
    type Frame = (Selection, Option<Vec<u8>>);

    fn name(&self) -> &'static str {
        BROADCAST_KEY
    }

    fn request(&mut self) -> Option<Self::Request> {
        Some((self.requested, self.size))
    }

    fn fetch(
        bridge: ComputeBridge,
        (selection, size): Self::Request,
    ) -> impl Future<Output = Result<Option<Self::Frame>>> + Send + 'static {
        async move {
            let buf = match selection.neuron() {
                Some(neuron) => bridge.get_neuron_response(neuron, size).await?,
                None => None,
            };
            Ok(Some((selection, buf)))
        }
    }

    fn present(&mut self, frame: Option<Self::Frame>) -> Result<()> {
        let Some((selection, buf)) = frame else {
            return Ok(());
        };
        if let Some(buf) = buf {
            let unit = self.size * self.size * 4;
            if buf.len() != unit {
                return Err(VizError::malformed("neuron response", buf.len(), unit));
            }
            self.canvas.put_rgba(0, 0, self.size, self.size, &buf)?;
        }
        self.drawn = Some(selection);
        Ok(())
    }

    fn clear(&mut self) {
        self.canvas.clear();
        self.drawn = None;
    }
}

/// Mounted heatmap panel. Follows the shared selection on every broadcast.
pub struct NeuronResponsePanel<C: Canvas + 'static> {
    scheduler: Arc<RenderScheduler<NeuronResponseRenderer<C>>>,
    _subscription: Subscription,
}

impl<C: Canvas + 'static> NeuronResponsePanel<C> {
    pub fn mount(
        canvas: C,
        config: &VizConfig,
        bridge: ComputeBridge,
        training: TrainingFlag,
        registry: &BroadcastRegistry,
        selection: Shared<Selection>,
    ) -> Result<Self> {
        let renderer = NeuronResponseRenderer::new(canvas, config.response_size);
        let scheduler = Arc::new(RenderScheduler::new(
            renderer,
            bridge,
            training,
            config.flight_policy,
        )?);
        scheduler.start(config.response_tick_period());

        let weak = Arc::downgrade(&scheduler);
        let subscription = registry.register(BROADCAST_KEY, move || {
            if let Some(scheduler) = weak.upgrade() {
                let current = selection.get();
                scheduler.with_panel(|r| r.set_selection(current));
                scheduler.force_render();
            }
        });
        scheduler.force_render();
        Ok(Self {
            scheduler,
            _subscription: subscription,
        })
    }

    /// Shows `selection`, fetching unless it is already drawn.
    pub fn set_selection(&self, selection: Selection) -> RenderOutcome {
        if !self.scheduler.with_panel(|r| r.set_selection(selection)) {
            debug!(?selection, "response selection unchanged");
            return RenderOutcome::Unchanged;
        }
        self.scheduler.force_render()
    }

    pub fn displayed(&self) -> Option<Selection> {
        self.scheduler.with_panel(|r| r.displayed())
    }

    pub fn force_render(&self) -> RenderOutcome {
        self.scheduler.force_render()
    }

    pub fn scheduler(&self) -> &RenderScheduler<NeuronResponseRenderer<C>> {
        &self.scheduler
    }

    pub async fn settled(&self) {
        self.scheduler.settled().await
    }

    pub fn with_canvas<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        self.scheduler.with_panel(|r| f(r.canvas()))
    }
}

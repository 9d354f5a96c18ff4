//! Pointer-driven probe coordinate picker.
//!
//! Press (mouse or touch) inside the picker sets the coordinate and starts a
//! drag; motion while dragging keeps updating it; release ends the drag. The
//! vertical axis is inverted: the top edge of the canvas is `y = 1`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use super::canvas::{Canvas, Rgba};
use super::surface::{ListenerId, PointerEvent, PointerKind, PointerSurface, Rect};
use crate::model::{ProbeCoordinate, Shared};

const MARKER_RADIUS: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DragState {
    #[default]
    Idle,
    Dragging,
}

/// Normalized coordinate of a client-space point inside `rect`, clamped to the unit square.
pub fn normalize(rect: Rect, client_x: f64, client_y: f64) -> ProbeCoordinate {
    let x = (client_x - rect.left) / rect.width;
    let y = 1.0 - (client_y - rect.top) / rect.height;
    ProbeCoordinate::new(x as f32, y as f32)
}

struct PickerState<C> {
    canvas: C,
    drag: DragState,
    coord: Shared<ProbeCoordinate>,
}

impl<C: Canvas> PickerState<C> {
    fn draw_marker(&mut self) {
        let c = self.coord.get();
        let (w, h) = (self.canvas.width() as f64, self.canvas.height() as f64);
        self.canvas.clear();
        self.canvas.fill_circle(
            c.x() as f64 * w,
            (1.0 - c.y() as f64) * h,
            MARKER_RADIUS,
            Rgba::MARKER,
        );
    }

    /// Applies one event; returns whether the coordinate changed.
    fn handle(&mut self, rect: Rect, event: &PointerEvent) -> bool {
        let kind = event.kind;
        if kind.is_release() {
            self.drag = DragState::Idle;
            return false;
        }
        let track = kind.is_press() || (kind.is_motion() && self.drag == DragState::Dragging);
        if !track {
            return false;
        }
        if kind.is_press() {
            self.drag = DragState::Dragging;
        }
        self.coord.set(normalize(rect, event.client_x, event.client_y));
        self.draw_marker();
        true
    }
}

fn lock<C>(state: &Mutex<PickerState<C>>) -> MutexGuard<'_, PickerState<C>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the picker's canvas and its pointer listeners.
///
/// Listeners are detached on [`dispose`](Self::dispose) or drop, so a
/// replacement engine never coexists with handlers of the old one.
pub struct CoordinateInputEngine<C: Canvas + 'static> {
    surface: Arc<dyn PointerSurface>,
    state: Arc<Mutex<PickerState<C>>>,
    listeners: Vec<ListenerId>,
}

impl<C: Canvas + 'static> std::fmt::Debug for CoordinateInputEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinateInputEngine")
            .field("drag", &self.drag_state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<C: Canvas + 'static> CoordinateInputEngine<C> {
    /// Draws the current coordinate and attaches press/motion/release handlers
    /// for mouse and touch. `on_change` runs after every coordinate update.
    pub fn acquire(
        surface: Arc<dyn PointerSurface>,
        canvas: C,
        coord: Shared<ProbeCoordinate>,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let mut picker = PickerState {
            canvas,
            drag: DragState::Idle,
            coord,
        };
        picker.draw_marker();
        let state = Arc::new(Mutex::new(picker));
        let on_change: Arc<dyn Fn() + Send + Sync> = Arc::new(on_change);

        let listeners = PointerKind::ALL
            .iter()
            .map(|&kind| {
                let weak: Weak<dyn PointerSurface> = Arc::downgrade(&surface);
                let state = Arc::clone(&state);
                let on_change = Arc::clone(&on_change);
                surface.listen(
                    kind,
                    Box::new(move |event| {
                        let Some(surface) = weak.upgrade() else {
                            return;
                        };
                        let rect = surface.bounding_rect();
                        // Released before notifying so on_change may read the picker.
                        let changed = lock(&state).handle(rect, event);
                        if changed {
                            on_change();
                        }
                    }),
                )
            })
            .collect();

        Self {
            surface,
            state,
            listeners,
        }
    }

    pub fn coord(&self) -> ProbeCoordinate {
        lock(&self.state).coord.get()
    }

    pub fn drag_state(&self) -> DragState {
        lock(&self.state).drag
    }

    pub fn with_canvas<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&lock(&self.state).canvas)
    }

    pub fn is_attached(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Detaches every handler. Idempotent.
    pub fn dispose(&mut self) {
        if self.listeners.is_empty() {
            return;
        }
        for id in self.listeners.drain(..) {
            self.surface.unlisten(id);
        }
        lock(&self.state).drag = DragState::Idle;
        debug!("coordinate picker disposed");
    }
}

impl<C: Canvas + 'static> Drop for CoordinateInputEngine<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

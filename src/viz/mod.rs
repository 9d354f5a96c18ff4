//! Panels that turn compute-service buffers into pixels, plus the pieces they
//! share: drawing surfaces, pointer input, the render scheduler and the
//! cross-panel refresh registry.

pub mod broadcast;
pub mod canvas;
pub mod coord_input;
pub mod layers;
pub mod legend;
pub mod neuron_response;
pub mod scheduler;
pub mod surface;

pub use broadcast::{BroadcastRegistry, DispatchReport, Subscription};
pub use canvas::{Canvas, Label, PixelCanvas, Rgba};
pub use coord_input::{CoordinateInputEngine, DragState};
pub use layers::{Cursor, GridLayout, LayerCanvasRenderer, LayerGeometry, LayerPanel};
pub use legend::{ColorScaleLegend, LegendHandle, LegendSpec, LegendState};
pub use neuron_response::{NeuronResponsePanel, NeuronResponseRenderer};
pub use scheduler::{FlightPolicy, RenderOutcome, RenderPanel, RenderScheduler};
pub use surface::{PointerEvent, PointerKind, PointerSurface, Rect, SoftSurface};

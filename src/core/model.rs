//! Shared visualization state: probe coordinate, neuron selection, topology and
//! the per-request network snapshot.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Input sample used to compute a live snapshot. Both axes stay in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProbeCoordinate {
    x: f32,
    y: f32,
}

impl ProbeCoordinate {
    pub const CENTER: ProbeCoordinate = ProbeCoordinate { x: 0.5, y: 0.5 };

    /// Builds a coordinate, clamping each axis into `[0, 1]` (NaN maps to 0).
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: clamp01(x),
            y: clamp01(y),
        }
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }

    pub fn to_array(self) -> [f32; 2] {
        [self.x, self.y]
    }
}

impl Default for ProbeCoordinate {
    fn default() -> Self {
        Self::CENTER
    }
}

fn clamp01(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// A layer of the network as seen by the visualization.
///
/// `Output` is the network's final layer and is never confused with a hidden
/// layer index (hidden layers are numbered from 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LayerRef {
    Input,
    Hidden(usize),
    Output,
}

impl LayerRef {
    /// Maps a grid row (0 = input, then hidden layers, then output) to a layer.
    pub fn from_row(row: usize, hidden_layers: usize) -> Option<Self> {
        if row == 0 {
            Some(LayerRef::Input)
        } else if row <= hidden_layers {
            Some(LayerRef::Hidden(row - 1))
        } else if row == hidden_layers + 1 {
            Some(LayerRef::Output)
        } else {
            None
        }
    }

    pub fn row(self, hidden_layers: usize) -> usize {
        match self {
            LayerRef::Input => 0,
            LayerRef::Hidden(ix) => ix + 1,
            LayerRef::Output => hidden_layers + 1,
        }
    }

    /// The layer feeding this one, if any.
    pub fn previous(self, hidden_layers: usize) -> Option<Self> {
        match self {
            LayerRef::Input => None,
            LayerRef::Hidden(0) => Some(LayerRef::Input),
            LayerRef::Hidden(ix) => Some(LayerRef::Hidden(ix - 1)),
            LayerRef::Output if hidden_layers == 0 => Some(LayerRef::Input),
            LayerRef::Output => Some(LayerRef::Hidden(hidden_layers - 1)),
        }
    }
}

impl fmt::Display for LayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerRef::Input => write!(f, "input layer"),
            LayerRef::Hidden(ix) => write!(f, "hidden layer {ix}"),
            LayerRef::Output => write!(f, "output layer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NeuronRef {
    pub layer: LayerRef,
    pub neuron: usize,
}

impl NeuronRef {
    pub fn new(layer: LayerRef, neuron: usize) -> Self {
        Self { layer, neuron }
    }
}

/// Currently selected neuron, shared by the layer grid, the response heatmap
/// and anything else that highlights it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Selection {
    #[default]
    None,
    Neuron(NeuronRef),
}

impl Selection {
    pub fn neuron(self) -> Option<NeuronRef> {
        match self {
            Selection::None => None,
            Selection::Neuron(n) => Some(n),
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, Selection::None)
    }

    /// Result of picking `hit`: picking the selected neuron again deselects it.
    pub fn toggled(self, hit: NeuronRef) -> Selection {
        match self {
            Selection::Neuron(current) if current == hit => Selection::None,
            _ => Selection::Neuron(hit),
        }
    }

    /// Drops a selection that no longer names a neuron of `topology`.
    pub fn revalidated(self, topology: &NetworkTopology) -> Selection {
        match self {
            Selection::Neuron(n) if topology.contains(n) => self,
            _ => Selection::None,
        }
    }
}

impl From<NeuronRef> for Selection {
    fn from(n: NeuronRef) -> Self {
        Selection::Neuron(n)
    }
}

/// Neuron counts per layer, as described by the configuration side.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkTopology {
    pub input: usize,
    pub hidden: Vec<usize>,
    pub output: usize,
}

impl NetworkTopology {
    pub fn new(input: usize, hidden: Vec<usize>, output: usize) -> Self {
        Self {
            input,
            hidden,
            output,
        }
    }

    /// Input + hidden + output.
    pub fn layer_count(&self) -> usize {
        self.hidden.len() + 2
    }

    pub fn neuron_count(&self, layer: LayerRef) -> Option<usize> {
        match layer {
            LayerRef::Input => Some(self.input),
            LayerRef::Hidden(ix) => self.hidden.get(ix).copied(),
            LayerRef::Output => Some(self.output),
        }
    }

    pub fn contains(&self, neuron: NeuronRef) -> bool {
        self.neuron_count(neuron.layer)
            .is_some_and(|count| neuron.neuron < count)
    }

    /// Whether this is the 2-input/1-output shape the response surface needs.
    pub fn is_planar_scalar(&self) -> bool {
        self.input == 2 && self.output == 1
    }
}

/// Largest tile edge a snapshot is ever built with. Layer buffers grow with
/// the square of the tile.
pub const MAX_TILE_SCALE: u32 = 64;

/// One computed set of per-layer color buffers for a single probe coordinate
/// and selection. Consumed and discarded by each render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub tile_scale: u32,
    pub input: Vec<u8>,
    pub hidden: Vec<Vec<u8>>,
    pub output: Vec<u8>,
    /// One RGBA color per incoming connection of the selected neuron.
    pub weights: Option<Vec<u8>>,
}

impl NetworkSnapshot {
    /// Layer buffers in grid order (input, hidden..., output).
    pub fn layers(&self) -> impl Iterator<Item = (LayerRef, &[u8])> + '_ {
        std::iter::once((LayerRef::Input, self.input.as_slice()))
            .chain(
                self.hidden
                    .iter()
                    .enumerate()
                    .map(|(ix, buf)| (LayerRef::Hidden(ix), buf.as_slice())),
            )
            .chain(std::iter::once((LayerRef::Output, self.output.as_slice())))
    }

    pub fn layer(&self, layer: LayerRef) -> Option<&[u8]> {
        match layer {
            LayerRef::Input => Some(&self.input),
            LayerRef::Hidden(ix) => self.hidden.get(ix).map(Vec::as_slice),
            LayerRef::Output => Some(&self.output),
        }
    }
}

/// A small value shared between panels living on different tasks.
#[derive(Debug, Default)]
pub struct Shared<T>(Arc<Mutex<T>>);

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Clone> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn get(&self) -> T {
        self.lock().clone()
    }

    /// Stores `value`, returning the previous one.
    pub fn set(&self, value: T) -> T {
        std::mem::replace(&mut *self.lock(), value)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether the model is currently training. Periodic renders only run while set.
#[derive(Debug, Clone, Default)]
pub struct TrainingFlag(Arc<AtomicBool>);

impl TrainingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_training(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, training: bool) {
        self.0.store(training, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_coordinate_clamps_to_unit_square() {
        let c = ProbeCoordinate::new(-0.5, 1.7);
        assert_eq!(c.to_array(), [0.0, 1.0]);
        let c = ProbeCoordinate::new(f32::NAN, 0.25);
        assert_eq!(c.to_array(), [0.0, 0.25]);
    }

    #[test]
    fn rows_map_to_layers_and_back() {
        let hidden = 2;
        assert_eq!(LayerRef::from_row(0, hidden), Some(LayerRef::Input));
        assert_eq!(LayerRef::from_row(2, hidden), Some(LayerRef::Hidden(1)));
        assert_eq!(LayerRef::from_row(3, hidden), Some(LayerRef::Output));
        assert_eq!(LayerRef::from_row(4, hidden), None);
        for row in 0..4 {
            let layer = LayerRef::from_row(row, hidden).unwrap();
            assert_eq!(layer.row(hidden), row);
        }
    }

    #[test]
    fn output_is_distinct_from_first_hidden_layer() {
        assert_ne!(LayerRef::Output, LayerRef::Hidden(0));
        assert_eq!(LayerRef::Output.previous(0), Some(LayerRef::Input));
        assert_eq!(LayerRef::Output.previous(3), Some(LayerRef::Hidden(2)));
        assert_eq!(LayerRef::Input.previous(3), None);
    }

    #[test]
    fn picking_the_same_neuron_twice_deselects() {
        let n = NeuronRef::new(LayerRef::Hidden(1), 0);
        let once = Selection::None.toggled(n);
        assert_eq!(once, Selection::Neuron(n));
        assert_eq!(once.toggled(n), Selection::None);

        let other = NeuronRef::new(LayerRef::Hidden(0), 2);
        assert_eq!(once.toggled(other), Selection::Neuron(other));
    }

    #[test]
    fn selection_is_dropped_when_topology_shrinks() {
        let sel = Selection::Neuron(NeuronRef::new(LayerRef::Hidden(1), 4));
        let wide = NetworkTopology::new(2, vec![8, 8], 1);
        let narrow = NetworkTopology::new(2, vec![8, 3], 1);
        let shallow = NetworkTopology::new(2, vec![8], 1);
        assert_eq!(sel.revalidated(&wide), sel);
        assert_eq!(sel.revalidated(&narrow), Selection::None);
        assert_eq!(sel.revalidated(&shallow), Selection::None);
    }

    #[test]
    fn shared_set_returns_previous_value() {
        let s = Shared::new(Selection::None);
        let n = Selection::Neuron(NeuronRef::new(LayerRef::Output, 0));
        let other = s.clone();
        assert_eq!(s.set(n), Selection::None);
        assert_eq!(other.get(), n);
    }
}

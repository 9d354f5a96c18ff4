//! In-process reference implementation of [`ComputeService`].

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, info};

use super::colorize::Colorizer;
use super::network::{Network, NetworkDefinition};
use crate::bridge::ComputeService;
use crate::error::{Result, VizError};
use crate::model::{
    LayerRef, NetworkSnapshot, NetworkTopology, NeuronRef, ProbeCoordinate, Selection,
    MAX_TILE_SCALE,
};
use crate::prng::Prng;

type Scratch = (Vec<f32>, Vec<f32>);

/// Owns the model context and the colorizer. Lives on the compute thread.
#[derive(Debug)]
pub struct LocalCompute {
    rng: Prng,
    colorizer: Colorizer,
    net: Option<Network>,
}

impl LocalCompute {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Prng::new(seed),
            colorizer: Colorizer::new(),
            net: None,
        }
    }

    /// Index of `layer` among the dense (non-input) layers.
    fn dense_index(net: &Network, layer: LayerRef) -> Option<usize> {
        match layer {
            LayerRef::Input => None,
            LayerRef::Hidden(ix) => Some(ix),
            LayerRef::Output => Some(net.topology().hidden.len()),
        }
    }

    fn probe_inputs(net: &Network, x: f32, y: f32) -> Vec<f32> {
        let mut inputs = vec![0.0; net.input_count()];
        for (slot, v) in inputs.iter_mut().zip([x, y]) {
            *slot = v;
        }
        inputs
    }
}

/// Fills `buf` one `size`-pixel row at a time.
fn fill_rows<F>(buf: &mut [u8], size: usize, fill: F)
where
    F: Fn(&mut Scratch, usize, &mut [u8]) + Sync,
{
    let row_bytes = size * 4;
    #[cfg(feature = "parallel")]
    buf.par_chunks_mut(row_bytes)
        .enumerate()
        .for_each_init(Scratch::default, |scratch, (y, row)| fill(scratch, y, row));
    #[cfg(not(feature = "parallel"))]
    {
        let mut scratch = Scratch::default();
        for (y, row) in buf.chunks_mut(row_bytes).enumerate() {
            fill(&mut scratch, y, row);
        }
    }
}

impl ComputeService for LocalCompute {
    fn initialize(&mut self, definition: Option<NetworkDefinition>) -> Result<()> {
        match definition {
            Some(def) => {
                let net = Network::new(&def, &mut self.rng)?;
                info!(topology = ?net.topology(), "model context built");
                self.net = Some(net);
            }
            None => {
                if self.net.take().is_some() {
                    info!("model context torn down");
                }
            }
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.net.is_some()
    }

    fn train_batch(
        &mut self,
        inputs: Vec<f32>,
        targets: Vec<f32>,
        learning_rate: f32,
    ) -> Result<Vec<f32>> {
        let net = self.net.as_mut().ok_or(VizError::NotInitialized)?;
        let (n_in, n_out) = (net.input_count(), net.output_count());
        if inputs.len() % n_in != 0 {
            return Err(VizError::malformed("training inputs", inputs.len(), n_in));
        }
        let examples = inputs.len() / n_in;
        if targets.len() != examples * n_out {
            return Err(VizError::malformed("training targets", targets.len(), n_out));
        }
        let costs: Vec<f32> = inputs
            .chunks_exact(n_in)
            .zip(targets.chunks_exact(n_out))
            .map(|(x, t)| net.train_example(x, t, learning_rate))
            .collect();
        debug!(examples, "trained batch");
        Ok(costs)
    }

    fn compute_response_matrix(&mut self, steps: usize, input_range: [f32; 2]) -> Result<Vec<f32>> {
        let net = self.net.as_ref().ok_or(VizError::NotInitialized)?;
        let topo = net.topology();
        if !topo.is_planar_scalar() {
            return Err(VizError::UnsupportedTopology {
                inputs: topo.input,
                outputs: topo.output,
            });
        }
        let [lo, hi] = input_range;
        let step = if steps == 0 { 0.0 } else { (hi - lo) / steps as f32 };
        let mut scratch = Scratch::default();
        let out_ix = topo.hidden.len();
        let mut matrix = Vec::with_capacity(steps * steps * 3);
        for ai in 0..steps {
            let a = ai as f32 * step + lo;
            for bi in 0..steps {
                let b = bi as f32 * step + lo;
                let c = net.activation_at(&[a, b], out_ix, 0, &mut scratch);
                matrix.extend_from_slice(&[a, b, c]);
            }
        }
        Ok(matrix)
    }

    fn viz_data(
        &mut self,
        coord: ProbeCoordinate,
        selection: Selection,
        tile_scale: u32,
    ) -> Option<NetworkSnapshot> {
        let net = self.net.as_mut()?;
        let inputs = Self::probe_inputs(net, coord.x(), coord.y());
        net.forward(&inputs);

        let tile_scale = tile_scale.clamp(1, MAX_TILE_SCALE);
        let tile = tile_scale as usize;
        let hidden_layers = net.topology().hidden.len();
        let colors = &self.colorizer;
        let hidden = (0..hidden_layers)
            .filter_map(|ix| net.layer_outputs(ix))
            .map(|out| colors.tiles(out, tile))
            .collect();
        let output = net
            .layer_outputs(hidden_layers)
            .map(|out| colors.tiles(out, tile))
            .unwrap_or_default();

        let weights = selection.neuron().and_then(|n| {
            let ix = Self::dense_index(net, n.layer)?;
            net.incoming_weights(ix, n.neuron).map(|w| colors.colors(w))
        });

        Some(NetworkSnapshot {
            tile_scale,
            input: colors.tiles(net.inputs(), tile),
            hidden,
            output,
            weights,
        })
    }

    fn neuron_response(&mut self, neuron: NeuronRef, size: usize) -> Option<Vec<u8>> {
        let net = self.net.as_ref()?;
        if !net.topology().contains(neuron) || size == 0 {
            return None;
        }
        let dense = Self::dense_index(net, neuron.layer);
        let colors = &self.colorizer;
        let mut buf = vec![0u8; size * size * 4];
        fill_rows(&mut buf, size, |scratch, y, row| {
            let b = 1.0 - (y as f32 + 0.5) / size as f32;
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let a = (x as f32 + 0.5) / size as f32;
                let inputs = Self::probe_inputs(net, a, b);
                let v = match dense {
                    Some(ix) => net.activation_at(&inputs, ix, neuron.neuron, scratch),
                    None => inputs.get(neuron.neuron).copied().unwrap_or(0.0),
                };
                px.copy_from_slice(&colors.color(v));
            }
        });
        Some(buf)
    }

    fn color_scale_legend(&mut self, range: [f32; 2], width: usize, height: usize) -> Vec<u8> {
        self.colorizer.legend(range, width, height)
    }

    fn topology(&self) -> Option<NetworkTopology> {
        self.net.as_ref().map(Network::topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Activation;

    fn example_definition() -> NetworkDefinition {
        NetworkDefinition::with_hidden_sizes(2, &[3, 2], 1, Activation::Relu)
    }

    fn ready() -> LocalCompute {
        let mut svc = LocalCompute::new(7);
        svc.initialize(Some(example_definition())).unwrap();
        svc
    }

    #[test]
    fn uninitialized_context_yields_none_and_not_initialized() {
        let mut svc = LocalCompute::new(1);
        assert!(!svc.is_initialized());
        assert!(svc
            .viz_data(ProbeCoordinate::CENTER, Selection::None, 16)
            .is_none());
        assert!(svc
            .neuron_response(NeuronRef::new(LayerRef::Output, 0), 8)
            .is_none());
        assert!(matches!(
            svc.train_batch(vec![0.0, 0.0], vec![0.0], 0.1),
            Err(VizError::NotInitialized)
        ));
        assert!(matches!(
            svc.compute_response_matrix(4, [0.0, 1.0]),
            Err(VizError::NotInitialized)
        ));
        assert_eq!(svc.color_scale_legend([-2.5, 2.5], 2, 3).len(), 24);
    }

    #[test]
    fn snapshot_for_selected_hidden_neuron_matches_scenario() {
        let mut svc = ready();
        let sel = Selection::Neuron(NeuronRef::new(LayerRef::Hidden(1), 0));
        let snap = svc
            .viz_data(ProbeCoordinate::new(0.3, 0.6), sel, 16)
            .unwrap();
        assert_eq!(snap.input.len(), 4 * 2 * 256);
        assert_eq!(snap.hidden[0].len(), 3072);
        assert_eq!(snap.hidden[1].len(), 2048);
        assert_eq!(snap.output.len(), 4 * 256);
        assert_eq!(snap.weights.map(|w| w.len()), Some(12));
    }

    #[test]
    fn buffer_sizes_hold_across_coordinates_and_scales() {
        let mut svc = ready();
        for &(x, y) in &[(0.0, 0.0), (1.0, 1.0), (0.25, 0.9)] {
            for tile in [1u32, 3, 8] {
                let snap = svc
                    .viz_data(ProbeCoordinate::new(x, y), Selection::None, tile)
                    .unwrap();
                let t2 = (tile * tile) as usize;
                assert_eq!(snap.hidden[0].len(), 4 * 3 * t2);
                assert_eq!(snap.hidden[1].len(), 4 * 2 * t2);
                assert_eq!(snap.output.len(), 4 * t2);
                assert!(snap.weights.is_none());
            }
        }
    }

    #[test]
    fn oversized_tiles_are_clamped() {
        let mut svc = ready();
        let snap = svc
            .viz_data(ProbeCoordinate::CENTER, Selection::None, 65_536)
            .unwrap();
        assert_eq!(snap.tile_scale, MAX_TILE_SCALE);
        let t2 = (MAX_TILE_SCALE * MAX_TILE_SCALE) as usize;
        assert_eq!(snap.output.len(), 4 * t2);
        assert_eq!(snap.hidden[0].len(), 4 * 3 * t2);

        let snap = svc.viz_data(ProbeCoordinate::CENTER, Selection::None, 0).unwrap();
        assert_eq!(snap.tile_scale, 1);
    }

    #[test]
    fn input_and_output_selection_weights() {
        let mut svc = ready();
        let input = Selection::Neuron(NeuronRef::new(LayerRef::Input, 1));
        let snap = svc.viz_data(ProbeCoordinate::CENTER, input, 4).unwrap();
        assert!(snap.weights.is_none());

        let output = Selection::Neuron(NeuronRef::new(LayerRef::Output, 0));
        let snap = svc.viz_data(ProbeCoordinate::CENTER, output, 4).unwrap();
        assert_eq!(snap.weights.map(|w| w.len()), Some(4 * 2));
    }

    #[test]
    fn neuron_response_is_square_and_rejects_unknown_neurons() {
        let mut svc = ready();
        let buf = svc
            .neuron_response(NeuronRef::new(LayerRef::Hidden(0), 2), 10)
            .unwrap();
        assert_eq!(buf.len(), 10 * 10 * 4);
        assert!(svc
            .neuron_response(NeuronRef::new(LayerRef::Hidden(0), 3), 10)
            .is_none());
        assert!(svc
            .neuron_response(NeuronRef::new(LayerRef::Hidden(2), 0), 10)
            .is_none());
    }

    #[test]
    fn input_neuron_response_is_a_ramp_along_its_axis() {
        let mut svc = ready();
        let c = Colorizer::new();
        let size = 4;
        let x_ramp = svc
            .neuron_response(NeuronRef::new(LayerRef::Input, 0), size)
            .unwrap();
        // Leftmost and rightmost pixel centers of the top row.
        assert_eq!(x_ramp[..4], c.color(0.125));
        assert_eq!(x_ramp[(size - 1) * 4..size * 4], c.color(0.875));
        let y_ramp = svc
            .neuron_response(NeuronRef::new(LayerRef::Input, 1), size)
            .unwrap();
        // Top of the canvas is y = 1.
        assert_eq!(y_ramp[..4], c.color(0.875));
    }

    #[test]
    fn response_matrix_requires_two_inputs_one_output() {
        let mut svc = ready();
        let m = svc.compute_response_matrix(4, [0.0, 1.0]).unwrap();
        assert_eq!(m.len(), 4 * 4 * 3);
        assert_eq!(&m[..2], &[0.0, 0.0]);
        assert_eq!(&m[3..5], &[0.0, 0.25]);

        let wide = NetworkDefinition::with_hidden_sizes(3, &[4], 2, Activation::Tanh);
        svc.initialize(Some(wide)).unwrap();
        assert!(matches!(
            svc.compute_response_matrix(4, [0.0, 1.0]),
            Err(VizError::UnsupportedTopology {
                inputs: 3,
                outputs: 2
            })
        ));
    }

    #[test]
    fn train_batch_checks_buffer_shapes() {
        let mut svc = ready();
        let costs = svc
            .train_batch(vec![0.1, 0.2, 0.3, 0.4], vec![1.0, 0.0], 0.01)
            .unwrap();
        assert_eq!(costs.len(), 2);
        assert!(matches!(
            svc.train_batch(vec![0.1, 0.2, 0.3], vec![1.0], 0.01),
            Err(VizError::MalformedBuffer { .. })
        ));

        svc.initialize(None).unwrap();
        assert!(svc.topology().is_none());
    }
}

//! Typed async proxy to the off-thread compute service.
//!
//! The service runs on its own OS thread and owns the model. Every call is a
//! message carrying a oneshot reply; buffers move through the channels, they
//! are never cloned on the way.

use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::engine::NetworkDefinition;
use crate::error::{Result, VizError};
use crate::model::{NetworkSnapshot, NetworkTopology, NeuronRef, ProbeCoordinate, Selection};

/// The synchronous surface implemented on the compute thread.
pub trait ComputeService: Send + 'static {
    /// `Some` (re)builds the model context, discarding prior state; `None` tears it down.
    fn initialize(&mut self, definition: Option<NetworkDefinition>) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Returns one cost per example.
    fn train_batch(
        &mut self,
        inputs: Vec<f32>,
        targets: Vec<f32>,
        learning_rate: f32,
    ) -> Result<Vec<f32>>;

    /// Flattened `(x, y, z)` triples over a `steps × steps` grid.
    fn compute_response_matrix(&mut self, steps: usize, input_range: [f32; 2]) -> Result<Vec<f32>>;

    /// `None` when no model context exists.
    fn viz_data(
        &mut self,
        coord: ProbeCoordinate,
        selection: Selection,
        tile_scale: u32,
    ) -> Option<NetworkSnapshot>;

    /// `size × size` RGBA heatmap, or `None` when there is nothing to show yet.
    fn neuron_response(&mut self, neuron: NeuronRef, size: usize) -> Option<Vec<u8>>;

    /// `width × height` RGBA vertical gradient, top = `range[1]`.
    fn color_scale_legend(&mut self, range: [f32; 2], width: usize, height: usize) -> Vec<u8>;

    fn topology(&self) -> Option<NetworkTopology>;
}

enum Call {
    Initialize {
        definition: Option<NetworkDefinition>,
        reply: oneshot::Sender<Result<()>>,
    },
    IsInitialized {
        reply: oneshot::Sender<bool>,
    },
    TrainBatch {
        inputs: Vec<f32>,
        targets: Vec<f32>,
        learning_rate: f32,
        reply: oneshot::Sender<Result<Vec<f32>>>,
    },
    ResponseMatrix {
        steps: usize,
        input_range: [f32; 2],
        reply: oneshot::Sender<Result<Vec<f32>>>,
    },
    VizData {
        coord: ProbeCoordinate,
        selection: Selection,
        tile_scale: u32,
        reply: oneshot::Sender<Option<NetworkSnapshot>>,
    },
    NeuronResponse {
        neuron: NeuronRef,
        size: usize,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Legend {
        range: [f32; 2],
        width: usize,
        height: usize,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Topology {
        reply: oneshot::Sender<Option<NetworkTopology>>,
    },
}

impl Call {
    fn serve<S: ComputeService>(self, service: &mut S) {
        // A dropped receiver means the caller stopped waiting (e.g. a timed-out
        // legend fetch); the result is discarded.
        match self {
            Call::Initialize { definition, reply } => {
                let _ = reply.send(service.initialize(definition));
            }
            Call::IsInitialized { reply } => {
                let _ = reply.send(service.is_initialized());
            }
            Call::TrainBatch {
                inputs,
                targets,
                learning_rate,
                reply,
            } => {
                let _ = reply.send(service.train_batch(inputs, targets, learning_rate));
            }
            Call::ResponseMatrix {
                steps,
                input_range,
                reply,
            } => {
                let _ = reply.send(service.compute_response_matrix(steps, input_range));
            }
            Call::VizData {
                coord,
                selection,
                tile_scale,
                reply,
            } => {
                let _ = reply.send(service.viz_data(coord, selection, tile_scale));
            }
            Call::NeuronResponse {
                neuron,
                size,
                reply,
            } => {
                let _ = reply.send(service.neuron_response(neuron, size));
            }
            Call::Legend {
                range,
                width,
                height,
                reply,
            } => {
                let _ = reply.send(service.color_scale_legend(range, width, height));
            }
            Call::Topology { reply } => {
                let _ = reply.send(service.topology());
            }
        }
    }
}

/// Cloneable handle to a compute service running on its own thread.
///
/// The thread exits once every handle has been dropped.
#[derive(Clone, Debug)]
pub struct ComputeBridge {
    tx: mpsc::UnboundedSender<Call>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Call::Initialize { .. } => "initialize",
            Call::IsInitialized { .. } => "is_initialized",
            Call::TrainBatch { .. } => "train_batch",
            Call::ResponseMatrix { .. } => "compute_response_matrix",
            Call::VizData { .. } => "get_viz_data",
            Call::NeuronResponse { .. } => "get_neuron_response",
            Call::Legend { .. } => "color_scale_legend",
            Call::Topology { .. } => "topology",
        };
        f.write_str(name)
    }
}

impl ComputeBridge {
    /// Moves `service` onto a dedicated compute thread.
    pub fn spawn<S: ComputeService>(mut service: S) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Call>();
        thread::Builder::new()
            .name("nnviz-compute".to_string())
            .spawn(move || {
                info!("compute thread started");
                while let Some(call) = rx.blocking_recv() {
                    debug!(call = ?call, "compute call");
                    call.serve(&mut service);
                }
                info!("compute thread stopped");
            })?;
        Ok(Self { tx })
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Call) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| VizError::ServiceUnavailable)?;
        rx.await.map_err(|_| VizError::ServiceUnavailable)
    }

    pub async fn initialize(&self, definition: Option<NetworkDefinition>) -> Result<()> {
        self.call(|reply| Call::Initialize { definition, reply })
            .await?
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        self.call(|reply| Call::IsInitialized { reply }).await
    }

    pub async fn train_batch(
        &self,
        inputs: Vec<f32>,
        targets: Vec<f32>,
        learning_rate: f32,
    ) -> Result<Vec<f32>> {
        self.call(|reply| Call::TrainBatch {
            inputs,
            targets,
            learning_rate,
            reply,
        })
        .await?
    }

    pub async fn compute_response_matrix(
        &self,
        steps: usize,
        input_range: [f32; 2],
    ) -> Result<Vec<f32>> {
        self.call(|reply| Call::ResponseMatrix {
            steps,
            input_range,
            reply,
        })
        .await?
    }

    pub async fn get_viz_data(
        &self,
        coord: ProbeCoordinate,
        selection: Selection,
        tile_scale: u32,
    ) -> Result<Option<NetworkSnapshot>> {
        self.call(|reply| Call::VizData {
            coord,
            selection,
            tile_scale,
            reply,
        })
        .await
    }

    pub async fn get_neuron_response(
        &self,
        neuron: NeuronRef,
        size: usize,
    ) -> Result<Option<Vec<u8>>> {
        self.call(|reply| Call::NeuronResponse {
            neuron,
            size,
            reply,
        })
        .await
    }

    pub async fn color_scale_legend(
        &self,
        range: [f32; 2],
        width: usize,
        height: usize,
    ) -> Result<Vec<u8>> {
        self.call(|reply| Call::Legend {
            range,
            width,
            height,
            reply,
        })
        .await
    }

    pub async fn topology(&self) -> Result<Option<NetworkTopology>> {
        self.call(|reply| Call::Topology { reply }).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable service for scheduler and panel tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc as std_mpsc, Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    pub(crate) struct Counters {
        pub(crate) viz: AtomicUsize,
        pub(crate) response: AtomicUsize,
        pub(crate) legend: AtomicUsize,
    }

    impl Counters {
        pub(crate) fn viz_calls(&self) -> usize {
            self.viz.load(Ordering::SeqCst)
        }

        pub(crate) fn response_calls(&self) -> usize {
            self.response.load(Ordering::SeqCst)
        }

        pub(crate) fn legend_calls(&self) -> usize {
            self.legend.load(Ordering::SeqCst)
        }
    }

    /// Serves fixed-shape snapshots for `topology`; optionally holds each
    /// viz or response request until the test releases it.
    pub(crate) struct FakeService {
        pub(crate) topology: Option<NetworkTopology>,
        pub(crate) counters: Arc<Counters>,
        pub(crate) gate: Option<Arc<Mutex<std_mpsc::Receiver<()>>>>,
        pub(crate) legend_delays: Vec<Duration>,
        pub(crate) weight_override: Option<Vec<u8>>,
    }

    impl FakeService {
        pub(crate) fn new(topology: Option<NetworkTopology>) -> Self {
            Self {
                topology,
                counters: Arc::new(Counters::default()),
                gate: None,
                legend_delays: Vec::new(),
                weight_override: None,
            }
        }

        /// Each viz or response request now waits for one `()` on the returned sender.
        pub(crate) fn gated(mut self) -> (Self, std_mpsc::Sender<()>) {
            let (tx, rx) = std_mpsc::channel();
            self.gate = Some(Arc::new(Mutex::new(rx)));
            (self, tx)
        }

        fn wait_at_gate(&self) {
            if let Some(gate) = &self.gate {
                let rx = gate.lock().unwrap();
                let _ = rx.recv_timeout(Duration::from_secs(5));
            }
        }
    }

    pub(crate) fn tile_color(layer_row: usize, neuron: usize) -> [u8; 4] {
        [(layer_row * 40) as u8, (neuron * 10) as u8, 200, 255]
    }

    fn layer_buffer(row: usize, count: usize, tile: usize) -> Vec<u8> {
        let width = count * tile;
        let mut buf = vec![0u8; width * tile * 4];
        for y in 0..tile {
            for x in 0..width {
                let px = (y * width + x) * 4;
                buf[px..px + 4].copy_from_slice(&tile_color(row, x / tile));
            }
        }
        buf
    }

    impl ComputeService for FakeService {
        fn initialize(&mut self, definition: Option<NetworkDefinition>) -> Result<()> {
            self.topology = definition.map(|d| d.topology());
            Ok(())
        }

        fn is_initialized(&self) -> bool {
            self.topology.is_some()
        }

        fn train_batch(&mut self, inputs: Vec<f32>, _: Vec<f32>, _: f32) -> Result<Vec<f32>> {
            let topo = self.topology.as_ref().ok_or(VizError::NotInitialized)?;
            Ok(vec![0.25; inputs.len() / topo.input.max(1)])
        }

        fn compute_response_matrix(&mut self, _: usize, _: [f32; 2]) -> Result<Vec<f32>> {
            Err(VizError::NotInitialized)
        }

        fn viz_data(
            &mut self,
            _coord: ProbeCoordinate,
            selection: Selection,
            tile_scale: u32,
        ) -> Option<NetworkSnapshot> {
            self.counters.viz.fetch_add(1, Ordering::SeqCst);
            self.wait_at_gate();
            let topo = self.topology.as_ref()?;
            let tile = tile_scale as usize;
            let hidden = topo
                .hidden
                .iter()
                .enumerate()
                .map(|(ix, &count)| layer_buffer(ix + 1, count, tile))
                .collect();
            let weights = match selection.neuron() {
                Some(n) => match n.layer.previous(topo.hidden.len()) {
                    Some(prev) => match &self.weight_override {
                        Some(w) => Some(w.clone()),
                        None => {
                            let count = topo.neuron_count(prev).unwrap_or(0);
                            Some((0..count).flat_map(|j| [255, j as u8, 0, 255]).collect())
                        }
                    },
                    None => None,
                },
                None => None,
            };
            Some(NetworkSnapshot {
                tile_scale,
                input: layer_buffer(0, topo.input, tile),
                hidden,
                output: layer_buffer(topo.hidden.len() + 1, topo.output, tile),
                weights,
            })
        }

        fn neuron_response(&mut self, neuron: NeuronRef, size: usize) -> Option<Vec<u8>> {
            self.counters.response.fetch_add(1, Ordering::SeqCst);
            self.wait_at_gate();
            let topo = self.topology.as_ref()?;
            if !topo.contains(neuron) {
                return None;
            }
            Some([9, neuron.neuron as u8, 9, 255].repeat(size * size))
        }

        fn color_scale_legend(&mut self, _: [f32; 2], width: usize, height: usize) -> Vec<u8> {
            let call = self.counters.legend.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.legend_delays.get(call) {
                std::thread::sleep(*delay);
            }
            [1, 2, 3, 255].repeat(width * height)
        }

        fn topology(&self) -> Option<NetworkTopology> {
            self.topology.clone()
        }
    }
}

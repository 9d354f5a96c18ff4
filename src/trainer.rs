//! Training driver: feeds random examples of a target function through the
//! compute bridge while the panels watch.

use std::collections::VecDeque;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bridge::ComputeBridge;
use crate::engine::NetworkDefinition;
use crate::error::{Result, VizError};
use crate::model::{NetworkTopology, Selection, Shared, TrainingFlag};
use crate::prng::Prng;
use crate::viz::broadcast::BroadcastRegistry;

/// Two-input, one-output functions the network can be trained to imitate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TargetFunction {
    #[default]
    Ternary,
    Multiply,
    Max,
    Min,
    FancySine,
    TiledSqrt,
    Bowl,
    Xor,
    Ridges,
}

impl TargetFunction {
    pub const ALL: [TargetFunction; 9] = [
        TargetFunction::Ternary,
        TargetFunction::Multiply,
        TargetFunction::Max,
        TargetFunction::Min,
        TargetFunction::FancySine,
        TargetFunction::TiledSqrt,
        TargetFunction::Bowl,
        TargetFunction::Xor,
        TargetFunction::Ridges,
    ];

    pub fn eval(self, a: f32, b: f32) -> f32 {
        let flag = |on: bool| if on { 1.0 } else { 0.0 };
        match self {
            TargetFunction::Ternary => flag(a > 0.5 || b > a),
            TargetFunction::Multiply => a * b,
            TargetFunction::Max => a.max(b),
            TargetFunction::Min => a.min(b),
            TargetFunction::FancySine => {
                if a < 0.1 || b < 0.1 || a > 0.9 || b > 0.9 {
                    a.max(b)
                } else {
                    (a * 6.0).sin().abs() * (b * 6.0).sin().abs()
                }
            }
            TargetFunction::TiledSqrt => {
                if (0.4..=0.6).contains(&a) && (0.4..=0.6).contains(&b) {
                    return 1.0;
                }
                let tile = |v: f32| (v * 4.0).fract();
                (tile(a) * tile(b)).sqrt()
            }
            TargetFunction::Bowl => {
                let (a, b) = (a * 2.0 - 1.0, b * 2.0 - 1.0);
                a.abs().max(b.abs()).powf(1.5)
            }
            TargetFunction::Xor => flag((a < 0.5) != (b > 0.5)),
            TargetFunction::Ridges => {
                let odd = |v: f32| (v * 5.0).floor() as i64 % 2 == 1;
                flag(odd(a) || odd(b))
            }
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TargetFunction::Ternary => "ternary",
            TargetFunction::Multiply => "multiply",
            TargetFunction::Max => "max",
            TargetFunction::Min => "min",
            TargetFunction::FancySine => "fancy_sine",
            TargetFunction::TiledSqrt => "tiled_sqrt",
            TargetFunction::Bowl => "bowl",
            TargetFunction::Xor => "xor",
            TargetFunction::Ridges => "ridges",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.label() == label)
    }
}

/// Fixed-capacity window over the most recent values.
#[derive(Debug, Clone)]
pub struct RollingHistory {
    data: VecDeque<f32>,
    capacity: usize,
}

impl RollingHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.data.len() >= self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        self.data.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last(&self) -> Option<f32> {
        self.data.back().copied()
    }

    pub fn mean(&self) -> Option<f32> {
        if self.data.is_empty() {
            return None;
        }
        Some(self.data.iter().sum::<f32>() / self.data.len() as f32)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// One training run as read from the driver's config file.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RunConfig {
    pub definition: NetworkDefinition,
    pub target: TargetFunction,
    pub examples: usize,
    pub batch_size: usize,
    /// Overrides the definition's learning rate when set.
    pub learning_rate: Option<f32>,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            definition: NetworkDefinition::default(),
            target: TargetFunction::default(),
            examples: 100_000,
            batch_size: 25_000,
            learning_rate: None,
            seed: 0x5eed,
        }
    }
}

impl RunConfig {
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate.unwrap_or(self.definition.learning_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainReport {
    pub examples: usize,
    pub batches: usize,
    /// Mean cost of the last batch.
    pub final_cost: f32,
}

/// Holds the training flag up for as long as it lives.
struct TrainingGuard(TrainingFlag);

impl TrainingGuard {
    fn engage(flag: &TrainingFlag) -> Result<Self> {
        if flag.is_training() {
            return Err(VizError::TrainingInProgress);
        }
        flag.set(true);
        Ok(Self(flag.clone()))
    }
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct Trainer {
    bridge: ComputeBridge,
    training: TrainingFlag,
    registry: BroadcastRegistry,
    selection: Shared<Selection>,
    rng: Prng,
    costs: RollingHistory,
    topology: Option<NetworkTopology>,
}

impl Trainer {
    pub const COST_HISTORY: usize = 512;

    pub fn new(
        bridge: ComputeBridge,
        training: TrainingFlag,
        registry: BroadcastRegistry,
        selection: Shared<Selection>,
        seed: u64,
    ) -> Self {
        Self {
            bridge,
            training,
            registry,
            selection,
            rng: Prng::new(seed),
            costs: RollingHistory::new(Self::COST_HISTORY),
            topology: None,
        }
    }

    pub fn costs(&self) -> &RollingHistory {
        &self.costs
    }

    pub fn topology(&self) -> Option<&NetworkTopology> {
        self.topology.as_ref()
    }

    pub fn is_training(&self) -> bool {
        self.training.is_training()
    }

    /// Rebuilds the model. Refused while training.
    pub async fn reset(&mut self, definition: NetworkDefinition) -> Result<NetworkTopology> {
        if self.training.is_training() {
            return Err(VizError::TrainingInProgress);
        }
        let topology = definition.topology();
        self.bridge.initialize(Some(definition)).await?;
        let kept = self.selection.update(|s| {
            *s = s.revalidated(&topology);
            *s
        });
        self.costs.clear();
        self.topology = Some(topology.clone());
        info!(?topology, selection = ?kept, "model reset");
        self.registry.dispatch();
        Ok(topology)
    }

    /// Tears the model down.
    pub async fn uninit(&mut self) -> Result<()> {
        if self.training.is_training() {
            return Err(VizError::TrainingInProgress);
        }
        self.bridge.initialize(None).await?;
        self.topology = None;
        self.registry.dispatch();
        Ok(())
    }

    /// Trains on `examples` random points of `target` over `[0, 1]²`.
    pub async fn train(
        &mut self,
        target: TargetFunction,
        examples: usize,
        batch_size: usize,
        learning_rate: f32,
    ) -> Result<TrainReport> {
        let topology = self.topology.as_ref().ok_or(VizError::NotInitialized)?;
        if !topology.is_planar_scalar() {
            return Err(VizError::UnsupportedTopology {
                inputs: topology.input,
                outputs: topology.output,
            });
        }
        let guard = TrainingGuard::engage(&self.training)?;
        info!(target = target.label(), examples, "training started");

        let batch_size = batch_size.max(1);
        let mut report = TrainReport {
            examples: 0,
            batches: 0,
            final_cost: 0.0,
        };
        while report.examples < examples {
            let n = batch_size.min(examples - report.examples);
            let mut inputs = vec![0.0; n * 2];
            self.rng.fill_range_f32(&mut inputs, 0.0, 1.0);
            let targets = inputs
                .chunks_exact(2)
                .map(|p| target.eval(p[0], p[1]))
                .collect();
            let costs = self.bridge.train_batch(inputs, targets, learning_rate).await?;
            let mean = costs.iter().sum::<f32>() / costs.len().max(1) as f32;
            self.costs.push(mean);
            report.examples += n;
            report.batches += 1;
            report.final_cost = mean;
            debug!(batch = report.batches, cost = mean, "batch trained");
        }

        drop(guard);
        info!(
            examples = report.examples,
            cost = report.final_cost,
            "training finished"
        );
        self.registry.dispatch();
        Ok(report)
    }

    /// Flattened `(a, b, output)` triples over `[0, 1]²`.
    pub async fn response_matrix(&self, steps: usize) -> Result<Vec<f32>> {
        self.bridge.compute_response_matrix(steps, [0.0, 1.0]).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::bridge::testing::FakeService;
    use crate::engine::Activation;
    use crate::model::{LayerRef, NeuronRef};
    use crate::viz::broadcast::Subscription;

    fn definition(hidden: &[usize]) -> NetworkDefinition {
        NetworkDefinition::with_hidden_sizes(2, hidden, 1, Activation::Relu)
    }

    fn trainer(selection: Shared<Selection>) -> (Trainer, Arc<AtomicUsize>, Subscription) {
        let bridge = ComputeBridge::spawn(FakeService::new(None)).unwrap();
        let registry = BroadcastRegistry::new();
        let dispatches = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dispatches);
        let sub = registry.register("counter", move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let t = Trainer::new(bridge, TrainingFlag::new(), registry, selection, 3);
        (t, dispatches, sub)
    }

    #[test]
    fn target_functions_match_their_definitions() {
        assert_eq!(TargetFunction::Ternary.eval(0.6, 0.0), 1.0);
        assert_eq!(TargetFunction::Ternary.eval(0.3, 0.2), 0.0);
        assert_eq!(TargetFunction::Ternary.eval(0.3, 0.4), 1.0);
        assert_eq!(TargetFunction::Multiply.eval(0.5, 0.5), 0.25);
        assert_eq!(TargetFunction::Xor.eval(0.2, 0.8), 0.0);
        assert_eq!(TargetFunction::Xor.eval(0.2, 0.2), 1.0);
        assert_eq!(TargetFunction::Bowl.eval(0.5, 0.5), 0.0);
        assert_eq!(TargetFunction::Bowl.eval(1.0, 0.5), 1.0);
        assert_eq!(TargetFunction::TiledSqrt.eval(0.5, 0.5), 1.0);
        assert_eq!(TargetFunction::Ridges.eval(0.3, 0.0), 1.0);
        assert_eq!(TargetFunction::Ridges.eval(0.1, 0.1), 0.0);
        assert_eq!(TargetFunction::FancySine.eval(0.05, 0.7), 0.7);
        for t in TargetFunction::ALL {
            assert_eq!(TargetFunction::from_label(t.label()), Some(t));
        }
        assert_eq!(TargetFunction::from_label("nope"), None);
    }

    #[test]
    fn rolling_history_keeps_the_tail() {
        let mut h = RollingHistory::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            h.push(v);
        }
        assert_eq!(h.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(h.last(), Some(4.0));
        assert_eq!(h.mean(), Some(3.0));
    }

    #[tokio::test]
    async fn reset_revalidates_selection_and_broadcasts() {
        let selection = Shared::new(Selection::Neuron(NeuronRef::new(LayerRef::Hidden(1), 1)));
        let (mut t, dispatches, _sub) = trainer(selection.clone());

        t.reset(definition(&[4, 4])).await.unwrap();
        assert!(!selection.get().is_none());
        t.reset(definition(&[4])).await.unwrap();
        assert!(selection.get().is_none());
        assert_eq!(dispatches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn train_runs_in_batches_and_lowers_the_flag() {
        let (mut t, dispatches, _sub) = trainer(Shared::new(Selection::None));
        assert!(matches!(
            t.train(TargetFunction::Max, 10, 5, 0.1).await,
            Err(VizError::NotInitialized)
        ));
        t.reset(definition(&[3, 2])).await.unwrap();

        let report = t.train(TargetFunction::Max, 100, 30, 0.1).await.unwrap();
        assert_eq!(report.examples, 100);
        assert_eq!(report.batches, 4);
        assert_eq!(report.final_cost, 0.25);
        assert_eq!(t.costs().len(), 4);
        assert!(!t.is_training());
        assert_eq!(dispatches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn busy_flag_refuses_reset_and_train() {
        let (mut t, _, _sub) = trainer(Shared::new(Selection::None));
        t.reset(definition(&[3])).await.unwrap();
        t.training.set(true);
        assert!(matches!(
            t.reset(definition(&[2])).await,
            Err(VizError::TrainingInProgress)
        ));
        assert!(matches!(
            t.train(TargetFunction::Min, 10, 10, 0.1).await,
            Err(VizError::TrainingInProgress)
        ));
        // A refused run must not clear someone else's flag.
        assert!(t.is_training());
    }

    #[tokio::test]
    async fn non_planar_networks_cannot_train_on_targets() {
        let (mut t, _, _sub) = trainer(Shared::new(Selection::None));
        let wide = NetworkDefinition::with_hidden_sizes(3, &[4], 1, Activation::Tanh);
        t.reset(wide).await.unwrap();
        assert!(matches!(
            t.train(TargetFunction::Bowl, 10, 10, 0.1).await,
            Err(VizError::UnsupportedTopology { inputs: 3, .. })
        ));
    }
}

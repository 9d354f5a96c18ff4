//! Dense feed-forward network: forward pass, MSE cost, per-example SGD.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, VizError};
use crate::model::NetworkTopology;
use crate::prng::Prng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    Identity,
    #[default]
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu => {
                if x >= 0.0 {
                    x
                } else {
                    0.01 * x
                }
            }
        }
    }

    /// Derivative at pre-activation `x`, given `y = apply(x)`.
    #[inline]
    fn derivative(self, x: f32, y: f32) -> f32 {
        match self {
            Activation::Identity => 1.0,
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if x >= 0.0 {
                    1.0
                } else {
                    0.01
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum WeightInit {
    Constant { value: f32 },
    Uniform { min: f32, max: f32 },
}

impl WeightInit {
    fn sample(self, rng: &mut Prng) -> f32 {
        match self {
            WeightInit::Constant { value } => value,
            WeightInit::Uniform { min, max } => rng.gen_range_f32(min, max),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HiddenLayerDefinition {
    pub neuron_count: usize,
    pub activation: Activation,
    pub init_weights: WeightInit,
    pub init_biases: WeightInit,
}

impl HiddenLayerDefinition {
    pub fn new(neuron_count: usize, activation: Activation) -> Self {
        Self {
            neuron_count,
            activation,
            init_weights: WeightInit::Uniform { min: -1.0, max: 1.0 },
            init_biases: WeightInit::Constant { value: 0.0 },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputLayerDefinition {
    pub neuron_count: usize,
    pub activation: Activation,
    pub init_weights: WeightInit,
}

/// What the configuration side hands the compute service.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkDefinition {
    pub input_count: usize,
    pub hidden: Vec<HiddenLayerDefinition>,
    pub output: OutputLayerDefinition,
    pub learning_rate: f32,
}

impl Default for NetworkDefinition {
    fn default() -> Self {
        Self::with_hidden_sizes(2, &[128, 64, 32], 1, Activation::Relu)
    }
}

impl NetworkDefinition {
    pub fn with_hidden_sizes(
        input_count: usize,
        hidden: &[usize],
        output_count: usize,
        activation: Activation,
    ) -> Self {
        Self {
            input_count,
            hidden: hidden
                .iter()
                .map(|&n| HiddenLayerDefinition::new(n, activation))
                .collect(),
            output: OutputLayerDefinition {
                neuron_count: output_count,
                activation: Activation::Sigmoid,
                init_weights: WeightInit::Uniform { min: -1.0, max: 1.0 },
            },
            learning_rate: 0.05,
        }
    }

    pub fn topology(&self) -> NetworkTopology {
        NetworkTopology::new(
            self.input_count,
            self.hidden.iter().map(|h| h.neuron_count).collect(),
            self.output.neuron_count,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.input_count == 0 {
            return Err(VizError::InvalidDefinition("input layer is empty".into()));
        }
        if let Some(ix) = self.hidden.iter().position(|h| h.neuron_count == 0) {
            return Err(VizError::InvalidDefinition(format!(
                "hidden layer {ix} is empty"
            )));
        }
        if self.output.neuron_count == 0 {
            return Err(VizError::InvalidDefinition("output layer is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct DenseLayer {
    inputs: usize,
    /// Row-major: `weights[neuron * inputs + input]`.
    weights: Vec<f32>,
    biases: Vec<f32>,
    activation: Activation,
    pre: Vec<f32>,
    out: Vec<f32>,
    delta: Vec<f32>,
}

impl DenseLayer {
    fn new(
        neurons: usize,
        inputs: usize,
        activation: Activation,
        init_weights: WeightInit,
        init_biases: WeightInit,
        rng: &mut Prng,
    ) -> Self {
        let weights = (0..neurons * inputs)
            .map(|_| init_weights.sample(rng))
            .collect();
        let biases = (0..neurons).map(|_| init_biases.sample(rng)).collect();
        Self {
            inputs,
            weights,
            biases,
            activation,
            pre: vec![0.0; neurons],
            out: vec![0.0; neurons],
            delta: vec![0.0; neurons],
        }
    }

    fn neurons(&self) -> usize {
        self.biases.len()
    }

    fn row(&self, neuron: usize) -> &[f32] {
        &self.weights[neuron * self.inputs..(neuron + 1) * self.inputs]
    }

    fn forward(&mut self, inputs: &[f32]) {
        for n in 0..self.neurons() {
            let z = dot(self.row(n), inputs) + self.biases[n];
            self.pre[n] = z;
            self.out[n] = self.activation.apply(z);
        }
    }

    /// Forward pass into `out` without touching the cached state.
    fn forward_into(&self, inputs: &[f32], out: &mut Vec<f32>) {
        out.clear();
        out.extend((0..self.neurons()).map(|n| {
            self.activation
                .apply(dot(self.row(n), inputs) + self.biases[n])
        }));
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Hidden layers followed by the output layer.
#[derive(Debug, Clone)]
pub struct Network {
    input: Vec<f32>,
    layers: Vec<DenseLayer>,
}

impl Network {
    pub fn new(definition: &NetworkDefinition, rng: &mut Prng) -> Result<Self> {
        definition.validate()?;
        let mut layers = Vec::with_capacity(definition.hidden.len() + 1);
        let mut inputs = definition.input_count;
        for h in &definition.hidden {
            layers.push(DenseLayer::new(
                h.neuron_count,
                inputs,
                h.activation,
                h.init_weights,
                h.init_biases,
                rng,
            ));
            inputs = h.neuron_count;
        }
        let out = &definition.output;
        layers.push(DenseLayer::new(
            out.neuron_count,
            inputs,
            out.activation,
            out.init_weights,
            WeightInit::Constant { value: 0.0 },
            rng,
        ));
        Ok(Self {
            input: vec![0.0; definition.input_count],
            layers,
        })
    }

    pub fn input_count(&self) -> usize {
        self.input.len()
    }

    pub fn output_count(&self) -> usize {
        self.layers.last().map_or(0, DenseLayer::neurons)
    }

    pub fn topology(&self) -> NetworkTopology {
        let (hidden, _) = self.layers.split_at(self.layers.len() - 1);
        NetworkTopology::new(
            self.input_count(),
            hidden.iter().map(DenseLayer::neurons).collect(),
            self.output_count(),
        )
    }

    /// Runs a forward pass and caches every layer's outputs.
    pub fn forward(&mut self, inputs: &[f32]) -> &[f32] {
        self.input.clear();
        self.input.extend_from_slice(inputs);
        self.input.resize(self.layers.first().map_or(0, |l| l.inputs), 0.0);
        for ix in 0..self.layers.len() {
            let (done, rest) = self.layers.split_at_mut(ix);
            let prev = done.last().map_or(self.input.as_slice(), |l| l.out.as_slice());
            rest[0].forward(prev);
        }
        self.outputs()
    }

    pub fn outputs(&self) -> &[f32] {
        self.layers.last().map_or(&[], |l| l.out.as_slice())
    }

    /// Cached inputs of the last forward pass.
    pub fn inputs(&self) -> &[f32] {
        &self.input
    }

    /// Cached outputs of dense layer `ix` (hidden layers first, output last).
    pub fn layer_outputs(&self, ix: usize) -> Option<&[f32]> {
        self.layers.get(ix).map(|l| l.out.as_slice())
    }

    /// Incoming weights of `neuron` in dense layer `ix`.
    pub fn incoming_weights(&self, ix: usize, neuron: usize) -> Option<&[f32]> {
        let layer = self.layers.get(ix)?;
        (neuron < layer.neurons()).then(|| layer.row(neuron))
    }

    /// Activation of `neuron` in dense layer `ix` for `inputs`, stopping at that layer.
    pub fn activation_at(
        &self,
        inputs: &[f32],
        ix: usize,
        neuron: usize,
        scratch: &mut (Vec<f32>, Vec<f32>),
    ) -> f32 {
        let (cur, next) = scratch;
        cur.clear();
        cur.extend_from_slice(inputs);
        if let Some(first) = self.layers.first() {
            cur.resize(first.inputs, 0.0);
        }
        for layer in self.layers.iter().take(ix + 1) {
            layer.forward_into(cur, next);
            std::mem::swap(cur, next);
        }
        cur.get(neuron).copied().unwrap_or(0.0)
    }

    /// One SGD step on a single example; returns its mean squared error.
    pub fn train_example(&mut self, inputs: &[f32], targets: &[f32], learning_rate: f32) -> f32 {
        self.forward(inputs);

        let n_out = self.output_count() as f32;
        let mut cost = 0.0;
        if let Some(out) = self.layers.last_mut() {
            for n in 0..out.neurons() {
                let err = out.out[n] - targets.get(n).copied().unwrap_or(0.0);
                cost += err * err;
                out.delta[n] = 2.0 * err / n_out * out.activation.derivative(out.pre[n], out.out[n]);
            }
        }

        for ix in (0..self.layers.len() - 1).rev() {
            let (lower, upper) = self.layers.split_at_mut(ix + 1);
            let layer = &mut lower[ix];
            let next = &upper[0];
            for n in 0..layer.neurons() {
                let back: f32 = (0..next.neurons())
                    .map(|m| next.weights[m * next.inputs + n] * next.delta[m])
                    .sum();
                layer.delta[n] = back * layer.activation.derivative(layer.pre[n], layer.out[n]);
            }
        }

        for ix in 0..self.layers.len() {
            let (done, rest) = self.layers.split_at_mut(ix);
            let prev = done.last().map_or(self.input.as_slice(), |l| l.out.as_slice());
            let layer = &mut rest[0];
            let inputs = layer.inputs;
            for n in 0..layer.neurons() {
                let step = learning_rate * layer.delta[n];
                for (w, x) in layer.weights[n * inputs..(n + 1) * inputs]
                    .iter_mut()
                    .zip(prev)
                {
                    *w -= step * x;
                }
                layer.biases[n] -= step;
            }
        }

        cost / n_out
    }
}

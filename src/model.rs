//! Local regression model.
//!
//! The federated core only needs the [`Model`] capability set. The concrete
//! [`MlpRegressor`] is a small fully-connected network trained with Adam on
//! mean squared error.

use anyhow::{bail, ensure};
use log::debug;
use ndarray::{Array, Array1, Array2, Axis, Dimension, Ix1, Ix2, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::common::ParameterSet;
use crate::config::ClientConfig;

pub trait Model: Send + 'static {
    fn get_weights(&self) -> ParameterSet;
    fn set_weights(&mut self, params: &ParameterSet) -> anyhow::Result<()>;
    fn fit(
        &mut self,
        x: &Array2<f32>,
        y: &Array2<f32>,
        epochs: usize,
        batch_size: usize,
    ) -> anyhow::Result<()>;
    fn predict(&self, x: &Array2<f32>) -> anyhow::Result<Array2<f32>>;
}

#[derive(Debug, Clone)]
struct Dense {
    kernel: Array2<f32>, // (inputs, units)
    bias: Array1<f32>,
}

impl Dense {
    fn glorot(inputs: usize, units: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (inputs + units) as f32).sqrt();
        let kernel = Array2::from_shape_fn((inputs, units), |_| rng.gen_range(-limit..limit));
        Self {
            kernel,
            bias: Array1::zeros(units),
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            kernel: Array2::zeros(self.kernel.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }
}

#[derive(Debug, Clone)]
struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    m: Vec<Dense>,
    v: Vec<Dense>,
}

impl Adam {
    fn new(lr: f32, layers: &[Dense]) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            m: layers.iter().map(Dense::zeros_like).collect(),
            v: layers.iter().map(Dense::zeros_like).collect(),
        }
    }

    fn update(&mut self, layers: &mut [Dense], grads: &[Dense]) {
        self.step += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let lr_t = self.lr * (1.0 - b2.powi(self.step)).sqrt() / (1.0 - b1.powi(self.step));
        let eps = self.epsilon;

        for (((layer, grad), m), v) in layers
            .iter_mut()
            .zip(grads)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            adam_step(
                &mut layer.kernel,
                &grad.kernel,
                &mut m.kernel,
                &mut v.kernel,
                b1,
                b2,
                lr_t,
                eps,
            );
            adam_step(&mut layer.bias, &grad.bias, &mut m.bias, &mut v.bias, b1, b2, lr_t, eps);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn adam_step<D: Dimension>(
    param: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    m: &mut Array<f32, D>,
    v: &mut Array<f32, D>,
    beta1: f32,
    beta2: f32,
    lr_t: f32,
    epsilon: f32,
) {
    Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *p -= lr_t * *m / (v.sqrt() + epsilon);
        });
}

/// Feed-forward regressor: ReLU hidden layers, linear output, MSE loss.
///
/// Weights are exposed as `[kernel_0, bias_0, kernel_1, bias_1, ...]` with
/// kernels shaped `(inputs, units)`.
#[derive(Debug, Clone)]
pub struct MlpRegressor {
    layers: Vec<Dense>,
    optimizer: Adam,
    rng: StdRng,
}

impl MlpRegressor {
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        hidden_units: &[usize],
        learning_rate: f32,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let widths: Vec<usize> = std::iter::once(input_dim)
            .chain(hidden_units.iter().copied())
            .chain(std::iter::once(output_dim))
            .collect();
        let layers: Vec<Dense> = widths
            .windows(2)
            .map(|w| Dense::glorot(w[0], w[1], &mut rng))
            .collect();
        let optimizer = Adam::new(learning_rate, &layers);
        Self {
            layers,
            optimizer,
            rng,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |l| l.kernel.nrows())
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, |l| l.kernel.ncols())
    }

    /// Mean squared error over every target value.
    pub fn loss(&self, x: &Array2<f32>, y: &Array2<f32>) -> anyhow::Result<f32> {
        let pred = self.predict(x)?;
        ensure!(pred.dim() == y.dim(), "targets {:?} vs predictions {:?}", y.dim(), pred.dim());
        let diff = pred - y;
        Ok(diff.mapv(|d| d * d).mean().unwrap_or(0.0))
    }

    /// Activations of every layer, input first.
    fn forward(&self, x: &Array2<f32>) -> Vec<Array2<f32>> {
        let last = self.layers.len().saturating_sub(1);
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(x.to_owned());
        for (i, layer) in self.layers.iter().enumerate() {
            let mut z = acts[i].dot(&layer.kernel) + &layer.bias;
            if i < last {
                z.mapv_inplace(|v| v.max(0.0));
            }
            acts.push(z);
        }
        acts
    }

    fn gradients(&self, x: &Array2<f32>, y: &Array2<f32>) -> Vec<Dense> {
        let acts = self.forward(x);
        let output = &acts[self.layers.len()];
        let mut delta = (output - y) * (2.0 / y.len() as f32);

        let mut grads = Vec::with_capacity(self.layers.len());
        for l in (0..self.layers.len()).rev() {
            let kernel = acts[l].t().dot(&delta);
            let bias = delta.sum_axis(Axis(0));
            if l > 0 {
                let mut upstream = delta.dot(&self.layers[l].kernel.t());
                Zip::from(&mut upstream).and(&acts[l]).for_each(|d, &a| {
                    if a <= 0.0 {
                        *d = 0.0;
                    }
                });
                delta = upstream;
            }
            grads.push(Dense { kernel, bias });
        }
        grads.reverse();
        grads
    }

    fn check_input(&self, x: &Array2<f32>) -> anyhow::Result<()> {
        ensure!(
            x.ncols() == self.input_dim(),
            "model expects {} features, got {}",
            self.input_dim(),
            x.ncols()
        );
        Ok(())
    }
}

impl Model for MlpRegressor {
    fn get_weights(&self) -> ParameterSet {
        let tensors = self
            .layers
            .iter()
            .flat_map(|l| [l.kernel.clone().into_dyn(), l.bias.clone().into_dyn()])
            .collect();
        ParameterSet::new(tensors)
    }

    fn set_weights(&mut self, params: &ParameterSet) -> anyhow::Result<()> {
        self.get_weights().ensure_same_shape(params)?;
        for (layer, pair) in self.layers.iter_mut().zip(params.tensors().chunks(2)) {
            layer.kernel = pair[0].clone().into_dimensionality::<Ix2>()?;
            layer.bias = pair[1].clone().into_dimensionality::<Ix1>()?;
        }
        Ok(())
    }

    fn fit(
        &mut self,
        x: &Array2<f32>,
        y: &Array2<f32>,
        epochs: usize,
        batch_size: usize,
    ) -> anyhow::Result<()> {
        self.check_input(x)?;
        ensure!(x.nrows() == y.nrows(), "{} feature rows, {} target rows", x.nrows(), y.nrows());
        ensure!(
            y.ncols() == self.output_dim(),
            "model predicts {} targets, got {}",
            self.output_dim(),
            y.ncols()
        );
        ensure!(batch_size > 0, "batch size must be positive");
        if x.nrows() == 0 {
            bail!("no rows to train on");
        }

        let mut order: Vec<usize> = (0..x.nrows()).collect();
        for epoch in 0..epochs {
            order.shuffle(&mut self.rng);
            for batch in order.chunks(batch_size) {
                let xb = x.select(Axis(0), batch);
                let yb = y.select(Axis(0), batch);
                let grads = self.gradients(&xb, &yb);
                self.optimizer.update(&mut self.layers, &grads);
            }
            if log::log_enabled!(log::Level::Debug) {
                debug!("epoch {}/{}: loss = {:.4}", epoch + 1, epochs, self.loss(x, y)?);
            }
        }
        Ok(())
    }

    fn predict(&self, x: &Array2<f32>) -> anyhow::Result<Array2<f32>> {
        self.check_input(x)?;
        let mut acts = self.forward(x);
        match acts.pop() {
            Some(out) => Ok(out),
            None => bail!("model has no layers"),
        }
    }
}

/// Builds the client's local model from its configuration.
pub fn build_model(input_dim: usize, output_dim: usize, config: &ClientConfig) -> MlpRegressor {
    MlpRegressor::new(
        input_dim,
        output_dim,
        &config.hidden_units,
        config.learning_rate,
        config.seed,
    )
}

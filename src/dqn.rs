use anyhow::{Result, bail, ensure};
use candle_core::backprop::GradStore;
use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

use crate::config::RunConfig;
use crate::safetensors::F32Tensor;
use crate::{NUM_ACTIONS, OBS_DIM, Observation};

// =============================================================================
// Fixed Hyperparameters
// =============================================================================

pub const HIDDEN_SIZE: usize = 64;
pub const GAMMA: f64 = 0.99;
pub const START_EPSILON: f64 = 1.0;
pub const END_EPSILON: f64 = 0.05;
pub const MAX_GRAD_NORM: f64 = 10.0;

/// Linear epsilon annealing from `START_EPSILON` to `END_EPSILON` over
/// `decay_dur` steps, clamped afterwards.
pub fn epsilon_at(step: usize, decay_dur: usize) -> f64 {
    let progress = step as f64 / decay_dur as f64;
    (START_EPSILON - (START_EPSILON - END_EPSILON) * progress).max(END_EPSILON)
}

// =============================================================================
// Q-Network (candle)
// =============================================================================

/// Input: OBS_DIM features → two hidden ReLU layers → NUM_ACTIONS Q-values
pub struct QNetwork {
    layer1: Linear,
    layer2: Linear,
    output: Linear,
}

impl QNetwork {
    pub fn new(vs: VarBuilder) -> Result<Self> {
        let layer1 = candle_nn::linear(OBS_DIM, HIDDEN_SIZE, vs.pp("layer1"))?;
        let layer2 = candle_nn::linear(HIDDEN_SIZE, HIDDEN_SIZE, vs.pp("layer2"))?;
        let output = candle_nn::linear(HIDDEN_SIZE, NUM_ACTIONS, vs.pp("output"))?;
        Ok(Self {
            layer1,
            layer2,
            output,
        })
    }

    /// Build a frozen network directly from a snapshot, e.g. for evaluation.
    pub fn from_snapshot(params: &ParamSnapshot, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_tensors(params.to_tensors(device)?, DType::F32, device);
        Self::new(vb)
    }

    /// Forward pass: observations `(batch, OBS_DIM)` → Q-values `(batch, NUM_ACTIONS)`
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.layer1.forward(x)?.relu()?;
        let h = self.layer2.forward(&h)?.relu()?;
        self.output.forward(&h)
    }
}

// =============================================================================
// Parameter Snapshots
// =============================================================================

/// Owned host-side copy of a network's parameters, sorted by variable name.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSnapshot {
    tensors: Vec<F32Tensor>,
}

/// Variable name → tensor name used by the browser visualizer.
const EXPORT_NAMES: [(&str, &str); 6] = [
    ("layer1.weight", "w0"),
    ("layer1.bias", "b0"),
    ("layer2.weight", "w2"),
    ("layer2.bias", "b2"),
    ("output.weight", "w4"),
    ("output.bias", "b4"),
];

impl ParamSnapshot {
    pub fn new(mut tensors: Vec<F32Tensor>) -> Self {
        tensors.sort_by(|a, b| a.name.cmp(&b.name));
        Self { tensors }
    }

    pub fn from_varmap(varmap: &VarMap) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock varmap for snapshot"))?;
        let mut tensors = Vec::with_capacity(data.len());
        for (name, var) in data.iter() {
            let tensor = var.as_tensor().to_device(&Device::Cpu)?.detach();
            tensors.push(F32Tensor {
                name: name.clone(),
                shape: tensor.dims().to_vec(),
                data: tensor.flatten_all()?.to_vec1::<f32>()?,
            });
        }
        Ok(Self::new(tensors))
    }

    /// Overwrite every variable in `varmap` with the snapshot's values.
    pub fn load_into(&self, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock varmap for load"))?;
        ensure!(
            data.len() == self.tensors.len(),
            "Snapshot has {} tensors but varmap has {}",
            self.tensors.len(),
            data.len()
        );
        for t in &self.tensors {
            let Some(var) = data.get(&t.name) else {
                bail!("Missing var {} in varmap during load", t.name);
            };
            let value = Tensor::from_vec(t.data.clone(), t.shape.as_slice(), var.device())?;
            var.set(&value)?;
        }
        Ok(())
    }

    pub fn to_tensors(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        self.tensors
            .iter()
            .map(|t| {
                let value = Tensor::from_vec(t.data.clone(), t.shape.as_slice(), device)?;
                Ok((t.name.clone(), value))
            })
            .collect()
    }

    pub fn tensors(&self) -> &[F32Tensor] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&F32Tensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Tensors renamed to `w0,b0,w2,b2,w4,b4`, in layer order.
    pub fn export_tensors(&self) -> Result<Vec<F32Tensor>> {
        EXPORT_NAMES
            .iter()
            .map(|(var_name, export_name)| {
                let Some(t) = self.get(var_name) else {
                    bail!("Missing parameter {var_name} for export");
                };
                Ok(F32Tensor {
                    name: export_name.to_string(),
                    ..t.clone()
                })
            })
            .collect()
    }

    /// Inverse of [`ParamSnapshot::export_tensors`].
    pub fn from_export_tensors(tensors: Vec<F32Tensor>) -> Result<Self> {
        let mut renamed = Vec::with_capacity(EXPORT_NAMES.len());
        for (var_name, export_name) in EXPORT_NAMES {
            let Some(t) = tensors.iter().find(|t| t.name == export_name) else {
                bail!("Weights file is missing tensor {export_name}");
            };
            renamed.push(F32Tensor {
                name: var_name.to_string(),
                ..t.clone()
            });
        }
        Ok(Self::new(renamed))
    }
}

/// Deterministic `(online, target)` initialisation; the target starts as an
/// exact copy of the online parameters.
pub fn fresh_params(seed: u64) -> (ParamSnapshot, ParamSnapshot) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let layers = [
        ("layer1", OBS_DIM, HIDDEN_SIZE),
        ("layer2", HIDDEN_SIZE, HIDDEN_SIZE),
        ("output", HIDDEN_SIZE, NUM_ACTIONS),
    ];
    let mut tensors = Vec::with_capacity(2 * layers.len());
    for (name, fan_in, fan_out) in layers {
        let bound = 1.0 / (fan_in as f32).sqrt();
        let weight = (0..fan_in * fan_out)
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        tensors.push(F32Tensor {
            name: format!("{name}.weight"),
            shape: vec![fan_out, fan_in],
            data: weight,
        });
        tensors.push(F32Tensor {
            name: format!("{name}.bias"),
            shape: vec![fan_out],
            data: vec![0.0; fan_out],
        });
    }
    let online = ParamSnapshot::new(tensors);
    (online.clone(), online)
}

// =============================================================================
// Experience Replay Buffer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: Observation,
    pub action: usize,
    pub reward: f32,
    pub next_state: Observation,
    /// True terminal only; step-limit truncation is stored as `false`.
    pub terminal: bool,
}

/// Fixed-capacity circular buffer stored as parallel flat arrays.
pub struct ReplayBuffer {
    states: Vec<f32>,
    actions: Vec<u32>,
    rewards: Vec<f32>,
    next_states: Vec<f32>,
    terminals: Vec<f32>,
    capacity: usize,
    cursor: usize,
    len: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: vec![0.0; capacity * OBS_DIM],
            actions: vec![0; capacity],
            rewards: vec![0.0; capacity],
            next_states: vec![0.0; capacity * OBS_DIM],
            terminals: vec![0.0; capacity],
            capacity,
            cursor: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, t: Transition) {
        let slot = self.cursor % self.capacity;
        let row = slot * OBS_DIM..(slot + 1) * OBS_DIM;
        self.states[row.clone()].copy_from_slice(&t.state);
        self.actions[slot] = t.action as u32;
        self.rewards[slot] = t.reward;
        self.next_states[row].copy_from_slice(&t.next_state);
        self.terminals[slot] = if t.terminal { 1.0 } else { 0.0 };
        self.cursor += 1;
        self.len = (self.len + 1).min(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of writes so far; the next slot is `cursor % capacity`.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn get(&self, idx: usize) -> Option<Transition> {
        if idx >= self.len {
            return None;
        }
        let row = idx * OBS_DIM..(idx + 1) * OBS_DIM;
        let mut state = [0.0; OBS_DIM];
        let mut next_state = [0.0; OBS_DIM];
        state.copy_from_slice(&self.states[row.clone()]);
        next_state.copy_from_slice(&self.next_states[row]);
        Some(Transition {
            state,
            action: self.actions[idx] as usize,
            reward: self.rewards[idx],
            next_state,
            terminal: self.terminals[idx] > 0.5,
        })
    }

    /// Sample a batch uniformly with replacement, return tensors ready for training
    pub fn sample(
        &self,
        batch_size: usize,
        dev: &Device,
        rng: &mut SmallRng,
    ) -> Result<BatchTensors> {
        ensure!(self.len > 0, "Cannot sample from an empty replay buffer");

        let mut states = Vec::with_capacity(batch_size * OBS_DIM);
        let mut actions = Vec::with_capacity(batch_size);
        let mut rewards = Vec::with_capacity(batch_size);
        let mut next_states = Vec::with_capacity(batch_size * OBS_DIM);
        let mut not_terminals = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let idx = rng.random_range(0..self.len);
            let row = idx * OBS_DIM..(idx + 1) * OBS_DIM;
            states.extend_from_slice(&self.states[row.clone()]);
            actions.push(self.actions[idx]);
            rewards.push(self.rewards[idx]);
            next_states.extend_from_slice(&self.next_states[row]);
            not_terminals.push(1.0 - self.terminals[idx]);
        }

        Ok(BatchTensors {
            states: Tensor::from_vec(states, (batch_size, OBS_DIM), dev)?,
            actions: Tensor::from_vec(actions, batch_size, dev)?,
            rewards: Tensor::from_vec(rewards, batch_size, dev)?,
            next_states: Tensor::from_vec(next_states, (batch_size, OBS_DIM), dev)?,
            not_terminals: Tensor::from_vec(not_terminals, batch_size, dev)?,
        })
    }
}

pub struct BatchTensors {
    pub states: Tensor,
    pub actions: Tensor,
    pub rewards: Tensor,
    pub next_states: Tensor,
    pub not_terminals: Tensor,
}

// =============================================================================
// Optimizer
// =============================================================================

pub const ADAM_BETA1: f64 = 0.9;
pub const ADAM_BETA2: f64 = 0.999;
pub const ADAM_EPS: f64 = 1e-8;

/// Plain bias-corrected Adam: `AdamW` with weight decay disabled.
pub fn adam_params(lr: f64) -> ParamsAdamW {
    ParamsAdamW {
        lr,
        beta1: ADAM_BETA1,
        beta2: ADAM_BETA2,
        eps: ADAM_EPS,
        weight_decay: 0.0,
    }
}

/// Rescale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
fn clip_gradients(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total_norm_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let total_norm = total_norm_sq.sqrt();
    if total_norm > max_norm {
        let clip_coef = max_norm / total_norm;
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * clip_coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(total_norm)
}

/// Elementwise Huber loss with delta 1: `0.5·d²` inside, `|d| - 0.5` outside.
fn huber(diff: &Tensor) -> candle_core::Result<Tensor> {
    let abs_diff = diff.abs()?;
    let ones = Tensor::ones_like(&abs_diff)?;
    abs_diff.lt(&ones)?.where_cond(
        &(diff.sqr()?.affine(0.5, 0.0)?),
        &(abs_diff.affine(1.0, -0.5)?),
    )
}

// =============================================================================
// DQN Agent
// =============================================================================

pub struct DqnAgent {
    pub online_varmap: VarMap,
    pub target_varmap: VarMap,
    online_net: QNetwork,
    target_net: QNetwork,
    optimizer: AdamW,
    optimizer_steps: u64,
    device: Device,
    pub replay: ReplayBuffer,
    batch_size: usize,
    learn_start: usize,
}

impl DqnAgent {
    pub fn new(
        device: &Device,
        config: &RunConfig,
        init_params: (&ParamSnapshot, &ParamSnapshot),
    ) -> Result<Self> {
        let online_varmap = VarMap::new();
        let target_varmap = VarMap::new();

        let online_vb = VarBuilder::from_varmap(&online_varmap, DType::F32, device);
        let target_vb = VarBuilder::from_varmap(&target_varmap, DType::F32, device);

        let online_net = QNetwork::new(online_vb)?;
        let target_net = QNetwork::new(target_vb)?;

        let (online, target) = init_params;
        online.load_into(&online_varmap)?;
        target.load_into(&target_varmap)?;

        let optimizer = AdamW::new(online_varmap.all_vars(), adam_params(config.lr))?;

        Ok(Self {
            online_varmap,
            target_varmap,
            online_net,
            target_net,
            optimizer,
            optimizer_steps: 0,
            device: device.clone(),
            replay: ReplayBuffer::new(config.buf_cap),
            batch_size: config.batch_size,
            learn_start: config.learn_start,
        })
    }

    pub fn q_values(&self, state: &Observation) -> Result<Vec<f32>> {
        let s = Tensor::from_slice(state, (1, OBS_DIM), &self.device)?;
        let q = self.online_net.forward(&s)?;
        Ok(q.squeeze(0)?.to_vec1::<f32>()?)
    }

    pub fn greedy_action(&self, state: &Observation) -> Result<usize> {
        let s = Tensor::from_slice(state, (1, OBS_DIM), &self.device)?;
        let q = self.online_net.forward(&s)?;
        let action = q.argmax(D::Minus1)?.squeeze(0)?.to_scalar::<u32>()? as usize;
        Ok(action)
    }

    /// Epsilon-greedy: greedy when a uniform draw exceeds `epsilon`, else random.
    pub fn select_action(
        &self,
        state: &Observation,
        epsilon: f64,
        rng: &mut SmallRng,
    ) -> Result<usize> {
        if rng.random::<f64>() > epsilon {
            self.greedy_action(state)
        } else {
            Ok(rng.random_range(0..NUM_ACTIONS))
        }
    }

    /// Store transition in replay buffer
    pub fn remember(&mut self, t: Transition) {
        self.replay.push(t);
    }

    pub fn ready_to_learn(&self) -> bool {
        self.replay.len() >= self.learn_start
    }

    /// One gradient step on a sampled batch, or `None` while the buffer is
    /// still below `learn_start`.
    pub fn train_step(&mut self, rng: &mut SmallRng) -> Result<Option<f32>> {
        if !self.ready_to_learn() {
            return Ok(None);
        }

        let batch = self.replay.sample(self.batch_size, &self.device, rng)?;

        // Q(s, a) for the actions actually taken
        let q_all = self.online_net.forward(&batch.states)?;
        let q_values = q_all.gather(&batch.actions.unsqueeze(1)?, 1)?.squeeze(1)?;

        // Target: r + gamma * max_a Q_target(s', a) * (1 - terminal)
        let next_q = self.target_net.forward(&batch.next_states)?.max(D::Minus1)?;
        let discounted = next_q.affine(GAMMA, 0.0)?;
        let target = batch.rewards.add(&discounted.mul(&batch.not_terminals)?)?;

        let diff = q_values.sub(&target.detach())?;
        let loss = huber(&diff)?.mean_all()?;

        let mut grads = loss.backward()?;
        let vars = self.online_varmap.all_vars();
        clip_gradients(&mut grads, &vars, MAX_GRAD_NORM)?;
        self.optimizer.step(&grads)?;
        self.optimizer_steps += 1;

        Ok(Some(loss.to_scalar::<f32>()?))
    }

    /// Copy online weights → target (hard copy)
    pub fn hard_update_target(&mut self) -> Result<()> {
        let online_data = self
            .online_varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock online varmap for hard update"))?;
        let mut target_data = self
            .target_varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock target varmap for hard update"))?;
        for (name, target_v) in target_data.iter_mut() {
            let online_v = online_data.get(name).ok_or_else(|| {
                anyhow::anyhow!("Missing var {name} in online varmap during hard update")
            })?;
            target_v.set(&online_v.as_tensor().detach())?;
        }
        Ok(())
    }

    pub fn online_params(&self) -> Result<ParamSnapshot> {
        ParamSnapshot::from_varmap(&self.online_varmap)
    }

    pub fn target_params(&self) -> Result<ParamSnapshot> {
        ParamSnapshot::from_varmap(&self.target_varmap)
    }

    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer_steps
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

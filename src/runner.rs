use anyhow::Result;
use candle_core::Device;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::time::Instant;
use tracing::{debug, info};

use crate::Observation;
use crate::config::RunConfig;
use crate::dqn::{DqnAgent, ParamSnapshot, Transition, epsilon_at};
use crate::env::{CartPole, CartPoleState, EnvConfig};

/// Number of completed episodes averaged for best-checkpoint selection.
pub const SCORE_WINDOW: usize = 50;

// =============================================================================
// Rolling Episode Window
// =============================================================================

/// Ring of the last `SCORE_WINDOW` episode returns.
#[derive(Debug, Clone)]
pub struct ReturnWindow {
    returns: [f32; SCORE_WINDOW],
    episodes: usize,
}

impl Default for ReturnWindow {
    fn default() -> Self {
        Self {
            returns: [0.0; SCORE_WINDOW],
            episodes: 0,
        }
    }
}

impl ReturnWindow {
    pub fn push(&mut self, episode_return: f32) {
        self.returns[self.episodes % SCORE_WINDOW] = episode_return;
        self.episodes += 1;
    }

    pub fn episodes(&self) -> usize {
        self.episodes
    }

    pub fn is_full(&self) -> bool {
        self.episodes >= SCORE_WINDOW
    }

    pub fn mean(&self) -> f32 {
        self.returns.iter().sum::<f32>() / SCORE_WINDOW as f32
    }
}

// =============================================================================
// Runner
// =============================================================================

/// What happened during a single environment step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRecord {
    /// Training loss, zero when no gradient step ran.
    pub loss: f32,
    pub reward: f32,
    pub done: bool,
    pub terminal: bool,
    pub epsilon: f64,
    pub buf_size: usize,
    pub trained: bool,
    pub target_synced: bool,
    pub best_updated: bool,
}

pub struct RunOutput {
    /// Total reward of every completed episode, in order.
    pub episode_returns: Vec<f32>,
    /// Per-step losses with the zero placeholders removed.
    pub losses: Vec<f32>,
    /// Online parameters at the best rolling-mean return.
    pub best_params: ParamSnapshot,
    pub best_score: f32,
    /// Online parameters after the last step.
    pub final_params: ParamSnapshot,
}

/// All mutable state of one training run.
pub struct Runner {
    config: RunConfig,
    env: CartPole,
    agent: DqnAgent,
    rng: SmallRng,
    obs: Observation,
    env_state: CartPoleState,
    step_index: usize,
    ep_return: f32,
    ep_len: u32,
    window: ReturnWindow,
    best_params: ParamSnapshot,
    best_score: f32,
    loss_log: Vec<f32>,
    step_rewards: Vec<f32>,
    step_dones: Vec<bool>,
}

impl Runner {
    pub fn new(
        config: RunConfig,
        init_params: (ParamSnapshot, ParamSnapshot),
        device: &Device,
    ) -> Result<Self> {
        Self::with_env_config(config, init_params, device, EnvConfig::default())
    }

    pub fn with_env_config(
        config: RunConfig,
        init_params: (ParamSnapshot, ParamSnapshot),
        device: &Device,
        env_config: EnvConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (online, target) = init_params;
        let agent = DqnAgent::new(device, &config, (&online, &target))?;
        let env = CartPole::new(env_config);
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let (obs, env_state) = env.reset(&mut rng);

        Ok(Self {
            config,
            env,
            agent,
            rng,
            obs,
            env_state,
            step_index: 0,
            ep_return: 0.0,
            ep_len: 0,
            window: ReturnWindow::default(),
            best_params: online,
            best_score: f32::NEG_INFINITY,
            loss_log: Vec::new(),
            step_rewards: Vec::new(),
            step_dones: Vec::new(),
        })
    }

    /// Advance one environment step, training and bookkeeping included.
    pub fn step(&mut self) -> Result<StepRecord> {
        let i = self.step_index;

        let epsilon = epsilon_at(i, self.config.decay_dur);
        let action = self.agent.select_action(&self.obs, epsilon, &mut self.rng)?;

        let result = self.env.step(&mut self.rng, &self.env_state, action);
        let done = result.done;
        let timeout = self.ep_len + 1 >= self.env.max_steps();
        let terminal = done && !timeout;

        self.agent.remember(Transition {
            state: self.obs,
            action,
            reward: result.reward,
            next_state: result.obs,
            terminal,
        });

        let loss = self.agent.train_step(&mut self.rng)?;

        let target_synced = i % self.config.upd_every == 0;
        if target_synced {
            self.agent.hard_update_target()?;
        }

        let finished_return = self.ep_return + result.reward;
        if done {
            let (obs, state) = self.env.reset(&mut self.rng);
            self.obs = obs;
            self.env_state = state;
            self.ep_return = 0.0;
            self.ep_len = 0;
        } else {
            self.obs = result.obs;
            self.env_state = result.state;
            self.ep_return = finished_return;
            self.ep_len += 1;
        }

        let mut best_updated = false;
        if done {
            self.window.push(finished_return);
            let rolling = self.window.mean();
            if self.window.is_full() && rolling > self.best_score {
                self.best_params = self.agent.online_params()?;
                self.best_score = rolling;
                best_updated = true;
                debug!(step = i, score = rolling, "new best rolling return");
            }
        }

        let loss_value = loss.unwrap_or(0.0);
        self.loss_log.push(loss_value);
        self.step_rewards.push(result.reward);
        self.step_dones.push(done);
        self.step_index += 1;

        Ok(StepRecord {
            loss: loss_value,
            reward: result.reward,
            done,
            terminal,
            epsilon,
            buf_size: self.agent.replay.len(),
            trained: loss.is_some(),
            target_synced,
            best_updated,
        })
    }

    pub fn agent(&self) -> &DqnAgent {
        &self.agent
    }

    pub fn steps_taken(&self) -> usize {
        self.step_index
    }

    pub fn episodes_completed(&self) -> usize {
        self.window.episodes()
    }

    pub fn best_score(&self) -> f32 {
        self.best_score
    }

    pub fn best_params(&self) -> &ParamSnapshot {
        &self.best_params
    }

    pub fn step_rewards(&self) -> &[f32] {
        &self.step_rewards
    }

    pub fn step_dones(&self) -> &[bool] {
        &self.step_dones
    }

    pub fn loss_log(&self) -> &[f32] {
        &self.loss_log
    }

    pub fn finish(self) -> Result<RunOutput> {
        Ok(RunOutput {
            episode_returns: episode_returns(&self.step_rewards, &self.step_dones),
            losses: nonzero_losses(&self.loss_log),
            final_params: self.agent.online_params()?,
            best_params: self.best_params,
            best_score: self.best_score,
        })
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Sum rewards up to each `done`; a trailing unfinished episode is dropped.
pub fn episode_returns(rewards: &[f32], dones: &[bool]) -> Vec<f32> {
    let mut returns = Vec::new();
    let mut ep_r = 0.0f32;
    for (&r, &d) in rewards.iter().zip(dones) {
        ep_r += r;
        if d {
            returns.push(ep_r);
            ep_r = 0.0;
        }
    }
    returns
}

/// Drop the zero placeholders logged on steps without a gradient update.
/// A genuine zero loss is indistinguishable and is dropped too.
pub fn nonzero_losses(losses: &[f32]) -> Vec<f32> {
    losses.iter().copied().filter(|&l| l != 0.0).collect()
}

/// Run one full training loop of `total_steps` environment steps on the CPU.
pub fn run(
    config: &RunConfig,
    total_steps: usize,
    init_params: (ParamSnapshot, ParamSnapshot),
) -> Result<RunOutput> {
    run_on(config, total_steps, init_params, &Device::Cpu)
}

pub fn run_on(
    config: &RunConfig,
    total_steps: usize,
    init_params: (ParamSnapshot, ParamSnapshot),
    device: &Device,
) -> Result<RunOutput> {
    let mut runner = Runner::new(config.clone(), init_params, device)?;
    let t_start = Instant::now();
    let log_every = (total_steps / 10).max(1);

    for _ in 0..total_steps {
        let record = runner.step()?;
        let steps = runner.steps_taken();
        if steps % log_every == 0 {
            info!(
                steps,
                episodes = runner.episodes_completed(),
                epsilon = record.epsilon,
                buf_size = record.buf_size,
                best = runner.best_score(),
                "training progress"
            );
        }
    }

    let output = runner.finish()?;
    info!(
        steps = total_steps,
        episodes = output.episode_returns.len(),
        updates = output.losses.len(),
        best = output.best_score,
        secs = t_start.elapsed().as_secs_f64(),
        "training complete"
    );
    Ok(output)
}

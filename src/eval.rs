use anyhow::{Result, ensure};
use candle_core::{D, Device, Tensor};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::info;

use crate::OBS_DIM;
use crate::dqn::{ParamSnapshot, QNetwork};
use crate::env::{CartPole, CartPoleState, EnvConfig};

pub struct EvalConfig {
    pub num_eval_episodes: usize,
    /// Episodes rolled out side by side per forward pass.
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            num_eval_episodes: 100,
            batch_size: 20,
            seed: 123,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalStats {
    /// Episodes that reached `max_score`.
    pub max_count: usize,
    pub total_episodes: usize,
    pub max_score: f32,
    pub max_pct: f64,
}

/// Greedy rollouts of `params`; reports how often the step limit is reached.
pub fn eval_max_score(params: &ParamSnapshot, config: &EvalConfig) -> Result<EvalStats> {
    eval_max_score_with(params, config, &EnvConfig::default(), &Device::Cpu)
}

pub fn eval_max_score_with(
    params: &ParamSnapshot,
    config: &EvalConfig,
    env_config: &EnvConfig,
    device: &Device,
) -> Result<EvalStats> {
    let env = CartPole::new(env_config.clone());
    let max_score = env.max_steps() as f32;

    if config.num_eval_episodes == 0 {
        info!("No evaluation episodes requested.");
        return Ok(EvalStats {
            max_count: 0,
            total_episodes: 0,
            max_score,
            max_pct: 0.0,
        });
    }
    ensure!(config.batch_size > 0, "eval batch_size must be positive");

    let net = QNetwork::from_snapshot(params, device)?;
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let num_batches = config.num_eval_episodes.div_ceil(config.batch_size);
    let mut scores = Vec::with_capacity(config.num_eval_episodes);

    for batch_idx in 0..num_batches {
        let n = config
            .batch_size
            .min(config.num_eval_episodes - batch_idx * config.batch_size);
        scores.extend(rollout_batch(&env, &net, n, device, &mut rng)?);
        info!(
            batch = batch_idx + 1,
            of = num_batches,
            episodes = scores.len(),
            "evaluating"
        );
    }

    let max_count = scores.iter().filter(|&&s| s >= max_score).count();
    let max_pct = 100.0 * max_count as f64 / config.num_eval_episodes as f64;
    Ok(EvalStats {
        max_count,
        total_episodes: config.num_eval_episodes,
        max_score,
        max_pct,
    })
}

/// Run `n` episodes in lockstep until all are done; returns each episode's score.
fn rollout_batch(
    env: &CartPole,
    net: &QNetwork,
    n: usize,
    device: &Device,
    rng: &mut SmallRng,
) -> Result<Vec<f32>> {
    let mut states: Vec<CartPoleState> = (0..n).map(|_| env.reset(rng).1).collect();
    let mut done = vec![false; n];
    let mut scores = vec![0.0f32; n];

    for _ in 0..env.max_steps() {
        let live: Vec<usize> = (0..n).filter(|&k| !done[k]).collect();
        if live.is_empty() {
            break;
        }
        let obs: Vec<f32> = live
            .iter()
            .flat_map(|&k| states[k].observation())
            .collect();
        let x = Tensor::from_vec(obs, (live.len(), OBS_DIM), device)?;
        let actions = net.forward(&x)?.argmax(D::Minus1)?.to_vec1::<u32>()?;

        for (&k, &action) in live.iter().zip(&actions) {
            let result = env.step(rng, &states[k], action as usize);
            states[k] = result.state;
            scores[k] += result.reward;
            done[k] = result.done;
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dqn::fresh_params;

    #[test]
    fn counts_every_episode() {
        let (params, _) = fresh_params(0);
        let config = EvalConfig {
            num_eval_episodes: 10,
            batch_size: 5,
            seed: 123,
        };
        let stats = eval_max_score(&params, &config).unwrap();
        assert_eq!(stats.total_episodes, 10);
        assert!(stats.max_count <= 10);
        assert_eq!(stats.max_score, 500.0);
        assert!((0.0..=100.0).contains(&stats.max_pct));
    }

    #[test]
    fn uneven_last_batch() {
        let (params, _) = fresh_params(1);
        let config = EvalConfig {
            num_eval_episodes: 7,
            batch_size: 3,
            seed: 0,
        };
        let stats = eval_max_score(&params, &config).unwrap();
        assert_eq!(stats.total_episodes, 7);
    }

    #[test]
    fn short_episodes_always_hit_max() {
        // With a two-step limit nothing can fall in time.
        let env_config = EnvConfig {
            max_steps: 2,
            ..Default::default()
        };
        let (params, _) = fresh_params(2);
        let config = EvalConfig {
            num_eval_episodes: 4,
            batch_size: 4,
            seed: 5,
        };
        let stats = eval_max_score_with(&params, &config, &env_config, &Device::Cpu).unwrap();
        assert_eq!(stats.max_count, 4);
        assert_eq!(stats.max_pct, 100.0);
    }

    #[test]
    fn zero_episodes_is_not_an_error() {
        let (params, _) = fresh_params(0);
        let config = EvalConfig {
            num_eval_episodes: 0,
            ..Default::default()
        };
        let stats = eval_max_score(&params, &config).unwrap();
        assert_eq!(stats.total_episodes, 0);
        assert_eq!(stats.max_count, 0);
    }
}

//! On-policy Monte Carlo control on the gridworld.
//!
//! Episodes are generated in batches under an epsilon-greedy policy; Q is
//! updated with an incremental mean of discounted returns (first- or
//! every-visit), and the greedy policy is re-derived after every batch.

use anyhow::{Result, ensure};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::dp::Phase;
use crate::gridworld::{
    Action, ActionValues, CellType, NUM_GRID_ACTIONS, Policy, TransitionTable,
};

pub const DEFAULT_MAX_STEPS: usize = 200;
pub const MAX_EPISODES_PER_BATCH: usize = 50;
pub const TOTAL_BATCHES: usize = 30;
/// Chosen actions within this gap of the best optimal value count as agreeing.
pub const OPTIMALITY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McConfig {
    pub gamma: f64,
    pub epsilon: f64,
    pub episodes_per_batch: usize,
    pub total_batches: usize,
    /// Start each episode on a uniformly drawn non-terminal floor cell.
    pub exploring_starts: bool,
    pub first_visit: bool,
    pub max_steps: usize,
    pub seed: u64,
}

impl Default for McConfig {
    fn default() -> Self {
        Self {
            gamma: 0.9,
            epsilon: 0.1,
            episodes_per_batch: 20,
            total_batches: TOTAL_BATCHES,
            exploring_starts: false,
            first_visit: true,
            max_steps: DEFAULT_MAX_STEPS,
            seed: 0,
        }
    }
}

impl McConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.gamma),
            "gamma must lie in [0, 1], got {}",
            self.gamma
        );
        ensure!(
            (0.0..=1.0).contains(&self.epsilon),
            "epsilon must lie in [0, 1], got {}",
            self.epsilon
        );
        ensure!(
            self.episodes_per_batch <= MAX_EPISODES_PER_BATCH,
            "episodes_per_batch must be at most {MAX_EPISODES_PER_BATCH}, got {}",
            self.episodes_per_batch
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Goal,
    Trap,
}

/// Visited states (by index) and the actions taken between them;
/// `path.len() == actions.len() + 1`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McEpisode {
    pub path: Vec<usize>,
    pub actions: Vec<Action>,
    /// `None` when the step limit ran out first.
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct McSnapshot {
    pub action_values: ActionValues,
    pub policy: Policy,
    pub phase: Phase,
    pub delta: f64,
    pub episodes: Vec<McEpisode>,
    pub total_episodes: usize,
}

/// One seed per episode slot. Slot `batch * MAX_EPISODES_PER_BATCH + ep`
/// keeps its seed whatever the batch size, so shrinking a batch replays a
/// prefix of the same episodes.
pub fn seed_pool(seed: u64, total_batches: usize) -> Vec<u64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..total_batches * MAX_EPISODES_PER_BATCH)
        .map(|_| rng.random::<u64>())
        .collect()
}

// =============================================================================
// Episode Generation
// =============================================================================

/// Roll out one epsilon-greedy episode from `start`. Each step draws, in
/// order, the exploration check, the random action and the slip.
pub fn generate_episode(
    table: &TransitionTable,
    start: usize,
    max_steps: usize,
    policy: &Policy,
    epsilon: f64,
    rng: &mut SmallRng,
) -> McEpisode {
    let mut path = vec![start];
    let mut actions = Vec::new();
    let mut state = start;

    for _ in 0..max_steps {
        let outcome = match table.cell(state) {
            CellType::Goal => Some(Outcome::Goal),
            CellType::Trap => Some(Outcome::Trap),
            _ => None,
        };
        if outcome.is_some() {
            return McEpisode {
                path,
                actions,
                outcome,
            };
        }

        let explore_draw = rng.random::<f64>();
        let action_draw = rng.random::<f64>();
        let slip_draw = rng.random::<f64>();

        let action = match policy.get(state).copied().flatten() {
            Some(greedy) if explore_draw >= epsilon => greedy,
            _ => {
                let idx = (action_draw * NUM_GRID_ACTIONS as f64) as usize;
                Action::ALL[idx.min(NUM_GRID_ACTIONS - 1)]
            }
        };
        actions.push(action);
        state = table.sample_next(state, action, slip_draw);
        path.push(state);
    }

    McEpisode {
        path,
        actions,
        outcome: None,
    }
}

/// Discounted return from every position of `path`; the last state
/// contributes its own reward.
pub fn episode_returns(table: &TransitionTable, path: &[usize], gamma: f64) -> Vec<f64> {
    let mut returns = vec![0.0; path.len()];
    let Some(&last) = path.last() else {
        return returns;
    };
    let n = path.len();
    returns[n - 1] = table.reward(last);
    for t in (0..n - 1).rev() {
        returns[t] = table.reward(path[t]) + gamma * returns[t + 1];
    }
    returns
}

/// Greedy policy over every non-wall cell, terminals included.
fn derive_policy(table: &TransitionTable, q: &ActionValues) -> Policy {
    let mut policy = vec![None; table.num_states()];
    for s in table.open_states() {
        let mut best = Action::ALL[0];
        let mut best_value = f64::NEG_INFINITY;
        for action in Action::ALL {
            if q[s][action.index()] > best_value {
                best_value = q[s][action.index()];
                best = action;
            }
        }
        policy[s] = Some(best);
    }
    policy
}

// =============================================================================
// Control Loop
// =============================================================================

/// Run `total_batches` rounds of evaluation then improvement. The returned
/// snapshots start with the initial state, then alternate an evaluation
/// snapshot (new Q, old policy, that batch's episodes) with an improvement
/// snapshot (new greedy policy).
pub fn monte_carlo_control(
    table: &TransitionTable,
    start: usize,
    config: &McConfig,
) -> Result<Vec<McSnapshot>> {
    config.validate()?;
    ensure!(
        start < table.num_states() && table.cell(start) != CellType::Wall,
        "Start state {start} is not an open cell"
    );

    let mut q = table.zero_action_values();
    for s in table.open_states().filter(|&s| table.is_terminal(s)) {
        q[s] = [table.reward(s); NUM_GRID_ACTIONS];
    }
    let start_cells: Vec<usize> = if config.exploring_starts {
        table.floor_states().collect()
    } else {
        Vec::new()
    };
    let seeds = seed_pool(config.seed, config.total_batches);

    let mut visit_counts: HashMap<(usize, Action), u32> = HashMap::new();
    let mut total_episodes = 0usize;
    let mut policy = derive_policy(table, &q);
    let mut snapshots = Vec::with_capacity(1 + 2 * config.total_batches);
    snapshots.push(McSnapshot {
        action_values: q.clone(),
        policy: policy.clone(),
        phase: Phase::Evaluation,
        delta: 0.0,
        episodes: Vec::new(),
        total_episodes,
    });

    for batch in 0..config.total_batches {
        let mut episodes = Vec::with_capacity(config.episodes_per_batch);
        let mut max_delta = 0.0f64;

        for ep in 0..config.episodes_per_batch {
            let mut rng = SmallRng::seed_from_u64(seeds[batch * MAX_EPISODES_PER_BATCH + ep]);
            let ep_start = if start_cells.is_empty() {
                start
            } else {
                start_cells[rng.random_range(0..start_cells.len())]
            };
            let episode =
                generate_episode(table, ep_start, config.max_steps, &policy, config.epsilon, &mut rng);
            total_episodes += 1;

            let returns = episode_returns(table, &episode.path, config.gamma);
            let mut visited = HashSet::new();
            for (t, &action) in episode.actions.iter().enumerate() {
                let s = episode.path[t];
                if table.is_terminal(s) {
                    continue;
                }
                if !visited.insert((s, action)) && config.first_visit {
                    continue;
                }
                let count = visit_counts.entry((s, action)).or_insert(0);
                *count += 1;
                let old = q[s][action.index()];
                let new = old + (returns[t] - old) / f64::from(*count);
                q[s][action.index()] = new;
                max_delta = max_delta.max((new - old).abs());
            }
            episodes.push(episode);
        }

        snapshots.push(McSnapshot {
            action_values: q.clone(),
            policy: policy.clone(),
            phase: Phase::Evaluation,
            delta: max_delta,
            episodes,
            total_episodes,
        });

        policy = derive_policy(table, &q);
        snapshots.push(McSnapshot {
            action_values: q.clone(),
            policy: policy.clone(),
            phase: Phase::Improvement,
            delta: 0.0,
            episodes: Vec::new(),
            total_episodes,
        });
        debug!(batch, delta = max_delta, total_episodes, "monte carlo batch");
    }

    info!(
        batches = config.total_batches,
        episodes = total_episodes,
        "monte carlo control finished"
    );
    Ok(snapshots)
}

// =============================================================================
// Comparison With an Optimal Baseline
// =============================================================================

/// Root mean squared difference of every action value over floor cells.
pub fn q_rmse(table: &TransitionTable, q: &ActionValues, optimal: &ActionValues) -> f64 {
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for s in table.floor_states() {
        for a in 0..NUM_GRID_ACTIONS {
            sum_sq += (q[s][a] - optimal[s][a]).powi(2);
            count += 1;
        }
    }
    if count == 0 { 0.0 } else { (sum_sq / count as f64).sqrt() }
}

/// Percentage of floor cells whose chosen action is optimal under `optimal`.
pub fn policy_agreement(table: &TransitionTable, policy: &Policy, optimal: &ActionValues) -> f64 {
    let mut matching = 0usize;
    let mut count = 0usize;
    for s in table.floor_states() {
        let Some(action) = policy[s] else {
            continue;
        };
        let best = optimal[s].iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if best - optimal[s][action.index()] <= OPTIMALITY_TOLERANCE {
            matching += 1;
        }
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        matching as f64 / count as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::value_iteration_q;
    use crate::gridworld::{Grid, GridLayout, RewardModel};

    fn table(layout: &GridLayout, success_prob: f64) -> TransitionTable {
        let grid = Grid::from_layout(layout).unwrap();
        TransitionTable::build(&grid, success_prob, &RewardModel::default()).unwrap()
    }

    fn corridor() -> TransitionTable {
        table(
            &GridLayout {
                rows: 1,
                cols: 3,
                walls: vec![],
                goals: vec![(0, 2)],
                traps: vec![],
                agent_start: None,
            },
            1.0,
        )
    }

    #[test]
    fn returns_accumulate_backwards() {
        let t = corridor();
        let r = episode_returns(&t, &[0, 1, 2], 0.5);
        assert_eq!(r[2], 10.0);
        assert!((r[1] - (-0.1 + 5.0)).abs() < 1e-12);
        assert!((r[0] - (-0.1 + 0.5 * 4.9)).abs() < 1e-12);
        assert!(episode_returns(&t, &[], 0.5).is_empty());
    }

    #[test]
    fn greedy_episode_walks_to_goal() {
        let t = corridor();
        let policy = vec![Some(Action::Right), Some(Action::Right), None];
        let mut rng = SmallRng::seed_from_u64(0);
        let ep = generate_episode(&t, 0, 10, &policy, 0.0, &mut rng);
        assert_eq!(ep.path, vec![0, 1, 2]);
        assert_eq!(ep.actions, vec![Action::Right, Action::Right]);
        assert_eq!(ep.outcome, Some(Outcome::Goal));
    }

    #[test]
    fn step_limit_leaves_outcome_open() {
        let t = corridor();
        let policy = vec![Some(Action::Left), Some(Action::Left), None];
        let mut rng = SmallRng::seed_from_u64(0);
        let ep = generate_episode(&t, 0, 5, &policy, 0.0, &mut rng);
        assert_eq!(ep.actions.len(), 5);
        assert_eq!(ep.path.len(), 6);
        assert_eq!(ep.outcome, None);
    }

    #[test]
    fn snapshots_alternate_after_initial() {
        let t = corridor();
        let config = McConfig {
            total_batches: 3,
            episodes_per_batch: 4,
            ..Default::default()
        };
        let snaps = monte_carlo_control(&t, 0, &config).unwrap();
        assert_eq!(snaps.len(), 1 + 2 * 3);
        assert_eq!(snaps[0].total_episodes, 0);
        for (i, pair) in snaps[1..].chunks(2).enumerate() {
            assert_eq!(pair[0].phase, Phase::Evaluation);
            assert_eq!(pair[0].episodes.len(), 4);
            assert_eq!(pair[1].phase, Phase::Improvement);
            assert!(pair[1].episodes.is_empty());
            assert_eq!(pair[1].total_episodes, 4 * (i + 1));
        }
        // Terminal action values stay pinned to the goal reward.
        assert_eq!(snaps.last().unwrap().action_values[2], [10.0; NUM_GRID_ACTIONS]);
    }

    #[test]
    fn same_seed_same_snapshots() {
        let t = corridor();
        let config = McConfig {
            total_batches: 2,
            ..Default::default()
        };
        let a = monte_carlo_control(&t, 0, &config).unwrap();
        let b = monte_carlo_control(&t, 0, &config).unwrap();
        assert_eq!(a.last().unwrap().action_values, b.last().unwrap().action_values);
        assert_eq!(a[1].episodes, b[1].episodes);
    }

    #[test]
    fn smaller_batches_replay_a_prefix() {
        let t = corridor();
        let big = McConfig {
            total_batches: 1,
            episodes_per_batch: 10,
            ..Default::default()
        };
        let small = McConfig {
            episodes_per_batch: 3,
            ..big.clone()
        };
        let a = monte_carlo_control(&t, 0, &big).unwrap();
        let b = monte_carlo_control(&t, 0, &small).unwrap();
        assert_eq!(a[1].episodes[..3], b[1].episodes[..]);
    }

    #[test]
    fn converges_towards_optimal_on_corridor() {
        let t = corridor();
        let optimal = value_iteration_q(&t, &t.zero_action_values(), 0.9, 1e-10).unwrap();
        let config = McConfig {
            exploring_starts: true,
            epsilon: 0.2,
            ..Default::default()
        };
        let snaps = monte_carlo_control(&t, 0, &config).unwrap();
        let last = snaps.last().unwrap();
        // Right from the cell next to the goal always returns exactly 8.9.
        assert_eq!(last.policy[1], Some(Action::Right));
        assert!((last.action_values[1][Action::Right.index()] - 8.9).abs() < 1e-9);
        assert!(policy_agreement(&t, &last.policy, &optimal.action_values) >= 50.0);
        assert!(
            q_rmse(&t, &last.action_values, &optimal.action_values)
                < q_rmse(&t, &snaps[0].action_values, &optimal.action_values)
        );
    }

    #[test]
    fn agreement_and_rmse_on_known_values() {
        let t = corridor();
        let mut optimal = t.zero_action_values();
        optimal[0] = [0.0, 0.0, 0.0, 1.0];
        optimal[1] = [0.0, 0.0, 0.0, 1.0];
        let policy = vec![Some(Action::Right), Some(Action::Up), None];
        assert_eq!(policy_agreement(&t, &policy, &optimal), 50.0);
        assert_eq!(q_rmse(&t, &optimal, &optimal), 0.0);
        let zeros = t.zero_action_values();
        assert!((q_rmse(&t, &zeros, &optimal) - (2.0f64 / 8.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn rejects_bad_config() {
        let t = corridor();
        let config = McConfig {
            episodes_per_batch: MAX_EPISODES_PER_BATCH + 1,
            ..Default::default()
        };
        assert!(monte_carlo_control(&t, 0, &config).is_err());
        assert!(monte_carlo_control(&t, 99, &McConfig::default()).is_err());
    }
}

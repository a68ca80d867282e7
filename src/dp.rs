//! Dynamic programming on the gridworld: value iteration and policy
//! iteration, each over state values (V) or action values (Q).
//!
//! Every solver records a snapshot per sweep so a run can be replayed. The
//! reward of a transition is the reward of the state being left, and terminal
//! states are pinned to their own reward.

use anyhow::{Result, ensure};
use serde::Serialize;
use tracing::debug;

use crate::gridworld::{
    Action, ActionValues, NUM_GRID_ACTIONS, Policy, StateValues, TransitionTable,
};

pub const MAX_VALUE_SWEEPS: usize = 500;
pub const MAX_POLICY_ITERATIONS: usize = 50;
pub const MAX_EVAL_SWEEPS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Evaluation,
    Improvement,
}

#[derive(Debug, Clone, Serialize)]
pub struct VSnapshot {
    pub values: StateValues,
    pub policy: Policy,
    pub phase: Phase,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QSnapshot {
    pub action_values: ActionValues,
    pub values: StateValues,
    pub policy: Policy,
    pub phase: Phase,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VSolution {
    pub snapshots: Vec<VSnapshot>,
    pub policy: Policy,
    pub values: StateValues,
}

#[derive(Debug, Clone, Serialize)]
pub struct QSolution {
    pub snapshots: Vec<QSnapshot>,
    pub policy: Policy,
    pub action_values: ActionValues,
    pub values: StateValues,
}

fn check_inputs(table: &TransitionTable, len: usize, gamma: f64, theta: f64) -> Result<()> {
    ensure!(
        len == table.num_states(),
        "Expected {} entries, one per cell, got {len}",
        table.num_states()
    );
    ensure!(
        (0.0..=1.0).contains(&gamma),
        "gamma must lie in [0, 1], got {gamma}"
    );
    ensure!(theta >= 0.0, "theta must be non-negative, got {theta}");
    Ok(())
}

// =============================================================================
// Shared Backups
// =============================================================================

/// Expected one-step return of taking `action` in `state` under `values`.
pub fn bellman_value(
    table: &TransitionTable,
    state: usize,
    action: Action,
    values: &[f64],
    gamma: f64,
) -> f64 {
    let reward = table.reward(state);
    table
        .outcomes(state, action)
        .iter()
        .map(|&(next, p)| p * (reward + gamma * values[next]))
        .sum()
}

/// First action with the strictly highest score.
fn argmax(mut score: impl FnMut(Action) -> f64) -> Action {
    let mut best = Action::ALL[0];
    let mut best_value = f64::NEG_INFINITY;
    for action in Action::ALL {
        let value = score(action);
        if value > best_value {
            best_value = value;
            best = action;
        }
    }
    best
}

/// One-step greedy policy on every floor cell.
pub fn greedy_policy_from_values(table: &TransitionTable, values: &[f64], gamma: f64) -> Policy {
    let mut policy = vec![None; table.num_states()];
    for s in table.floor_states() {
        policy[s] = Some(argmax(|a| bellman_value(table, s, a, values, gamma)));
    }
    policy
}

/// Greedy policy on every floor cell from action values.
pub fn greedy_policy_from_q(table: &TransitionTable, q: &ActionValues) -> Policy {
    let mut policy = vec![None; table.num_states()];
    for s in table.floor_states() {
        policy[s] = Some(argmax(|a| q[s][a.index()]));
    }
    policy
}

fn max_q(row: &[f64; NUM_GRID_ACTIONS]) -> f64 {
    let best = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if best.is_finite() { best } else { 0.0 }
}

// =============================================================================
// Value Iteration
// =============================================================================

/// Repeated Bellman optimality backups on V until the largest change over
/// non-terminal states drops below `theta`.
pub fn value_iteration_v(
    table: &TransitionTable,
    initial_values: &[f64],
    gamma: f64,
    theta: f64,
) -> Result<VSolution> {
    check_inputs(table, initial_values.len(), gamma, theta)?;
    let mut values = initial_values.to_vec();
    let mut policy = greedy_policy_from_values(table, &values, gamma);
    let mut snapshots = vec![VSnapshot {
        values: values.clone(),
        policy: policy.clone(),
        phase: Phase::Evaluation,
        delta: 0.0,
    }];

    for sweep in 0..MAX_VALUE_SWEEPS {
        let mut next = values.clone();
        let mut delta = 0.0f64;
        for s in table.open_states() {
            if table.is_terminal(s) {
                next[s] = table.reward(s);
                continue;
            }
            let best = Action::ALL
                .into_iter()
                .map(|a| bellman_value(table, s, a, &values, gamma))
                .fold(f64::NEG_INFINITY, f64::max);
            next[s] = best;
            delta = delta.max((best - values[s]).abs());
        }
        values = next;
        policy = greedy_policy_from_values(table, &values, gamma);
        snapshots.push(VSnapshot {
            values: values.clone(),
            policy: policy.clone(),
            phase: Phase::Evaluation,
            delta,
        });
        if delta < theta {
            debug!(sweeps = sweep + 1, delta, "value iteration (V) converged");
            break;
        }
    }

    Ok(VSolution {
        snapshots,
        policy,
        values,
    })
}

fn q_state_values(table: &TransitionTable, q: &ActionValues) -> StateValues {
    let mut values = vec![0.0; table.num_states()];
    for s in table.open_states() {
        values[s] = if table.is_terminal(s) {
            table.reward(s)
        } else {
            max_q(&q[s])
        };
    }
    values
}

/// Bellman optimality backups directly on Q.
pub fn value_iteration_q(
    table: &TransitionTable,
    initial_action_values: &ActionValues,
    gamma: f64,
    theta: f64,
) -> Result<QSolution> {
    check_inputs(table, initial_action_values.len(), gamma, theta)?;
    let mut q = initial_action_values.clone();
    let mut values = q_state_values(table, &q);
    let mut policy = greedy_policy_from_q(table, &q);
    let mut snapshots = vec![QSnapshot {
        action_values: q.clone(),
        values: values.clone(),
        policy: policy.clone(),
        phase: Phase::Evaluation,
        delta: 0.0,
    }];

    for sweep in 0..MAX_VALUE_SWEEPS {
        let mut next = q.clone();
        let mut delta = 0.0f64;
        for s in table.open_states() {
            if table.is_terminal(s) {
                next[s] = [table.reward(s); NUM_GRID_ACTIONS];
                continue;
            }
            let reward = table.reward(s);
            for action in Action::ALL {
                let value: f64 = table
                    .outcomes(s, action)
                    .iter()
                    .map(|&(n, p)| p * (reward + gamma * max_q(&q[n])))
                    .sum();
                next[s][action.index()] = value;
                delta = delta.max((value - q[s][action.index()]).abs());
            }
        }
        q = next;
        values = q_state_values(table, &q);
        policy = greedy_policy_from_q(table, &q);
        snapshots.push(QSnapshot {
            action_values: q.clone(),
            values: values.clone(),
            policy: policy.clone(),
            phase: Phase::Evaluation,
            delta,
        });
        if delta < theta {
            debug!(sweeps = sweep + 1, delta, "value iteration (Q) converged");
            break;
        }
    }

    Ok(QSolution {
        snapshots,
        policy,
        action_values: q,
        values,
    })
}

// =============================================================================
// Policy Iteration
// =============================================================================

fn evaluation_sweep_v(
    table: &TransitionTable,
    policy: &Policy,
    values: &[f64],
    gamma: f64,
) -> (StateValues, f64) {
    let mut next = values.to_vec();
    let mut delta = 0.0f64;
    for s in table.open_states() {
        if table.is_terminal(s) {
            next[s] = table.reward(s);
            continue;
        }
        let Some(action) = policy[s] else {
            next[s] = 0.0;
            continue;
        };
        let value = bellman_value(table, s, action, values, gamma);
        next[s] = value;
        delta = delta.max((value - values[s]).abs());
    }
    (next, delta)
}

/// Alternate iterative policy evaluation of V (up to `MAX_EVAL_SWEEPS`
/// sweeps) with greedy improvement until the policy stops changing.
pub fn policy_iteration_v(
    table: &TransitionTable,
    initial_policy: &Policy,
    initial_values: &[f64],
    gamma: f64,
    theta: f64,
) -> Result<VSolution> {
    check_inputs(table, initial_values.len(), gamma, theta)?;
    check_inputs(table, initial_policy.len(), gamma, theta)?;
    let mut policy = initial_policy.clone();
    let mut values = initial_values.to_vec();
    let mut snapshots = vec![VSnapshot {
        values: values.clone(),
        policy: policy.clone(),
        phase: Phase::Evaluation,
        delta: 0.0,
    }];

    for iteration in 0..MAX_POLICY_ITERATIONS {
        for _ in 0..MAX_EVAL_SWEEPS {
            let (next, delta) = evaluation_sweep_v(table, &policy, &values, gamma);
            values = next;
            snapshots.push(VSnapshot {
                values: values.clone(),
                policy: policy.clone(),
                phase: Phase::Evaluation,
                delta,
            });
            if delta < theta {
                break;
            }
        }

        let improved = greedy_policy_from_values(table, &values, gamma);
        let stable = improved == policy;
        policy = improved;
        snapshots.push(VSnapshot {
            values: values.clone(),
            policy: policy.clone(),
            phase: Phase::Improvement,
            delta: 0.0,
        });
        if stable {
            debug!(iterations = iteration + 1, "policy iteration (V) stable");
            break;
        }
    }

    Ok(VSolution {
        snapshots,
        policy,
        values,
    })
}

/// `V(s)` implied by Q under `policy`: the chosen action's value, or the
/// state's own reward where the policy has no action.
fn policy_value(table: &TransitionTable, s: usize, policy: &Policy, q: &ActionValues) -> f64 {
    match policy[s] {
        Some(action) => q[s][action.index()],
        None => table.reward(s),
    }
}

fn policy_state_values(table: &TransitionTable, policy: &Policy, q: &ActionValues) -> StateValues {
    let mut values = vec![0.0; table.num_states()];
    for s in table.open_states() {
        values[s] = if table.is_terminal(s) {
            table.reward(s)
        } else {
            policy_value(table, s, policy, q)
        };
    }
    values
}

fn evaluation_sweep_q(
    table: &TransitionTable,
    policy: &Policy,
    q: &ActionValues,
    gamma: f64,
) -> (ActionValues, f64) {
    let mut next = q.clone();
    let mut delta = 0.0f64;
    for s in table.open_states() {
        if table.is_terminal(s) {
            next[s] = [table.reward(s); NUM_GRID_ACTIONS];
            continue;
        }
        let reward = table.reward(s);
        for action in Action::ALL {
            let value: f64 = table
                .outcomes(s, action)
                .iter()
                .map(|&(n, p)| p * (reward + gamma * policy_value(table, n, policy, q)))
                .sum();
            next[s][action.index()] = value;
            delta = delta.max((value - q[s][action.index()]).abs());
        }
    }
    (next, delta)
}

/// Policy iteration carried out in Q-space: evaluation backs up every action
/// under the fixed policy, improvement takes the argmax of Q.
pub fn policy_iteration_q(
    table: &TransitionTable,
    initial_policy: &Policy,
    initial_action_values: &ActionValues,
    gamma: f64,
    theta: f64,
) -> Result<QSolution> {
    check_inputs(table, initial_action_values.len(), gamma, theta)?;
    check_inputs(table, initial_policy.len(), gamma, theta)?;
    let mut policy = initial_policy.clone();
    let mut q = initial_action_values.clone();
    let mut values = policy_state_values(table, &policy, &q);
    let mut snapshots = vec![QSnapshot {
        action_values: q.clone(),
        values: values.clone(),
        policy: policy.clone(),
        phase: Phase::Evaluation,
        delta: 0.0,
    }];

    for iteration in 0..MAX_POLICY_ITERATIONS {
        for _ in 0..MAX_EVAL_SWEEPS {
            let (next, delta) = evaluation_sweep_q(table, &policy, &q, gamma);
            q = next;
            values = policy_state_values(table, &policy, &q);
            snapshots.push(QSnapshot {
                action_values: q.clone(),
                values: values.clone(),
                policy: policy.clone(),
                phase: Phase::Evaluation,
                delta,
            });
            if delta < theta {
                break;
            }
        }

        let improved = greedy_policy_from_q(table, &q);
        let stable = improved == policy;
        policy = improved;
        values = policy_state_values(table, &policy, &q);
        snapshots.push(QSnapshot {
            action_values: q.clone(),
            values: values.clone(),
            policy: policy.clone(),
            phase: Phase::Improvement,
            delta: 0.0,
        });
        if stable {
            debug!(iterations = iteration + 1, "policy iteration (Q) stable");
            break;
        }
    }

    Ok(QSolution {
        snapshots,
        policy,
        action_values: q,
        values,
    })
}

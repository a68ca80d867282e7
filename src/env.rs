use rand::Rng;
use rand::rngs::SmallRng;

use crate::Observation;

// =============================================================================
// Environment Constants
// =============================================================================

const GRAVITY: f32 = 9.8;
const CART_MASS: f32 = 1.0;
const POLE_MASS: f32 = 0.1;
const TOTAL_MASS: f32 = CART_MASS + POLE_MASS;
const POLE_HALF_LENGTH: f32 = 0.5;
const POLE_MASS_LENGTH: f32 = POLE_MASS * POLE_HALF_LENGTH;
const DT: f32 = 0.02;
const RESET_BOUND: f32 = 0.05;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub force_mag: f32,
    /// Pole angle (radians) beyond which the episode terminates.
    pub angle_limit: f32,
    /// Cart position beyond which the episode terminates.
    pub position_limit: f32,
    /// Episode length at which the episode is truncated.
    pub max_steps: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            force_mag: 10.0,
            angle_limit: 12.0 * 2.0 * std::f32::consts::PI / 360.0,
            position_limit: 2.4,
            max_steps: 500,
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CartPoleState {
    pub x: f32,
    pub x_dot: f32,
    pub theta: f32,
    pub theta_dot: f32,
    /// Steps taken since the last reset.
    pub time: u32,
}

impl CartPoleState {
    pub fn observation(&self) -> Observation {
        [self.x, self.x_dot, self.theta, self.theta_dot]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepInfo {
    /// Pole fell or cart left the track.
    pub terminated: bool,
    /// Step limit reached.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StepResult {
    pub obs: Observation,
    pub state: CartPoleState,
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
}

// =============================================================================
// CartPole-v1
// =============================================================================

/// Classic cart-pole balancing task with Euler integration.
///
/// The environment itself holds only constants; the state is threaded through
/// `reset`/`step` as a plain value, so one instance can drive any number of
/// episodes side by side.
#[derive(Debug, Clone, Default)]
pub struct CartPole {
    config: EnvConfig,
}

impl CartPole {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn max_steps(&self) -> u32 {
        self.config.max_steps
    }

    pub fn reset(&self, rng: &mut SmallRng) -> (Observation, CartPoleState) {
        let mut draw = || rng.random_range(-RESET_BOUND..RESET_BOUND);
        let state = CartPoleState {
            x: draw(),
            x_dot: draw(),
            theta: draw(),
            theta_dot: draw(),
            time: 0,
        };
        (state.observation(), state)
    }

    /// Advance one step. Action `1` pushes right, anything else pushes left.
    ///
    /// The rng is unused by the deterministic dynamics but kept in the
    /// signature so stochastic variants stay drop-in.
    pub fn step(&self, _rng: &mut SmallRng, state: &CartPoleState, action: usize) -> StepResult {
        let force = if action == 1 {
            self.config.force_mag
        } else {
            -self.config.force_mag
        };
        let (sin_theta, cos_theta) = state.theta.sin_cos();

        let temp =
            (force + POLE_MASS_LENGTH * state.theta_dot * state.theta_dot * sin_theta) / TOTAL_MASS;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (POLE_HALF_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta * cos_theta / TOTAL_MASS));
        let x_acc = temp - POLE_MASS_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

        let next = CartPoleState {
            x: state.x + DT * state.x_dot,
            x_dot: state.x_dot + DT * x_acc,
            theta: state.theta + DT * state.theta_dot,
            theta_dot: state.theta_dot + DT * theta_acc,
            time: state.time + 1,
        };

        let terminated = next.theta.abs() > self.config.angle_limit
            || next.x.abs() > self.config.position_limit;
        let truncated = next.time >= self.config.max_steps;

        StepResult {
            obs: next.observation(),
            state: next,
            reward: 1.0,
            done: terminated || truncated,
            info: StepInfo {
                terminated,
                truncated,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn reset_draws_small_state() {
        let env = CartPole::default();
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..100 {
            let (obs, state) = env.reset(&mut rng);
            assert_eq!(state.time, 0);
            assert!(obs.iter().all(|v| v.abs() <= RESET_BOUND));
            assert_eq!(obs, state.observation());
        }
    }

    #[test]
    fn constant_push_terminates_on_bounds() {
        let env = CartPole::default();
        let mut rng = SmallRng::seed_from_u64(0);
        let (_, mut state) = env.reset(&mut rng);
        let mut steps = 0;
        loop {
            let result = env.step(&mut rng, &state, 1);
            steps += 1;
            assert_eq!(result.reward, 1.0);
            state = result.state;
            if result.done {
                assert!(result.info.terminated);
                assert!(!result.info.truncated);
                break;
            }
        }
        assert!(steps < 100, "always pushing right should drop the pole fast");
    }

    #[test]
    fn step_limit_truncates() {
        let env = CartPole::new(EnvConfig {
            max_steps: 3,
            ..Default::default()
        });
        let mut rng = SmallRng::seed_from_u64(0);
        let state = CartPoleState::default();
        let r1 = env.step(&mut rng, &state, 0);
        let r2 = env.step(&mut rng, &r1.state, 1);
        let r3 = env.step(&mut rng, &r2.state, 0);
        assert!(!r1.done && !r2.done);
        assert!(r3.done);
        assert!(r3.info.truncated);
        assert!(!r3.info.terminated);
    }

    #[test]
    fn push_direction_moves_cart() {
        let env = CartPole::default();
        let mut rng = SmallRng::seed_from_u64(0);
        let state = CartPoleState::default();
        let right = env.step(&mut rng, &state, 1);
        let left = env.step(&mut rng, &state, 0);
        assert!(right.state.x_dot > 0.0);
        assert!(left.state.x_dot < 0.0);
        // Pushing the cart right tips the pole left.
        assert!(right.state.theta_dot < 0.0);
    }
}

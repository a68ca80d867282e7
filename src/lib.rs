pub const OBS_DIM: usize = 4;
pub const NUM_ACTIONS: usize = 2;
pub type Observation = [f32; OBS_DIM];

pub mod config;
pub mod dp;
pub mod dqn;
pub mod env;
pub mod eval;
pub mod gridworld;
pub mod mc;
pub mod metrics;
pub mod runner;
pub mod safetensors;

pub use config::RunConfig;
pub use dqn::{
    BatchTensors, DqnAgent, ParamSnapshot, QNetwork, ReplayBuffer, Transition, adam_params,
    epsilon_at, fresh_params,
};
pub use dp::{
    Phase, QSolution, VSolution, policy_iteration_q, policy_iteration_v, value_iteration_q,
    value_iteration_v,
};
pub use env::{CartPole, CartPoleState, EnvConfig, StepInfo, StepResult};
pub use eval::{EvalConfig, EvalStats, eval_max_score, eval_max_score_with};
pub use gridworld::{
    Action, CellType, Grid, GridEpisode, GridLayout, RewardModel, TransitionTable,
};
pub use mc::{McConfig, McEpisode, McSnapshot, monte_carlo_control, policy_agreement, q_rmse};
pub use metrics::{TrainingReport, rolling_mean};
pub use safetensors::{F32Tensor, read_tensors, write_safetensors};
pub use runner::{
    ReturnWindow, RunOutput, Runner, SCORE_WINDOW, StepRecord, episode_returns, nonzero_losses,
    run, run_on,
};

use anyhow::{Result, ensure};
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use cartpole_dqn::dp::{
    policy_iteration_q, policy_iteration_v, value_iteration_q, value_iteration_v,
};
use cartpole_dqn::dqn::ParamSnapshot;
use cartpole_dqn::env::CartPole;
use cartpole_dqn::eval::{EvalConfig, EvalStats, eval_max_score_with};
use cartpole_dqn::gridworld::{
    DEFAULT_SUCCESS_PROB, Grid, GridLayout, Policy, RewardModel, TransitionTable,
};
use cartpole_dqn::mc::{McConfig, monte_carlo_control, policy_agreement, q_rmse};
use cartpole_dqn::metrics::TrainingReport;
use cartpole_dqn::runner::run_on;
use cartpole_dqn::safetensors::{read_tensors, write_safetensors};
use cartpole_dqn::{NUM_ACTIONS, RunConfig, fresh_params};

fn select_device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
}

fn log_eval(stats: &EvalStats) {
    info!(
        max_count = stats.max_count,
        total = stats.total_episodes,
        max_score = stats.max_score,
        "evaluation done"
    );
    println!(
        "{}/{} episodes reached the max score of {:.0} ({:.1}%)",
        stats.max_count, stats.total_episodes, stats.max_score, stats.max_pct
    );
}

// =============================================================================
// Train
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig {
            buf_cap: args.buf_cap,
            batch_size: args.batch_size,
            lr: args.lr,
            decay_dur: args.decay_dur,
            learn_start: args.learn_start,
            upd_every: args.upd_every,
            seed: args.seed,
        },
    };
    config.validate()?;

    let device = select_device(args.cpu);
    info!(?device, ?config, steps = args.steps, "starting DQN training");

    std::fs::create_dir_all(&args.out_dir)?;
    config.save(args.out_dir.join("config.json"))?;

    let init = fresh_params(config.seed);
    let output = run_on(&config, args.steps, init, &device)?;

    let best_path = args.out_dir.join("best.safetensors");
    write_safetensors(&best_path, &output.best_params.export_tensors()?)?;
    info!(path = %best_path.display(), score = output.best_score, "saved best weights");
    write_safetensors(
        args.out_dir.join("final.safetensors"),
        &output.final_params.export_tensors()?,
    )?;

    let report = TrainingReport::new(&output.losses, &output.episode_returns, output.best_score);
    report.save(args.out_dir.join("report.json"))?;
    println!("{}", report.summary());

    if args.eval_episodes > 0 {
        let eval_config = EvalConfig {
            num_eval_episodes: args.eval_episodes,
            batch_size: args.eval_batch_size,
            ..Default::default()
        };
        let stats =
            eval_max_score_with(&output.best_params, &eval_config, &Default::default(), &device)?;
        log_eval(&stats);
    }
    Ok(())
}

// =============================================================================
// Evaluate saved weights
// =============================================================================

fn eval(args: &EvalArgs) -> Result<()> {
    let params = ParamSnapshot::from_export_tensors(read_tensors(&args.weights)?)?;
    info!(weights = %args.weights.display(), "loaded weights");
    let config = EvalConfig {
        num_eval_episodes: args.episodes,
        batch_size: args.batch_size,
        seed: args.seed,
    };
    let device = select_device(args.cpu);
    let stats = eval_max_score_with(&params, &config, &Default::default(), &device)?;
    log_eval(&stats);
    Ok(())
}

// =============================================================================
// Random baseline
// =============================================================================

fn baseline(args: &BaselineArgs) -> Result<()> {
    info!(episodes = args.episodes, "running random agent baseline");
    let env = CartPole::default();
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let t_start = Instant::now();
    let mut returns = Vec::with_capacity(args.episodes);

    for _ in 0..args.episodes {
        let (_, mut state) = env.reset(&mut rng);
        let mut ep_reward = 0.0f32;
        loop {
            let action = rng.random_range(0..NUM_ACTIONS);
            let result = env.step(&mut rng, &state, action);
            ep_reward += result.reward;
            state = result.state;
            if result.done {
                break;
            }
        }
        returns.push(ep_reward);
    }

    if returns.is_empty() {
        info!("No episodes requested.");
        return Ok(());
    }
    let mean = returns.iter().sum::<f32>() / returns.len() as f32;
    let max = returns.iter().copied().fold(f32::MIN, f32::max);
    println!(
        "Baseline: mean={mean:.1}, max={max:.1} over {} episodes ({:.2}s)",
        returns.len(),
        t_start.elapsed().as_secs_f64()
    );
    Ok(())
}

// =============================================================================
// Gridworld solvers
// =============================================================================

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let writer = std::io::BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer(writer, value)?;
    info!(path = %path.display(), "wrote snapshots");
    Ok(())
}

fn print_solution(table: &TransitionTable, policy: &Policy, values: &[f64], snapshots: usize) {
    println!("{snapshots} snapshots");
    println!("{}", table.render_values(values));
    println!("{}", table.render_policy(policy));
}

fn gridworld(args: &GridworldArgs) -> Result<()> {
    let layout = match &args.layout {
        Some(path) => GridLayout::load(path)?,
        None => GridLayout::medium(),
    };
    let grid = Grid::from_layout(&layout)?;
    let table = TransitionTable::build(&grid, args.success_prob, &RewardModel::default())?;
    let mut rng = SmallRng::seed_from_u64(args.seed);
    info!(
        method = ?args.method,
        rows = table.rows(),
        cols = table.cols(),
        gamma = args.gamma,
        "solving gridworld"
    );

    match args.method {
        GridMethod::ValueV => {
            let sol = value_iteration_v(&table, &table.zero_values(), args.gamma, args.theta)?;
            print_solution(&table, &sol.policy, &sol.values, sol.snapshots.len());
            if let Some(out) = &args.out {
                write_json(out, &sol)?;
            }
        }
        GridMethod::ValueQ => {
            let sol =
                value_iteration_q(&table, &table.zero_action_values(), args.gamma, args.theta)?;
            print_solution(&table, &sol.policy, &sol.values, sol.snapshots.len());
            if let Some(out) = &args.out {
                write_json(out, &sol)?;
            }
        }
        GridMethod::PolicyV => {
            let initial = table.random_policy(&mut rng);
            let sol =
                policy_iteration_v(&table, &initial, &table.zero_values(), args.gamma, args.theta)?;
            print_solution(&table, &sol.policy, &sol.values, sol.snapshots.len());
            if let Some(out) = &args.out {
                write_json(out, &sol)?;
            }
        }
        GridMethod::PolicyQ => {
            let initial = table.random_policy(&mut rng);
            let sol = policy_iteration_q(
                &table,
                &initial,
                &table.zero_action_values(),
                args.gamma,
                args.theta,
            )?;
            print_solution(&table, &sol.policy, &sol.values, sol.snapshots.len());
            if let Some(out) = &args.out {
                write_json(out, &sol)?;
            }
        }
        GridMethod::MonteCarlo => {
            let (row, col) = layout.start();
            ensure!(
                row < table.rows() && col < table.cols(),
                "Agent start ({row}, {col}) is outside the grid"
            );
            let config = McConfig {
                gamma: args.gamma,
                epsilon: args.epsilon,
                episodes_per_batch: args.episodes_per_batch,
                exploring_starts: args.exploring_starts,
                first_visit: !args.every_visit,
                seed: args.seed,
                ..Default::default()
            };
            let snapshots = monte_carlo_control(&table, table.state_index(row, col), &config)?;
            let optimal =
                value_iteration_q(&table, &table.zero_action_values(), args.gamma, 1e-8)?;
            if let Some(last) = snapshots.last() {
                let values: Vec<f64> = last
                    .action_values
                    .iter()
                    .map(|q| q.iter().copied().fold(f64::NEG_INFINITY, f64::max))
                    .collect();
                print_solution(&table, &last.policy, &values, snapshots.len());
                println!(
                    "policy agreement {:.1}%, Q rmse {:.3} after {} episodes",
                    policy_agreement(&table, &last.policy, &optimal.action_values),
                    q_rmse(&table, &last.action_values, &optimal.action_values),
                    last.total_episodes
                );
            }
            if let Some(out) = &args.out {
                write_json(out, &snapshots)?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "cartpole-dqn", about = "CartPole-v1 DQN agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a DQN agent and export the best weights
    Train(TrainArgs),
    /// Evaluate exported weights with a greedy policy
    Eval(EvalArgs),
    /// Run random agent baseline
    Baseline(BaselineArgs),
    /// Solve the slippery gridworld with DP or Monte Carlo control
    Gridworld(GridworldArgs),
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum GridMethod {
    ValueV,
    ValueQ,
    PolicyV,
    PolicyQ,
    MonteCarlo,
}

#[derive(Parser)]
struct TrainArgs {
    /// JSON run config; overrides the hyperparameter flags below
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "50000")]
    steps: usize,
    #[arg(long, default_value_t = RunConfig::default().buf_cap)]
    buf_cap: usize,
    #[arg(long, default_value_t = RunConfig::default().batch_size)]
    batch_size: usize,
    #[arg(long, default_value_t = RunConfig::default().lr)]
    lr: f64,
    #[arg(long, default_value_t = RunConfig::default().decay_dur)]
    decay_dur: usize,
    #[arg(long, default_value_t = RunConfig::default().learn_start)]
    learn_start: usize,
    #[arg(long, default_value_t = RunConfig::default().upd_every)]
    upd_every: usize,
    #[arg(long, default_value_t = RunConfig::default().seed)]
    seed: u64,
    #[arg(long, default_value = "checkpoints")]
    out_dir: PathBuf,
    #[arg(long, default_value = "100")]
    eval_episodes: usize,
    #[arg(long, default_value = "20")]
    eval_batch_size: usize,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct EvalArgs {
    #[arg(long)]
    weights: PathBuf,
    #[arg(long, default_value = "100")]
    episodes: usize,
    #[arg(long, default_value = "20")]
    batch_size: usize,
    #[arg(long, default_value = "123")]
    seed: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct GridworldArgs {
    #[arg(long, value_enum, default_value_t = GridMethod::ValueV)]
    method: GridMethod,
    /// JSON grid layout; the built-in 6x8 maze when omitted
    #[arg(long)]
    layout: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_SUCCESS_PROB)]
    success_prob: f64,
    #[arg(long, default_value = "0.9")]
    gamma: f64,
    #[arg(long, default_value = "0.0001")]
    theta: f64,
    #[arg(long, default_value = "0.1")]
    epsilon: f64,
    #[arg(long, default_value = "20")]
    episodes_per_batch: usize,
    #[arg(long, default_value_t = false)]
    exploring_starts: bool,
    #[arg(long, default_value_t = false)]
    every_visit: bool,
    #[arg(long, default_value = "0")]
    seed: u64,
    /// Write every snapshot as JSON
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Parser)]
struct BaselineArgs {
    #[arg(long, default_value = "100")]
    episodes: usize,
    #[arg(long, default_value = "0")]
    seed: u64,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Eval(args) => eval(args),
        Commands::Baseline(args) => baseline(args),
        Commands::Gridworld(args) => gridworld(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_flags_default_to_preset() {
        let cli = Cli::try_parse_from(["cartpole-dqn", "train"]).unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train subcommand");
        };
        let from_flags = RunConfig {
            buf_cap: args.buf_cap,
            batch_size: args.batch_size,
            lr: args.lr,
            decay_dur: args.decay_dur,
            learn_start: args.learn_start,
            upd_every: args.upd_every,
            seed: args.seed,
        };
        assert_eq!(from_flags, RunConfig::default());
    }

    #[test]
    fn gridworld_method_parses() {
        let cli =
            Cli::try_parse_from(["cartpole-dqn", "gridworld", "--method", "monte-carlo"]).unwrap();
        let Commands::Gridworld(args) = cli.command else {
            panic!("expected gridworld subcommand");
        };
        assert!(matches!(args.method, GridMethod::MonteCarlo));
        assert_eq!(args.success_prob, DEFAULT_SUCCESS_PROB);
    }
}

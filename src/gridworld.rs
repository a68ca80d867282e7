//! Slippery gridworld MDP.
//!
//! Cells are addressed by a flat state index `row * cols + col`. An action
//! moves in its intended direction with probability `success_prob` and slips
//! to either perpendicular direction with `(1 - success_prob) / 2` each.
//! Moves into a wall or off the grid leave the agent in place. Goal and trap
//! cells are terminal.

use anyhow::{Context, Result, ensure};
use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use tracing::warn;

pub const NUM_GRID_ACTIONS: usize = 4;
pub const DEFAULT_SUCCESS_PROB: f64 = 0.8;

// =============================================================================
// Cells and Actions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Floor,
    Wall,
    Goal,
    Trap,
}

impl CellType {
    pub fn is_terminal(self) -> bool {
        matches!(self, CellType::Goal | CellType::Trap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Up,
    Down,
    Left,
    Right,
}

impl Action {
    /// Canonical order; ties in every argmax resolve to the earliest entry.
    pub const ALL: [Action; NUM_GRID_ACTIONS] =
        [Action::Up, Action::Down, Action::Left, Action::Right];

    pub fn index(self) -> usize {
        match self {
            Action::Up => 0,
            Action::Down => 1,
            Action::Left => 2,
            Action::Right => 3,
        }
    }

    pub fn perpendicular(self) -> [Action; 2] {
        match self {
            Action::Up | Action::Down => [Action::Left, Action::Right],
            Action::Left | Action::Right => [Action::Up, Action::Down],
        }
    }

    fn offset(self) -> (isize, isize) {
        match self {
            Action::Up => (-1, 0),
            Action::Down => (1, 0),
            Action::Left => (0, -1),
            Action::Right => (0, 1),
        }
    }

    pub fn arrow(self) -> char {
        match self {
            Action::Up => '^',
            Action::Down => 'v',
            Action::Left => '<',
            Action::Right => '>',
        }
    }
}

// =============================================================================
// Layout and Grid
// =============================================================================

/// Sparse description of a grid: everything not listed is floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLayout {
    pub rows: usize,
    pub cols: usize,
    #[serde(default)]
    pub walls: Vec<(usize, usize)>,
    #[serde(default)]
    pub goals: Vec<(usize, usize)>,
    #[serde(default)]
    pub traps: Vec<(usize, usize)>,
    #[serde(default)]
    pub agent_start: Option<(usize, usize)>,
}

impl GridLayout {
    /// 6x8 maze with one goal in the bottom-right corner and a trap above it.
    pub fn medium() -> Self {
        Self {
            rows: 6,
            cols: 8,
            walls: vec![
                (0, 3),
                (1, 1),
                (1, 3),
                (1, 5),
                (1, 6),
                (3, 1),
                (3, 2),
                (3, 4),
                (3, 5),
                (5, 1),
                (5, 2),
                (5, 4),
            ],
            goals: vec![(5, 7)],
            traps: vec![(3, 7)],
            agent_start: Some((0, 0)),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open grid layout {}", path.display()))?;
        let layout: GridLayout = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse grid layout {}", path.display()))?;
        Ok(layout)
    }

    pub fn start(&self) -> (usize, usize) {
        self.agent_start.unwrap_or((0, 0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<CellType>,
}

impl Grid {
    /// Walls are placed first, then goals, then traps, so a later list wins
    /// on overlap. Out-of-range coordinates are skipped.
    pub fn from_layout(layout: &GridLayout) -> Result<Self> {
        ensure!(
            layout.rows > 0 && layout.cols > 0,
            "Grid must have at least one row and one column, got {}x{}",
            layout.rows,
            layout.cols
        );
        let mut grid = Self {
            rows: layout.rows,
            cols: layout.cols,
            cells: vec![CellType::Floor; layout.rows * layout.cols],
        };
        let lists = [
            (&layout.walls, CellType::Wall),
            (&layout.goals, CellType::Goal),
            (&layout.traps, CellType::Trap),
        ];
        for (positions, cell) in lists {
            for &(row, col) in positions {
                if row >= grid.rows || col >= grid.cols {
                    warn!(row, col, ?cell, "cell outside grid ignored");
                    continue;
                }
                grid.cells[row * grid.cols + col] = cell;
            }
        }
        Ok(grid)
    }

    pub fn from_rows(rows: &[Vec<CellType>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        ensure!(!rows.is_empty() && cols > 0, "Grid must not be empty");
        ensure!(
            rows.iter().all(|r| r.len() == cols),
            "All grid rows must have {cols} cells"
        );
        Ok(Self {
            rows: rows.len(),
            cols,
            cells: rows.concat(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn cell(&self, row: usize, col: usize) -> CellType {
        self.cells[row * self.cols + col]
    }
}

// =============================================================================
// Transition Model
// =============================================================================

/// Per-cell rewards, collected on the state being left (DP/MC) or entered
/// (interactive episodes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardModel {
    pub goal: f64,
    pub trap: f64,
    pub step: f64,
}

impl Default for RewardModel {
    fn default() -> Self {
        Self {
            goal: 10.0,
            trap: -10.0,
            step: -0.1,
        }
    }
}

/// Value per state index. Walls keep 0 and are never read.
pub type StateValues = Vec<f64>;
/// Action values per state index, indexed by `Action::index`.
pub type ActionValues = Vec<[f64; NUM_GRID_ACTIONS]>;
/// Chosen action per state index; `None` where no decision is made.
pub type Policy = Vec<Option<Action>>;

/// Precomputed outcomes for every (state, action): intended target, then the
/// two perpendicular slips.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    rows: usize,
    cols: usize,
    cells: Vec<CellType>,
    rewards: Vec<f64>,
    next: Vec<[usize; 3]>,
    success_prob: f64,
    perp_prob: f64,
}

impl TransitionTable {
    pub fn build(grid: &Grid, success_prob: f64, rewards: &RewardModel) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&success_prob),
            "success_prob must lie in [0, 1], got {success_prob}"
        );
        let (rows, cols) = (grid.rows, grid.cols);
        let cells = grid.cells.clone();
        let reward_of = |cell: CellType| match cell {
            CellType::Wall => 0.0,
            CellType::Goal => rewards.goal,
            CellType::Trap => rewards.trap,
            CellType::Floor => rewards.step,
        };
        let state_rewards = cells.iter().map(|&c| reward_of(c)).collect();

        let target = |state: usize, action: Action| -> usize {
            let (dr, dc) = action.offset();
            let row = (state / cols) as isize + dr;
            let col = (state % cols) as isize + dc;
            if row < 0 || col < 0 || row >= rows as isize || col >= cols as isize {
                return state;
            }
            let idx = row as usize * cols + col as usize;
            if cells[idx] == CellType::Wall { state } else { idx }
        };

        let mut next = Vec::with_capacity(rows * cols * NUM_GRID_ACTIONS);
        for state in 0..rows * cols {
            for action in Action::ALL {
                let [p1, p2] = action.perpendicular();
                if cells[state] == CellType::Wall {
                    next.push([state; 3]);
                } else {
                    next.push([target(state, action), target(state, p1), target(state, p2)]);
                }
            }
        }

        Ok(Self {
            rows,
            cols,
            cells,
            rewards: state_rewards,
            next,
            success_prob,
            perp_prob: (1.0 - success_prob) / 2.0,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn num_states(&self) -> usize {
        self.cells.len()
    }

    pub fn state_index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    pub fn position(&self, state: usize) -> (usize, usize) {
        (state / self.cols, state % self.cols)
    }

    pub fn cell(&self, state: usize) -> CellType {
        self.cells[state]
    }

    pub fn is_terminal(&self, state: usize) -> bool {
        self.cells[state].is_terminal()
    }

    pub fn reward(&self, state: usize) -> f64 {
        self.rewards[state]
    }

    pub fn success_prob(&self) -> f64 {
        self.success_prob
    }

    /// Non-wall states.
    pub fn open_states(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_states()).filter(|&s| self.cells[s] != CellType::Wall)
    }

    /// Floor states, the only ones a policy decides in.
    pub fn floor_states(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_states()).filter(|&s| self.cells[s] == CellType::Floor)
    }

    /// `(next_state, probability)` for the three possible outcomes.
    pub fn outcomes(&self, state: usize, action: Action) -> [(usize, f64); 3] {
        let [a, b, c] = self.next[state * NUM_GRID_ACTIONS + action.index()];
        [
            (a, self.success_prob),
            (b, self.perp_prob),
            (c, self.perp_prob),
        ]
    }

    /// Pick an outcome from a uniform draw `u` in `[0, 1)`.
    pub fn sample_next(&self, state: usize, action: Action, u: f64) -> usize {
        let [a, b, c] = self.next[state * NUM_GRID_ACTIONS + action.index()];
        if u <= self.success_prob {
            a
        } else if u <= self.success_prob + self.perp_prob {
            b
        } else {
            c
        }
    }

    pub fn zero_values(&self) -> StateValues {
        vec![0.0; self.num_states()]
    }

    pub fn zero_action_values(&self) -> ActionValues {
        vec![[0.0; NUM_GRID_ACTIONS]; self.num_states()]
    }

    /// Uniformly random action on every floor cell.
    pub fn random_policy(&self, rng: &mut SmallRng) -> Policy {
        (0..self.num_states())
            .map(|s| {
                (self.cells[s] == CellType::Floor)
                    .then(|| Action::ALL[rng.random_range(0..NUM_GRID_ACTIONS)])
            })
            .collect()
    }

    /// Text rendering of a policy: arrows on decided cells, `#` walls,
    /// `G`/`T` terminals, `.` elsewhere.
    pub fn render_policy(&self, policy: &Policy) -> String {
        let mut out = String::new();
        for row in 0..self.rows {
            for col in 0..self.cols {
                let s = self.state_index(row, col);
                let ch = match self.cells[s] {
                    CellType::Wall => '#',
                    CellType::Goal => 'G',
                    CellType::Trap => 'T',
                    CellType::Floor => policy.get(s).copied().flatten().map_or('.', Action::arrow),
                };
                out.push(ch);
            }
            out.push('\n');
        }
        out
    }

    pub fn render_values(&self, values: &[f64]) -> String {
        let mut out = String::new();
        for row in 0..self.rows {
            let line: Vec<String> = (0..self.cols)
                .map(|col| {
                    let s = self.state_index(row, col);
                    if self.cells[s] == CellType::Wall {
                        format!("{:>7}", "#")
                    } else {
                        format!("{:>7.2}", values[s])
                    }
                })
                .collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        out
    }
}

// =============================================================================
// Interactive Episode
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpisodeStatus {
    Playing,
    ReachedGoal,
    ReachedTrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Move {
    pub intended: Action,
    pub actual: Action,
    pub slipped: bool,
}

/// A single agent walking the grid one chosen action at a time. Rewards are
/// those of the cell entered.
#[derive(Debug, Clone)]
pub struct GridEpisode {
    table: TransitionTable,
    start: usize,
    pub position: usize,
    pub steps: usize,
    pub cumulative_reward: f64,
    pub status: EpisodeStatus,
    pub trail: Vec<usize>,
    pub last_move: Option<Move>,
}

impl GridEpisode {
    pub fn new(table: TransitionTable, start_row: usize, start_col: usize) -> Result<Self> {
        ensure!(
            start_row < table.rows && start_col < table.cols,
            "Start ({start_row}, {start_col}) is outside the grid"
        );
        let start = table.state_index(start_row, start_col);
        Ok(Self {
            table,
            start,
            position: start,
            steps: 0,
            cumulative_reward: 0.0,
            status: EpisodeStatus::Playing,
            trail: vec![start],
            last_move: None,
        })
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn reset(&mut self) {
        self.position = self.start;
        self.steps = 0;
        self.cumulative_reward = 0.0;
        self.status = EpisodeStatus::Playing;
        self.trail = vec![self.start];
        self.last_move = None;
    }

    /// Rebuild the transition model with `success_prob = 1 - slipperiness`,
    /// clamping `slipperiness` to `[0, 1]`. Returns the clamped value.
    pub fn set_slipperiness(&mut self, slipperiness: f64, rewards: &RewardModel) -> Result<f64> {
        let slipperiness = slipperiness.clamp(0.0, 1.0);
        let grid = Grid {
            rows: self.table.rows,
            cols: self.table.cols,
            cells: self.table.cells.clone(),
        };
        self.table = TransitionTable::build(&grid, 1.0 - slipperiness, rewards)?;
        Ok(slipperiness)
    }

    /// Ignored once the episode reached a terminal cell.
    pub fn step(&mut self, intended: Action, rng: &mut SmallRng) {
        if self.status != EpisodeStatus::Playing {
            return;
        }
        let next = self
            .table
            .sample_next(self.position, intended, rng.random::<f64>());
        self.apply(intended, next);
    }

    fn apply(&mut self, intended: Action, next: usize) {
        let (row, col) = self.table.position(self.position);
        let (next_row, next_col) = self.table.position(next);
        let dr = next_row as isize - row as isize;
        let dc = next_col as isize - col as isize;
        // Staying in place reports the intended direction.
        let actual = Action::ALL
            .into_iter()
            .find(|a| a.offset() == (dr, dc))
            .unwrap_or(intended);

        self.last_move = Some(Move {
            intended,
            actual,
            slipped: actual != intended,
        });
        self.position = next;
        self.steps += 1;
        self.cumulative_reward += self.table.reward(next);
        self.trail.push(next);

        self.status = match self.table.cell(next) {
            CellType::Goal => EpisodeStatus::ReachedGoal,
            CellType::Trap => EpisodeStatus::ReachedTrap,
            _ => EpisodeStatus::Playing,
        };
    }
}

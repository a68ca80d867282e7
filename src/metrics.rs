use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use tracing::info;

use crate::runner::SCORE_WINDOW;

pub const LOSS_WINDOW: usize = 500;

/// Trailing mean over `window` values; `xs` are the indices the means end at.
/// Both are empty when fewer than `window` values exist.
pub fn rolling_mean(data: &[f32], window: usize) -> (Vec<usize>, Vec<f32>) {
    if window == 0 || data.len() < window {
        return (Vec::new(), Vec::new());
    }
    let mut xs = Vec::with_capacity(data.len() - window + 1);
    let mut means = Vec::with_capacity(data.len() - window + 1);
    let mut sum: f64 = data[..window].iter().map(|&v| v as f64).sum();
    xs.push(window - 1);
    means.push((sum / window as f64) as f32);
    for end in window..data.len() {
        sum += data[end] as f64 - data[end - window] as f64;
        xs.push(end);
        means.push((sum / window as f64) as f32);
    }
    (xs, means)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub xs: Vec<usize>,
    pub ys: Vec<f32>,
}

impl Series {
    fn rolling(data: &[f32], window: usize) -> Self {
        let (xs, ys) = rolling_mean(data, window);
        Self { xs, ys }
    }
}

/// Everything needed to plot a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub losses: Vec<f32>,
    pub episode_returns: Vec<f32>,
    pub loss_rolling: Series,
    pub return_rolling: Series,
    pub best_score: Option<f32>,
}

impl TrainingReport {
    pub fn new(losses: &[f32], episode_returns: &[f32], best_score: f32) -> Self {
        Self {
            losses: losses.to_vec(),
            episode_returns: episode_returns.to_vec(),
            loss_rolling: Series::rolling(losses, LOSS_WINDOW),
            return_rolling: Series::rolling(episode_returns, SCORE_WINDOW),
            best_score: best_score.is_finite().then_some(best_score),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty() && self.episode_returns.is_empty()
    }

    /// Write the report as JSON. Returns `false` without touching the
    /// filesystem when nothing was recorded.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<bool> {
        if self.is_empty() {
            info!("No loss or return values recorded. Run training first.");
            return Ok(false);
        }
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(true)
    }

    pub fn summary(&self) -> String {
        let last_return = self.return_rolling.ys.last().copied();
        let last_loss = self.loss_rolling.ys.last().copied();
        format!(
            "episodes={} updates={} avg{SCORE_WINDOW}_return={} avg{LOSS_WINDOW}_loss={} best={}",
            self.episode_returns.len(),
            self.losses.len(),
            fmt_opt(last_return),
            fmt_opt(last_loss),
            fmt_opt(self.best_score),
        )
    }
}

fn fmt_opt(v: Option<f32>) -> String {
    v.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_mean_short_input_is_empty() {
        let (xs, ys) = rolling_mean(&[1.0, 2.0], 3);
        assert!(xs.is_empty() && ys.is_empty());
    }

    #[test]
    fn rolling_mean_values() {
        let (xs, ys) = rolling_mean(&[1.0, 2.0, 3.0, 4.0, 5.0], 2);
        assert_eq!(xs, vec![1, 2, 3, 4]);
        assert_eq!(ys, vec![1.5, 2.5, 3.5, 4.5]);
    }

    #[test]
    fn empty_report_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = TrainingReport::new(&[], &[], f32::NEG_INFINITY);
        assert!(!report.save(&path).unwrap());
        assert!(!path.exists());
        assert_eq!(report.best_score, None);
    }

    #[test]
    fn report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        let returns: Vec<f32> = (0..60).map(|i| i as f32).collect();
        let report = TrainingReport::new(&[0.5, 0.25], &returns, 30.0);
        assert!(report.save(&path).unwrap());

        let file = File::open(&path).unwrap();
        let back: TrainingReport = serde_json::from_reader(file).unwrap();
        assert_eq!(back.episode_returns.len(), 60);
        assert_eq!(back.return_rolling.ys.len(), 60 - SCORE_WINDOW + 1);
        assert!(back.loss_rolling.ys.is_empty());
        assert_eq!(back.best_score, Some(30.0));
        assert!(report.summary().contains("episodes=60"));
    }
}

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

// =============================================================================
// Run Hyperparameters
// =============================================================================

/// Per-run knobs. Every field except `seed` must be supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Replay buffer capacity.
    pub buf_cap: usize,
    pub batch_size: usize,
    pub lr: f64,
    /// Steps over which epsilon anneals from start to end.
    pub decay_dur: usize,
    /// Minimum replay size before gradient steps begin.
    pub learn_start: usize,
    /// Target network hard-copy period, in environment steps.
    pub upd_every: usize,
    #[serde(default)]
    pub seed: u64,
}

/// Preset used by the `train` command: a 10k transition buffer, 64-sample
/// batches, epsilon annealed over the first 10k steps.
impl Default for RunConfig {
    fn default() -> Self {
        Self {
            buf_cap: 10_000,
            batch_size: 64,
            lr: 5e-4,
            decay_dur: 10_000,
            learn_start: 1_000,
            upd_every: 500,
            seed: 0,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.buf_cap > 0, "buf_cap must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(
            self.lr.is_finite() && self.lr > 0.0,
            "lr must be a positive finite number, got {}",
            self.lr
        );
        ensure!(self.decay_dur > 0, "decay_dur must be positive");
        ensure!(self.upd_every > 0, "upd_every must be positive");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open run config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: RunConfig = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse run config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunConfig {
        RunConfig {
            buf_cap: 500,
            batch_size: 32,
            lr: 1e-3,
            decay_dur: 1000,
            learn_start: 100,
            upd_every: 50,
            seed: 0,
        }
    }

    #[test]
    fn default_preset_is_valid() {
        let cfg = RunConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.buf_cap, 10_000);
        assert_eq!(cfg.batch_size, 64);
        assert_eq!(cfg.lr, 5e-4);
        assert_eq!(cfg.decay_dur, 10_000);
        assert_eq!(cfg.learn_start, 1_000);
        assert_eq!(cfg.upd_every, 500);
        assert_eq!(cfg.seed, 0);
        assert!(cfg.learn_start <= cfg.buf_cap);
    }

    #[test]
    fn accepts_sane_values() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity_and_period() {
        let mut cfg = sample();
        cfg.buf_cap = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.upd_every = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.lr = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn seed_defaults_when_missing() {
        let json = r#"{"buf_cap":10,"batch_size":4,"lr":0.001,"decay_dur":5,"learn_start":2,"upd_every":3}"#;
        let cfg: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.seed, 0);
        assert_eq!(cfg.buf_cap, 10);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let json = r#"{"buf_cap":10,"batch_size":4,"lr":0.001,"decay_dur":5,"learn_start":2}"#;
        assert!(serde_json::from_str::<RunConfig>(json).is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let cfg = sample();
        cfg.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), cfg);
    }
}

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use super::apu::{DEFAULT_SAMPLE_RATE, MIN_SAMPLE_RATE, Mixing};

pub const NTSC_CYCLES_PER_FRAME: u32 = 29_781;

/// Host-tunable timing and audio settings. Missing JSON fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NesConfig {
    pub sample_rate: u32,
    pub mixing: Mixing,
    pub cycles_per_frame: u32,
    pub sequencer_steps_per_frame: u32,
    pub scanlines_per_frame: u32,
    pub visible_scanlines: u32,
    /// Clock the mapper's scanline counter from elapsed cycles during `run_frame`.
    pub synthesize_scanlines: bool,
    /// Upper bound on cycles spent inside one init or play routine.
    pub routine_cycle_budget: u64,
}

impl Default for NesConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            mixing: Mixing::Nonlinear,
            cycles_per_frame: NTSC_CYCLES_PER_FRAME,
            sequencer_steps_per_frame: 4,
            scanlines_per_frame: 262,
            visible_scanlines: 240,
            synthesize_scanlines: true,
            routine_cycle_budget: 1_000_000,
        }
    }
}

impl NesConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let mut cfg: Self = serde_json::from_str(text).context("failed to parse config JSON")?;
        cfg.sample_rate = cfg.sample_rate.max(MIN_SAMPLE_RATE);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cycles_per_frame == 0 {
            bail!("cycles_per_frame must be positive");
        }
        if !(1..=5).contains(&self.sequencer_steps_per_frame) {
            bail!(
                "sequencer_steps_per_frame must be between 1 and 5, got {}",
                self.sequencer_steps_per_frame
            );
        }
        if self.scanlines_per_frame == 0 || self.scanlines_per_frame > self.cycles_per_frame {
            bail!(
                "scanlines_per_frame {} does not fit in {} cycles",
                self.scanlines_per_frame,
                self.cycles_per_frame
            );
        }
        if self.visible_scanlines >= self.scanlines_per_frame {
            bail!(
                "visible_scanlines {} must be below scanlines_per_frame {}",
                self.visible_scanlines,
                self.scanlines_per_frame
            );
        }
        if self.routine_cycle_budget == 0 {
            bail!("routine_cycle_budget must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_ntsc() {
        let cfg = NesConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cycles_per_frame, 29_781);
        assert_eq!(cfg.sequencer_steps_per_frame, 4);
        assert_eq!(cfg.mixing, Mixing::Nonlinear);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let cfg = NesConfig::from_json_str(r#"{"sample_rate": 44100, "mixing": "linear"}"#).unwrap();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.mixing, Mixing::Linear);
        assert_eq!(cfg.cycles_per_frame, NTSC_CYCLES_PER_FRAME);
        assert!(cfg.synthesize_scanlines);

        assert_eq!(NesConfig::from_json_str("{}").unwrap(), NesConfig::default());
    }

    #[test]
    fn low_sample_rate_is_clamped() {
        let cfg = NesConfig::from_json_str(r#"{"sample_rate": 100}"#).unwrap();
        assert_eq!(cfg.sample_rate, MIN_SAMPLE_RATE);
    }

    #[test]
    fn rejects_inconsistent_timing() {
        assert!(NesConfig::from_json_str(r#"{"cycles_per_frame": 0}"#).is_err());
        assert!(NesConfig::from_json_str(r#"{"sequencer_steps_per_frame": 0}"#).is_err());
        assert!(NesConfig::from_json_str(r#"{"visible_scanlines": 262}"#).is_err());
        assert!(NesConfig::from_json_str(r#"{"mixing": "cubic"}"#).is_err());
        assert!(NesConfig::from_json_str("not json").is_err());
    }
}

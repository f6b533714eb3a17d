//! Session configuration.
//!
//! Built once per process (defaults, then environment overrides) and
//! shared by `Arc` with every pipeline stage. Nothing in the core reads
//! the environment after startup.

use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Bitrate bounds for one media kind, in bits/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitrate {
    // ---
    pub start: u64,
    pub min: u64,
    pub max: u64,

    /// Granularity of controller output
    pub step: u64,
}

impl Bitrate {
    // ---
    /// Rounds `value` down to a multiple of `step`, then clamps it into
    /// the step-aligned `[min, max]` range.
    pub fn align(&self, value: u64) -> u64 {
        // ---
        let step = self.step.max(1);
        let min = self.min.div_ceil(step) * step;
        let max = (self.max / step) * step;
        ((value / step) * step).clamp(min, max.max(min))
    }

    /// Checks that the bounds are usable.
    ///
    /// # Errors
    ///
    /// Fails when `step` is zero, `min > max`, `start` lies outside the
    /// bounds, or no multiple of `step` fits in `[min, max]`.
    pub fn validate(&self, what: &str) -> Result<()> {
        // ---
        if self.step == 0 {
            bail!("{what} bitrate step must be > 0");
        }
        if self.min > self.max {
            bail!("{what} bitrate min {} > max {}", self.min, self.max);
        }
        if self.start < self.min || self.start > self.max {
            bail!(
                "{what} bitrate start {} outside [{}, {}]",
                self.start,
                self.min,
                self.max
            );
        }
        if self.min.div_ceil(self.step) * self.step > self.max {
            bail!(
                "{what} bitrate range [{}, {}] holds no multiple of step {}",
                self.min,
                self.max,
                self.step
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitrates {
    pub audio: Bitrate,
    pub video: Bitrate,
}

impl Default for Bitrates {
    fn default() -> Self {
        // ---
        Self {
            audio: Bitrate {
                start: 32_000,
                min: 16_000,
                max: 64_000,
                step: 1_000,
            },
            video: Bitrate {
                start: 512_000,
                min: 128_000,
                max: 2_048_000,
                step: 64_000,
            },
        }
    }
}

/// Forwarding mode: decides how large the publisher buffering window is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain forwarding, no buffering window
    Sfu,

    /// Transcoding: 100 ms window, then RTT-derived
    Mcu,
}

impl Mode {
    /// Buffering window a publisher jitter buffer starts with.
    pub fn initial_window(self) -> Duration {
        // ---
        match self {
            Mode::Sfu => Duration::ZERO,
            Mode::Mcu => Duration::from_millis(100),
        }
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s.to_ascii_lowercase().as_str() {
            "sfu" => Ok(Mode::Sfu),
            "mcu" => Ok(Mode::Mcu),
            other => bail!("unknown mode {other:?}, expected sfu or mcu"),
        }
    }
}

/// REMB smoothing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RembAlgorithm {
    /// Follow the latest REMB
    Simple,

    /// Trend-based hysteresis over 1 s averages
    Matrix,
}

impl FromStr for RembAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(RembAlgorithm::Simple),
            "matrix" => Ok(RembAlgorithm::Matrix),
            other => bail!("unknown REMB algorithm {other:?}, expected simple or matrix"),
        }
    }
}

/// Configuration shared by every stage of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    // ---
    pub bitrates: Bitrates,
    pub mode: Mode,

    pub video_clock_rate: u32, // Hz
    pub audio_clock_rate: u32, // Hz

    /// Raw REMB samples kept by the controller
    pub remb_history: usize,
    pub remb_algorithm: RembAlgorithm,

    /// Capacity of pipeline stage queues
    pub channel_capacity: usize,

    /// Capacity of the RTCP info event queue
    pub event_capacity: usize,

    /// Packets kept by the listener for retransmission
    pub listener_cache_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        // ---
        Self {
            bitrates: Bitrates::default(),
            mode: Mode::Sfu,
            video_clock_rate: 90_000,
            audio_clock_rate: 48_000,
            remb_history: 30,
            remb_algorithm: RembAlgorithm::Simple,
            channel_capacity: 1000,
            event_capacity: 128,
            listener_cache_size: 3000,
        }
    }
}

impl SessionConfig {
    // ---
    /// Defaults overridden by environment variables.
    ///
    /// Reads `BITRATE_{AUDIO,VIDEO}_{START,MIN,MAX,STEP}`, `SFU_MODE` and
    /// `REMB_ALGORITHM`. An absent variable keeps its default.
    ///
    /// # Errors
    ///
    /// Fails on a present but unparsable value, or if the result does not
    /// pass [`SessionConfig::validate`].
    pub fn from_env() -> Result<Self> {
        // ---
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`SessionConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let mut config = Self::default();

        for (prefix, bitrate) in [
            ("BITRATE_AUDIO", &mut config.bitrates.audio),
            ("BITRATE_VIDEO", &mut config.bitrates.video),
        ] {
            override_from(&lookup, &format!("{prefix}_START"), &mut bitrate.start)?;
            override_from(&lookup, &format!("{prefix}_MIN"), &mut bitrate.min)?;
            override_from(&lookup, &format!("{prefix}_MAX"), &mut bitrate.max)?;
            override_from(&lookup, &format!("{prefix}_STEP"), &mut bitrate.step)?;
        }
        override_from(&lookup, "SFU_MODE", &mut config.mode)?;
        override_from(&lookup, "REMB_ALGORITHM", &mut config.remb_algorithm)?;

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Fails on unusable bitrate bounds, zero clock rates or zero-sized
    /// queues.
    pub fn validate(&self) -> Result<()> {
        // ---
        self.bitrates.audio.validate("audio")?;
        self.bitrates.video.validate("video")?;
        if self.video_clock_rate == 0 || self.audio_clock_rate == 0 {
            bail!("clock rates must be > 0");
        }
        if self.channel_capacity == 0 || self.event_capacity == 0 {
            bail!("queue capacities must be > 0");
        }
        if self.remb_history == 0 || self.listener_cache_size == 0 {
            bail!("REMB history and listener cache must be > 0");
        }
        Ok(())
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    // ---
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value {raw:?} for {key}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        // ---
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        // ---
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bitrates.video.start, 512_000);
        assert_eq!(config.mode.initial_window(), Duration::ZERO);
    }

    #[test]
    fn test_env_overrides() {
        // ---
        let config = SessionConfig::from_lookup(lookup_from(&[
            ("BITRATE_VIDEO_MAX", "4096000"),
            ("SFU_MODE", "MCU"),
            ("REMB_ALGORITHM", "matrix"),
        ]))
        .unwrap();

        assert_eq!(config.bitrates.video.max, 4_096_000);
        assert_eq!(config.mode, Mode::Mcu);
        assert_eq!(config.mode.initial_window(), Duration::from_millis(100));
        assert_eq!(config.remb_algorithm, RembAlgorithm::Matrix);
    }

    #[test]
    fn test_unparsable_value_is_an_error() {
        // ---
        let err = SessionConfig::from_lookup(lookup_from(&[("BITRATE_AUDIO_MIN", "lots")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("BITRATE_AUDIO_MIN"));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        // ---
        let result = SessionConfig::from_lookup(lookup_from(&[
            ("BITRATE_VIDEO_MIN", "3000000"),
            ("BITRATE_VIDEO_START", "3000000"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_align_steps_and_clamps() {
        // ---
        let video = Bitrates::default().video;
        assert_eq!(video.align(500_000), 448_000);
        assert_eq!(video.align(0), 128_000);
        assert_eq!(video.align(10_000_000), 2_048_000);

        // bounds that are not step multiples are pulled inside
        let odd = Bitrate {
            start: 150,
            min: 110,
            max: 290,
            step: 100,
        };
        assert_eq!(odd.align(0), 200);
        assert_eq!(odd.align(1000), 200);
    }
}

//! Engine Configuration
//!
//! Tempo, look-ahead and voice-count settings shared by the timer, the
//! keyboard router and the live-coding session. Loadable from JSON.

use serde::{Deserialize, Serialize};

/// Timer settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Tempo in beats per minute
    pub bpm: f64,
    /// Period between wake-ups, in seconds
    pub wake_interval: f64,
    /// How far ahead of the clock events are scheduled, in seconds
    pub lookahead: f64,
    /// Timer units per beat (4 = sixteenth notes)
    pub steps_per_beat: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            bpm: 60.0,
            wake_interval: 0.025,
            lookahead: 0.1,
            steps_per_beat: 4,
        }
    }
}

impl TimerConfig {
    pub fn with_bpm(mut self, bpm: f64) -> Self {
        self.bpm = bpm;
        self
    }

    pub fn with_lookahead(mut self, lookahead: f64) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn with_wake_interval(mut self, interval: f64) -> Self {
        self.wake_interval = interval;
        self
    }

    /// Duration of one timer unit at the given tempo
    pub fn unit_duration(&self, bpm: f64) -> f64 {
        60.0 / bpm / self.steps_per_beat.max(1) as f64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_bpm(self.bpm)?;
        if !(self.lookahead > 0.0) {
            return Err(ConfigError::InvalidLookahead(self.lookahead));
        }
        if !(self.wake_interval > 0.0) || self.wake_interval >= self.lookahead {
            return Err(ConfigError::WakeIntervalTooLong {
                interval: self.wake_interval,
                lookahead: self.lookahead,
            });
        }
        if self.steps_per_beat == 0 {
            return Err(ConfigError::InvalidStepsPerBeat);
        }
        Ok(())
    }
}

pub(crate) fn validate_bpm(bpm: f64) -> Result<(), ConfigError> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidTempo(bpm))
    }
}

/// Whole-engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timer: TimerConfig,
    /// Look-ahead window of the live-coding timer
    pub live_lookahead: f64,
    /// Default voice count of live-coding instruments
    pub voices: usize,
    /// Voice count used when the keyboard switches to polyphonic mode
    pub keyboard_voices: usize,
    /// Fraction of a timer unit an arpeggiated note is held
    pub arpeggio_gate: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            live_lookahead: 0.2,
            voices: 4,
            keyboard_voices: 8,
            arpeggio_gate: 0.75,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn with_timer(mut self, timer: TimerConfig) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_voices(mut self, voices: usize) -> Self {
        self.voices = voices;
        self
    }

    /// Timer settings for the live-coding session
    pub fn live_timer(&self) -> TimerConfig {
        self.timer.with_lookahead(self.live_lookahead)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timer.validate()?;
        self.live_timer().validate()?;
        if self.voices == 0 || self.keyboard_voices == 0 {
            return Err(ConfigError::NoVoices);
        }
        if !(0.0..=1.0).contains(&self.arpeggio_gate) {
            return Err(ConfigError::InvalidGate(self.arpeggio_gate));
        }
        Ok(())
    }
}

/// Error type for configuration problems
#[derive(Debug)]
pub enum ConfigError {
    InvalidTempo(f64),
    InvalidLookahead(f64),
    WakeIntervalTooLong { interval: f64, lookahead: f64 },
    InvalidStepsPerBeat,
    NoVoices,
    InvalidGate(f64),
    Json(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidTempo(bpm) => write!(f, "Invalid tempo: {} bpm", bpm),
            ConfigError::InvalidLookahead(s) => write!(f, "Invalid look-ahead window: {}s", s),
            ConfigError::WakeIntervalTooLong {
                interval,
                lookahead,
            } => write!(
                f,
                "Wake interval {}s must be shorter than the look-ahead window {}s",
                interval, lookahead
            ),
            ConfigError::InvalidStepsPerBeat => write!(f, "Steps per beat must be at least 1"),
            ConfigError::NoVoices => write!(f, "Voice count must be at least 1"),
            ConfigError::InvalidGate(g) => write!(f, "Arpeggio gate {} outside 0..=1", g),
            ConfigError::Json(e) => write!(f, "Malformed configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unit_is_a_sixteenth() {
        let timer = TimerConfig::default();
        assert_relative_eq!(timer.unit_duration(60.0), 0.25);
        assert_relative_eq!(timer.unit_duration(120.0), 0.125);
    }

    #[test]
    fn test_wake_interval_must_be_below_lookahead() {
        let timer = TimerConfig::default().with_wake_interval(0.2);
        assert!(matches!(
            timer.validate(),
            Err(ConfigError::WakeIntervalTooLong { .. })
        ));
    }

    #[test]
    fn test_zero_tempo_rejected() {
        let timer = TimerConfig::default().with_bpm(0.0);
        assert!(matches!(timer.validate(), Err(ConfigError::InvalidTempo(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"voices": 8, "timer": {"bpm": 90}}"#).unwrap();
        assert_eq!(config.voices, 8);
        assert_eq!(config.timer.bpm, 90.0);
        assert_eq!(config.timer.lookahead, 0.1);
        assert_eq!(config.live_lookahead, 0.2);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json("{voices: }"),
            Err(ConfigError::Json(_))
        ));
    }
}

use std::time::Duration;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ModelComplexity {
    Low,
    #[default]
    Mid,
    High,
}

impl ModelComplexity {
    /// Intra-op threads handed to the inference session.
    pub fn intra_threads(&self) -> usize {
        match self {
            ModelComplexity::Low => 1,
            ModelComplexity::Mid => 2,
            ModelComplexity::High => 4,
        }
    }
}

/// Fixed for the lifetime of one pipeline; changing it means rebuilding.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub overlay_enabled: bool,
    pub detection_confidence: f32,
    pub tracking_confidence: f32,
    pub max_subjects: usize,
    pub model_complexity: ModelComplexity,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            overlay_enabled: true,
            detection_confidence: 0.5,
            tracking_confidence: 0.5,
            max_subjects: 2,
            model_complexity: ModelComplexity::Mid,
        }
    }
}

impl PipelineConfig {
    pub fn with_overlay(mut self, enabled: bool) -> Self {
        self.overlay_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("detection_confidence", self.detection_confidence),
            ("tracking_confidence", self.tracking_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ConfidenceOutOfRange { name, value });
            }
        }
        if self.max_subjects == 0 {
            return Err(ConfigError::NoSubjects);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// How often the scheduler looks for a new frame.
    pub tick_interval: Duration,
    /// Consecutive per-frame failures tolerated before the pipeline fails.
    pub max_consecutive_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(16),
            max_consecutive_failures: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let config = PipelineConfig {
            tracking_confidence: 1.5,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ConfidenceOutOfRange {
                name: "tracking_confidence",
                value: 1.5
            })
        );
    }

    #[test]
    fn rejects_zero_subjects() {
        let config = PipelineConfig {
            max_subjects: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoSubjects));
    }
}

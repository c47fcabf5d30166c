use super::{
    camera::FrameSource,
    detector::{DetectionResult, LandmarkDetector},
    pending::{CancellationToken, Pending},
};
use crate::{config::SchedulerConfig, error::DetectionError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// Frame `sequence` went to the detector.
    Submitted(u64),
    /// A detection was still running, so this cycle's frame was skipped.
    Dropped,
    /// No new frame since the last submission.
    Idle,
    Stopped,
    /// Detection failed `max_consecutive_failures` times in a row.
    Exhausted(DetectionError),
}

/// Drives detection from the latest frame, one detection at a time.
pub struct FrameScheduler {
    config: SchedulerConfig,
    in_flight: Option<Pending<DetectionResult>>,
    last_sequence: Option<u64>,
    consecutive_failures: u32,
    stopped: bool,
    stats: SchedulerStats,
    owner: Option<CancellationToken>,
}

impl FrameScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            in_flight: None,
            last_sequence: None,
            consecutive_failures: 0,
            stopped: false,
            stats: SchedulerStats::default(),
            owner: None,
        }
    }

    /// Stops submitting as soon as `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.owner = Some(token);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// One scheduling cycle.
    pub fn tick(&mut self, source: &dyn FrameSource, detector: &mut LandmarkDetector) -> TickOutcome {
        if self.stopped {
            return TickOutcome::Stopped;
        }

        if let Some(err) = self.settle() {
            return TickOutcome::Exhausted(err);
        }
        if self.in_flight.is_some() {
            self.stats.dropped += 1;
            return TickOutcome::Dropped;
        }

        let Some(frame) = source.current_frame() else {
            return TickOutcome::Idle;
        };
        if self.last_sequence == Some(frame.sequence) {
            return TickOutcome::Idle;
        }

        if self.owner.as_ref().is_some_and(CancellationToken::is_cancelled) {
            self.stop();
            return TickOutcome::Stopped;
        }
        let sequence = frame.sequence;
        match detector.detect(frame) {
            Ok(pending) => {
                self.in_flight = Some(pending);
                self.last_sequence = Some(sequence);
                self.stats.submitted += 1;
                TickOutcome::Submitted(sequence)
            }
            Err(DetectionError::Busy) => {
                self.stats.dropped += 1;
                TickOutcome::Dropped
            }
            Err(DetectionError::NotInitialized) => TickOutcome::Idle,
            Err(err) => match self.record_failure(err) {
                Some(err) => TickOutcome::Exhausted(err),
                None => TickOutcome::Idle,
            },
        }
    }

    /// Stops submitting. A detection still in flight is abandoned.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.in_flight = None;
        let stats = self.stats;
        log::debug!(
            "scheduler stopped: submitted={} completed={} dropped={} failed={}",
            stats.submitted,
            stats.completed,
            stats.dropped,
            stats.failed
        );
    }

    fn settle(&mut self) -> Option<DetectionError> {
        let outcome = self.in_flight.as_ref()?.try_get()?;
        self.in_flight = None;
        match outcome {
            Ok(_) => {
                self.stats.completed += 1;
                self.consecutive_failures = 0;
                None
            }
            Err(err) => self.record_failure(err),
        }
    }

    fn record_failure(&mut self, err: DetectionError) -> Option<DetectionError> {
        self.stats.failed += 1;
        self.consecutive_failures += 1;
        log::warn!(
            "detection failed ({} in a row): {err}",
            self.consecutive_failures
        );
        let terminal = matches!(err, DetectionError::Disposed | DetectionError::WorkerGone);
        if terminal || self.consecutive_failures >= self.config.max_consecutive_failures {
            Some(err)
        } else {
            None
        }
    }
}

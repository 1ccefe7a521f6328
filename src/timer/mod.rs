//! Wall-clock accounting: per-phase pausable timers and the run deadline.
//!
//! Each named phase holds an ordered list of intervals. A phase is running
//! while its last interval is open; `summarize` refuses to report as long as
//! any phase is still running, so the driver must pause (or `pause_all` on
//! abnormal termination) first.

use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("phase \"{0}\" is already tracked")]
    AlreadyTracked(String),
    #[error("phase \"{0}\" is not tracked")]
    NotTracked(String),
    #[error("phase \"{0}\" is already paused")]
    AlreadyPaused(String),
    #[error("phase \"{0}\" is already running")]
    AlreadyRunning(String),
    #[error("phase \"{0}\" is still running; pause it before summarizing")]
    StillRunning(String),
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    start: Instant,
    end: Option<Instant>,
}

/// Tracks time spent per named phase, in phase-start order.
#[derive(Debug, Default)]
pub struct PhaseTimer {
    phases: Vec<(String, Vec<Interval>)>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self, phase: &str) -> bool {
        self.phases.iter().any(|(name, _)| name == phase)
    }

    fn intervals_mut(&mut self, phase: &str) -> Option<&mut Vec<Interval>> {
        self.phases
            .iter_mut()
            .find(|(name, _)| name == phase)
            .map(|(_, intervals)| intervals)
    }

    /// Begin tracking a new phase. Re-declaring a tracked phase is an error.
    pub fn start(&mut self, phase: &str) -> Result<(), TimerError> {
        if self.is_tracked(phase) {
            return Err(TimerError::AlreadyTracked(phase.to_string()));
        }
        self.phases.push((
            phase.to_string(),
            vec![Interval {
                start: Instant::now(),
                end: None,
            }],
        ));
        Ok(())
    }

    pub fn pause(&mut self, phase: &str) -> Result<(), TimerError> {
        let now = Instant::now();
        let intervals = self
            .intervals_mut(phase)
            .ok_or_else(|| TimerError::NotTracked(phase.to_string()))?;
        let last = intervals.last_mut().filter(|i| i.end.is_none());
        match last {
            Some(interval) => {
                interval.end = Some(now);
                Ok(())
            }
            None => Err(TimerError::AlreadyPaused(phase.to_string())),
        }
    }

    pub fn resume(&mut self, phase: &str) -> Result<(), TimerError> {
        let now = Instant::now();
        let intervals = self
            .intervals_mut(phase)
            .ok_or_else(|| TimerError::NotTracked(phase.to_string()))?;
        if intervals.last().is_some_and(|i| i.end.is_none()) {
            return Err(TimerError::AlreadyRunning(phase.to_string()));
        }
        intervals.push(Interval {
            start: now,
            end: None,
        });
        Ok(())
    }

    /// Start the phase if it is new, resume it otherwise.
    pub fn start_or_resume(&mut self, phase: &str) -> Result<(), TimerError> {
        if self.is_tracked(phase) {
            self.resume(phase)
        } else {
            self.start(phase)
        }
    }

    /// Force-close every running phase at the same timestamp.
    /// Used on abnormal termination so a report can still be produced.
    pub fn pause_all(&mut self) {
        let now = Instant::now();
        for (_, intervals) in &mut self.phases {
            if let Some(interval) = intervals.last_mut() {
                if interval.end.is_none() {
                    interval.end = Some(now);
                }
            }
        }
    }

    /// Total closed duration per phase, in phase-start order.
    pub fn summarize(&self) -> Result<Vec<(String, Duration)>, TimerError> {
        for (name, intervals) in &self.phases {
            if intervals.last().is_some_and(|i| i.end.is_none()) {
                return Err(TimerError::StillRunning(name.clone()));
            }
        }
        Ok(self
            .phases
            .iter()
            .map(|(name, intervals)| {
                let total = intervals
                    .iter()
                    .filter_map(|i| i.end.map(|end| end - i.start))
                    .sum();
                (name.clone(), total)
            })
            .collect())
    }
}

/// The single process-wide deadline. Cheap to copy; checked cooperatively at
/// suspension points.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            end: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }

    /// Resolves when the deadline passes (for use in `select!`).
    pub async fn sleep(&self) {
        tokio::time::sleep(self.remaining()).await;
    }
}

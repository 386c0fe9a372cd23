//! Execution Timeline
//!
//! Tracks per-step events during a run for the end-of-run summary.

use std::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
    Skipped,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Records when each step starts and how it ends.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Renders a per-step summary of how the run went.
    pub fn summary(&self) -> String {
        let mut out = String::from("Step timeline:\n");

        let mut open: Vec<(String, Instant)> = Vec::new();
        for event in &self.events {
            match event.event_type {
                EventType::Started => open.push((event.step_id.clone(), event.timestamp)),
                EventType::Completed | EventType::Failed | EventType::Skipped => {
                    let started = open
                        .iter()
                        .rev()
                        .find(|(id, _)| *id == event.step_id)
                        .map(|(_, at)| *at)
                        .unwrap_or(self.start_time);
                    let verb = match event.event_type {
                        EventType::Completed => "completed",
                        EventType::Failed => "failed",
                        _ => "blocked",
                    };
                    out.push_str(&format!(
                        "  {:<24} {} in {:.2?}\n",
                        event.step_id,
                        verb,
                        event.timestamp.duration_since(started)
                    ));
                }
            }
        }

        out.push_str(&format!("Total: {:.2?}\n", self.elapsed()));
        out
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

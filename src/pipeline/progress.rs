//! In-process stage progress registry
//!
//! Progress is ephemeral: it lives only while a stage runs in this process.
//! Completed and failed stages are answered from the session store instead.

use dashmap::DashMap;

use crate::types::{Progress, Stage};

#[derive(Debug, Default)]
pub struct ProgressTracker {
    entries: DashMap<(String, Stage), Progress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress; never moves backwards while a stage runs
    pub fn update(&self, session_id: &str, stage: Stage, percent: f32, message: &str) {
        let key = (session_id.to_string(), stage);
        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| Progress::new(0.0, ""));
        let percent = percent.max(entry.percent);
        *entry = Progress::new(percent, message);
    }

    pub fn get(&self, session_id: &str, stage: Stage) -> Option<Progress> {
        self.entries
            .get(&(session_id.to_string(), stage))
            .map(|p| p.clone())
    }

    pub fn clear(&self, session_id: &str, stage: Stage) {
        self.entries.remove(&(session_id.to_string(), stage));
    }
}

/// Map `fraction` (0.0 - 1.0) into the `[start, end]` percentage band
pub fn band(range: (f32, f32), fraction: f32) -> f32 {
    let (start, end) = range;
    start + (end - start) * fraction.clamp(0.0, 1.0)
}

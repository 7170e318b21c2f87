use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Default, Clone)]
struct Stat {
    calls: u64,
    exclusive_ns: u128,
    inclusive_ns: u128,
}

struct GuardFrame {
    annotation: String,
    start: Instant,
    child_time: Duration,
}

#[derive(Default)]
struct ProfilerState {
    stats: HashMap<String, Stat>,
    frames: Vec<GuardFrame>,
}

/// Collects per-annotation call counts and durations during thunk execution.
///
/// Scopes nest: a scope's exclusive time excludes the time spent in scopes
/// opened while it was active. A disabled profiler records nothing.
pub struct ExecutionProfiler {
    enabled: bool,
    state: Mutex<ProfilerState>,
}

impl ExecutionProfiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(ProfilerState::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Enabled when `AOTRS_PROFILE` is truthy.
    pub fn from_env() -> Self {
        Self::new(crate::env::profile_enabled())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scope(&self, annotation: impl Into<String>) -> ScopeGuard<'_> {
        if !self.enabled {
            return ScopeGuard { profiler: None };
        }
        let mut state = self.state.lock().expect("profiler mutex poisoned");
        state.frames.push(GuardFrame {
            annotation: annotation.into(),
            start: Instant::now(),
            child_time: Duration::ZERO,
        });
        ScopeGuard {
            profiler: Some(self),
        }
    }

    fn close_scope(&self) {
        let mut state = self.state.lock().expect("profiler mutex poisoned");
        let Some(frame) = state.frames.pop() else {
            return;
        };
        let elapsed = frame.start.elapsed();
        let exclusive = elapsed.saturating_sub(frame.child_time);
        let entry = state.stats.entry(frame.annotation).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.exclusive_ns = entry.exclusive_ns.saturating_add(exclusive.as_nanos());
        entry.inclusive_ns = entry.inclusive_ns.saturating_add(elapsed.as_nanos());
        if let Some(parent) = state.frames.last_mut() {
            parent.child_time = parent.child_time.saturating_add(elapsed);
        }
    }

    /// Drains the collected statistics, sorted by inclusive time (descending).
    pub fn take_report(&self) -> ProfileReport {
        let stats = {
            let mut state = self.state.lock().expect("profiler mutex poisoned");
            std::mem::take(&mut state.stats)
        };
        let mut rows: Vec<ProfileRow> = stats
            .into_iter()
            .map(|(annotation, stat)| ProfileRow {
                annotation,
                calls: stat.calls,
                inclusive_ms: stat.inclusive_ns as f64 / 1e6,
                exclusive_ms: stat.exclusive_ns as f64 / 1e6,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.inclusive_ms
                .partial_cmp(&a.inclusive_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.annotation.cmp(&b.annotation))
        });
        ProfileReport { rows }
    }
}

impl Default for ExecutionProfiler {
    fn default() -> Self {
        Self::disabled()
    }
}

pub struct ScopeGuard<'a> {
    profiler: Option<&'a ExecutionProfiler>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(profiler) = self.profiler {
            profiler.close_scope();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileRow {
    pub annotation: String,
    pub calls: u64,
    pub inclusive_ms: f64,
    pub exclusive_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileReport {
    pub rows: Vec<ProfileRow>,
}

impl ProfileReport {
    pub fn row(&self, annotation: &str) -> Option<&ProfileRow> {
        self.rows.iter().find(|row| row.annotation == annotation)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<48} {:>8} {:>12} {:>12}",
            "annotation", "calls", "incl ms", "excl ms"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<48} {:>8} {:>12.3} {:>12.3}",
                row.annotation, row.calls, row.inclusive_ms, row.exclusive_ms
            )?;
        }
        Ok(())
    }
}

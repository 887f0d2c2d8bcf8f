//! Per-subsystem health tracking for the application context.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use kiln_core::event::now_ms;

/// Errors kept per subsystem.
pub const ERROR_RING_SIZE: usize = 10;

/// The subsystems the context tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    EventHub,
    PluginEngine,
    Application,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Subsystem::EventHub => "eventHub",
            Subsystem::PluginEngine => "pluginEngine",
            Subsystem::Application => "application",
        };
        write!(f, "{name}")
    }
}

/// Health record of one subsystem.
#[derive(Debug, Clone)]
pub struct HealthEntry {
    pub healthy: bool,
    pub last_check_ms: u64,
    /// Most recent errors, oldest first, capped at [`ERROR_RING_SIZE`].
    pub errors: VecDeque<String>,
}

impl Default for HealthEntry {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check_ms: now_ms(),
            errors: VecDeque::new(),
        }
    }
}

/// Thread-safe health map with an error ring per subsystem.
pub struct ContextHealth {
    entries: Mutex<HashMap<Subsystem, HealthEntry>>,
}

impl Default for ContextHealth {
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert(Subsystem::EventHub, HealthEntry::default());
        entries.insert(Subsystem::PluginEngine, HealthEntry::default());
        entries.insert(Subsystem::Application, HealthEntry::default());
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl ContextHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a subsystem healthy and stamps the check time.
    pub fn mark_healthy(&self, subsystem: Subsystem) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(subsystem).or_default();
        entry.healthy = true;
        entry.last_check_ms = now_ms();
    }

    /// Records an error, marking the subsystem unhealthy.
    pub fn record_error(&self, subsystem: Subsystem, error: impl Into<String>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(subsystem).or_default();
        entry.healthy = false;
        entry.last_check_ms = now_ms();
        if entry.errors.len() == ERROR_RING_SIZE {
            entry.errors.pop_front();
        }
        entry.errors.push_back(error.into());
    }

    /// Whether a subsystem is currently healthy.
    pub fn is_healthy(&self, subsystem: Subsystem) -> bool {
        self.entries
            .lock()
            .get(&subsystem)
            .map(|entry| entry.healthy)
            .unwrap_or(true)
    }

    /// Snapshot of every subsystem's record.
    pub fn snapshot(&self) -> HashMap<Subsystem, HealthEntry> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let health = ContextHealth::new();
        for subsystem in [
            Subsystem::EventHub,
            Subsystem::PluginEngine,
            Subsystem::Application,
        ] {
            assert!(health.is_healthy(subsystem));
        }
    }

    #[test]
    fn errors_flip_health_and_ring_is_bounded() {
        let health = ContextHealth::new();
        for i in 0..(ERROR_RING_SIZE + 5) {
            health.record_error(Subsystem::PluginEngine, format!("err {i}"));
        }
        assert!(!health.is_healthy(Subsystem::PluginEngine));

        let snapshot = health.snapshot();
        let entry = &snapshot[&Subsystem::PluginEngine];
        assert_eq!(entry.errors.len(), ERROR_RING_SIZE);
        assert_eq!(entry.errors.front().unwrap(), "err 5");
        assert_eq!(entry.errors.back().unwrap(), "err 14");
    }

    #[test]
    fn mark_healthy_recovers_but_keeps_history() {
        let health = ContextHealth::new();
        health.record_error(Subsystem::EventHub, "boom");
        health.mark_healthy(Subsystem::EventHub);

        assert!(health.is_healthy(Subsystem::EventHub));
        assert_eq!(health.snapshot()[&Subsystem::EventHub].errors.len(), 1);
    }
}

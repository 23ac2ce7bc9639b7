//! Memory back-pressure for the training loop.

use std::time::Duration;

use sysinfo::System;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_HIGH_WATER_PERCENT: f64 = 90.0;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Source of the current memory utilization, in percent.
pub trait MemoryProbe: Send {
    fn used_percent(&mut self) -> Result<f64>;
}

/// Reads system-wide memory usage.
pub struct SystemMemory {
    system: System,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn used_percent(&mut self) -> Result<f64> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(Error::MemoryProbe("total memory reported as 0".into()));
        }
        let used = total.saturating_sub(self.system.available_memory());
        Ok(used as f64 / total as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Allow,
    /// The governor already waited out the cooldown; retry the same work.
    Pause,
}

type Sleeper = Box<dyn FnMut(Duration) + Send>;

pub struct ResourceGovernor {
    probe: Box<dyn MemoryProbe>,
    high_water_percent: f64,
    cooldown: Duration,
    sleeper: Sleeper,
}

impl ResourceGovernor {
    pub fn new() -> Self {
        Self::with_probe(Box::new(SystemMemory::new()))
    }

    pub fn with_probe(probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            high_water_percent: DEFAULT_HIGH_WATER_PERCENT,
            cooldown: DEFAULT_COOLDOWN,
            sleeper: Box::new(std::thread::sleep),
        }
    }

    /// Replace how the governor waits; tests record the duration instead.
    pub fn with_sleeper(
        mut self,
        sleeper: impl FnMut(Duration) + Send + 'static,
    ) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn with_limits(
        mut self,
        high_water_percent: f64,
        cooldown: Duration,
    ) -> Self {
        self.high_water_percent = high_water_percent;
        self.cooldown = cooldown;
        self
    }

    /// Sample memory once. Above the high-water mark, sleep for the cooldown
    /// and return [`Pressure::Pause`].
    ///
    /// A failing probe does not hold up training.
    pub fn check_pressure(&mut self) -> Pressure {
        let used = match self.probe.used_percent() {
            Ok(used) => used,
            Err(e) => {
                warn!(error = %e, "memory probe failed, continuing");
                return Pressure::Allow;
            }
        };
        if used <= self.high_water_percent {
            return Pressure::Allow;
        }

        info!(
            used_percent = used,
            cooldown_secs = self.cooldown.as_secs(),
            "memory pressure high, pausing"
        );
        (self.sleeper)(self.cooldown);
        Pressure::Pause
    }
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("high_water_percent", &self.high_water_percent)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct Fixed(Vec<f64>);

    impl MemoryProbe for Fixed {
        fn used_percent(&mut self) -> Result<f64> {
            if self.0.len() > 1 {
                Ok(self.0.remove(0))
            } else {
                Ok(self.0[0])
            }
        }
    }

    struct Broken;

    impl MemoryProbe for Broken {
        fn used_percent(&mut self) -> Result<f64> {
            Err(Error::MemoryProbe("unavailable".into()))
        }
    }

    fn recording(
        probe: impl MemoryProbe + 'static,
    ) -> (ResourceGovernor, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&slept);
        let governor = ResourceGovernor::with_probe(Box::new(probe))
            .with_sleeper(move |d| log.lock().unwrap().push(d));
        (governor, slept)
    }

    #[test]
    fn below_threshold_allows_without_sleeping() {
        let (mut governor, slept) = recording(Fixed(vec![42.0]));
        assert_eq!(governor.check_pressure(), Pressure::Allow);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn above_threshold_pauses_for_cooldown() {
        let (mut governor, slept) = recording(Fixed(vec![95.0, 50.0]));
        assert_eq!(governor.check_pressure(), Pressure::Pause);
        assert_eq!(*slept.lock().unwrap(), vec![Duration::from_secs(60)]);
        assert_eq!(governor.check_pressure(), Pressure::Allow);
    }

    #[test]
    fn exactly_at_threshold_is_allowed() {
        let (mut governor, _slept) = recording(Fixed(vec![90.0]));
        assert_eq!(governor.check_pressure(), Pressure::Allow);
    }

    #[test]
    fn custom_limits_apply() {
        let (governor, slept) = recording(Fixed(vec![60.0]));
        let mut governor =
            governor.with_limits(50.0, Duration::from_millis(5));
        assert_eq!(governor.check_pressure(), Pressure::Pause);
        assert_eq!(*slept.lock().unwrap(), vec![Duration::from_millis(5)]);
    }

    #[test]
    fn probe_failure_allows() {
        let (mut governor, slept) = recording(Broken);
        assert_eq!(governor.check_pressure(), Pressure::Allow);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn system_probe_reports_a_percentage() {
        let mut probe = SystemMemory::new();
        if let Ok(used) = probe.used_percent() {
            assert!((0.0..=100.0).contains(&used));
        }
    }
}

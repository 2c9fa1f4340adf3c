//! Host vitals (interoception).

use crate::bus::{topics, EventBus};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use sysinfo::{Disks, System};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Vitals {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub disk_percent: f32,
}

impl Vitals {
    pub fn over(&self, threshold: f32) -> bool {
        self.cpu_percent > threshold || self.ram_percent > threshold
    }
}

pub trait VitalsProbe: Send + Sync {
    fn sample(&self) -> Vitals;
}

/// Live readings through `sysinfo`.
pub struct SystemProbe {
    sys: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new_all()),
        }
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0) as f32
    }
}

impl VitalsProbe for SystemProbe {
    fn sample(&self) -> Vitals {
        let mut sys = self.sys.lock();
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_percent = sys.global_cpu_info().cpu_usage();
        let ram_percent = percent(sys.used_memory(), sys.total_memory());
        drop(sys);

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
        let disk_percent = percent(total.saturating_sub(available), total);

        Vitals {
            cpu_percent,
            ram_percent,
            disk_percent,
        }
    }
}

/// Samples a probe and raises `high_resource_warning` above a threshold.
pub struct Interoception {
    probe: Arc<dyn VitalsProbe>,
    bus: Arc<EventBus>,
    threshold: f32,
}

impl Interoception {
    pub fn new(probe: Arc<dyn VitalsProbe>, bus: Arc<EventBus>, threshold: f32) -> Self {
        Self { probe, bus, threshold }
    }

    pub fn check(&self) -> Vitals {
        let vitals = self.probe.sample();
        debug!(cpu = vitals.cpu_percent, ram = vitals.ram_percent, disk = vitals.disk_percent, "vitals");
        if vitals.over(self.threshold) {
            warn!(cpu = vitals.cpu_percent, ram = vitals.ram_percent, "high resource usage");
            self.bus
                .publish(topics::HIGH_RESOURCE_WARNING, serde_json::to_value(vitals).unwrap_or_default());
        }
        vitals
    }

    /// Check on every `heartbeat` event.
    pub fn attach_to_heartbeat(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.bus.subscribe(topics::HEARTBEAT, move |_| {
            me.check();
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct FixedProbe(Vitals);
    impl VitalsProbe for FixedProbe {
        fn sample(&self) -> Vitals {
            self.0
        }
    }

    fn watch(bus: &EventBus) -> Arc<PlMutex<usize>> {
        let count = Arc::new(PlMutex::new(0));
        let c = count.clone();
        bus.subscribe(topics::HIGH_RESOURCE_WARNING, move |e| {
            assert!(e.payload["cpu_percent"].is_number());
            *c.lock() += 1;
            Ok(())
        });
        count
    }

    #[test]
    fn warns_only_above_threshold() {
        let bus = Arc::new(EventBus::new());
        let warnings = watch(&bus);

        let calm = Interoception::new(
            Arc::new(FixedProbe(Vitals { cpu_percent: 12.0, ram_percent: 90.0, disk_percent: 99.0 })),
            bus.clone(),
            90.0,
        );
        calm.check();
        assert_eq!(*warnings.lock(), 0);

        let busy = Interoception::new(
            Arc::new(FixedProbe(Vitals { cpu_percent: 95.0, ram_percent: 10.0, disk_percent: 5.0 })),
            bus.clone(),
            90.0,
        );
        busy.check();
        assert_eq!(*warnings.lock(), 1);
    }

    #[test]
    fn heartbeat_triggers_check() {
        let bus = Arc::new(EventBus::new());
        let warnings = watch(&bus);
        let hot = Arc::new(Interoception::new(
            Arc::new(FixedProbe(Vitals { cpu_percent: 20.0, ram_percent: 97.0, disk_percent: 5.0 })),
            bus.clone(),
            90.0,
        ));
        hot.attach_to_heartbeat();
        bus.publish(topics::HEARTBEAT, serde_json::json!(0.0));
        assert_eq!(*warnings.lock(), 1);
    }

    #[test]
    fn system_probe_reports_percentages() {
        let v = SystemProbe::new().sample();
        assert!((0.0..=100.0).contains(&v.ram_percent));
        assert!((0.0..=100.0).contains(&v.disk_percent));
    }
}

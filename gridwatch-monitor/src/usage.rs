//! Host load sampled once per cycle and published as usage telemetry.

use gridwatch_core::contracts::UsageData;
use sysinfo::System;
use tracing::debug;

pub struct UsageSampler {
    sys: System,
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        // CPU usage is a delta between two refreshes; prime the first one.
        sys.refresh_cpu_usage();
        Self { sys }
    }

    /// CPU and memory load in percent.
    pub fn sample(&mut self) -> UsageData {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cpu_load = self.sys.global_cpu_info().cpu_usage();
        let total = self.sys.total_memory();
        let used = total.saturating_sub(self.sys.available_memory());
        let memory_load = if total > 0 { (used as f32 / total as f32) * 100.0 } else { 0.0 };

        debug!(cpu_load, memory_load, "usage sampled");
        UsageData { cpu_load, memory_load }
    }
}

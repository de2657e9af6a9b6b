use serde::{Serialize, Serializer, ser::SerializeStruct};
use sysinfo::{Disks, System};

use super::types::SystemStats;

const MIB: u64 = 1024 * 1024;

fn percent(value: f32) -> String {
    format!("{:.2}%", value)
}

fn megabytes(bytes: u64) -> String {
    format!("{} MB", bytes / MIB)
}

impl Serialize for SystemStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("SystemStats", 13)?;
        out.serialize_field("hostname", &self.hostname)?;
        out.serialize_field("os", &self.os)?;
        out.serialize_field("uptime_secs", &self.uptime_secs)?;
        out.serialize_field("load_one", &self.load_one)?;
        out.serialize_field("cpu_count", &self.cpu_count)?;
        out.serialize_field("cpu_usage", &percent(self.cpu_percent))?;
        out.serialize_field("memory_total", &megabytes(self.memory_total))?;
        out.serialize_field("memory_used", &megabytes(self.memory_used))?;
        out.serialize_field("swap_total", &megabytes(self.swap_total))?;
        out.serialize_field("swap_used", &megabytes(self.swap_used))?;
        out.serialize_field("disk_usage", &percent(self.disk_percent))?;
        out.serialize_field("tasks_processed", &self.tasks_processed)?;
        out.serialize_field("queue_length", &self.queue_length)?;
        out.end()
    }
}

impl SystemStats {
    /// Reads a `System` the caller has already refreshed. CPU usage is only
    /// meaningful after two refreshes some time apart.
    pub fn sample(host: &System, tasks_processed: u64, queue_length: usize) -> Self {
        SystemStats {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
            uptime_secs: System::uptime(),
            load_one: System::load_average().one,
            cpu_count: host.cpus().len(),
            cpu_percent: host.global_cpu_usage(),
            memory_total: host.total_memory(),
            memory_used: host.used_memory(),
            swap_total: host.total_swap(),
            swap_used: host.used_swap(),
            disk_percent: disk_percent(&Disks::new_with_refreshed_list()),
            tasks_processed,
            queue_length,
        }
    }
}

fn disk_percent(disks: &Disks) -> f32 {
    let (used, total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
        (
            used + disk.total_space().saturating_sub(disk.available_space()),
            total + disk.total_space(),
        )
    });
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0) as f32
}

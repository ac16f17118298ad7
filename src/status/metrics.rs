//! Host metrics sampling
//!
//! One sectioned command gathers everything in a single exec:
//! - two `head -1 /proc/stat` samples half a second apart (CPU% needs a delta)
//! - `MemTotal` + `MemAvailable` from `/proc/meminfo`
//! - `df -Pk /` for the root filesystem
//!
//! Non-Linux hosts produce empty sections and therefore no metrics.

use serde::Serialize;

/// Sampling command, sections delimited by `===NAME===` markers
pub const METRICS_COMMAND: &str = "echo '===STAT1==='; head -1 /proc/stat 2>/dev/null; sleep 0.5; echo '===STAT2==='; head -1 /proc/stat 2>/dev/null; echo '===MEMINFO==='; grep -E '^(MemTotal|MemAvailable):' /proc/meminfo 2>/dev/null; echo '===DISK==='; df -Pk / 2>/dev/null; echo '===END==='";

/// Used/total pair in bytes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStat {
    pub used: u64,
    pub total: u64,
    pub percent: f64,
}

impl UsageStat {
    fn new(used: u64, total: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64) * 100.0
        };
        Self {
            used,
            total,
            percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    /// Busy percentage over the sampling window
    pub cpu: f64,
    pub memory: UsageStat,
    pub disk: UsageStat,
}

/// Raw CPU counters from /proc/stat
#[derive(Debug, Clone, Copy, Default)]
struct CpuSnapshot {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CpuSnapshot {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn idle(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// Parse the full command output. Any missing section yields `None`.
pub fn parse_metrics(output: &str) -> Option<HostMetrics> {
    let first = parse_cpu_snapshot(extract_section(output, "STAT1")?)?;
    let second = parse_cpu_snapshot(extract_section(output, "STAT2")?)?;
    let (mem_used, mem_total) = parse_meminfo(extract_section(output, "MEMINFO")?)?;
    let (disk_used, disk_total) = parse_df(extract_section(output, "DISK")?)?;

    Some(HostMetrics {
        cpu: cpu_percent(&first, &second),
        memory: UsageStat::new(mem_used, mem_total),
        disk: UsageStat::new(disk_used, disk_total),
    })
}

// ─── Parsers ──────────────────────────────────────────────────────────────

/// Extract section between markers
fn extract_section<'a>(output: &'a str, marker: &str) -> Option<&'a str> {
    let start_marker = format!("==={}===", marker);
    let start = output.find(&start_marker)?;
    let rest = &output[start + start_marker.len()..];
    let end = rest.find("===").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// "cpu  user nice system idle iowait irq softirq steal ..."
fn parse_cpu_snapshot(section: &str) -> Option<CpuSnapshot> {
    let line = section.lines().next()?;
    if !line.starts_with("cpu ") {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    Some(CpuSnapshot {
        user: parts[1].parse().ok()?,
        nice: parts[2].parse().ok()?,
        system: parts[3].parse().ok()?,
        idle: parts[4].parse().ok()?,
        iowait: parts[5].parse().ok()?,
        irq: parts[6].parse().ok()?,
        softirq: parts[7].parse().ok()?,
        steal: parts[8].parse().ok()?,
    })
}

fn cpu_percent(prev: &CpuSnapshot, curr: &CpuSnapshot) -> f64 {
    let total = curr.total().saturating_sub(prev.total());
    if total == 0 {
        return 0.0;
    }
    let idle = curr.idle().saturating_sub(prev.idle());
    let busy = total.saturating_sub(idle);
    ((busy as f64 / total as f64) * 1000.0).round() / 10.0
}

/// (used_bytes, total_bytes)
fn parse_meminfo(section: &str) -> Option<(u64, u64)> {
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;

    for line in section.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = extract_kb_value(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = extract_kb_value(line);
        }
    }

    let total = total_kb? * 1024;
    let available = available_kb? * 1024;
    Some((total.saturating_sub(available), total))
}

/// "MemTotal:    1234 kB" → 1234
fn extract_kb_value(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// POSIX `df -Pk` → (used_bytes, total_bytes) of the last data row
fn parse_df(section: &str) -> Option<(u64, u64)> {
    let row = section
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .last()?;
    let parts: Vec<&str> = row.split_whitespace().collect();
    if parts.len() < 6 {
        return None;
    }
    let total_kb: u64 = parts[1].parse().ok()?;
    let used_kb: u64 = parts[2].parse().ok()?;
    Some((used_kb * 1024, total_kb * 1024))
}

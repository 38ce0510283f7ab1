//! Host and process statistics
//!
//! [`ProcSampler`] reads the Linux `/proc` filesystem, or any directory laid
//! out like it, to describe the CPU, memory and load of the host and the
//! resource usage of the current process. It also lists which known ML
//! framework libraries the process has loaded.
//!
//! [`ProcCollector`] runs both collections as separate tasks on a worker
//! pool and gathers whatever they produce. A collection that fails is logged
//! and left out of the report.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam::channel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{BoundedExecutor, TaskExecutor};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Worker threads of the collection pool
pub const COLLECTION_WORKERS: usize = 2;

/// Library name fragments reported as imports, in report order
pub const KNOWN_FRAMEWORKS: [&str; 10] = [
    "torch",
    "tensorflow",
    "onnxruntime",
    "cudart",
    "cudnn",
    "nccl",
    "mkl",
    "openblas",
    "xgboost",
    "lightgbm",
];

const KIB: u64 = 1024;

#[derive(Error, Debug)]
pub enum ProcError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {file}: {message}")]
    Parse { file: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, ProcError>;

fn parse_error(file: &'static str, message: impl Into<String>) -> ProcError {
    ProcError::Parse {
        file,
        message: message.into(),
    }
}

/// Busy and total clock ticks of one `cpu` line in `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy share of the ticks elapsed since `earlier`, in percent
    pub fn percent_since(&self, earlier: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let busy = self.busy.saturating_sub(earlier.busy);
        round2(busy as f64 / total as f64 * 100.0)
    }
}

/// The aggregate `cpu` line and one entry per CPU
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSample {
    pub total: CpuTimes,
    pub per_cpu: Vec<CpuTimes>,
}

/// Parses the `cpu*` lines of `/proc/stat`
pub fn parse_cpu_stat(content: &str) -> Result<CpuSample> {
    let mut sample = CpuSample::default();
    let mut seen_total = false;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else {
            continue;
        };
        if !label.starts_with("cpu") {
            continue;
        }

        let values: Vec<u64> = parts.map(|value| value.parse().unwrap_or(0)).collect();
        if values.len() < 4 {
            return Err(parse_error("stat", format!("short {} line", label)));
        }
        // idle + iowait
        let idle = values[3].saturating_add(values.get(4).copied().unwrap_or(0));
        // guest time is already counted in user and nice
        let total = values.iter().take(8).fold(0u64, |sum, v| sum.saturating_add(*v));
        let times = CpuTimes {
            busy: total.saturating_sub(idle),
            total,
        };

        if label == "cpu" {
            sample.total = times;
            seen_total = true;
        } else {
            sample.per_cpu.push(times);
        }
    }

    if !seen_total {
        return Err(parse_error("stat", "missing aggregate cpu line"));
    }
    Ok(sample)
}

/// Host memory in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total: u64,
    pub available: u64,
    pub swap_total: u64,
}

/// Parses `/proc/meminfo`
///
/// Kernels without `MemAvailable` report `MemFree` as available.
pub fn parse_meminfo(content: &str) -> Result<MemInfo> {
    let mut info = MemInfo::default();
    let mut free = 0;
    let mut available = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let bytes = value
            .split_whitespace()
            .next()
            .and_then(|kb| kb.parse::<u64>().ok())
            .unwrap_or(0)
            .saturating_mul(KIB);
        match key.trim() {
            "MemTotal" => info.total = bytes,
            "MemFree" => free = bytes,
            "MemAvailable" => available = Some(bytes),
            "SwapTotal" => info.swap_total = bytes,
            _ => {}
        }
    }

    if info.total == 0 {
        return Err(parse_error("meminfo", "missing MemTotal"));
    }
    info.available = available.unwrap_or(free);
    Ok(info)
}

/// Parses the 1, 5 and 15 minute averages of `/proc/loadavg`
pub fn parse_loadavg(content: &str) -> Result<[f64; 3]> {
    let mut averages = [0.0; 3];
    let mut parts = content.split_whitespace();
    for (slot, name) in averages.iter_mut().zip(["load1", "load5", "load15"]) {
        *slot = parts
            .next()
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| parse_error("loadavg", format!("invalid {}", name)))?;
    }
    Ok(averages)
}

/// User plus system clock ticks from `/proc/[pid]/stat`
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn parse_process_ticks(content: &str) -> Result<u64> {
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| parse_error("self/stat", "missing ')'"))?;
    let fields: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();

    let field = |index: usize, name: &str| -> Result<u64> {
        fields
            .get(index)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| parse_error("self/stat", format!("invalid {}", name)))
    };
    Ok(field(11, "utime")?.saturating_add(field(12, "stime")?))
}

/// Virtual and resident size in bytes from `/proc/[pid]/status`
pub fn parse_process_memory(content: &str) -> (u64, u64) {
    let mut vms = 0;
    let mut rss = 0;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let bytes = || {
            value
                .split_whitespace()
                .next()
                .and_then(|kb| kb.parse::<u64>().ok())
                .unwrap_or(0)
                .saturating_mul(KIB)
        };
        match key.trim() {
            "VmSize" => vms = bytes(),
            "VmRSS" => rss = bytes(),
            _ => {}
        }
    }
    (vms, rss)
}

/// Known frameworks among the libraries mapped in `/proc/[pid]/maps`
pub fn parse_imports(maps: &str) -> Vec<String> {
    let libraries: BTreeSet<&str> = maps
        .lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .filter(|path| path.starts_with('/'))
        .filter_map(|path| Path::new(path).file_name().and_then(|name| name.to_str()))
        .collect();

    KNOWN_FRAMEWORKS
        .iter()
        .filter(|framework| libraries.iter().any(|library| library.contains(*framework)))
        .map(|framework| framework.to_string())
        .collect()
}

/// Host-wide usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub cpu_count: usize,
    pub cpu_percent: f64,
    pub cpu_percent_percpu: Vec<f64>,
    pub load_average: [f64; 3],
    /// 15 minute load relative to the CPU count, in percent
    pub cpu_usage: f64,
    pub used_ram_percent: f64,
    pub used_ram_mb: f64,
}

/// Share of a memory pool held by the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryShare {
    /// Fraction of the pool, three decimals
    pub p: String,
    /// Bytes
    pub t: u64,
}

impl MemoryShare {
    fn of(bytes: u64, pool: u64) -> Self {
        let fraction = if pool == 0 {
            0.0
        } else {
            bytes as f64 / pool as f64
        };
        Self {
            p: format!("{:.3}", fraction),
            t: bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMemory {
    /// Against physical memory plus swap
    pub vms: MemoryShare,
    /// Against physical memory
    pub rss: MemoryShare,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Share of all CPUs used by this process, in percent
    pub cpu: f64,
    pub mem: ProcessMemory,
}

/// One hardware sample as sent with the heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcStats {
    pub ps_stats: HostStats,
    pub proc: ProcessStats,
}

#[derive(Debug, Clone, Default)]
struct CpuReading {
    host: CpuSample,
    process_ticks: u64,
}

/// Reads host and process statistics below a proc root
///
/// CPU shares cover the interval since the previous sample; the first sample
/// covers the time since boot.
#[derive(Debug)]
pub struct ProcSampler {
    root: PathBuf,
    previous: Mutex<Option<CpuReading>>,
}

impl ProcSampler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            previous: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, relative: &str) -> Result<String> {
        let path = self.root.join(relative);
        fs::read_to_string(&path).map_err(|source| ProcError::Read { path, source })
    }

    pub fn sample(&self) -> Result<ProcStats> {
        let cpu = parse_cpu_stat(&self.read("stat")?)?;
        let process_ticks = parse_process_ticks(&self.read("self/stat")?)?;
        let memory = parse_meminfo(&self.read("meminfo")?)?;
        let load_average = parse_loadavg(&self.read("loadavg")?)?;
        let (vms, rss) = parse_process_memory(&self.read("self/status")?);

        let previous = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(CpuReading {
                host: cpu.clone(),
                process_ticks,
            })
            .unwrap_or_default();

        let cpu_count = cpu.per_cpu.len().max(1);
        let cpu_percent = cpu.total.percent_since(&previous.host.total);
        let cpu_percent_percpu = cpu
            .per_cpu
            .iter()
            .enumerate()
            .map(|(index, times)| {
                let earlier = previous.host.per_cpu.get(index).copied().unwrap_or_default();
                times.percent_since(&earlier)
            })
            .collect();

        let elapsed = cpu.total.total.saturating_sub(previous.host.total.total);
        let process_cpu = if elapsed == 0 {
            0.0
        } else {
            let used = process_ticks.saturating_sub(previous.process_ticks);
            round2(used as f64 / elapsed as f64 * 100.0)
        };

        let used = memory.total.saturating_sub(memory.available);
        Ok(ProcStats {
            ps_stats: HostStats {
                cpu_count,
                cpu_percent,
                cpu_percent_percpu,
                load_average,
                cpu_usage: round2(load_average[2] / cpu_count as f64 * 100.0),
                used_ram_percent: round2(used as f64 / memory.total as f64 * 100.0),
                used_ram_mb: round2(used as f64 / (KIB * KIB) as f64),
            },
            proc: ProcessStats {
                cpu: process_cpu.min(cpu_percent),
                mem: ProcessMemory {
                    vms: MemoryShare::of(vms, memory.total.saturating_add(memory.swap_total)),
                    rss: MemoryShare::of(rss, memory.total),
                },
            },
        })
    }

    pub fn imports(&self) -> Result<Vec<String>> {
        Ok(parse_imports(&self.read("self/maps")?))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Result of one collection round
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcReport {
    pub proc_stats: Option<ProcStats>,
    pub imports: Vec<String>,
}

enum Collected {
    Hardware(Result<ProcStats>),
    Imports(Result<Vec<String>>),
}

/// Runs hardware sampling and the imports scan on a worker pool
pub struct ProcCollector {
    sampler: Arc<ProcSampler>,
    executor: Arc<dyn TaskExecutor>,
}

impl ProcCollector {
    pub fn new(sampler: ProcSampler, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            sampler: Arc::new(sampler),
            executor,
        }
    }

    /// Collector over `root` with a pool of its own
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let pool = BoundedExecutor::named(
            "arcee-collect",
            COLLECTION_WORKERS,
            COLLECTION_WORKERS * 2,
        );
        Self::new(ProcSampler::new(root), Arc::new(pool))
    }

    pub fn root(&self) -> &Path {
        self.sampler.root()
    }

    /// Sample hardware and scan imports, waiting for both tasks
    pub fn collect(&self) -> ProcReport {
        let (tx, rx) = channel::bounded(2);

        let sampler = Arc::clone(&self.sampler);
        let hardware_tx = tx.clone();
        self.executor.submit(Box::new(move || {
            let _ = hardware_tx.send(Collected::Hardware(sampler.sample()));
        }));
        let sampler = Arc::clone(&self.sampler);
        self.executor.submit(Box::new(move || {
            let _ = tx.send(Collected::Imports(sampler.imports()));
        }));

        // ends once both tasks dropped their sender, including on panic
        let mut report = ProcReport::default();
        for collected in rx.iter() {
            match collected {
                Collected::Hardware(Ok(stats)) => report.proc_stats = Some(stats),
                Collected::Imports(Ok(imports)) => report.imports = imports,
                Collected::Hardware(Err(err)) | Collected::Imports(Err(err)) => {
                    tracing::debug!(root = %self.root().display(), %err, "proc collection failed");
                }
            }
        }
        report
    }

    /// Scan imports only
    pub fn imports(&self) -> Vec<String> {
        let (tx, rx) = channel::bounded(1);
        let sampler = Arc::clone(&self.sampler);
        self.executor.submit(Box::new(move || {
            let _ = tx.send(sampler.imports());
        }));

        match rx.recv() {
            Ok(Ok(imports)) => imports,
            Ok(Err(err)) => {
                tracing::debug!(root = %self.root().display(), %err, "imports scan failed");
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }
}

impl std::fmt::Debug for ProcCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcCollector")
            .field("root", &self.sampler.root())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STAT: &str = "\
cpu  1000 0 500 8000 500 0 0 0 0 0
cpu0 500 0 250 4000 250 0 0 0 0 0
cpu1 500 0 250 4000 250 0 0 0 0 0
intr 12345
ctxt 6789
";

    const MEMINFO: &str = "\
MemTotal:        8388608 kB
MemFree:         1048576 kB
MemAvailable:    4194304 kB
SwapTotal:             0 kB
";

    const SELF_STAT: &str = "4242 (python3 (worker)) S 1 4242 4242 0 -1 4194304 100 0 0 0 \
                             300 200 0 0 20 0 4 0 100 2147483648 262144 18446744073709551615";

    const SELF_STATUS: &str = "\
Name:\tpython3
VmSize:\t 2097152 kB
VmRSS:\t 1048576 kB
Threads:\t4
";

    const MAPS: &str = "\
55d0a0000000-55d0a0001000 r-xp 00000000 08:01 1001 /usr/bin/python3.11
7f0000000000-7f0000001000 r-xp 00000000 08:01 1234 /opt/conda/lib/libtorch_cpu.so
7f0000001000-7f0000002000 r--p 00000000 08:01 1235 /usr/lib/x86_64-linux-gnu/libc.so.6
7f0000002000-7f0000003000 rw-p 00000000 00:00 0 [heap]
7f0000003000-7f0000004000 r-xp 00000000 08:01 1236 /opt/conda/lib/libcudart.so.12
7f0000004000-7f0000005000 rw-p 00000000 00:00 0
";

    fn fake_proc() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("self")).unwrap();
        for (name, content) in [
            ("stat", STAT),
            ("meminfo", MEMINFO),
            ("loadavg", "0.50 1.00 2.00 1/300 4242\n"),
            ("self/stat", SELF_STAT),
            ("self/status", SELF_STATUS),
            ("self/maps", MAPS),
        ] {
            fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn test_parse_cpu_stat() {
        let sample = parse_cpu_stat(STAT).unwrap();
        assert_eq!(sample.total, CpuTimes { busy: 1500, total: 10000 });
        assert_eq!(sample.per_cpu.len(), 2);
        assert_eq!(sample.per_cpu[0], CpuTimes { busy: 750, total: 5000 });
    }

    #[test]
    fn test_parse_cpu_stat_requires_aggregate() {
        assert!(parse_cpu_stat("cpu0 1 2 3 4\n").is_err());
        assert!(parse_cpu_stat("cpu 1 2\n").is_err());
    }

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(info.total, 8 * 1024 * 1024 * 1024);
        assert_eq!(info.available, 4 * 1024 * 1024 * 1024);
        assert_eq!(info.swap_total, 0);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let info = parse_meminfo("MemTotal: 100 kB\nMemFree: 40 kB\n").unwrap();
        assert_eq!(info.available, 40 * 1024);
        assert!(parse_meminfo("MemFree: 40 kB\n").is_err());
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.50 1.00 2.00 1/300 4242").unwrap(), [0.5, 1.0, 2.0]);
        assert!(parse_loadavg("0.50 oops").is_err());
    }

    #[test]
    fn test_parse_process_ticks_with_parens_in_name() {
        assert_eq!(parse_process_ticks(SELF_STAT).unwrap(), 500);
        assert!(parse_process_ticks("4242 (short) S 1").is_err());
    }

    #[test]
    fn test_parse_process_memory() {
        assert_eq!(
            parse_process_memory(SELF_STATUS),
            (2 * 1024 * 1024 * 1024, 1024 * 1024 * 1024)
        );
    }

    #[test]
    fn test_parse_imports() {
        assert_eq!(parse_imports(MAPS), vec!["torch", "cudart"]);
        assert!(parse_imports("").is_empty());
    }

    #[test]
    fn test_first_sample_covers_time_since_boot() {
        let proc_root = fake_proc();
        let stats = ProcSampler::new(proc_root.path()).sample().unwrap();

        assert_eq!(stats.ps_stats.cpu_count, 2);
        assert_eq!(stats.ps_stats.cpu_percent, 15.0);
        assert_eq!(stats.ps_stats.cpu_percent_percpu, vec![15.0, 15.0]);
        assert_eq!(stats.ps_stats.load_average, [0.5, 1.0, 2.0]);
        assert_eq!(stats.ps_stats.cpu_usage, 100.0);
        assert_eq!(stats.ps_stats.used_ram_percent, 50.0);
        assert_eq!(stats.ps_stats.used_ram_mb, 4096.0);
        assert_eq!(stats.proc.cpu, 5.0);
        assert_eq!(stats.proc.mem.vms.p, "0.250");
        assert_eq!(stats.proc.mem.rss.p, "0.125");
        assert_eq!(stats.proc.mem.rss.t, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_next_sample_covers_interval() {
        let proc_root = fake_proc();
        let sampler = ProcSampler::new(proc_root.path());
        sampler.sample().unwrap();

        fs::write(
            proc_root.path().join("stat"),
            STAT.replace("cpu  1000 0 500 8000 500", "cpu  2000 0 500 11000 500"),
        )
        .unwrap();
        fs::write(
            proc_root.path().join("self/stat"),
            SELF_STAT.replace(" 300 200 ", " 500 200 "),
        )
        .unwrap();

        let stats = sampler.sample().unwrap();
        assert_eq!(stats.ps_stats.cpu_percent, 25.0);
        assert_eq!(stats.ps_stats.cpu_percent_percpu, vec![0.0, 0.0]);
        assert_eq!(stats.proc.cpu, 5.0);
    }

    #[test]
    fn test_missing_root_is_a_read_error() {
        let sampler = ProcSampler::new("/nonexistent/proc");
        assert!(matches!(sampler.sample(), Err(ProcError::Read { .. })));
        assert!(sampler.imports().is_err());
    }

    #[test]
    fn test_collector_runs_on_pool() {
        let proc_root = fake_proc();
        let collector = ProcCollector::new(
            ProcSampler::new(proc_root.path()),
            Arc::new(BoundedExecutor::named("arcee-collect", COLLECTION_WORKERS, 4)),
        );

        let report = collector.collect();
        assert_eq!(report.imports, vec!["torch", "cudart"]);
        assert_eq!(report.proc_stats.unwrap().ps_stats.cpu_count, 2);
        assert_eq!(collector.imports(), vec!["torch", "cudart"]);
    }

    #[test]
    fn test_collector_leaves_out_failed_collections() {
        let collector = ProcCollector::with_root("/nonexistent/proc");
        assert_eq!(collector.collect(), ProcReport::default());
        assert!(collector.imports().is_empty());
    }

    #[test]
    fn test_report_serialization() {
        let proc_root = fake_proc();
        let report = ProcCollector::with_root(proc_root.path()).collect();
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["imports"], serde_json::json!(["torch", "cudart"]));
        assert_eq!(value["proc_stats"]["proc"]["mem"]["vms"]["t"], 2147483648u64);
        assert_eq!(value["proc_stats"]["ps_stats"]["load_average"][2], 2.0);
    }
}

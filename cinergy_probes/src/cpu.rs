use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::{
    delta::Counter,
    sink::Sample,
    source::now_ns,
    Delta, DeltaResult, DeltaTracker, SourceError,
};

pub const SYSFS_CPU_PATH: &str = "/sys/devices/system/cpu";

/// Cumulative CPU time of one line of `/proc/stat`, in jiffies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTicks {
    /// idle + iowait
    pub idle: u64,
    /// user + nice + system + irq + softirq + steal
    pub not_idle: u64,
}

impl CpuTicks {
    pub fn new(idle: u64, not_idle: u64) -> CpuTicks {
        CpuTicks { idle, not_idle }
    }

    pub fn total(&self) -> u64 {
        self.idle + self.not_idle
    }
}

impl From<&procfs::CpuTime> for CpuTicks {
    fn from(t: &procfs::CpuTime) -> Self {
        let opt = |v: Option<u64>| v.unwrap_or(0);
        // guest time is already accounted in user time
        CpuTicks {
            idle: t.idle + opt(t.iowait),
            not_idle: t.user + t.nice + t.system + opt(t.irq) + opt(t.softirq) + opt(t.steal),
        }
    }
}

impl Counter for CpuTicks {
    type Diff = CpuTicks;

    fn diff(self, previous: CpuTicks) -> Option<CpuTicks> {
        Some(CpuTicks {
            idle: self.idle.checked_sub(previous.idle)?,
            not_idle: self.not_idle.checked_sub(previous.not_idle)?,
        })
    }
}

/// Percentage of busy time during the delta.
///
/// An empty delta is `Unavailable`, not 0%: nothing proves that the cpu was idle.
pub fn busy_percent(delta: Delta<CpuTicks>) -> DeltaResult<f64> {
    let total = delta.value.total();
    if total == 0 {
        return DeltaResult::Unavailable;
    }
    let busy = total - delta.value.idle;
    DeltaResult::Valid(busy as f64 / total as f64 * 100.0)
}

/// A snapshot of `/proc/stat`.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuStat {
    pub timestamp_ns: i64,
    /// The first, cumulated, line.
    pub total: CpuTicks,
    /// One entry per online core.
    pub cores: Vec<(u32, CpuTicks)>,
}

pub trait CpuStatSource: Send {
    fn read_stat(&mut self) -> Result<CpuStat, SourceError>;
}

pub const PROC_STAT_PATH: &str = "/proc/stat";

/// Reads `/proc/stat` through procfs.
#[derive(Debug, Clone)]
pub struct ProcStatSource {
    path: PathBuf,
}

impl ProcStatSource {
    pub fn new() -> ProcStatSource {
        Self::with_path(PROC_STAT_PATH)
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> ProcStatSource {
        ProcStatSource {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Default for ProcStatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuStatSource for ProcStatSource {
    fn read_stat(&mut self) -> Result<CpuStat, SourceError> {
        let content = fs::read_to_string(&self.path).map_err(|e| SourceError::io(PROC_STAT_PATH, e))?;
        parse_proc_stat(&content, now_ns())
    }
}

/// Parses the content of `/proc/stat`.
///
/// Offline cpus have no line, so the core ids are taken from the `cpuN` labels,
/// not from the position of the lines.
pub fn parse_proc_stat(content: &str, timestamp_ns: i64) -> Result<CpuStat, SourceError> {
    let stats = procfs::KernelStats::from_reader(content.as_bytes())?;
    let ids: Vec<u32> = content
        .lines()
        .filter_map(|line| line.split_whitespace().next()?.strip_prefix("cpu"))
        .filter(|id| !id.is_empty())
        .map(|id| id.parse())
        .collect::<Result<_, _>>()
        .map_err(|_| SourceError::parse(PROC_STAT_PATH, content.as_bytes()))?;
    if ids.len() != stats.cpu_time.len() {
        return Err(SourceError::parse(PROC_STAT_PATH, content.as_bytes()));
    }
    let cores = ids.into_iter().zip(stats.cpu_time.iter().map(CpuTicks::from)).collect();
    Ok(CpuStat {
        timestamp_ns,
        total: CpuTicks::from(&stats.total),
        cores,
    })
}

/// Reads the current frequency of a core, in kHz.
pub trait FrequencySource: Send {
    fn read_khz(&mut self, cpu: u32) -> Result<u64, SourceError>;
}

/// Reads `cpuN/cpufreq/scaling_cur_freq`.
#[derive(Debug, Clone)]
pub struct SysfsFrequencySource {
    root: PathBuf,
}

impl SysfsFrequencySource {
    pub fn new() -> SysfsFrequencySource {
        Self::with_root(SYSFS_CPU_PATH)
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> SysfsFrequencySource {
        SysfsFrequencySource {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Default for SysfsFrequencySource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencySource for SysfsFrequencySource {
    fn read_khz(&mut self, cpu: u32) -> Result<u64, SourceError> {
        let stream = format!("cpu{cpu}/cpufreq/scaling_cur_freq");
        let content = fs::read_to_string(self.root.join(&stream)).map_err(|e| SourceError::io(&stream, e))?;
        content
            .trim_end()
            .parse()
            .map_err(|_| SourceError::parse(stream, content.as_bytes()))
    }
}

/// Average frequency of the cores, in kHz. Cores whose frequency can't be read are ignored.
pub fn mean_frequency(source: &mut dyn FrequencySource, cores: &[u32]) -> Option<f64> {
    let readable: Vec<u64> = cores.iter().filter_map(|c| source.read_khz(*c).ok()).collect();
    if readable.is_empty() {
        None
    } else {
        Some(readable.iter().sum::<u64>() as f64 / readable.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CpuStream {
    Global,
    Core(u32),
}

/// CPU usage of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuUsage {
    /// From the first line of `/proc/stat`.
    pub global: DeltaResult<f64>,
    pub per_core: BTreeMap<u32, DeltaResult<f64>>,
}

impl CpuUsage {
    fn unavailable() -> CpuUsage {
        CpuUsage {
            global: DeltaResult::Unavailable,
            per_core: BTreeMap::new(),
        }
    }

    /// Usage of one core, `Unavailable` if the core is unknown.
    pub fn core(&self, id: u32) -> DeltaResult<f64> {
        self.per_core.get(&id).copied().unwrap_or(DeltaResult::Unavailable)
    }

    /// Mean usage of a set of cores, `Unavailable` unless every core is valid.
    pub fn mean_of(&self, cores: &[u32]) -> DeltaResult<f64> {
        DeltaResult::mean(cores.iter().map(|c| self.core(*c)))
    }
}

/// Turns jiffy counters into busy percentages, globally, per core and per socket.
pub struct CpuUsageEngine {
    /// socket id and its cores, in discovery order
    sockets: Vec<(u32, Vec<u32>)>,
    history: DeltaTracker<CpuStream, CpuTicks>,
}

impl CpuUsageEngine {
    pub fn new(sockets: Vec<(u32, Vec<u32>)>) -> CpuUsageEngine {
        CpuUsageEngine {
            sockets,
            history: DeltaTracker::new(),
        }
    }

    pub fn sockets(&self) -> &[(u32, Vec<u32>)] {
        &self.sockets
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn tick(&mut self, source: &mut dyn CpuStatSource) -> CpuUsage {
        let stat = match source.read_stat() {
            Ok(stat) => stat,
            Err(e) => {
                warn!("cpu usage unavailable this tick: {e}");
                return CpuUsage::unavailable();
            }
        };
        let ts = stat.timestamp_ns;

        let global = self
            .history
            .update(CpuStream::Global, ts, stat.total)
            .and_then(busy_percent);

        let mut per_core = BTreeMap::new();
        for (id, ticks) in &stat.cores {
            let usage = self.history.update(CpuStream::Core(*id), ts, *ticks).and_then(busy_percent);
            if usage == DeltaResult::Invalid {
                debug!("jiffies of cpu{id} went backwards");
            }
            per_core.insert(*id, usage);
        }

        // cores that went offline start again from scratch when they come back
        self.history.retain(|s| match s {
            CpuStream::Global => true,
            CpuStream::Core(id) => per_core.contains_key(id),
        });

        CpuUsage { global, per_core }
    }

    /// Appends the global usage, and the usage and frequency of every socket.
    ///
    /// The frequency of a socket is only written along with a valid usage.
    pub fn write_to(&self, usage: &CpuUsage, freq: &mut dyn FrequencySource, sample: &mut Sample) {
        if let DeltaResult::Valid(global) = usage.global {
            sample.number("cpu%_package-global", global);
        }
        for (socket, cores) in &self.sockets {
            if let DeltaResult::Valid(socket_usage) = usage.mean_of(cores) {
                sample.number(format!("cpu%_package-{socket}"), socket_usage);
                if let Some(khz) = mean_frequency(freq, cores) {
                    sample.number(format!("freq_package-{socket}"), khz);
                }
            }
        }
    }
}

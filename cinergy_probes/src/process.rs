use log::{debug, info};
use procfs::process::Process;

use crate::{sink::Sample, source::now_ns, DeltaResult, DeltaTracker, SourceError};

const NS_PER_SEC: u64 = 1_000_000_000;

/// Cumulative cpu time of a monitored process or thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCpuTime {
    pub pid: i32,
    /// Name of the metric, for instance `vm` or `CPU0`.
    pub label: String,
    pub cpu_time_ns: u64,
    pub timestamp_ns: i64,
}

/// Supplies the cpu time of the monitored processes.
///
/// Processes that can no longer be read are left out of the result.
pub trait ProcessUsageProvider: Send {
    fn cpu_times(&mut self) -> Vec<ProcessCpuTime>;
}

/// Computes the cpu usage of processes, in percent of one core.
#[derive(Debug, Default)]
pub struct ProcessUsageEngine {
    history: DeltaTracker<i32>,
}

impl ProcessUsageEngine {
    pub fn new() -> ProcessUsageEngine {
        ProcessUsageEngine::default()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn tick(&mut self, provider: &mut dyn ProcessUsageProvider) -> Vec<(String, DeltaResult<f64>)> {
        let times = provider.cpu_times();
        let usages = times
            .iter()
            .map(|t| {
                let usage = self
                    .history
                    .update(t.pid, t.timestamp_ns, t.cpu_time_ns)
                    .map(|d| d.per_ns() * 100.0);
                (t.label.clone(), usage)
            })
            .collect();
        self.history.retain(|pid| times.iter().any(|t| t.pid == *pid));
        usages
    }

    pub fn write_to(usages: &[(String, DeltaResult<f64>)], sample: &mut Sample) {
        for (label, usage) in usages {
            if let DeltaResult::Valid(percent) = usage {
                sample.number(label.as_str(), *percent);
            }
        }
    }
}

/// Monitors a process, such as a QEMU virtual machine, and its vCPU threads through procfs.
#[derive(Debug)]
pub struct ProcfsProcessProvider {
    pid: i32,
    label: String,
    /// thread id and label
    threads: Vec<(i32, String)>,
    ticks_per_second: u64,
}

impl ProcfsProcessProvider {
    /// Monitors `pid` under the name `label`, and every thread of `pid` whose name contains `CPU`.
    pub fn new<S: Into<String>>(pid: i32, label: S) -> Result<ProcfsProcessProvider, SourceError> {
        let process = Process::new(pid)?;
        let mut threads = Vec::new();
        for task in process.tasks()? {
            let task = task?;
            if task.tid == pid {
                continue;
            }
            let comm = task.stat()?.comm;
            if comm.contains("CPU") {
                threads.push((task.tid, vcpu_label(&comm)));
            }
        }
        info!("monitoring process {pid} with {} vCPU threads", threads.len());
        Ok(ProcfsProcessProvider {
            pid,
            label: label.into(),
            threads,
            ticks_per_second: procfs::ticks_per_second(),
        })
    }

    fn process_time(&self) -> Result<u64, SourceError> {
        let stat = Process::new(self.pid)?.stat()?;
        Ok((stat.utime + stat.stime) * NS_PER_SEC / self.ticks_per_second.max(1))
    }

    fn thread_time(tid: i32) -> Result<u64, SourceError> {
        Ok(Process::new(tid)?.schedstat()?.sum_exec_runtime)
    }
}

/// `CPU 0/KVM` becomes `CPU0`.
fn vcpu_label(comm: &str) -> String {
    comm.replace(' ', "").replace("/KVM", "")
}

impl ProcessUsageProvider for ProcfsProcessProvider {
    fn cpu_times(&mut self) -> Vec<ProcessCpuTime> {
        let mut times = Vec::with_capacity(self.threads.len() + 1);
        // the whole process through stat, the details through schedstat
        match self.process_time() {
            Ok(t) => times.push(ProcessCpuTime {
                pid: self.pid,
                label: self.label.clone(),
                cpu_time_ns: t,
                timestamp_ns: now_ns(),
            }),
            Err(e) => debug!("process {} unreadable: {e}", self.pid),
        }
        for (tid, label) in &self.threads {
            match Self::thread_time(*tid) {
                Ok(t) => times.push(ProcessCpuTime {
                    pid: *tid,
                    label: label.clone(),
                    cpu_time_ns: t,
                    timestamp_ns: now_ns(),
                }),
                Err(e) => debug!("thread {tid} unreadable: {e}"),
            }
        }
        times
    }
}

#[cfg(test)]
mod tests {
    use super::{vcpu_label, ProcessCpuTime, ProcessUsageEngine, ProcessUsageProvider};
    use crate::{sink::Sample, DeltaResult};

    const SEC: i64 = 1_000_000_000;

    struct Fixed(Vec<ProcessCpuTime>);

    impl ProcessUsageProvider for Fixed {
        fn cpu_times(&mut self) -> Vec<ProcessCpuTime> {
            self.0.clone()
        }
    }

    fn time(pid: i32, label: &str, cpu_time_ns: u64, timestamp_ns: i64) -> ProcessCpuTime {
        ProcessCpuTime {
            pid,
            label: label.to_owned(),
            cpu_time_ns,
            timestamp_ns,
        }
    }

    #[test]
    fn test_vcpu_label() {
        assert_eq!(vcpu_label("CPU 0/KVM"), "CPU0");
        assert_eq!(vcpu_label("CPU 12/KVM"), "CPU12");
    }

    #[test]
    fn usage_of_processes() {
        let mut engine = ProcessUsageEngine::new();
        let mut provider = Fixed(vec![time(10, "vm", 0, 0), time(11, "CPU0", 0, 0)]);
        let first = engine.tick(&mut provider);
        assert_eq!(first[0], ("vm".to_owned(), DeltaResult::Unavailable));

        // the vm used 1.5 cores, its first vcpu a quarter of a core
        provider.0 = vec![time(10, "vm", 3 * SEC as u64, 2 * SEC), time(11, "CPU0", SEC as u64 / 2, 2 * SEC)];
        let second = engine.tick(&mut provider);
        assert_eq!(second[0].1, DeltaResult::Valid(150.0));
        assert_eq!(second[1].1, DeltaResult::Valid(25.0));

        let mut sample = Sample::new(0, 2);
        ProcessUsageEngine::write_to(&second, &mut sample);
        assert_eq!(sample.get_number("vm"), Some(150.0));
        assert_eq!(sample.get_number("CPU0"), Some(25.0));

        // the thread disappears, then a new thread reuses its id
        provider.0 = vec![time(10, "vm", 3 * SEC as u64, 3 * SEC)];
        assert_eq!(engine.tick(&mut provider).len(), 1);
        provider.0 = vec![time(11, "CPU1", 5, 4 * SEC)];
        assert_eq!(engine.tick(&mut provider)[0].1, DeltaResult::Unavailable);
    }
}

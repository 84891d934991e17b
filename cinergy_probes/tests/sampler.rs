use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use cinergy_probes::{
    cpu::{CpuStat, CpuStatSource, CpuTicks, FrequencySource},
    energy::EnergyDomain,
    process::{ProcessCpuTime, ProcessUsageProvider},
    sampler::{Clock, Sampler, SamplerConfig, SamplerState, Sources},
    sink::{MemorySink, MetricValue, Record},
    topology::{CacheKey, TopologyDescription, TopologyNode},
    CounterReading, CounterSource, SinkError, SourceError,
};
use tokio::time::Instant;

const SEC: i64 = 1_000_000_000;

/// Follows the (paused) tokio clock, so that sleeping moves the time forward.
#[derive(Clone, Copy)]
struct PausedClock(Instant);

impl Clock for PausedClock {
    fn now_ns(&self) -> i64 {
        self.0.elapsed().as_nanos() as i64
    }
}

/// Counters shared with the test, absent counters can't be read.
#[derive(Clone)]
struct Counters {
    clock: PausedClock,
    energy: Arc<Mutex<HashMap<String, u64>>>,
    cores: Arc<Mutex<Vec<(u32, CpuTicks)>>>,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            clock: PausedClock(Instant::now()),
            energy: Arc::default(),
            cores: Arc::default(),
        }
    }

    fn set_energy(&self, domain: &str, uj: u64) {
        self.energy.lock().unwrap().insert(domain.to_owned(), uj);
    }

    fn remove_energy(&self, domain: &str) {
        self.energy.lock().unwrap().remove(domain);
    }

    fn set_cores(&self, cores: &[(u32, u64, u64)]) {
        *self.cores.lock().unwrap() = cores.iter().map(|(id, i, n)| (*id, CpuTicks::new(*i, *n))).collect();
    }
}

impl CounterSource for Counters {
    fn read_counter(&mut self, stream: &str) -> Result<CounterReading, SourceError> {
        let value = self
            .energy
            .lock()
            .unwrap()
            .get(stream)
            .copied()
            .ok_or_else(|| SourceError::UnknownStream(stream.to_owned()))?;
        Ok(CounterReading {
            value,
            timestamp_ns: self.clock.now_ns(),
        })
    }
}

impl CpuStatSource for Counters {
    fn read_stat(&mut self) -> Result<CpuStat, SourceError> {
        let cores = self.cores.lock().unwrap().clone();
        let total = cores.iter().fold(CpuTicks::default(), |acc, (_, t)| {
            CpuTicks::new(acc.idle + t.idle, acc.not_idle + t.not_idle)
        });
        Ok(CpuStat {
            timestamp_ns: self.clock.now_ns(),
            total,
            cores,
        })
    }
}

impl FrequencySource for Counters {
    fn read_khz(&mut self, _cpu: u32) -> Result<u64, SourceError> {
        Ok(2_400_000)
    }
}

fn topology(domains: &[&str]) -> TopologyDescription {
    TopologyDescription {
        domains: domains.iter().map(|d| EnergyDomain::new(*d)).collect(),
        sockets: vec![(0, vec![0, 1])],
        cache: TopologyNode::Interior(Vec::new()),
    }
}

fn sampler(counters: &Counters, sink: &MemorySink, domains: &[&str]) -> Sampler {
    let config = SamplerConfig {
        interval: Duration::from_secs(1),
        ..SamplerConfig::default()
    };
    sampler_with(counters, sink, config, &topology(domains))
}

fn sampler_with(counters: &Counters, sink: &MemorySink, config: SamplerConfig, topology: &TopologyDescription) -> Sampler {
    let sources = Sources {
        energy: Box::new(counters.clone()),
        cpu: Box::new(counters.clone()),
        frequency: Box::new(counters.clone()),
        processes: None,
    };
    Sampler::new(config, topology, sources, Box::new(sink.clone()), Box::new(counters.clock))
}

fn names_at(records: &[Record], label: &str, relative_secs: i64) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.label == label && r.relative_secs == relative_secs)
        .map(|r| r.name.clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn unreadable_domain_hides_only_itself_and_the_global_figure() -> Result<(), SinkError> {
    let counters = Counters::new();
    let sink = MemorySink::new();
    let mut sampler = sampler(&counters, &sink, &["package-0", "package-1"]);
    counters.set_energy("package-0", 0);
    counters.set_energy("package-1", 0);
    counters.set_cores(&[(0, 0, 0), (1, 0, 0)]);

    sampler.init("test")?;
    let first = sampler.tick().await?;
    assert_eq!(first.records, 0);
    assert_eq!(first.ticks_without_global, 1);

    counters.set_energy("package-0", 5_000_000);
    counters.remove_energy("package-1");
    counters.set_cores(&[(0, 100, 0), (1, 0, 100)]);
    let second = sampler.tick().await?;
    assert_eq!(second.overrun, None);
    assert_eq!(second.ticks_without_global, 2);

    let records = sink.records();
    assert_eq!(
        names_at(&records, "test", 2),
        vec![
            "package-0-joule",
            "package-0-watt",
            "cpu%_package-global",
            "cpu%_package-0",
            "freq_package-0"
        ]
    );
    let value_of = |name: &str| records.iter().find(|r| r.name == name).map(|r| r.value.clone());
    assert_eq!(value_of("package-0-watt"), Some(MetricValue::Number(5.0)));
    assert_eq!(value_of("package-0-joule"), Some(MetricValue::Number(5.0)));
    assert_eq!(value_of("cpu%_package-0"), Some(MetricValue::Number(50.0)));

    // both domains readable again: package-1 restarts from scratch
    counters.set_energy("package-0", 6_000_000);
    counters.set_energy("package-1", 1_000_000);
    sampler.tick().await?;
    counters.set_energy("package-0", 7_000_000);
    counters.set_energy("package-1", 3_000_000);
    let fourth = sampler.tick().await?;
    assert_eq!(fourth.ticks_without_global, 0);

    let records = sink.records();
    let global: Vec<&Record> = records.iter().filter(|r| r.name == "package-global-watt").collect();
    assert_eq!(global.len(), 1);
    assert_eq!(global[0].relative_secs, 4);
    assert_eq!(global[0].value, MetricValue::Number(3.0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn late_tick_is_reported_as_overrun() -> Result<(), SinkError> {
    let counters = Counters::new();
    let sink = MemorySink::new();
    let mut sampler = sampler(&counters, &sink, &["package-0"]);

    sampler.init("drift")?;
    assert_eq!(sampler.planned_sleep_ns(counters.clock.now_ns()), SEC);
    assert_eq!(sampler.tick().await?.overrun, None);
    let last_tick = counters.clock.now_ns();
    assert!(last_tick >= SEC);

    // on time: half of the interval is left
    assert_eq!(sampler.planned_sleep_ns(last_tick + SEC / 2), SEC / 2);

    // the work after the previous tick took 2.5 intervals
    tokio::time::advance(Duration::from_millis(2500)).await;
    assert!(sampler.planned_sleep_ns(counters.clock.now_ns()) < 0);
    let late = sampler.tick().await?;
    assert_eq!(late.overrun, Some(Duration::from_millis(1500)));

    // the cadence restarts from the late tick, the lag is not carried over
    assert_eq!(sampler.planned_sleep_ns(counters.clock.now_ns()), SEC);
    assert_eq!(sampler.tick().await?.overrun, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lifecycle_and_tags() -> Result<(), SinkError> {
    let counters = Counters::new();
    let sink = MemorySink::new();
    let mut sampler = sampler(&counters, &sink, &["package-0"]);
    assert_eq!(sampler.state(), SamplerState::Idle);
    assert!(matches!(sampler.tick().await, Err(SinkError::NotOpen)));

    sampler.init("phase-a")?;
    assert_eq!(sampler.state(), SamplerState::Ready);
    sampler.set_tags(vec![
        ("phase".to_owned(), MetricValue::from("phase-a")),
        ("target".to_owned(), MetricValue::from(25u32)),
    ]);
    counters.set_energy("package-0", 0);
    counters.set_cores(&[(0, 0, 0), (1, 0, 0)]);
    sampler.tick().await?;
    counters.set_energy("package-0", 3_000_000);
    counters.set_cores(&[(0, 10, 10), (1, 10, 10)]);
    sampler.tick().await?;

    let records = sink.records();
    assert_eq!(names_at(&records, "phase-a", 1), vec!["phase", "target"]);
    let at_2 = names_at(&records, "phase-a", 2);
    assert_eq!(&at_2[..2], &["phase", "target"]);
    assert!(at_2.contains(&"package-global-watt".to_owned()));

    // a new phase forgets the history and restarts the relative time
    sampler.init("phase-b")?;
    sampler.tick().await?;
    let records = sink.records();
    assert_eq!(names_at(&records, "phase-b", 1), vec!["phase", "target"]);
    assert_eq!(records.iter().filter(|r| r.label == "phase-a").count(), at_2.len() + 2);

    sampler.stop()?;
    assert_eq!(sampler.state(), SamplerState::Stopped);
    assert!(matches!(sampler.tick().await, Err(SinkError::NotOpen)));
    Ok(())
}

/// A vm that uses one core and a half, and one of its vCPUs that uses half a core.
struct Vm(PausedClock);

impl ProcessUsageProvider for Vm {
    fn cpu_times(&mut self) -> Vec<ProcessCpuTime> {
        let now = self.0.now_ns();
        vec![
            ProcessCpuTime {
                pid: 42,
                label: "vm".to_owned(),
                cpu_time_ns: (now as u64) * 3 / 2,
                timestamp_ns: now,
            },
            ProcessCpuTime {
                pid: 43,
                label: "CPU0".to_owned(),
                cpu_time_ns: (now as u64) / 2,
                timestamp_ns: now,
            },
        ]
    }
}

#[tokio::test(start_paused = true)]
async fn monitored_processes() -> Result<(), SinkError> {
    let counters = Counters::new();
    let sink = MemorySink::new();
    let mut sampler = sampler(&counters, &sink, &[]);
    sampler.set_processes(Some(Box::new(Vm(counters.clock))));

    sampler.init("vm")?;
    sampler.tick().await?;
    sampler.tick().await?;
    let records = sink.records();
    assert_eq!(names_at(&records, "vm", 2), vec!["vm", "CPU0"]);
    let value_of = |name: &str| records.iter().find(|r| r.name == name).map(|r| r.value.clone());
    assert_eq!(value_of("vm"), Some(MetricValue::Number(150.0)));
    assert_eq!(value_of("CPU0"), Some(MetricValue::Number(50.0)));

    sampler.set_processes(None);
    sampler.tick().await?;
    assert!(names_at(&sink.records(), "vm", 3).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cache_groups_are_reported() -> Result<(), SinkError> {
    let counters = Counters::new();
    let sink = MemorySink::new();
    let config = SamplerConfig {
        interval: Duration::from_secs(1),
        ..SamplerConfig::default().with_cache_report()
    };
    // one L2 shared by both cores, private L1s
    let l1 = |id| CacheKey { level: 1, id };
    let cache = TopologyNode::Interior(vec![(
        CacheKey { level: 2, id: 0 },
        TopologyNode::Interior(vec![(l1(0), TopologyNode::Leaf(vec![0])), (l1(1), TopologyNode::Leaf(vec![1]))]),
    )]);
    let topology = TopologyDescription {
        cache,
        ..topology(&[])
    };
    let mut sampler = sampler_with(&counters, &sink, config, &topology);

    sampler.init("cache")?;
    counters.set_cores(&[(0, 0, 0), (1, 0, 0)]);
    sampler.tick().await?;
    // 40% and 80%: the L2 group (60%) is above the default threshold
    counters.set_cores(&[(0, 60, 40), (1, 20, 80)]);
    sampler.tick().await?;
    // 0% and 80%: the L2 group (40%) is not
    counters.set_cores(&[(0, 160, 40), (1, 40, 160)]);
    sampler.tick().await?;

    let records = sink.records();
    let cache_names = |secs| -> Vec<String> {
        names_at(&records, "cache", secs)
            .into_iter()
            .filter(|n| n.starts_with("cpu%_L"))
            .collect()
    };
    assert_eq!(cache_names(2), vec!["cpu%_L2-0", "cpu%_L2-0_L1-0", "cpu%_L2-0_L1-1"]);
    assert_eq!(cache_names(3), vec!["cpu%_L2-0_L1-0", "cpu%_L2-0_L1-1"]);
    let l2 = records.iter().find(|r| r.name == "cpu%_L2-0").map(|r| r.value.clone());
    assert_eq!(l2, Some(MetricValue::Number(60.0)));
    Ok(())
}

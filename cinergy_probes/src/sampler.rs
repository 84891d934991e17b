use std::time::Duration;

use log::{debug, warn};

use crate::{
    cpu::{CpuStatSource, CpuUsageEngine, FrequencySource},
    energy::{EnergyDomain, EnergyRateEngine},
    process::{ProcessUsageEngine, ProcessUsageProvider},
    sink::{MetricSink, MetricValue, Sample},
    source::{self, CounterSource},
    topology::{TopologyAggregator, TopologyDescription, DEFAULT_DISPLAY_THRESHOLD},
    SinkError,
};

const NS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Planned time between two ticks.
    pub interval: Duration,
    /// Number of decimal digits of the reported values.
    pub precision: u32,
    /// Report the usage of the cache groups, with this display threshold (in percent).
    pub cache_threshold: Option<f64>,
    /// Warn when the global package figure is missing for that many consecutive ticks.
    pub missing_global_warning: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval: Duration::from_secs(2),
            precision: 2,
            cache_threshold: None,
            missing_global_warning: 5,
        }
    }
}

impl SamplerConfig {
    pub fn with_cache_report(mut self) -> Self {
        self.cache_threshold = Some(DEFAULT_DISPLAY_THRESHOLD);
        self
    }
}

/// Wall clock, in nanoseconds.
pub trait Clock: Send {
    fn now_ns(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> i64 {
        source::now_ns()
    }
}

/// Where the counters come from.
pub struct Sources {
    pub energy: Box<dyn CounterSource>,
    pub cpu: Box<dyn CpuStatSource>,
    pub frequency: Box<dyn FrequencySource>,
    pub processes: Option<Box<dyn ProcessUsageProvider>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Ready,
    Stopped,
}

/// What happened during a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// How late the tick started, if the previous one took longer than the interval.
    pub overrun: Option<Duration>,
    /// Number of records sent to the sink.
    pub records: usize,
    /// Number of consecutive ticks, this one included, without the global package figure.
    pub ticks_without_global: u32,
}

/// Samples all the engines at a fixed pace and sends the results to a sink.
pub struct Sampler {
    config: SamplerConfig,
    state: SamplerState,
    energy: EnergyRateEngine,
    cpu: CpuUsageEngine,
    cache: Option<TopologyAggregator>,
    processes: ProcessUsageEngine,
    sources: Sources,
    sink: Box<dyn MetricSink>,
    clock: Box<dyn Clock>,
    tags: Vec<(String, MetricValue)>,
    launched_at_ns: i64,
    last_tick_ns: Option<i64>,
    ticks_without_global: u32,
}

impl Sampler {
    pub fn new(
        config: SamplerConfig,
        topology: &TopologyDescription,
        sources: Sources,
        sink: Box<dyn MetricSink>,
        clock: Box<dyn Clock>,
    ) -> Sampler {
        let domains: Vec<EnergyDomain> = topology.domains.clone();
        let cache = config
            .cache_threshold
            .map(|threshold| TopologyAggregator::new(topology.cache.clone(), threshold));
        Sampler {
            energy: EnergyRateEngine::new(domains),
            cpu: CpuUsageEngine::new(topology.sockets.clone()),
            cache,
            processes: ProcessUsageEngine::new(),
            config,
            state: SamplerState::Idle,
            sources,
            sink,
            clock,
            tags: Vec::new(),
            launched_at_ns: 0,
            last_tick_ns: None,
            ticks_without_global: 0,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Starts a new time series: forgets every previous reading and (re)creates the output.
    pub fn init(&mut self, label: &str) -> Result<(), SinkError> {
        self.energy.reset();
        self.cpu.reset();
        self.processes.reset();
        self.sink.open(label)?;
        self.launched_at_ns = self.clock.now_ns();
        self.last_tick_ns = None;
        self.ticks_without_global = 0;
        self.state = SamplerState::Ready;
        debug!("sampler initialized for {label}");
        Ok(())
    }

    /// Sets the tags written at the beginning of every sample, such as the phase and the target load.
    pub fn set_tags(&mut self, tags: Vec<(String, MetricValue)>) {
        self.tags = tags;
    }

    /// Replaces the monitored processes.
    pub fn set_processes(&mut self, provider: Option<Box<dyn ProcessUsageProvider>>) {
        self.processes.reset();
        self.sources.processes = provider;
    }

    /// Time to wait before the next tick, in nanoseconds. Negative when the sampler is late.
    pub fn planned_sleep_ns(&self, now_ns: i64) -> i64 {
        let interval = self.config.interval.as_nanos() as i64;
        match self.last_tick_ns {
            Some(last) => interval - (now_ns - last),
            None => interval,
        }
    }

    /// Waits for the next tick, then measures everything and writes one sample.
    ///
    /// Only sink failures are returned: unreadable counters are left out of the sample.
    pub async fn tick(&mut self) -> Result<TickReport, SinkError> {
        if self.state != SamplerState::Ready {
            return Err(SinkError::NotOpen);
        }

        let sleep_ns = self.planned_sleep_ns(self.clock.now_ns());
        let mut overrun = None;
        if sleep_ns > 0 {
            tokio::time::sleep(Duration::from_nanos(sleep_ns as u64)).await;
        } else if self.last_tick_ns.is_some() {
            let late = Duration::from_nanos(sleep_ns.unsigned_abs());
            warn!("overlap iteration: {:.3}s late", late.as_secs_f64());
            overrun = Some(late);
        }

        let now = self.clock.now_ns();
        self.last_tick_ns = Some(now);
        let sample = self.measure(now);

        let relative_secs = (now - self.launched_at_ns) / NS_PER_SEC;
        self.sink.write(relative_secs, &sample)?;

        Ok(TickReport {
            overrun,
            records: sample.len(),
            ticks_without_global: self.ticks_without_global,
        })
    }

    fn measure(&mut self, timestamp_ns: i64) -> Sample {
        let mut sample = Sample::new(timestamp_ns, self.config.precision);
        for (name, value) in &self.tags {
            sample.push(name.as_str(), value.clone());
        }

        let energy = self.energy.tick(self.sources.energy.as_mut());
        energy.write_to(&mut sample);
        if energy.package_global.is_some() {
            self.ticks_without_global = 0;
        } else {
            self.ticks_without_global += 1;
            if self.ticks_without_global == self.config.missing_global_warning {
                warn!(
                    "no global package measurement for {} ticks, is RAPL supported?",
                    self.ticks_without_global
                );
            }
        }

        let usage = self.cpu.tick(self.sources.cpu.as_mut());
        self.cpu.write_to(&usage, self.sources.frequency.as_mut(), &mut sample);
        if let Some(cache) = &self.cache {
            cache.write_to(&usage.per_core, &mut sample);
        }

        if let Some(provider) = self.sources.processes.as_mut() {
            let usages = self.processes.tick(provider.as_mut());
            ProcessUsageEngine::write_to(&usages, &mut sample);
        }
        sample
    }

    /// Releases the sink.
    pub fn stop(&mut self) -> Result<(), SinkError> {
        self.state = SamplerState::Stopped;
        self.sink.close()
    }
}

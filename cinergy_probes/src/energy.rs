use log::{debug, warn};

use crate::{
    sink::Sample,
    source::CounterSource,
    Delta, DeltaResult, DeltaTracker, DomainRole,
};

/// Name of the synthetic domain that sums all the packages.
pub const PACKAGE_GLOBAL: &str = "package-global";

const UJ_PER_JOULE: f64 = 1_000_000.0;
const NS_PER_US: f64 = 1_000.0;

/// A RAPL domain to measure, for instance `package-0` or `dram-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergyDomain {
    pub name: String,
    pub role: DomainRole,
}

impl EnergyDomain {
    pub fn new<S: Into<String>>(name: S) -> EnergyDomain {
        let name = name.into();
        let role = DomainRole::of(&name);
        EnergyDomain { name, role }
    }
}

/// Energy consumed by a domain between two ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyRate {
    pub joules: f64,
    pub watts: f64,
}

impl From<Delta<u64>> for EnergyRate {
    fn from(delta: Delta<u64>) -> Self {
        let microjoules = delta.value as f64;
        let elapsed_us = delta.elapsed_ns as f64 / NS_PER_US;
        EnergyRate {
            joules: microjoules / UJ_PER_JOULE,
            watts: microjoules / elapsed_us,
        }
    }
}

/// Result of one tick of the [`EnergyRateEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyTick {
    /// One entry per configured domain, in configuration order.
    pub domains: Vec<(String, DeltaResult<EnergyRate>)>,
    /// Sum of the package domains, only when every domain is valid.
    pub package_global: Option<EnergyRate>,
}

impl EnergyTick {
    /// `true` if at least one domain could not be measured this tick.
    pub fn overflowed(&self) -> bool {
        self.domains.iter().any(|(_, r)| !r.is_valid())
    }

    pub fn get(&self, domain: &str) -> Option<DeltaResult<EnergyRate>> {
        self.domains.iter().find(|(name, _)| name == domain).map(|(_, r)| *r)
    }

    /// Appends `<domain>-joule` and `<domain>-watt` for every valid domain.
    pub fn write_to(&self, sample: &mut Sample) {
        let valid = self.domains.iter().filter_map(|(name, r)| r.valid().map(|r| (name.as_str(), r)));
        for (name, rate) in valid.chain(self.package_global.map(|g| (PACKAGE_GLOBAL, g))) {
            sample.number(format!("{name}-joule"), rate.joules);
            sample.number(format!("{name}-watt"), rate.watts);
        }
    }
}

/// Turns RAPL energy counters (in microjoules) into joules and watts.
pub struct EnergyRateEngine {
    domains: Vec<EnergyDomain>,
    history: DeltaTracker<String>,
}

impl EnergyRateEngine {
    pub fn new(domains: Vec<EnergyDomain>) -> EnergyRateEngine {
        EnergyRateEngine {
            domains,
            history: DeltaTracker::new(),
        }
    }

    pub fn domains(&self) -> &[EnergyDomain] {
        &self.domains
    }

    /// Forgets every previous reading.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Reads every domain once and computes the energy consumed since the previous tick.
    ///
    /// A domain that can't be read is `Unavailable` for this tick, the other ones are not affected.
    pub fn tick(&mut self, source: &mut dyn CounterSource) -> EnergyTick {
        let mut domains = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            let rate = match source.read_counter(&domain.name) {
                Ok(reading) => self
                    .history
                    .update(domain.name.clone(), reading.timestamp_ns, reading.value)
                    .map(EnergyRate::from),
                Err(e) => {
                    warn!("{e}");
                    self.history.forget(domain.name.as_str());
                    DeltaResult::Unavailable
                }
            };
            if rate == DeltaResult::Invalid {
                debug!("energy counter {} went backwards, skipping this tick", domain.name);
            }
            domains.push((domain.name.clone(), rate));
        }

        let tick_is_complete = domains.iter().all(|(_, r)| r.is_valid());
        let package_global = tick_is_complete
            .then(|| self.sum_of_packages(&domains))
            .flatten();

        EnergyTick {
            domains,
            package_global,
        }
    }

    fn sum_of_packages(&self, rates: &[(String, DeltaResult<EnergyRate>)]) -> Option<EnergyRate> {
        let packages: Vec<EnergyRate> = self
            .domains
            .iter()
            .zip(rates)
            .filter(|(d, _)| d.role == DomainRole::Package)
            .filter_map(|(_, (_, r))| r.valid())
            .collect();
        if packages.is_empty() {
            return None;
        }
        Some(packages.iter().fold(EnergyRate { joules: 0.0, watts: 0.0 }, |acc, r| EnergyRate {
            joules: acc.joules + r.joules,
            watts: acc.watts + r.watts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{EnergyDomain, EnergyRate, EnergyRateEngine};
    use crate::{CounterReading, CounterSource, DeltaResult, DomainRole, SourceError};

    const SEC: i64 = 1_000_000_000;

    #[derive(Default)]
    struct FakeCounters {
        values: HashMap<String, u64>,
        now: i64,
    }

    impl FakeCounters {
        fn set(&mut self, name: &str, value: u64) {
            self.values.insert(name.to_owned(), value);
        }
    }

    impl CounterSource for FakeCounters {
        fn read_counter(&mut self, stream: &str) -> Result<CounterReading, SourceError> {
            let value = *self
                .values
                .get(stream)
                .ok_or_else(|| SourceError::UnknownStream(stream.to_owned()))?;
            Ok(CounterReading {
                value,
                timestamp_ns: self.now,
            })
        }
    }

    fn engine() -> EnergyRateEngine {
        EnergyRateEngine::new(vec![
            EnergyDomain::new("package-0"),
            EnergyDomain::new("core-0"),
            EnergyDomain::new("package-1"),
        ])
    }

    #[test]
    fn rate_conversion() {
        let rate = EnergyRate::from(crate::Delta {
            value: 30_000_000,
            elapsed_ns: 2 * SEC,
        });
        assert_eq!(rate.joules, 30.0);
        assert_eq!(rate.watts, 15.0);
    }

    #[test]
    fn global_sum_of_packages() {
        let mut src = FakeCounters::default();
        let mut engine = engine();
        assert_eq!(engine.domains()[1].role, DomainRole::Core);
        src.set("package-0", 0);
        src.set("core-0", 0);
        src.set("package-1", 0);
        let first = engine.tick(&mut src);
        assert!(first.domains.iter().all(|(_, r)| *r == DeltaResult::Unavailable));
        assert!(first.overflowed());
        assert_eq!(first.package_global, None);

        src.now = SEC;
        src.set("package-0", 10_000_000);
        src.set("core-0", 4_000_000);
        src.set("package-1", 20_000_000);
        let second = engine.tick(&mut src);
        assert!(!second.overflowed());
        // core-0 is not a package
        assert_eq!(
            second.package_global,
            Some(EnergyRate {
                joules: 30.0,
                watts: 30.0
            })
        );
    }

    #[test]
    fn one_overflow_suppresses_only_the_global_figure() {
        let mut src = FakeCounters::default();
        let mut engine = engine();
        src.set("package-0", 10);
        src.set("core-0", 10);
        src.set("package-1", 10);
        engine.tick(&mut src);

        src.now = SEC;
        src.set("package-0", 5); // overflow
        src.set("core-0", 1_000_010);
        src.set("package-1", 2_000_010);
        let tick = engine.tick(&mut src);
        assert_eq!(tick.get("package-0"), Some(DeltaResult::Invalid));
        assert_eq!(
            tick.get("package-1"),
            Some(DeltaResult::Valid(EnergyRate {
                joules: 2.0,
                watts: 2.0
            }))
        );
        assert!(tick.get("core-0").unwrap().is_valid());
        assert_eq!(tick.package_global, None);

        // the post-overflow value is the new baseline
        src.now = 2 * SEC;
        src.set("package-0", 1_000_005);
        src.set("core-0", 1_000_010);
        src.set("package-1", 2_000_010);
        let tick = engine.tick(&mut src);
        assert_eq!(
            tick.package_global,
            Some(EnergyRate {
                joules: 1.0,
                watts: 1.0
            })
        );
    }

    #[test]
    fn vanished_domain_restarts_from_scratch() {
        let mut src = FakeCounters::default();
        let mut engine = EnergyRateEngine::new(vec![EnergyDomain::new("package-0")]);
        src.set("package-0", 10);
        engine.tick(&mut src);

        src.values.clear();
        src.now = SEC;
        assert_eq!(engine.tick(&mut src).get("package-0"), Some(DeltaResult::Unavailable));

        src.now = 2 * SEC;
        src.set("package-0", 20);
        assert_eq!(engine.tick(&mut src).get("package-0"), Some(DeltaResult::Unavailable));
    }
}

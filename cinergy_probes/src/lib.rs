use std::num::ParseIntError;

pub mod cpu;
pub mod delta;
pub mod energy;
pub mod error;
pub mod powercap;
pub mod process;
pub mod sampler;
pub mod sink;
pub mod source;
pub mod topology;

pub use delta::{Delta, DeltaResult, DeltaTracker};
pub use error::{SinkError, SourceError, TopologyError};
pub use source::{CounterReading, CounterSource};

/// The role of a RAPL power domain, deduced from its powercap name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DomainRole {
    /// entire socket
    Package,
    /// power plane 0: core
    Core,
    /// power plane 1: uncore
    Uncore,
    ///  DRAM
    Dram,
    /// psys
    Platform,
    /// Anything the kernel exposes that we don't know about.
    Other,
}

impl DomainRole {
    /// Classifies a domain name such as `package-0`, `core-0` or `psys`.
    pub fn of(name: &str) -> DomainRole {
        let base = name.split('-').next().unwrap_or(name);
        match base {
            "package" => DomainRole::Package,
            "core" => DomainRole::Core,
            "uncore" => DomainRole::Uncore,
            "dram" => DomainRole::Dram,
            "psys" => DomainRole::Platform,
            _ => DomainRole::Other,
        }
    }
}

/// Rounds `value` to `digits` decimal digits.
pub fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// Parses a kernel cpu list, such as `0-3,8,10-11`.
pub fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist: {}", item)),
        }
    }

    let trimmed = cpulist.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    // this can be "0,64" or "0-1" or maybe "0-1,64-66"
    let cpus: Vec<u32> = trimmed
        .split(',')
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter() // not the same as iter() !
        .flatten()
        .collect();

    Ok(cpus)
}

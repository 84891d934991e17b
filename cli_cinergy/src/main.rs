use std::{path::Path, time::Duration};

use clap::Parser;
use log::{info, warn};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use cinergy_probes::{
    cpu::{ProcStatSource, SysfsFrequencySource, SYSFS_CPU_PATH},
    energy::EnergyDomain,
    powercap::{self, PowerZone, PowerZoneHierarchy, PowercapSource},
    process::{ProcessUsageProvider, ProcfsProcessProvider},
    sampler::{Sampler, SamplerConfig, Sources, SystemClock},
    sink::{CsvSink, LiveSink, MetricSink},
    topology::{self, TopologyDescription, TopologyNode},
};
use cli::{Cli, Commands, SamplingArgs};

mod cli;
mod experiment;
mod load;

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    // get the RAPL domains and the cpu topology
    // without RAPL, the cpu usage is still measured and the sampler reports the missing energy
    let power_zones = powercap::all_power_zones().unwrap_or_else(|e| {
        warn!("RAPL power zones unavailable: {e:?}");
        PowerZoneHierarchy::default()
    });
    if power_zones.flat.is_empty() {
        warn!("No RAPL power zone found, is RAPL supported by this cpu and kernel?");
    }
    let topology = describe_host(&power_zones)?;
    info!(
        "{} sockets, {} cores, RAPL domains: {}",
        topology.sockets.len(),
        topology.core_count(),
        mkstring(&topology.domains.iter().map(|d| &d.name).collect::<Vec<_>>(), ", ")
    );

    match cli.command {
        Commands::Info => {
            println!("\nFound powercap zones:");
            for zone in &power_zones.top {
                println!("{zone}");
            }
            println!("\nCores per socket:");
            for (socket, cores) in &topology.sockets {
                println!("- package-{socket}: {}", mkstring(cores, ", "));
            }
            println!("\nCache groups:\n{}", topology.cache);
        }
        Commands::Record {
            label,
            ticks,
            vm_pid,
            sampling,
        } => {
            let processes = match vm_pid {
                Some(pid) => Some(Box::new(ProcfsProcessProvider::new(pid, "vm")?) as Box<dyn ProcessUsageProvider>),
                None => None,
            };
            let mut sampler = new_sampler(&sampling, &topology, &power_zones, processes)?;
            log_start(None)?;
            // stops at the end of the current tick when interrupted
            tokio::select! {
                res = experiment::record(&mut sampler, &label, ticks) => res?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping here."),
            }
            sampler.stop()?;
        }
        Commands::Model {
            step,
            iterations,
            sampling,
        } => {
            let mut sampler = new_sampler(&sampling, &topology, &power_zones, None)?;
            let plan = experiment::ModelPlan::new(step, iterations, &topology.sockets);
            let tick_secs = sampling.interval;
            log_start(Some(Duration::from_secs_f64(plan.total_ticks() as f64 * tick_secs)))?;
            // the stress-ng workers are killed when the experiment is dropped
            tokio::select! {
                res = plan.run(&mut sampler) => res?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping the load."),
            }
            sampler.stop()?;
        }
    }

    Ok(())
}

fn describe_host(power_zones: &PowerZoneHierarchy) -> anyhow::Result<TopologyDescription> {
    let cpu_root = Path::new(SYSFS_CPU_PATH);
    let domains = power_zones.flat.iter().map(|z| EnergyDomain::new(z.name.clone())).collect();
    let sockets = topology::cpus_per_socket(cpu_root)?;
    let cache = topology::cache_topology(cpu_root).unwrap_or_else(|e| {
        warn!("cache topology unavailable: {e:?}");
        TopologyNode::Interior(Vec::new())
    });
    Ok(TopologyDescription { domains, sockets, cache })
}

fn new_sampler(
    args: &SamplingArgs,
    topology: &TopologyDescription,
    power_zones: &PowerZoneHierarchy,
    processes: Option<Box<dyn ProcessUsageProvider>>,
) -> anyhow::Result<Sampler> {
    if args.interval <= 0.0 {
        anyhow::bail!("invalid interval {}, it must be positive", args.interval);
    }
    let mut config = SamplerConfig {
        interval: Duration::from_secs_f64(args.interval),
        precision: args.precision,
        ..SamplerConfig::default()
    };
    if args.cache {
        config.cache_threshold = Some(args.cache_threshold);
    }

    let zones: Vec<&PowerZone> = power_zones.flat.iter().collect();
    let sources = Sources {
        energy: Box::new(PowercapSource::new(&zones)),
        cpu: Box::new(ProcStatSource::new()),
        frequency: Box::new(SysfsFrequencySource::new()),
        processes,
    };
    let csv = CsvSink::new(&args.output_dir, args.output.clone());
    let sink: Box<dyn MetricSink> = if args.live {
        Box::new(LiveSink::new(csv, std::io::stdout()))
    } else {
        Box::new(csv)
    };
    Ok(Sampler::new(config, topology, sources, sink, Box::new(SystemClock)))
}

fn log_start(duration: Option<Duration>) -> anyhow::Result<()> {
    let start = OffsetDateTime::now_utc();
    info!("Started at {}", start.format(&Rfc3339)?);
    if let Some(d) = duration {
        let end = start + d;
        info!("Estimated duration: {:.0}s, end at {}", d.as_secs_f64(), end.format(&Rfc3339)?);
    }
    Ok(())
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about RAPL domains, sockets and caches, then exit.
    Info,

    /// Record one phase, until the number of ticks is reached or Ctrl-C.
    Record {
        /// Name of the phase, used in the output file name.
        #[arg(short, long)]
        label: String,

        /// Number of ticks to record, unlimited if not set.
        #[arg(short, long)]
        ticks: Option<u64>,

        /// Pid of a process to monitor, such as a QEMU virtual machine.
        #[arg(long)]
        vm_pid: Option<i32>,

        #[command(flatten)]
        sampling: SamplingArgs,
    },

    /// Record the idle host, then load it step by step with stress-ng.
    Model {
        /// Load of each stress-ng worker, in percent of one core.
        #[arg(long, default_value_t = 25, value_parser = clap::value_parser!(u32).range(1..=100))]
        step: u32,

        /// Number of ticks recorded for each load level.
        #[arg(long, default_value_t = 10)]
        iterations: u64,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SamplingArgs {
    /// Prefix of the output files, `<output>-<label>.csv`.
    #[arg(short, long, default_value = "consumption")]
    pub output: String,

    /// Directory of the output files.
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Number of decimal digits.
    #[arg(short, long, default_value_t = 2)]
    pub precision: u32,

    /// Time between two measurements, in seconds.
    #[arg(short, long, default_value_t = 2.0)]
    pub interval: f64,

    /// Also record the usage of the cache groups.
    #[arg(short, long)]
    pub cache: bool,

    /// Print the power of each domain at every tick.
    #[arg(long)]
    pub live: bool,

    /// Inner cache groups are only recorded above this usage (percent).
    #[arg(long, default_value_t = cinergy_probes::topology::DEFAULT_DISPLAY_THRESHOLD)]
    pub cache_threshold: f64,
}

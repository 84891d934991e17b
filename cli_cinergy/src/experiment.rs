use log::info;

use cinergy_probes::{round_to, sampler::Sampler, sink::MetricValue};

use crate::load::LoadGenerator;

/// Records one phase, `ticks` times or forever.
pub async fn record(sampler: &mut Sampler, label: &str, ticks: Option<u64>) -> anyhow::Result<()> {
    sampler.init(label)?;
    sampler.set_tags(vec![("phase".to_owned(), MetricValue::from(label))]);
    let mut n = 0;
    while ticks.map_or(true, |max| n < max) {
        sampler.tick().await?;
        n += 1;
    }
    Ok(())
}

/// Loads the host core after core, `step` percent at a time, and records each level.
pub struct ModelPlan {
    step: u32,
    iterations: u64,
    /// socket by socket
    cores: Vec<u32>,
}

impl ModelPlan {
    pub fn new(step: u32, iterations: u64, sockets: &[(u32, Vec<u32>)]) -> ModelPlan {
        let cores = sockets.iter().flat_map(|(_, cores)| cores.iter().copied()).collect();
        ModelPlan {
            step: step.clamp(1, 100),
            iterations,
            cores,
        }
    }

    pub fn label(&self) -> String {
        format!("training-{}", self.step)
    }

    fn workers_per_core(&self) -> u32 {
        100 / self.step
    }

    /// Number of load levels, the idle one included.
    pub fn levels(&self) -> u64 {
        1 + self.cores.len() as u64 * self.workers_per_core() as u64
    }

    pub fn total_ticks(&self) -> u64 {
        self.levels() * self.iterations
    }

    /// Load of the whole host after `level` workers, in percent.
    pub fn target_percentage(&self, level: u32) -> u32 {
        if self.cores.is_empty() {
            return 0;
        }
        let fraction = level as f64 * self.step as f64 / 100.0 / self.cores.len() as f64;
        // truncated, 0.29 gives 28
        (round_to(fraction, 2) * 100.0) as u32
    }

    pub async fn run(&self, sampler: &mut Sampler) -> anyhow::Result<()> {
        let label = self.label();
        sampler.init(&label)?;
        let mut load = LoadGenerator::new();

        info!("{label}: target 0%");
        self.record_level(sampler, &label, 0).await?;

        for core in &self.cores {
            for _ in 0..self.workers_per_core() {
                load.add_worker(self.step)?;
                let target = self.target_percentage(load.len() as u32);
                info!("{label}: target {target}% (core {core})");
                self.record_level(sampler, &label, target).await?;
            }
        }
        load.stop();
        Ok(())
    }

    async fn record_level(&self, sampler: &mut Sampler, label: &str, target: u32) -> anyhow::Result<()> {
        sampler.set_tags(vec![
            ("phase".to_owned(), MetricValue::from(label)),
            ("target".to_owned(), MetricValue::from(target)),
        ]);
        for _ in 0..self.iterations {
            sampler.tick().await?;
        }
        Ok(())
    }
}

use std::{
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
};

use anyhow::Context;
use log::{debug, warn};

/// Spawns stress-ng workers, and kills them when dropped.
#[derive(Default)]
pub struct LoadGenerator {
    workers: Vec<Child>,
}

impl LoadGenerator {
    pub fn new() -> LoadGenerator {
        LoadGenerator::default()
    }

    /// Starts one worker that loads one core at `load_percent`.
    pub fn add_worker(&mut self, load_percent: u32) -> anyhow::Result<()> {
        let child = Command::new("stress-ng")
            .args(["-c", "1", "-l", &load_percent.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // own process group, so that the stressors are killed along with stress-ng
            .process_group(0)
            .spawn()
            .context("failed to spawn stress-ng, is it installed?")?;
        debug!("stress-ng worker {} started at {load_percent}%", child.id());
        self.workers.push(child);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn stop(&mut self) {
        for mut child in self.workers.drain(..) {
            let pgid = child.id() as libc::pid_t;
            // SAFETY: plain syscall, the group was created by `process_group(0)`
            let res = unsafe { libc::killpg(pgid, libc::SIGTERM) };
            if res != 0 {
                warn!("failed to stop stress-ng group {pgid}: {}", std::io::Error::last_os_error());
            }
            if let Err(e) = child.wait() {
                warn!("failed to wait for stress-ng {pgid}: {e}");
            }
        }
    }
}

impl Drop for LoadGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

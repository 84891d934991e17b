// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fmt::Display,
    fs::{self, File},
    io::{Read, Seek},
    path::{Path, PathBuf},
};

use anyhow::Context;

use crate::{
    source::{now_ns, CounterReading, CounterSource},
    DomainRole, SourceError,
};

pub const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl:";

/// Hierarchy of power zones
#[derive(Debug, Default)]
pub struct PowerZoneHierarchy {
    /// All the zones in the same Vec.
    pub flat: Vec<PowerZone>,
    /// The top zones. To access their children, use [PowerZone::children].
    pub top: Vec<PowerZone>,
}

/// A power zone.
#[derive(Debug, Clone)]
pub struct PowerZone {
    /// The unique name of the zone, for instance `package-0` or `core-0`.
    ///
    /// Powercap names sub-zones `core`, `uncore` or `dram` on every socket,
    /// so the socket index is appended to names that don't have one.
    pub name: String,

    /// The role of the zone, as an enum
    pub role: DomainRole,

    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// Note that in the above path, `intel-rapl` is the "control type"
    /// and "intel-rapl:0" is the power zone.
    pub path: PathBuf,

    /// The sub-zones (can be empty).
    pub children: Vec<PowerZone>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>, level: i8) -> std::fmt::Result {
        let mut indent = "  ".repeat(level as _);
        if level > 0 {
            indent.insert(0, '\n');
        }

        let name = &self.name;
        let role = self.role;
        let path = self.path.to_string_lossy();

        write!(f, "{indent}- {name} ({role:?}) \t\t: {path}")?;
        for subzone in &self.children {
            subzone.fmt_rec(f, level + 1)?;
        }
        Ok(())
    }
}

impl Display for PowerZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f, 0)
    }
}

/// Discovers all the RAPL power zones in the powercap sysfs.
pub fn all_power_zones() -> anyhow::Result<PowerZoneHierarchy> {
    power_zones_in(Path::new(POWERCAP_RAPL_PATH))
}

/// Discovers the RAPL power zones below `root`.
///
/// A missing `root` means that RAPL is not supported: there is no zone.
pub fn power_zones_in(root: &Path) -> anyhow::Result<PowerZoneHierarchy> {
    /// Recursively explore a power zone
    fn explore_rec(dir: &Path, flat: &mut Vec<PowerZone>) -> anyhow::Result<Vec<PowerZone>> {
        let mut zones = Vec::new();
        let entries = fs::read_dir(dir).with_context(|| format!("Failed to list {dir:?}"))?;
        for e in entries {
            let path = e?.path();
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };

            if path.is_dir() && file_name.starts_with(POWER_ZONE_PREFIX) {
                let name_path = path.join("name");
                let raw_name = fs::read_to_string(&name_path)
                    .with_context(|| format!("Failed to read {name_path:?}"))?
                    .trim()
                    .to_owned();
                let name = unique_zone_name(&raw_name, &file_name);
                let role = DomainRole::of(&name);
                let children = explore_rec(&path, flat)?; // recursively explore
                let zone = PowerZone {
                    name,
                    role,
                    path,
                    children,
                };
                zones.push(zone.clone());
                flat.push(zone);
            }
        }
        zones.sort_by_key(|z| z.path.to_string_lossy().to_string());
        Ok(zones)
    }
    if !root.exists() {
        log::debug!("{root:?} does not exist");
        return Ok(PowerZoneHierarchy::default());
    }
    let mut flat = Vec::new();
    let top = explore_rec(root, &mut flat)?;
    flat.sort_by_key(|z| z.path.to_string_lossy().to_string());
    Ok(PowerZoneHierarchy { flat, top })
}

/// `core` in `intel-rapl:1:0` becomes `core-1`, `package-1` stays as is.
fn unique_zone_name(raw_name: &str, dir_name: &str) -> String {
    if raw_name.contains('-') {
        return raw_name.to_owned();
    }
    match dir_name.split(':').nth(1) {
        Some(socket) => format!("{raw_name}-{socket}"),
        None => raw_name.to_owned(),
    }
}

/// Reads the `energy_uj` counters of powercap zones, by zone name.
pub struct PowercapSource {
    zones: Vec<OpenedZone>,
    /// reused for every read, `energy_uj` never exceeds a few bytes
    buf: Vec<u8>,
}

struct OpenedZone {
    name: String,
    path: PathBuf,
    /// Closed when the last read failed, reopened on the next one.
    file: Option<File>,
}

impl PowercapSource {
    pub fn new(zones: &[&PowerZone]) -> PowercapSource {
        let zones = zones
            .iter()
            .map(|z| OpenedZone {
                name: z.name.clone(),
                path: z.energy_path(),
                file: None,
            })
            .collect();
        PowercapSource {
            zones,
            buf: Vec::with_capacity(16),
        }
    }

    /// Names of the zones, in discovery order.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.zones.iter().map(|z| z.name.as_str())
    }
}

impl OpenedZone {
    fn read_into(&mut self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        // left closed if anything fails, reopened next time
        let mut file = match self.file.take() {
            Some(f) => f,
            None => File::open(&self.path)?,
        };
        // read the file from the beginning
        file.rewind()?;
        file.read_to_end(buf)?;
        self.file = Some(file);
        Ok(())
    }
}

impl CounterSource for PowercapSource {
    fn read_counter(&mut self, stream: &str) -> Result<CounterReading, SourceError> {
        let zone = self
            .zones
            .iter_mut()
            .find(|z| z.name == stream)
            .ok_or_else(|| SourceError::UnknownStream(stream.to_owned()))?;

        self.buf.clear();
        zone.read_into(&mut self.buf).map_err(|e| SourceError::io(stream, e))?;
        let timestamp_ns = now_ns();

        let value = std::str::from_utf8(&self.buf)
            .ok()
            .and_then(|s| s.trim_end().parse::<u64>().ok())
            .ok_or_else(|| SourceError::parse(stream, &self.buf))?;

        log::debug!("read {stream} value {value}");
        Ok(CounterReading { value, timestamp_ns })
    }
}

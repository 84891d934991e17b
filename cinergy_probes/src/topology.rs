//! Sockets and cache hierarchy of the host, and usage aggregation along that hierarchy.

use std::{
    collections::BTreeMap,
    fmt::Display,
    fs,
    path::Path,
};

use anyhow::Context;
use log::debug;
use regex::Regex;

use crate::{energy::EnergyDomain, parse_cpu_list, sink::Sample, DeltaResult, TopologyError};

/// Default threshold above which inner cache groups are reported, in percent.
pub const DEFAULT_DISPLAY_THRESHOLD: f64 = 51.0;

/// Identifies a cache shared by some cores: its level and its id at that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub level: u8,
    pub id: u32,
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}-{}", self.level, self.id)
    }
}

/// The cache hierarchy, from the last level cache down to the cores.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyNode {
    /// The cores that share the lowest cache level.
    Leaf(Vec<u32>),
    /// Sub-groups, in insertion order.
    Interior(Vec<(CacheKey, TopologyNode)>),
}

/// One cache of a core, as described in `cpuN/cache/indexM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub index: u32,
    pub level: u8,
    pub id: u32,
    /// Raw content of `shared_cpu_list`, such as `0-1`.
    pub shared_cpu_list: String,
}

/// Builds a [`TopologyNode`] from the caches of each core.
///
/// A cache that is reported by several cores is only inserted once.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    root: Vec<(CacheKey, TopologyNode)>,
}

impl TopologyBuilder {
    pub fn new() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    pub fn add_cpu(&mut self, cpu: u32, caches: &[CacheInfo]) -> Result<(), TopologyError> {
        let mut caches = caches.to_vec();
        caches.sort_by_key(|c| c.index);

        // Consecutive caches shared by the same cores are redundant (typically L1d and L1i).
        let mut kept: Vec<CacheKey> = Vec::new();
        let mut prev_shared: Option<&str> = None;
        for cache in &caches {
            let shared = cache.shared_cpu_list.trim();
            if prev_shared == Some(shared) {
                continue;
            }
            prev_shared = Some(shared);
            kept.push(CacheKey {
                level: cache.level,
                id: cache.id,
            });
        }

        // from the highest level down to the lowest one
        kept.reverse();
        let (leaf_key, inner_keys) = kept.split_last().ok_or(TopologyError::NoCache(cpu))?;

        let mut children = &mut self.root;
        for key in inner_keys {
            match child_entry(children, *key, || TopologyNode::Interior(Vec::new())) {
                TopologyNode::Interior(grand_children) => children = grand_children,
                TopologyNode::Leaf(_) => {
                    return Err(TopologyError::Inconsistent {
                        cpu,
                        key: key.to_string(),
                    })
                }
            }
        }
        match child_entry(children, *leaf_key, || TopologyNode::Leaf(Vec::new())) {
            TopologyNode::Leaf(cpus) => {
                if !cpus.contains(&cpu) {
                    cpus.push(cpu);
                }
                Ok(())
            }
            TopologyNode::Interior(_) => Err(TopologyError::Inconsistent {
                cpu,
                key: leaf_key.to_string(),
            }),
        }
    }

    pub fn build(self) -> TopologyNode {
        TopologyNode::Interior(self.root)
    }
}

fn child_entry<F: FnOnce() -> TopologyNode>(
    children: &mut Vec<(CacheKey, TopologyNode)>,
    key: CacheKey,
    make: F,
) -> &mut TopologyNode {
    let pos = match children.iter().position(|(k, _)| *k == key) {
        Some(pos) => pos,
        None => {
            children.push((key, make()));
            children.len() - 1
        }
    };
    &mut children[pos].1
}

/// Aggregated usage of one node of the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUsage {
    /// Path of cache keys from the top, such as `L3-0_L2-4`.
    pub label: String,
    pub is_leaf: bool,
    pub cores: Vec<u32>,
    pub usage: DeltaResult<f64>,
}

impl TopologyNode {
    /// Returns the cores below this node and their average usage.
    ///
    /// An inner node averages the averages of its children, each child weighing the same
    /// regardless of its number of cores. If any core below is not valid, the result is `Unavailable`.
    pub fn aggregate(&self, per_core: &BTreeMap<u32, DeltaResult<f64>>) -> (Vec<u32>, DeltaResult<f64>) {
        let mut out = Vec::new();
        self.aggregate_rec(per_core, None, &mut out)
    }

    /// Aggregates every labelled node, parents before their children.
    pub fn aggregate_all(&self, per_core: &BTreeMap<u32, DeltaResult<f64>>) -> Vec<NodeUsage> {
        let mut out = Vec::new();
        self.aggregate_rec(per_core, None, &mut out);
        out
    }

    fn aggregate_rec(
        &self,
        per_core: &BTreeMap<u32, DeltaResult<f64>>,
        label: Option<&str>,
        out: &mut Vec<NodeUsage>,
    ) -> (Vec<u32>, DeltaResult<f64>) {
        // reserve the slot of this node so that it comes before its children
        let slot = label.map(|l| {
            out.push(NodeUsage {
                label: l.to_owned(),
                is_leaf: matches!(self, TopologyNode::Leaf(_)),
                cores: Vec::new(),
                usage: DeltaResult::Unavailable,
            });
            out.len() - 1
        });

        let (cores, usage) = match self {
            TopologyNode::Leaf(cpus) => {
                let usage = DeltaResult::mean(
                    cpus.iter()
                        .map(|c| per_core.get(c).copied().unwrap_or(DeltaResult::Unavailable)),
                );
                (cpus.clone(), usage)
            }
            TopologyNode::Interior(children) => {
                let mut cores = Vec::new();
                let mut child_means = Vec::with_capacity(children.len());
                for (key, child) in children {
                    let child_label = match label {
                        Some(l) => format!("{l}_{key}"),
                        None => key.to_string(),
                    };
                    let (child_cores, child_usage) = child.aggregate_rec(per_core, Some(&child_label), out);
                    cores.extend(child_cores);
                    child_means.push(child_usage);
                }
                (cores, DeltaResult::mean(child_means))
            }
        };

        if let Some(i) = slot {
            out[i].cores = cores.clone();
            out[i].usage = usage;
        }
        (cores, usage)
    }

    /// All the cores below this node.
    pub fn cores(&self) -> Vec<u32> {
        match self {
            TopologyNode::Leaf(cpus) => cpus.clone(),
            TopologyNode::Interior(children) => children.iter().flat_map(|(_, c)| c.cores()).collect(),
        }
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>, level: usize) -> std::fmt::Result {
        match self {
            TopologyNode::Leaf(cpus) => write!(f, " {cpus:?}"),
            TopologyNode::Interior(children) => {
                for (key, child) in children {
                    write!(f, "\n{}- {key}", "  ".repeat(level))?;
                    child.fmt_rec(f, level + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl Display for TopologyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f, 0)
    }
}

/// Reports the usage of the cache groups.
#[derive(Debug, Clone)]
pub struct TopologyAggregator {
    tree: TopologyNode,
    /// inner groups are only reported above this usage
    display_threshold: f64,
}

impl TopologyAggregator {
    pub fn new(tree: TopologyNode, display_threshold: f64) -> TopologyAggregator {
        TopologyAggregator {
            tree,
            display_threshold,
        }
    }

    pub fn tree(&self) -> &TopologyNode {
        &self.tree
    }

    /// Appends `cpu%_<label>` for every valid group: all the leaves, and the inner
    /// groups whose usage exceeds the display threshold.
    pub fn write_to(&self, per_core: &BTreeMap<u32, DeltaResult<f64>>, sample: &mut Sample) {
        for node in self.tree.aggregate_all(per_core) {
            if let DeltaResult::Valid(usage) = node.usage {
                if node.is_leaf || usage > self.display_threshold {
                    sample.number(format!("cpu%_{}", node.label), usage);
                }
            }
        }
    }
}

/// Static description of the host, built once before sampling starts.
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    /// RAPL domains to measure.
    pub domains: Vec<EnergyDomain>,
    /// Socket id and its cores.
    pub sockets: Vec<(u32, Vec<u32>)>,
    pub cache: TopologyNode,
}

impl TopologyDescription {
    pub fn core_count(&self) -> usize {
        self.sockets.iter().map(|(_, cores)| cores.len()).sum()
    }
}

/// Lists the `cpuN` directories below `root`, sorted by N.
pub fn cpus_in(root: &Path) -> anyhow::Result<Vec<u32>> {
    numbered_entries(root, r"^cpu([0-9]+)$")
}

fn numbered_entries(dir: &Path, pattern: &str) -> anyhow::Result<Vec<u32>> {
    let re = Regex::new(pattern)?;
    let mut found = Vec::new();
    for e in fs::read_dir(dir).with_context(|| format!("Failed to list {dir:?}"))? {
        let entry = e?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(n) = re.captures(&name).and_then(|c| c.get(1)) {
            if entry.path().is_dir() {
                found.push(n.as_str().parse()?);
            }
        }
    }
    found.sort_unstable();
    Ok(found)
}

fn read_trimmed(path: &Path) -> anyhow::Result<String> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    Ok(content.trim().to_owned())
}

/// Groups the cores by physical package (socket), sorted by socket id.
pub fn cpus_per_socket(root: &Path) -> anyhow::Result<Vec<(u32, Vec<u32>)>> {
    let mut sockets: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for cpu in cpus_in(root)? {
        let path = root.join(format!("cpu{cpu}/topology/physical_package_id"));
        if !path.exists() {
            debug!("cpu{cpu} has no package id, probably offline");
            continue;
        }
        let socket: u32 = read_trimmed(&path)?
            .parse()
            .with_context(|| format!("Failed to parse {path:?}"))?;
        sockets.entry(socket).or_default().push(cpu);
    }
    Ok(sockets.into_iter().collect())
}

/// Reads the caches of a core.
pub fn caches_of(root: &Path, cpu: u32) -> anyhow::Result<Vec<CacheInfo>> {
    let dir = root.join(format!("cpu{cpu}/cache"));
    let mut caches = Vec::new();
    for index in numbered_entries(&dir, r"^index([0-9]+)$")? {
        let base = dir.join(format!("index{index}"));
        let level = read_trimmed(&base.join("level"))?.parse()?;
        let shared_cpu_list = read_trimmed(&base.join("shared_cpu_list"))?;
        // some hypervisors don't expose the id, the first sharing core identifies the cache as well
        let id = match fs::read_to_string(base.join("id")) {
            Ok(id) => id.trim().parse()?,
            Err(_) => parse_cpu_list(&shared_cpu_list)?.first().copied().unwrap_or(cpu),
        };
        caches.push(CacheInfo {
            index,
            level,
            id,
            shared_cpu_list,
        });
    }
    Ok(caches)
}

/// Builds the deduplicated cache hierarchy of all the cores below `root`.
pub fn cache_topology(root: &Path) -> anyhow::Result<TopologyNode> {
    let mut builder = TopologyBuilder::new();
    for cpu in cpus_in(root)? {
        let caches = caches_of(root, cpu)?;
        if caches.is_empty() {
            debug!("cpu{cpu} exposes no cache");
            continue;
        }
        builder.add_cpu(cpu, &caches)?;
    }
    Ok(builder.build())
}

//! CPU topology and search sets
//!
//! The platform describes its CPUs as cache clusters (cores sharing a
//! last-level cache, possibly heterogeneous in speed). From that description
//! this module precomputes, for every CPU, a search set: all CPUs ordered by
//! cache affinity — the CPU itself, then its cluster siblings, then remote
//! clusters by distance. Placement and work stealing walk candidates in this
//! order so threads land close to their cache footprint.

use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::percpu;
use crate::types::{CpuId, FP_ONE, MAX_CPUS};
use crate::{kinfo, thread};

/// One cache cluster: member CPUs and their nominal speed.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub cpus: Vec<CpuId>,
    /// Performance scale of the cluster's cores (Q16; 1.0 = nominal).
    pub performance_scale_fp: u64,
}

/// Platform CPU description handed to [`init`].
#[derive(Clone, Debug, Default)]
pub struct CpuTopology {
    pub clusters: Vec<Cluster>,
}

impl CpuTopology {
    /// Uniform topology: `cpus` identical CPUs in a single cluster.
    pub fn uniform(cpus: usize) -> Self {
        Self {
            clusters: alloc::vec![Cluster {
                cpus: (0..cpus as CpuId).collect(),
                performance_scale_fp: FP_ONE,
            }],
        }
    }

    fn cpu_count(&self) -> usize {
        self.clusters.iter().map(|c| c.cpus.len()).sum()
    }
}

struct TopologyState {
    /// Cluster index per CPU.
    cluster_of: Vec<u16>,
    /// Search set per CPU: every online-capable CPU in affinity order.
    search_sets: Vec<Vec<CpuId>>,
}

lazy_static! {
    static ref TOPOLOGY: Mutex<TopologyState> = Mutex::new(TopologyState {
        cluster_of: Vec::new(),
        search_sets: Vec::new(),
    });
}

/// Initialize the scheduler for the given topology. Resets every per-CPU
/// scheduler and the thread registry; CPUs come up online with their
/// cluster's performance scale as both default and active value.
pub fn init(topology: &CpuTopology) {
    let count = topology.cpu_count();
    assert!(count > 0, "topology describes no CPUs");
    assert!(count <= MAX_CPUS, "topology exceeds MAX_CPUS");

    let mut cluster_of = alloc::vec![0u16; count];
    let mut assignments = Vec::with_capacity(count);
    for (idx, cluster) in topology.clusters.iter().enumerate() {
        for cpu in &cluster.cpus {
            assert!((*cpu as usize) < count, "non-contiguous CPU numbering");
            cluster_of[*cpu as usize] = idx as u16;
            assignments.push((*cpu, idx as u16, cluster.performance_scale_fp.max(1)));
        }
    }
    assert_eq!(assignments.len(), count, "CPU listed in two clusters");

    let search_sets = (0..count as CpuId)
        .map(|cpu| build_search_set(cpu, &cluster_of, count))
        .collect();

    thread::reset_registry();
    percpu::init_cpus(&assignments);
    {
        let mut topo = TOPOLOGY.lock();
        topo.cluster_of = cluster_of;
        topo.search_sets = search_sets;
    }

    kinfo!(
        "scheduler initialized: {} CPUs in {} clusters",
        count,
        topology.clusters.len()
    );
}

/// Order all CPUs by cache affinity relative to `cpu`: itself first, then
/// cluster siblings by index distance, then remote CPUs by cluster distance
/// and index distance.
fn build_search_set(cpu: CpuId, cluster_of: &[u16], count: usize) -> Vec<CpuId> {
    let home = cluster_of[cpu as usize];
    let mut set: Vec<CpuId> = (0..count as CpuId).collect();
    set.sort_by_key(|candidate| {
        let cluster_distance = cluster_of[*candidate as usize].abs_diff(home) as u32;
        let index_distance = candidate.abs_diff(cpu) as u32;
        ((cluster_distance as u64) << 32) | index_distance as u64
    });
    set
}

/// Cluster index of a CPU.
pub fn cluster_of(cpu: CpuId) -> u16 {
    let topo = TOPOLOGY.lock();
    topo.cluster_of.get(cpu as usize).copied().unwrap_or(0)
}

/// The precomputed search set for a CPU (the CPU itself leads).
pub fn search_order(cpu: CpuId) -> Vec<CpuId> {
    let topo = TOPOLOGY.lock();
    topo.search_sets
        .get(cpu as usize)
        .cloned()
        .unwrap_or_default()
}

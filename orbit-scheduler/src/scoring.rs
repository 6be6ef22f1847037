// Filter/score/reserve (spec §4.2 "VM Scheduler"). Pure functions over
// `Node`/`VmSpec` snapshots so the scoring math itself stays unit
// testable without touching the data store.

use orbit_base::model::{HardwareInventory, NatType, Node, QualityTier, VmSpec, VmType};
use ordered_float::OrderedFloat;

/// Points charged per virtual CPU core, by tier. A stand-in for the
/// spec's `pointsPerVCpu(baselineBenchmark, overcommitRatio)` — tiers
/// are priced relative to each other rather than derived from a live
/// per-node benchmark, which keeps reservation math reproducible across
/// runs (an Open Question the spec leaves to the implementation).
pub fn points_per_vcpu(tier: QualityTier) -> u64 {
    match tier {
        QualityTier::Burstable => 1,
        QualityTier::Standard => 2,
        QualityTier::Premium => 4,
    }
}

/// Fixed per-role cost for system VMs (spec §4.2: "e.g., Relay=2").
/// Dht/Ingress/BlockStore costs aren't specified; priced relative to
/// Relay by their typical resource footprint.
pub fn system_vm_point_cost(vm_type: VmType) -> u64 {
    match vm_type {
        VmType::Relay => 2,
        VmType::Dht => 2,
        VmType::Ingress => 2,
        VmType::BlockStore => 4,
        VmType::User => 0,
    }
}

pub fn vm_point_cost(spec: &VmSpec, vm_type: VmType) -> u64 {
    match vm_type {
        VmType::User => spec.virtual_cpu_cores as u64 * points_per_vcpu(spec.quality_tier),
        other => system_vm_point_cost(other),
    }
}

/// `totalComputePoints = physicalCores * (nodeBenchmark / baselineBenchmark)
/// * baseOvercommitRatio`, capped by `maxPerformanceMultiplier` (spec
/// §4.2). Run once at node registration/re-benchmark, not per schedule.
pub fn total_compute_points(
    hardware: &HardwareInventory,
    node_benchmark: u64,
    baseline_benchmark: u64,
    base_overcommit_ratio: f64,
    max_performance_multiplier: f64,
) -> u64 {
    if baseline_benchmark == 0 {
        return 0;
    }
    let multiplier =
        (node_benchmark as f64 / baseline_benchmark as f64).min(max_performance_multiplier);
    (hardware.cores as f64 * multiplier * base_overcommit_ratio).floor() as u64
}

#[derive(Clone, Copy, Debug)]
pub struct ScoringWeights {
    pub utilization: f64,
    pub reputation: f64,
    pub price: f64,
    pub region: f64,
    pub gpu: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            utilization: 0.30,
            reputation: 0.25,
            price: 0.20,
            region: 0.15,
            gpu: 0.10,
        }
    }
}

pub const TARGET_UTILIZATION: f64 = 0.7;

fn utilization_score(node: &Node, cost_points: u64) -> f64 {
    let total = node.total_resources.compute_points.max(1) as f64;
    let post = (node.reserved_resources.compute_points + cost_points) as f64 / total;
    let post = post.clamp(0.0, 1.0);
    let max_distance = TARGET_UTILIZATION.max(1.0 - TARGET_UTILIZATION);
    (1.0 - (post - TARGET_UTILIZATION).abs() / max_distance).clamp(0.0, 1.0)
}

fn reputation_score(node: &Node) -> f64 {
    (node.reputation_uptime_percent / 100.0) * 0.6 + node.reputation_success_rate * 0.4
}

/// Normalized across the candidate set: lower price -> higher score.
fn price_scores(candidates: &[&Node]) -> Vec<f64> {
    let prices: Vec<f64> = candidates.iter().map(|n| n.price_per_point).collect();
    let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return vec![1.0; candidates.len()];
    }
    prices.iter().map(|p| (max - p) / (max - min)).collect()
}

fn continent(region: &str) -> &str {
    region.split('-').next().unwrap_or(region)
}

fn region_affinity(node: &Node, wanted_region: Option<&str>) -> f64 {
    match wanted_region {
        None => 1.0,
        Some(wanted) if wanted == node.region => 1.0,
        Some(wanted) if continent(wanted) == continent(&node.region) => 0.5,
        Some(_) => 0.0,
    }
}

fn gpu_affinity_penalty(node: &Node, spec: &VmSpec) -> f64 {
    if node.hardware.has_gpu && !spec.requires_gpu {
        0.0
    } else {
        1.0
    }
}

/// Hard constraints (spec §4.2 "Filtering"). A node failing any of
/// these is never scored.
pub fn passes_filters(node: &Node, spec: &VmSpec, cost_points: u64) -> bool {
    use orbit_base::model::NodeLifecycle;

    if node.lifecycle != NodeLifecycle::Online {
        return false;
    }
    if !node.performance.allowed_tiers.contains(&spec.quality_tier) {
        return false;
    }
    if let Some(region) = &spec.region {
        if region != &node.region {
            return false;
        }
    }
    if let Some(zone) = &spec.zone {
        if node.zone.as_deref() != Some(zone.as_str()) {
            return false;
        }
    }
    let available = node.available();
    if available.compute_points < cost_points
        || available.memory_bytes < spec.memory_bytes
        || available.storage_bytes < spec.disk_bytes
    {
        return false;
    }
    if spec.requires_gpu && !node.hardware.has_gpu {
        return false;
    }
    if spec.requires_public_ip && node.hardware.nat_type != Some(NatType::None) {
        return false;
    }
    true
}

/// Score one candidate against the weighted sum (spec §4.2 "Scoring").
/// `price_score` is passed in since it's normalized across the whole
/// candidate set, not computable per-node in isolation.
pub fn score_node(
    node: &Node,
    spec: &VmSpec,
    cost_points: u64,
    price_score: f64,
    weights: &ScoringWeights,
) -> f64 {
    weights.utilization * utilization_score(node, cost_points)
        + weights.reputation * reputation_score(node)
        + weights.price * price_score
        + weights.region * region_affinity(node, spec.region.as_deref())
        + weights.gpu * gpu_affinity_penalty(node, spec)
}

/// Filter, score, and pick the winning node deterministically. Ties
/// break by `(-score, nodeId)` (spec §4.2 "Tie-breaking") — no
/// randomness.
pub fn pick_node<'a>(
    nodes: &'a [Node],
    spec: &VmSpec,
    vm_type: VmType,
    weights: &ScoringWeights,
) -> Option<&'a Node> {
    let cost_points = vm_point_cost(spec, vm_type);
    let candidates: Vec<&Node> = nodes
        .iter()
        .filter(|n| passes_filters(n, spec, cost_points))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let prices = price_scores(&candidates);
    let mut scored: Vec<(OrderedFloat<f64>, &Node)> = candidates
        .iter()
        .zip(prices.iter())
        .map(|(node, price_score)| {
            (
                OrderedFloat(score_node(node, spec, cost_points, *price_score, weights)),
                *node,
            )
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
    scored.first().map(|(_, node)| *node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_base::ids::NodeId;
    use orbit_base::model::{
        CgnatInfo, DhtInfo, NodeLifecycle, PerformanceEvaluation, RelayInfo, ResourceCounters,
    };

    fn node(region: &str, price: f64, points: u64) -> Node {
        Node {
            id: NodeId::new(),
            wallet_address: "0x1".into(),
            public_ip: "1.1.1.1".into(),
            agent_port: 9000,
            region: region.into(),
            zone: None,
            hardware: HardwareInventory {
                cores: 8,
                memory_bytes: 32 * 1024 * 1024 * 1024,
                disk_bytes: 1000 * 1024 * 1024 * 1024,
                bandwidth_mbps: Some(1000),
                nat_type: Some(NatType::None),
                has_gpu: false,
            },
            performance: PerformanceEvaluation {
                benchmark_score: 1000,
                allowed_tiers: vec![QualityTier::Standard],
            },
            total_resources: ResourceCounters {
                compute_points: points,
                memory_bytes: 32 * 1024 * 1024 * 1024,
                storage_bytes: 1000 * 1024 * 1024 * 1024,
            },
            reserved_resources: ResourceCounters::default(),
            system_vm_obligations: vec![],
            dht_info: DhtInfo::default(),
            relay_info: RelayInfo::default(),
            cgnat_info: CgnatInfo::default(),
            lifecycle: NodeLifecycle::Online,
            last_heartbeat_at: None,
            reputation_uptime_percent: 99.0,
            reputation_success_rate: 0.95,
            price_per_point: price,
            version: 0,
        }
    }

    fn spec() -> VmSpec {
        VmSpec {
            virtual_cpu_cores: 2,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            disk_bytes: 20 * 1024 * 1024 * 1024,
            quality_tier: QualityTier::Standard,
            compute_point_cost: 4,
            ssh_public_key: None,
            user_data: None,
            region: None,
            zone: None,
            requires_public_ip: false,
            requires_gpu: false,
        }
    }

    #[test]
    fn cheaper_node_wins_when_otherwise_equal() {
        let cheap = node("us-east", 0.01, 100);
        let pricey = node("us-east", 0.05, 100);
        let nodes = vec![cheap.clone(), pricey];
        let winner = pick_node(&nodes, &spec(), VmType::User, &ScoringWeights::default()).unwrap();
        assert_eq!(winner.id, cheap.id);
    }

    #[test]
    fn insufficient_points_is_filtered_out() {
        let tiny = node("us-east", 0.01, 1);
        let nodes = vec![tiny];
        assert!(pick_node(&nodes, &spec(), VmType::User, &ScoringWeights::default()).is_none());
    }

    #[test]
    fn tie_break_is_deterministic_by_node_id() {
        let a = node("us-east", 0.01, 100);
        let b = node("us-east", 0.01, 100);
        let (lo, hi) = if a.id < b.id { (a, b) } else { (b, a) };
        let nodes = vec![hi.clone(), lo.clone()];
        let winner = pick_node(&nodes, &spec(), VmType::User, &ScoringWeights::default()).unwrap();
        assert_eq!(winner.id, lo.id);
    }

    #[test]
    fn gpu_node_deprioritized_for_non_gpu_workload() {
        let mut gpu_node = node("us-east", 0.01, 100);
        gpu_node.hardware.has_gpu = true;
        let plain = node("us-east", 0.01, 100);
        let gpu_score = score_node(&gpu_node, &spec(), 4, 1.0, &ScoringWeights::default());
        let plain_score = score_node(&plain, &spec(), 4, 1.0, &ScoringWeights::default());
        assert!(plain_score > gpu_score);
    }
}

// The data store (spec §3 "Data Store", §9 "global mutable collections
// indexed ad hoc" re-architecture item). A repository trait per entity
// kind, backed in this reference implementation by lock-guarded
// `BTreeMap`s for deterministic iteration order — following the
// teacher's own preference for `BTreeMap`/`VecDeque` over unordered
// hash collections wherever enumeration order matters
// (`submerge-net::Node`'s `requests: BTreeMap<i64, Request>`).
//
// Secondary indexes (`vms-by-node`, `vms-by-user`,
// `obligations-by-status`) are maintained alongside the primary table
// rather than recomputed per query.

use crate::error::Result;
use crate::ids::{CustomDomainId, NodeId, ObligationId, UserId, UsageRecordId, VmId};
use crate::model::{CustomDomain, Node, Obligation, ObligationStatus, UsageRecord, VirtualMachine};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A generic keyed repository. Implementations must be safe to share
/// across threads/tasks; this reference version is a single in-memory
/// table behind a reader-writer lock.
pub trait Repository<K: Ord + Copy, V: Clone>: Send + Sync {
    fn get(&self, key: K) -> Option<V>;
    fn put(&self, key: K, value: V);
    fn remove(&self, key: K) -> Option<V>;
    fn all(&self) -> Vec<V>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MapRepository<K: Ord, V> {
    table: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord, V> Default for MapRepository<K, V> {
    fn default() -> Self {
        Self {
            table: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Copy, V: Clone> Repository<K, V> for MapRepository<K, V> {
    fn get(&self, key: K) -> Option<V> {
        self.table.read().get(&key).cloned()
    }
    fn put(&self, key: K, value: V) {
        self.table.write().insert(key, value);
    }
    fn remove(&self, key: K) -> Option<V> {
        self.table.write().remove(&key)
    }
    fn all(&self) -> Vec<V> {
        self.table.read().values().cloned().collect()
    }
    fn len(&self) -> usize {
        self.table.read().len()
    }
}

// `ObligationStatus` needs `Ord` to key a `BTreeMap`; it only derives
// `Eq`/`PartialEq` in `model.rs` since ordering has no domain meaning,
// so the index uses a stable discriminant instead of the enum directly.
fn status_discriminant(status: ObligationStatus) -> u8 {
    match status {
        ObligationStatus::Pending => 0,
        ObligationStatus::Ready => 1,
        ObligationStatus::Running => 2,
        ObligationStatus::WaitingForSignal => 3,
        ObligationStatus::Completed => 4,
        ObligationStatus::Failed => 5,
        ObligationStatus::Cancelled => 6,
    }
}

#[derive(Default)]
pub struct DataStore {
    nodes: MapRepository<NodeId, Node>,
    vms: MapRepository<VmId, VirtualMachine>,
    obligations: MapRepository<ObligationId, Obligation>,
    usage_records: MapRepository<UsageRecordId, UsageRecord>,
    custom_domains: MapRepository<CustomDomainId, CustomDomain>,
    vms_by_node: RwLock<BTreeMap<NodeId, BTreeSet<VmId>>>,
    vms_by_user: RwLock<BTreeMap<UserId, BTreeSet<VmId>>>,
    obligations_by_status: RwLock<BTreeMap<u8, BTreeSet<ObligationId>>>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Nodes --------------------------------------------------------

    pub fn get_node(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(id)
    }

    pub fn put_node(&self, node: Node) {
        self.nodes.put(node.id, node);
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.nodes.all()
    }

    /// Read-modify-write a node under an implicit per-call lock,
    /// bumping `version`. Returns `Conflict`-shaped error text if `f`
    /// rejects the current state (e.g. insufficient available
    /// resources) so scheduler reservation and VM-lifecycle release
    /// never race on the same node (spec §5).
    pub fn update_node<F>(&self, id: NodeId, f: F) -> Result<Node>
    where
        F: FnOnce(&mut Node) -> Result<()>,
    {
        let mut node = self
            .get_node(id)
            .ok_or_else(|| crate::error::Error::not_found(format!("node {id} not found")))?;
        f(&mut node)?;
        node.version += 1;
        self.put_node(node.clone());
        Ok(node)
    }

    // --- VMs ------------------------------------------------------------

    pub fn get_vm(&self, id: VmId) -> Option<VirtualMachine> {
        self.vms.get(id)
    }

    pub fn put_vm(&self, vm: VirtualMachine) {
        let old = self.vms.get(vm.id);
        if let Some(old) = &old {
            if old.node_id != vm.node_id {
                if let Some(old_node) = old.node_id {
                    self.vms_by_node
                        .write()
                        .entry(old_node)
                        .or_default()
                        .remove(&vm.id);
                }
            }
            if old.owner_id != vm.owner_id {
                self.vms_by_user
                    .write()
                    .entry(old.owner_id)
                    .or_default()
                    .remove(&vm.id);
            }
        }
        if let Some(node_id) = vm.node_id {
            self.vms_by_node
                .write()
                .entry(node_id)
                .or_default()
                .insert(vm.id);
        }
        self.vms_by_user
            .write()
            .entry(vm.owner_id)
            .or_default()
            .insert(vm.id);
        self.vms.put(vm.id, vm);
    }

    pub fn all_vms(&self) -> Vec<VirtualMachine> {
        self.vms.all()
    }

    pub fn vms_by_node(&self, node_id: NodeId) -> Vec<VirtualMachine> {
        self.vms_by_node
            .read()
            .get(&node_id)
            .map(|ids| ids.iter().filter_map(|id| self.get_vm(*id)).collect())
            .unwrap_or_default()
    }

    pub fn vms_by_user(&self, user_id: UserId) -> Vec<VirtualMachine> {
        self.vms_by_user
            .read()
            .get(&user_id)
            .map(|ids| ids.iter().filter_map(|id| self.get_vm(*id)).collect())
            .unwrap_or_default()
    }

    pub fn update_vm<F>(&self, id: VmId, f: F) -> Result<VirtualMachine>
    where
        F: FnOnce(&mut VirtualMachine) -> Result<()>,
    {
        let mut vm = self
            .get_vm(id)
            .ok_or_else(|| crate::error::Error::not_found(format!("vm {id} not found")))?;
        f(&mut vm)?;
        vm.version += 1;
        self.put_vm(vm.clone());
        Ok(vm)
    }

    // --- Obligations ------------------------------------------------------

    pub fn get_obligation(&self, id: ObligationId) -> Option<Obligation> {
        self.obligations.get(id)
    }

    pub fn put_obligation(&self, obligation: Obligation) {
        let old_status = self.obligations.get(obligation.id).map(|o| o.status);
        if old_status != Some(obligation.status) {
            if let Some(old) = old_status {
                self.obligations_by_status
                    .write()
                    .entry(status_discriminant(old))
                    .or_default()
                    .remove(&obligation.id);
            }
            self.obligations_by_status
                .write()
                .entry(status_discriminant(obligation.status))
                .or_default()
                .insert(obligation.id);
        }
        self.obligations.put(obligation.id, obligation);
    }

    pub fn all_obligations(&self) -> Vec<Obligation> {
        self.obligations.all()
    }

    pub fn obligations_by_status(&self, status: ObligationStatus) -> Vec<Obligation> {
        self.obligations_by_status
            .read()
            .get(&status_discriminant(status))
            .map(|ids| ids.iter().filter_map(|id| self.get_obligation(*id)).collect())
            .unwrap_or_default()
    }

    pub fn active_obligations(&self) -> Vec<Obligation> {
        self.all_obligations().into_iter().filter(|o| o.is_active()).collect()
    }

    pub fn remove_obligation(&self, id: ObligationId) {
        if let Some(old) = self.obligations.remove(id) {
            self.obligations_by_status
                .write()
                .entry(status_discriminant(old.status))
                .or_default()
                .remove(&id);
        }
    }

    // --- Usage records ------------------------------------------------------

    pub fn put_usage_record(&self, record: UsageRecord) {
        self.usage_records.put(record.id, record);
    }

    pub fn get_usage_record(&self, id: UsageRecordId) -> Option<UsageRecord> {
        self.usage_records.get(id)
    }

    pub fn all_usage_records(&self) -> Vec<UsageRecord> {
        self.usage_records.all()
    }

    pub fn unsettled_usage_records(&self) -> Vec<UsageRecord> {
        self.all_usage_records()
            .into_iter()
            .filter(|r| !r.settled_on_chain)
            .collect()
    }

    // --- Custom domains ------------------------------------------------------

    pub fn get_custom_domain(&self, id: CustomDomainId) -> Option<CustomDomain> {
        self.custom_domains.get(id)
    }

    pub fn put_custom_domain(&self, domain: CustomDomain) {
        self.custom_domains.put(domain.id, domain);
    }

    pub fn all_custom_domains(&self) -> Vec<CustomDomain> {
        self.custom_domains.all()
    }

    pub fn custom_domains_by_vm(&self, vm_id: VmId) -> Vec<CustomDomain> {
        self.all_custom_domains().into_iter().filter(|d| d.vm_id == vm_id).collect()
    }

    // --- Snapshot persistence ------------------------------------------------

    /// Serialize the full store to `path` with `rmp-serde`, the
    /// teacher's wire format of choice (`submerge-net`). Forward
    /// compatibility on read relies on `#[serde(default)]` in the
    /// model types, not on this envelope's shape.
    pub fn snapshot_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = Snapshot {
            nodes: self.all_nodes(),
            vms: self.all_vms(),
            obligations: self.all_obligations(),
            usage_records: self.all_usage_records(),
            custom_domains: self.all_custom_domains(),
        };
        let bytes = rmp_serde::to_vec(&snapshot)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = rmp_serde::from_slice(&bytes)?;
        let store = Self::new();
        for node in snapshot.nodes {
            store.put_node(node);
        }
        for vm in snapshot.vms {
            store.put_vm(vm);
        }
        for obligation in snapshot.obligations {
            // Crash recovery: `Running` obligations re-enter `Ready` so
            // they re-execute idempotently (spec §4.1 "Crash recovery").
            let mut obligation = obligation;
            if obligation.status == ObligationStatus::Running {
                obligation.status = ObligationStatus::Ready;
            }
            store.put_obligation(obligation);
        }
        for record in snapshot.usage_records {
            store.put_usage_record(record);
        }
        for domain in snapshot.custom_domains {
            store.put_custom_domain(domain);
        }
        Ok(store)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    nodes: Vec<Node>,
    vms: Vec<VirtualMachine>,
    obligations: Vec<Obligation>,
    usage_records: Vec<UsageRecord>,
    #[serde(default)]
    custom_domains: Vec<CustomDomain>,
}

pub type SharedStore = Arc<DataStore>;

pub fn shared_store() -> SharedStore {
    Arc::new(DataStore::new())
}

pub fn default_snapshot_path() -> PathBuf {
    PathBuf::from("orbit-snapshot.mpk")
}

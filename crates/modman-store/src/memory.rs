//! In-memory storage implementation
//!
//! Writes made under a transaction are recorded as an operation log and
//! applied to a private copy of the tables, so reads inside the transaction
//! see them. Commit replays the log against the committed tables and swaps
//! the result in only if every operation applies.

use crate::error::{StorageError, StorageResult};
use crate::traits::*;
use async_trait::async_trait;
use modman_types::{DepAssets, DepFilter, DepInstance, Deployment, DeploymentId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Tables {
    deps: BTreeMap<DeploymentId, Deployment>,
    requirements: BTreeMap<DeploymentId, BTreeSet<DeploymentId>>,
    assets: BTreeMap<DeploymentId, DepAssets>,
    instances: BTreeMap<DeploymentId, DepInstance>,
}

#[derive(Debug, Clone)]
enum Op {
    CreateDep(Deployment),
    UpdateDep(Deployment),
    DeleteDep(DeploymentId),
    CreateRequirements(DeploymentId, BTreeSet<DeploymentId>),
    DeleteRequirements(DeploymentId),
    CreateAssets(DeploymentId, DepAssets),
    DeleteAssets(DeploymentId),
    CreateInstance(DeploymentId, DepInstance),
    DeleteInstance(DeploymentId),
}

/// Strip everything that is not stored on the row itself
fn row(dep: &Deployment) -> Deployment {
    Deployment {
        assets: DepAssets::default(),
        instance: None,
        required_dep: BTreeSet::new(),
        dep_requiring: BTreeSet::new(),
        ..dep.clone()
    }
}

impl Tables {
    fn ensure_dep(&self, id: &DeploymentId) -> StorageResult<()> {
        if self.deps.contains_key(id) {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("deployment {}", id)))
        }
    }

    fn apply(&mut self, op: &Op) -> StorageResult<()> {
        match op {
            Op::CreateDep(dep) => {
                if self.deps.contains_key(&dep.id) {
                    return Err(StorageError::Conflict(format!("deployment {} exists", dep.id)));
                }
                self.deps.insert(dep.id.clone(), row(dep));
            }
            Op::UpdateDep(dep) => {
                self.ensure_dep(&dep.id)?;
                self.deps.insert(dep.id.clone(), row(dep));
            }
            Op::DeleteDep(id) => {
                self.ensure_dep(id)?;
                self.deps.remove(id);
                self.requirements.remove(id);
                self.assets.remove(id);
                self.instances.remove(id);
                for reqs in self.requirements.values_mut() {
                    reqs.remove(id);
                }
            }
            Op::CreateRequirements(id, required) => {
                self.ensure_dep(id)?;
                for req in required {
                    if req == id {
                        return Err(StorageError::Conflict(format!(
                            "deployment {} cannot require itself",
                            id
                        )));
                    }
                    self.ensure_dep(req)?;
                }
                self.requirements
                    .entry(id.clone())
                    .or_default()
                    .extend(required.iter().cloned());
            }
            Op::DeleteRequirements(id) => {
                self.requirements.remove(id);
            }
            Op::CreateAssets(id, assets) => {
                self.ensure_dep(id)?;
                self.assets.insert(id.clone(), assets.clone());
            }
            Op::DeleteAssets(id) => {
                self.assets.remove(id);
            }
            Op::CreateInstance(id, instance) => {
                self.ensure_dep(id)?;
                if self.instances.contains_key(id) {
                    return Err(StorageError::Conflict(format!(
                        "deployment {} already has an instance",
                        id
                    )));
                }
                self.instances.insert(id.clone(), instance.clone());
            }
            Op::DeleteInstance(id) => {
                self.instances.remove(id);
            }
        }
        Ok(())
    }

    fn assemble(&self, id: &DeploymentId, assets: bool, containers: bool) -> StorageResult<Deployment> {
        let mut dep = self
            .deps
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("deployment {}", id)))?;

        dep.required_dep = self.requirements.get(id).cloned().unwrap_or_default();
        dep.dep_requiring = self
            .requirements
            .iter()
            .filter(|(_, reqs)| reqs.contains(id))
            .map(|(other, _)| other.clone())
            .collect();
        if assets {
            dep.assets = self.assets.get(id).cloned().unwrap_or_default();
        }
        if containers {
            dep.instance = self.instances.get(id).cloned();
        }
        Ok(dep)
    }
}

#[derive(Debug)]
struct Staged {
    view: Tables,
    ops: Vec<Op>,
}

/// In-memory storage for development and testing
#[derive(Debug)]
pub struct InMemoryStorage {
    committed: Arc<RwLock<Tables>>,
    transactions: Arc<Mutex<HashMap<u64, Staged>>>,
    next_tx: Arc<AtomicU64>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        Self {
            committed: Arc::new(RwLock::new(Tables::default())),
            transactions: Arc::new(Mutex::new(HashMap::new())),
            next_tx: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of transactions neither committed nor rolled back
    pub async fn open_transactions(&self) -> usize {
        self.transactions.lock().await.len()
    }

    async fn write(&self, tx: Option<&Tx>, op: Op) -> StorageResult<()> {
        match tx {
            Some(tx) => {
                let mut transactions = self.transactions.lock().await;
                let staged = transactions
                    .get_mut(&tx.id())
                    .ok_or_else(|| unknown_tx(tx))?;
                staged.view.apply(&op)?;
                staged.ops.push(op);
                Ok(())
            }
            None => self.committed.write().await.apply(&op),
        }
    }

    async fn read<R, F>(&self, tx: Option<&Tx>, f: F) -> StorageResult<R>
    where
        F: FnOnce(&Tables) -> R + Send,
        R: Send,
    {
        match tx {
            Some(tx) => {
                let transactions = self.transactions.lock().await;
                let staged = transactions.get(&tx.id()).ok_or_else(|| unknown_tx(tx))?;
                Ok(f(&staged.view))
            }
            None => Ok(f(&*self.committed.read().await)),
        }
    }
}

fn unknown_tx(tx: &Tx) -> StorageError {
    StorageError::Transaction(format!("unknown transaction {}", tx.id()))
}

#[async_trait]
impl Transactional for InMemoryStorage {
    async fn begin_transaction(&self) -> StorageResult<Tx> {
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        let view = self.committed.read().await.clone();
        self.transactions
            .lock()
            .await
            .insert(id, Staged { view, ops: Vec::new() });
        debug!(tx = id, "Transaction started");
        Ok(Tx::new(id))
    }

    async fn commit(&self, tx: Tx) -> StorageResult<()> {
        let staged = self
            .transactions
            .lock()
            .await
            .remove(&tx.id())
            .ok_or_else(|| unknown_tx(&tx))?;

        let mut committed = self.committed.write().await;
        let mut next = committed.clone();
        for op in &staged.ops {
            next.apply(op)
                .map_err(|e| StorageError::Transaction(format!("commit {} failed: {}", tx.id(), e)))?;
        }
        *committed = next;
        debug!(tx = tx.id(), ops = staged.ops.len(), "Transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: Tx) -> StorageResult<()> {
        self.transactions
            .lock()
            .await
            .remove(&tx.id())
            .ok_or_else(|| unknown_tx(&tx))?;
        debug!(tx = tx.id(), "Transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl DeploymentStorage for InMemoryStorage {
    async fn list_deps(&self, filter: &DepFilter) -> StorageResult<Vec<Deployment>> {
        self.read(None, |tables| {
            tables
                .deps
                .keys()
                .filter_map(|id| tables.assemble(id, false, false).ok())
                .filter(|dep| filter.matches(dep))
                .collect()
        })
        .await
    }

    async fn read_dep(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
        assets: bool,
        containers: bool,
    ) -> StorageResult<Deployment> {
        self.read(tx, |tables| tables.assemble(id, assets, containers))
            .await?
    }

    async fn create_dep(&self, tx: Option<&Tx>, dep: &Deployment) -> StorageResult<()> {
        self.write(tx, Op::CreateDep(dep.clone())).await
    }

    async fn update_dep(&self, tx: Option<&Tx>, dep: &Deployment) -> StorageResult<()> {
        self.write(tx, Op::UpdateDep(dep.clone())).await
    }

    async fn delete_dep(&self, tx: Option<&Tx>, id: &DeploymentId) -> StorageResult<()> {
        self.write(tx, Op::DeleteDep(id.clone())).await
    }
}

#[async_trait]
impl RequirementStorage for InMemoryStorage {
    async fn create_dep_requirements(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
        required: &BTreeSet<DeploymentId>,
    ) -> StorageResult<()> {
        self.write(tx, Op::CreateRequirements(id.clone(), required.clone()))
            .await
    }

    async fn delete_dep_requirements(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
    ) -> StorageResult<()> {
        self.write(tx, Op::DeleteRequirements(id.clone())).await
    }
}

#[async_trait]
impl AssetStorage for InMemoryStorage {
    async fn create_dep_assets(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
        assets: &DepAssets,
    ) -> StorageResult<()> {
        self.write(tx, Op::CreateAssets(id.clone(), assets.clone()))
            .await
    }

    async fn delete_dep_assets(&self, tx: Option<&Tx>, id: &DeploymentId) -> StorageResult<()> {
        self.write(tx, Op::DeleteAssets(id.clone())).await
    }
}

#[async_trait]
impl InstanceStorage for InMemoryStorage {
    async fn create_dep_instance(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
        instance: &DepInstance,
    ) -> StorageResult<()> {
        self.write(tx, Op::CreateInstance(id.clone(), instance.clone()))
            .await
    }

    async fn delete_dep_instance(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
    ) -> StorageResult<()> {
        self.write(tx, Op::DeleteInstance(id.clone())).await
    }
}

impl Storage for InMemoryStorage {}

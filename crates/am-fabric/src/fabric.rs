use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};

use am_types::{AmError, NodeId};

use crate::error::FabricError;
use crate::fault::{take_fault, FaultAction, FaultRule};
use crate::message::{Envelope, Responder, Response, Transport};
use crate::node::BackendNode;

/// Configuration for the [`LocalFabric`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Ordered lanes per node. Affinity ids are folded onto this many
    /// worker tasks.
    pub lanes: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self { lanes: 64 }
    }
}

type Job = (Envelope, Responder);

/// State shared with the lane workers.
struct Shared {
    nodes: RwLock<BTreeMap<NodeId, Arc<BackendNode>>>,
    down: RwLock<BTreeSet<NodeId>>,
    faults: Mutex<Vec<FaultRule>>,
}

impl Shared {
    async fn execute(&self, node: NodeId, envelope: Envelope) -> Result<Response, AmError> {
        let unreachable = self.down.read().expect("fabric lock poisoned").contains(&node);
        if unreachable {
            return Err(AmError::Transport(format!("{node} is unreachable")));
        }
        let kind = envelope.request.kind();
        let fault = {
            let mut rules = self.faults.lock().expect("fault rules poisoned");
            take_fault(&mut rules, node, kind)
        };
        match fault {
            Some(FaultAction::Fail(error)) => {
                debug!(%node, %kind, %error, "injected failure");
                return Err(error);
            }
            Some(FaultAction::Delay(delay)) => {
                debug!(%node, %kind, ?delay, "injected delay");
                tokio::time::sleep(delay).await;
            }
            None => {}
        }
        let target = self
            .nodes
            .read()
            .expect("fabric lock poisoned")
            .get(&node)
            .cloned()
            .ok_or_else(|| AmError::Transport(format!("unknown node {node}")))?;
        target.handle(envelope)
    }
}

async fn run_lane(shared: Arc<Shared>, node: NodeId, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some((envelope, responder)) = jobs.recv().await {
        let result = shared.execute(node, envelope).await;
        responder(result);
    }
}

/// In-process [`Transport`] over a set of [`BackendNode`]s.
///
/// Requests with an affinity id are queued on the lane `(node, affinity %
/// lanes)` and executed one at a time by that lane's worker task. Requests
/// without one get a task each. Lane workers are spawned lazily and exit
/// when the fabric is dropped.
pub struct LocalFabric {
    shared: Arc<Shared>,
    lanes: Mutex<HashMap<(NodeId, usize), mpsc::UnboundedSender<Job>>>,
    config: FabricConfig,
    runtime: Handle,
}

impl LocalFabric {
    /// Create an empty fabric. Must be called from inside a tokio runtime.
    pub fn new(config: FabricConfig) -> Result<Self, FabricError> {
        if config.lanes == 0 {
            return Err(FabricError::ZeroLanes);
        }
        let runtime = Handle::try_current().map_err(|e| FabricError::NoRuntime(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                nodes: RwLock::new(BTreeMap::new()),
                down: RwLock::new(BTreeSet::new()),
                faults: Mutex::new(Vec::new()),
            }),
            lanes: Mutex::new(HashMap::new()),
            config,
            runtime,
        })
    }

    /// Create a fabric with one backend node per id.
    pub fn with_nodes(
        config: FabricConfig,
        ids: impl IntoIterator<Item = NodeId>,
    ) -> Result<Self, FabricError> {
        let fabric = Self::new(config)?;
        for id in ids {
            fabric.add_node(id)?;
        }
        Ok(fabric)
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn add_node(&self, id: NodeId) -> Result<Arc<BackendNode>, FabricError> {
        let mut nodes = self.shared.nodes.write().expect("fabric lock poisoned");
        if nodes.contains_key(&id) {
            return Err(FabricError::DuplicateNode(id));
        }
        let node = Arc::new(BackendNode::new(id));
        nodes.insert(id, Arc::clone(&node));
        info!(node = %id, "backend node added");
        Ok(node)
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<BackendNode>> {
        self.shared
            .nodes
            .read()
            .expect("fabric lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<BackendNode>> {
        self.shared
            .nodes
            .read()
            .expect("fabric lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Make `node` unreachable (or reachable again).
    pub fn set_down(&self, node: NodeId, down: bool) {
        let mut set = self.shared.down.write().expect("fabric lock poisoned");
        if down {
            set.insert(node);
        } else {
            set.remove(&node);
        }
        info!(%node, down, "node reachability changed");
    }

    pub fn inject(&self, rule: FaultRule) {
        self.shared
            .faults
            .lock()
            .expect("fault rules poisoned")
            .push(rule);
    }

    pub fn clear_faults(&self) {
        self.shared
            .faults
            .lock()
            .expect("fault rules poisoned")
            .clear();
    }

    fn lane(&self, node: NodeId, affinity: u64) -> mpsc::UnboundedSender<Job> {
        let index = (affinity % self.config.lanes as u64) as usize;
        let mut lanes = self.lanes.lock().expect("lane table poisoned");
        lanes
            .entry((node, index))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                self.runtime.spawn(run_lane(Arc::clone(&self.shared), node, rx));
                tx
            })
            .clone()
    }
}

impl Transport for LocalFabric {
    fn send(&self, node: NodeId, envelope: Envelope, responder: Responder) {
        match envelope.affinity {
            Some(affinity) => {
                if let Err(mpsc::error::SendError((_, responder))) =
                    self.lane(node, affinity).send((envelope, responder))
                {
                    self.runtime.spawn(async move { responder(Err(AmError::Shutdown)) });
                }
            }
            None => {
                let shared = Arc::clone(&self.shared);
                self.runtime.spawn(async move {
                    let result = shared.execute(node, envelope).await;
                    responder(result);
                });
            }
        }
    }
}

impl std::fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFabric")
            .field("nodes", &self.nodes().len())
            .field("lanes", &self.config.lanes)
            .finish()
    }
}

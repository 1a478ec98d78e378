use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tracing::{debug, warn};

use am_crypto::{blob_affinity, volume_affinity};
use am_fabric::{Envelope, Request, Response, Transport};
use am_store::{BlobStat, CatalogEntry, CatalogUpdate};
use am_topology::{Dmt, PlacementTable, TablePin, TopologyService};
use am_types::{AmError, BlobKey, ErrorClass, NodeId, ObjectId, ReplicaPolicy, SerializationMode, TxId, VolumeId};

use crate::barrier::TxStartBarrier;
use crate::fanout::{FailoverCursor, FanoutTracker, MultiPrimaryTracker, QuorumTracker};
use crate::sequencer::VolumeSequencer;

/// Completion callback for a dispatched operation. Invoked exactly once.
pub type ResponseFn<T> = Box<dyn FnOnce(Result<T, AmError>) + Send>;

/// Classifies errors that end a failover walk early.
type Terminal = fn(&AmError) -> bool;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub serialization: SerializationMode,
    /// Policy for volumes registered without one.
    pub replica_policy: ReplicaPolicy,
}

/// A transaction start admitted to, or waiting in, the barrier.
struct PendingStart {
    key: BlobKey,
    tx: TxId,
    done: ResponseFn<()>,
}

#[derive(Default)]
struct Hooks {
    /// Sees every successful reply.
    on_reply: Option<Box<dyn Fn(&Response) + Send>>,
    /// Runs once every replica replied, with the worst error among them.
    on_all: Option<ResponseFn<()>>,
}

/// Shared by the responders of one fan-out. Dropping the last responder
/// drops the table pin.
struct Fanout {
    tracker: Box<dyn FanoutTracker>,
    done: Option<ResponseFn<Response>>,
    hooks: Hooks,
    _pin: Box<dyn Send>,
}

/// Sends requests to the replica groups of pinned placement tables.
pub struct ReplicaDispatcher {
    transport: Arc<dyn Transport>,
    topology: Arc<TopologyService>,
    sequencer: VolumeSequencer,
    barrier: TxStartBarrier<PendingStart>,
    policies: RwLock<HashMap<VolumeId, ReplicaPolicy>>,
    config: DispatcherConfig,
}

impl ReplicaDispatcher {
    pub fn new(transport: Arc<dyn Transport>, topology: Arc<TopologyService>, config: DispatcherConfig) -> Self {
        Self {
            transport,
            topology,
            sequencer: VolumeSequencer::new(),
            barrier: TxStartBarrier::new(),
            policies: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn topology(&self) -> &Arc<TopologyService> {
        &self.topology
    }

    pub fn sequencer(&self) -> &VolumeSequencer {
        &self.sequencer
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Choose how `volume`'s catalog mutations fan out.
    pub fn set_policy(&self, volume: VolumeId, policy: ReplicaPolicy) {
        self.policies
            .write()
            .expect("policy table poisoned")
            .insert(volume, policy);
    }

    pub fn policy(&self, volume: VolumeId) -> ReplicaPolicy {
        self.policies
            .read()
            .expect("policy table poisoned")
            .get(&volume)
            .copied()
            .unwrap_or(self.config.replica_policy)
    }

    /// Drop per-volume state of a detached volume.
    pub fn forget_volume(&self, volume: VolumeId) {
        self.policies
            .write()
            .expect("policy table poisoned")
            .remove(&volume);
        self.sequencer.forget(volume);
    }

    /// Serialization tag for requests touching `key`.
    pub fn affinity(&self, key: &BlobKey) -> Option<u64> {
        match self.config.serialization {
            SerializationMode::None => None,
            SerializationMode::Volume => Some(volume_affinity(key.volume)),
            SerializationMode::Blob => Some(blob_affinity(key)),
        }
    }

    fn volume_tag(&self, volume: VolumeId) -> Option<u64> {
        match self.config.serialization {
            SerializationMode::None => None,
            SerializationMode::Volume | SerializationMode::Blob => Some(volume_affinity(volume)),
        }
    }

    // -----------------------------------------------------------------------
    // SM operations
    // -----------------------------------------------------------------------

    /// Store one object on a quorum of its DLT group.
    pub fn put_object(&self, key: &BlobKey, id: ObjectId, data: Bytes, done: ResponseFn<()>) {
        let pin = self.topology.pin_dlt();
        let group = pin.node_group(&id).to_vec();
        let envelope = Envelope::new(Request::PutObject { id, data }, pin.version())
            .with_affinity(self.affinity(key));
        let tracker = Box::new(QuorumTracker::new(group.len()));
        let done: ResponseFn<Response> = Box::new(move |result| {
            if let Err(error) = &result {
                warn!(object = %id.short_hex(), %error, "object put failed");
            }
            done(result.map(|_| ()));
        });
        self.fan_out(&group, pin, envelope, tracker, done, Hooks::default());
    }

    /// Read one object from the first replica that has it.
    pub fn get_object(&self, key: &BlobKey, id: ObjectId, done: ResponseFn<Bytes>) {
        let pin = self.topology.pin_dlt();
        let group = pin.node_group(&id).to_vec();
        let envelope = Envelope::new(Request::GetObject { id }, pin.version())
            .with_affinity(self.affinity(key));
        let done = typed(done, |response| match response {
            Response::Object(data) => Some(data),
            _ => None,
        });
        failover(Arc::clone(&self.transport), FailoverCursor::new(group), envelope, AmError::is_not_found, Box::new(pin), done);
    }

    // -----------------------------------------------------------------------
    // DM reads
    // -----------------------------------------------------------------------

    /// Size of `key` and its sectors overlapping `[start, end)`.
    pub fn query_catalog(
        &self,
        key: &BlobKey,
        tx: Option<TxId>,
        start: u64,
        end: u64,
        done: ResponseFn<(u64, Vec<CatalogEntry>)>,
    ) {
        let request = Request::QueryCatalog {
            volume: key.volume,
            blob: key.blob.clone(),
            tx,
            start,
            end,
        };
        let done = typed(done, |response| match response {
            Response::Catalog { size, entries } => Some((size, entries)),
            _ => None,
        });
        self.dm_read(key, request, done);
    }

    pub fn stat_blob(&self, key: &BlobKey, done: ResponseFn<BlobStat>) {
        let request = Request::StatBlob {
            volume: key.volume,
            blob: key.blob.clone(),
        };
        let done = typed(done, |response| match response {
            Response::Stat(stat) => Some(stat),
            _ => None,
        });
        self.dm_read(key, request, done);
    }

    fn dm_read(&self, key: &BlobKey, request: Request, done: ResponseFn<Response>) {
        let pin = self.topology.pin_dmt();
        let group = pin.node_group(&key.volume).to_vec();
        let envelope = Envelope::new(request, pin.version()).with_affinity(self.affinity(key));
        failover(Arc::clone(&self.transport), FailoverCursor::new(group), envelope, AmError::is_not_found, Box::new(pin), done);
    }

    // -----------------------------------------------------------------------
    // DM mutations
    // -----------------------------------------------------------------------

    /// Open `volume` on its DM group and seed its sequence counter from the
    /// replies. Returns the highest sequence number reported.
    pub fn open_volume(&self, volume: VolumeId, done: ResponseFn<u64>) {
        let pin = self.topology.pin_dmt();
        let envelope = Envelope::new(Request::OpenVolume { volume }, pin.version())
            .with_affinity(self.volume_tag(volume));
        let highest = Arc::new(Mutex::new(0u64));
        let seen = Arc::clone(&highest);
        let hooks = Hooks {
            on_reply: Some(Box::new(move |response| {
                if let Response::VolumeOpened { last_seq } = response {
                    let mut seen = seen.lock().expect("open-volume state poisoned");
                    *seen = (*seen).max(*last_seq);
                }
            })),
            on_all: None,
        };
        let sequencer_entry = self.sequencer.entry(volume);
        let done: ResponseFn<Response> = Box::new(move |result| {
            let result = result.map(|_| *highest.lock().expect("open-volume state poisoned"));
            if let Ok(last_seq) = result {
                sequencer_entry.register(last_seq);
                debug!(volume = %volume, last_seq, "volume opened");
            }
            done(result);
        });
        self.dm_fanout(volume, pin, envelope, done, hooks);
    }

    /// Start `tx` on `key`, possibly after waiting out a DMT change.
    pub fn start_tx(self: &Arc<Self>, key: BlobKey, tx: TxId, done: ResponseFn<()>) {
        let pin = self.topology.pin_dmt();
        let version = pin.version();
        let start = PendingStart {
            key: key.clone(),
            tx,
            done,
        };
        match self.barrier.admit(&key, version, start) {
            Some(start) => self.dispatch_start(pin, start),
            None => debug!(blob = %key, %tx, "transaction start queued"),
        }
    }

    fn dispatch_start(self: &Arc<Self>, pin: TablePin<Dmt>, start: PendingStart) {
        let PendingStart { key, tx, done } = start;
        let this = Arc::clone(self);
        let affinity = self.affinity(&key);
        let volume = key.volume;
        let blob = key.blob.clone();
        self.sequenced(
            pin,
            volume,
            affinity,
            move |seq| Request::StartTx { volume, blob, tx, seq },
            Box::new(move |result| {
                this.release_start(&key);
                done(result.map(|_| ()));
            }),
        );
    }

    /// Release one outstanding start of `key`, dispatching the next epoch's
    /// queued starts if it drained.
    fn release_start(self: &Arc<Self>, key: &BlobKey) {
        let pin = self.topology.pin_dmt();
        for start in self.barrier.release(key, pin.version()) {
            self.dispatch_start(pin.clone(), start);
        }
    }

    /// Commit `tx`. Returns the blob's size after the commit.
    pub fn commit_tx(&self, key: &BlobKey, tx: TxId, done: ResponseFn<u64>) {
        let volume = key.volume;
        let done = typed(done, |response| match response {
            Response::Committed { size } => Some(size),
            _ => None,
        });
        self.sequenced(
            self.topology.pin_dmt(),
            volume,
            self.affinity(key),
            move |seq| Request::CommitTx { volume, tx, seq },
            done,
        );
    }

    pub fn abort_tx(&self, key: &BlobKey, tx: TxId, done: ResponseFn<()>) {
        let volume = key.volume;
        self.sequenced(
            self.topology.pin_dmt(),
            volume,
            self.affinity(key),
            move |seq| Request::AbortTx { volume, tx, seq },
            ack(done),
        );
    }

    pub fn update_catalog(&self, key: &BlobKey, tx: Option<TxId>, update: CatalogUpdate, done: ResponseFn<()>) {
        let volume = key.volume;
        let blob = key.blob.clone();
        self.sequenced(
            self.topology.pin_dmt(),
            volume,
            self.affinity(key),
            move |seq| Request::UpdateCatalog {
                volume,
                blob,
                tx,
                seq,
                update,
            },
            ack(done),
        );
    }

    pub fn delete_blob(&self, key: &BlobKey, done: ResponseFn<()>) {
        let volume = key.volume;
        let blob = key.blob.clone();
        self.sequenced(
            self.topology.pin_dmt(),
            volume,
            self.affinity(key),
            move |seq| Request::DeleteBlob { volume, blob, seq },
            ack(done),
        );
    }

    pub fn rename_blob(&self, key: &BlobKey, to: String, done: ResponseFn<()>) {
        let volume = key.volume;
        let from = key.blob.clone();
        // Both names must share a lane, so rename is ordered per volume.
        self.sequenced(
            self.topology.pin_dmt(),
            volume,
            self.volume_tag(volume),
            move |seq| Request::RenameBlob { volume, from, to, seq },
            ack(done),
        );
    }

    /// Stamp a volume sequence number and fan out. The sequence lock is held
    /// until every replica has the request.
    fn sequenced(
        &self,
        pin: TablePin<Dmt>,
        volume: VolumeId,
        affinity: Option<u64>,
        build: impl FnOnce(u64) -> Request,
        done: ResponseFn<Response>,
    ) {
        let entry = self.sequencer.entry(volume);
        let (_guard, seq) = entry.get_and_lock();
        let envelope = Envelope::new(build(seq), pin.version()).with_affinity(affinity);
        let kind = envelope.request.kind();
        let hooks = Hooks {
            on_reply: None,
            on_all: Some(Box::new(move |overall| {
                if let Err(error) = overall {
                    if error.class() != ErrorClass::NotFound {
                        warn!(volume = %volume, seq, %kind, %error, "replica did not apply catalog mutation");
                    }
                }
            })),
        };
        self.dm_fanout(volume, pin, envelope, done, hooks);
    }

    fn dm_fanout(&self, volume: VolumeId, pin: TablePin<Dmt>, envelope: Envelope, done: ResponseFn<Response>, hooks: Hooks) {
        let group = pin.node_group(&volume).to_vec();
        let tracker: Box<dyn FanoutTracker> = match self.policy(volume) {
            ReplicaPolicy::MultiPrimary { num_primaries } => {
                Box::new(MultiPrimaryTracker::new(group.len(), num_primaries))
            }
            ReplicaPolicy::Legacy => Box::new(QuorumTracker::new(group.len())),
        };
        self.fan_out(&group, pin, envelope, tracker, done, hooks);
    }

    fn fan_out<T: PlacementTable>(
        &self,
        nodes: &[NodeId],
        pin: TablePin<T>,
        envelope: Envelope,
        tracker: Box<dyn FanoutTracker>,
        done: ResponseFn<Response>,
        hooks: Hooks,
    ) {
        if nodes.is_empty() {
            done(Err(AmError::NoReplicas(format!("{} {}", T::KIND, pin.version()))));
            return;
        }
        let state = Arc::new(Mutex::new(Fanout {
            tracker,
            done: Some(done),
            hooks,
            _pin: Box::new(pin),
        }));
        for (index, node) in nodes.iter().enumerate() {
            let state = Arc::clone(&state);
            self.transport.send(
                *node,
                envelope.clone(),
                Box::new(move |result| {
                    let result = downgrade_duplicate(result);
                    let (done, outcome, on_all, overall) = {
                        let mut fanout = state.lock().expect("fan-out state poisoned");
                        if let (Ok(response), Some(on_reply)) = (&result, &fanout.hooks.on_reply) {
                            on_reply(response);
                        }
                        let outcome = fanout.tracker.record(index, result);
                        let done = if outcome.is_some() { fanout.done.take() } else { None };
                        let on_all = if fanout.tracker.finished() {
                            fanout.hooks.on_all.take()
                        } else {
                            None
                        };
                        (done, outcome, on_all, fanout.tracker.overall())
                    };
                    if let (Some(done), Some(outcome)) = (done, outcome) {
                        done(outcome);
                    }
                    if let Some(on_all) = on_all {
                        on_all(overall);
                    }
                }),
            );
        }
    }
}

/// Walk `cursor` until a replica answers or an error is terminal. The pin
/// rides along and is dropped with the last responder.
fn failover(
    transport: Arc<dyn Transport>,
    mut cursor: FailoverCursor,
    envelope: Envelope,
    terminal: Terminal,
    pin: Box<dyn Send>,
    done: ResponseFn<Response>,
) {
    let Some(node) = cursor.next_node() else {
        done(Err(cursor.into_error()));
        return;
    };
    let retry = envelope.clone();
    let next = Arc::clone(&transport);
    transport.send(
        node,
        envelope,
        Box::new(move |result| match result {
            Ok(response) => done(Ok(response)),
            Err(error) if terminal(&error) => {
                debug!(%node, %error, "terminal reply; failover stops");
                done(Err(error));
            }
            Err(error) => {
                warn!(%node, attempt = cursor.attempts(), %error, "replica failed; trying next");
                cursor.record_failure(&error);
                failover(next, cursor, retry, terminal, pin, done);
            }
        }),
    );
}

fn downgrade_duplicate(result: Result<Response, AmError>) -> Result<Response, AmError> {
    match result {
        Err(error) if error.class() == ErrorClass::Duplicate => {
            debug!(%error, "duplicate reply treated as success");
            Ok(Response::Ack)
        }
        other => other,
    }
}

fn ack(done: ResponseFn<()>) -> ResponseFn<Response> {
    Box::new(move |result| done(result.map(|_| ())))
}

fn typed<T: 'static>(done: ResponseFn<T>, extract: fn(Response) -> Option<T>) -> ResponseFn<Response> {
    Box::new(move |result| {
        done(result.and_then(|response| {
            extract(response).ok_or_else(|| AmError::Backend("unexpected reply from backend".into()))
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_fabric::Responder;
    use am_topology::Dlt;
    use am_types::TableVersion;

    struct Sent {
        node: NodeId,
        envelope: Envelope,
        responder: Responder,
    }

    /// Records sends; the test answers them by hand.
    #[derive(Default)]
    struct ManualTransport {
        sent: Mutex<Vec<Sent>>,
    }

    impl Transport for ManualTransport {
        fn send(&self, node: NodeId, envelope: Envelope, responder: Responder) {
            self.sent.lock().unwrap().push(Sent {
                node,
                envelope,
                responder,
            });
        }
    }

    impl ManualTransport {
        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    type Slot<T> = Arc<Mutex<Option<Result<T, AmError>>>>;

    fn capture<T: Send + 'static>() -> (ResponseFn<T>, Slot<T>) {
        let slot: Slot<T> = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&slot);
        (
            Box::new(move |result| {
                let previous = writer.lock().unwrap().replace(result);
                assert!(previous.is_none(), "completion invoked twice");
            }),
            slot,
        )
    }

    fn nodes(ids: &[u64]) -> Vec<NodeId> {
        ids.iter().copied().map(NodeId).collect()
    }

    fn topology() -> Arc<TopologyService> {
        Arc::new(TopologyService::new(
            Dlt::new(TableVersion(1), 0, vec![nodes(&[1, 2, 3])]).unwrap(),
            Dmt::new(TableVersion(1), vec![nodes(&[4, 5, 6])]).unwrap(),
        ))
    }

    fn setup(policy: ReplicaPolicy) -> (Arc<ReplicaDispatcher>, Arc<ManualTransport>, Arc<TopologyService>) {
        let transport = Arc::new(ManualTransport::default());
        let topology = topology();
        let dispatcher = Arc::new(ReplicaDispatcher::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&topology),
            DispatcherConfig {
                serialization: SerializationMode::Volume,
                replica_policy: policy,
            },
        ));
        (dispatcher, transport, topology)
    }

    fn key() -> BlobKey {
        BlobKey::new(VolumeId(1), "blob")
    }

    fn update() -> CatalogUpdate {
        CatalogUpdate {
            offset: 0,
            object: ObjectId::from_hash([1; 32]),
            length: 4,
            truncate: false,
        }
    }

    #[test]
    fn put_acks_at_quorum_and_holds_pin_until_all_reply() {
        let (dispatcher, transport, topology) = setup(ReplicaPolicy::default());
        let (done, slot) = capture();
        dispatcher.put_object(&key(), ObjectId::from_hash([9; 32]), Bytes::from_static(b"x"), done);

        let mut sent = transport.take();
        assert_eq!(sent.iter().map(|s| s.node).collect::<Vec<_>>(), nodes(&[1, 2, 3]));
        assert_eq!(sent[0].envelope.affinity, Some(volume_affinity(VolumeId(1))));
        assert_eq!(topology.dlt().outstanding(), 1);

        let third = sent.pop().unwrap();
        for s in sent {
            (s.responder)(Ok(Response::Ack));
        }
        assert_eq!(*slot.lock().unwrap(), Some(Ok(())));
        assert_eq!(topology.dlt().outstanding(), 1);
        (third.responder)(Err(AmError::Timeout));
        assert_eq!(topology.dlt().outstanding(), 0);
    }

    #[test]
    fn put_reports_unreachable_quorum() {
        let (dispatcher, transport, _) = setup(ReplicaPolicy::default());
        let (done, slot) = capture();
        dispatcher.put_object(&key(), ObjectId::from_hash([9; 32]), Bytes::new(), done);
        let mut sent = transport.take().into_iter();
        (sent.next().unwrap().responder)(Err(AmError::Timeout));
        (sent.next().unwrap().responder)(Err(AmError::Backend("disk".into())));
        assert!(matches!(
            *slot.lock().unwrap(),
            Some(Err(AmError::QuorumUnreachable { acked: 0, required: 2, failed: 2 }))
        ));
    }

    #[test]
    fn get_fails_over_and_stops_at_not_found() {
        let (dispatcher, transport, topology) = setup(ReplicaPolicy::default());
        let id = ObjectId::from_hash([2; 32]);
        let (done, slot) = capture();
        dispatcher.get_object(&key(), id, done);

        let first = transport.take().pop().unwrap();
        assert_eq!(first.node, NodeId(1));
        (first.responder)(Err(AmError::Transport("reset".into())));

        let second = transport.take().pop().unwrap();
        assert_eq!(second.node, NodeId(2));
        (second.responder)(Err(AmError::ObjectNotFound(id)));

        assert!(transport.take().is_empty());
        assert_eq!(*slot.lock().unwrap(), Some(Err(AmError::ObjectNotFound(id))));
        assert_eq!(topology.dlt().outstanding(), 0);
    }

    #[test]
    fn get_reports_worst_error_when_every_replica_fails() {
        let (dispatcher, transport, _) = setup(ReplicaPolicy::default());
        let (done, slot) = capture();
        dispatcher.get_object(&key(), ObjectId::from_hash([2; 32]), done);
        for error in [AmError::Timeout, AmError::Backend("disk".into()), AmError::Timeout] {
            let sent = transport.take().pop().unwrap();
            (sent.responder)(Err(error));
        }
        assert_eq!(*slot.lock().unwrap(), Some(Err(AmError::Backend("disk".into()))));
    }

    #[test]
    fn get_returns_first_success() {
        let (dispatcher, transport, _) = setup(ReplicaPolicy::default());
        let (done, slot) = capture();
        dispatcher.get_object(&key(), ObjectId::from_hash([2; 32]), done);
        let sent = transport.take().pop().unwrap();
        (sent.responder)(Ok(Response::Object(Bytes::from_static(b"data"))));
        assert_eq!(*slot.lock().unwrap(), Some(Ok(Bytes::from_static(b"data"))));
    }

    #[test]
    fn multi_primary_answers_after_primaries() {
        let (dispatcher, transport, topology) = setup(ReplicaPolicy::MultiPrimary { num_primaries: 2 });
        let (done, slot) = capture();
        dispatcher.update_catalog(&key(), None, update(), done);

        let mut sent = transport.take();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| s.envelope.request.seq() == Some(1)));
        let optional = sent.pop().unwrap();
        for s in sent {
            (s.responder)(Ok(Response::Ack));
        }
        assert_eq!(*slot.lock().unwrap(), Some(Ok(())));
        assert_eq!(topology.dmt().outstanding(), 1);
        (optional.responder)(Err(AmError::Timeout));
        assert_eq!(topology.dmt().outstanding(), 0);
    }

    #[test]
    fn legacy_policy_uses_quorum() {
        let (dispatcher, transport, _) = setup(ReplicaPolicy::Legacy);
        let (done, slot) = capture();
        dispatcher.delete_blob(&key(), done);
        let mut sent = transport.take().into_iter();
        (sent.next().unwrap().responder)(Ok(Response::Ack));
        assert!(slot.lock().unwrap().is_none());
        (sent.next().unwrap().responder)(Ok(Response::Ack));
        assert_eq!(*slot.lock().unwrap(), Some(Ok(())));
    }

    #[test]
    fn per_volume_policy_overrides_default() {
        let (dispatcher, _, _) = setup(ReplicaPolicy::Legacy);
        dispatcher.set_policy(VolumeId(1), ReplicaPolicy::MultiPrimary { num_primaries: 1 });
        assert_eq!(dispatcher.policy(VolumeId(1)), ReplicaPolicy::MultiPrimary { num_primaries: 1 });
        assert_eq!(dispatcher.policy(VolumeId(2)), ReplicaPolicy::Legacy);
        dispatcher.forget_volume(VolumeId(1));
        assert_eq!(dispatcher.policy(VolumeId(1)), ReplicaPolicy::Legacy);
    }

    #[test]
    fn open_volume_seeds_sequence_from_replies() {
        let (dispatcher, transport, _) = setup(ReplicaPolicy::MultiPrimary { num_primaries: 3 });
        let (done, slot) = capture();
        dispatcher.open_volume(VolumeId(1), done);
        for (s, last_seq) in transport.take().into_iter().zip([4u64, 10, 7]) {
            (s.responder)(Ok(Response::VolumeOpened { last_seq }));
        }
        assert_eq!(*slot.lock().unwrap(), Some(Ok(10)));

        let (done, _) = capture();
        dispatcher.update_catalog(&key(), None, update(), done);
        assert_eq!(transport.take()[0].envelope.request.seq(), Some(11));
    }

    #[test]
    fn sequence_numbers_follow_dispatch_order() {
        let (dispatcher, transport, _) = setup(ReplicaPolicy::default());
        for _ in 0..3 {
            let (done, _) = capture();
            dispatcher.update_catalog(&key(), None, update(), done);
        }
        let seqs: Vec<u64> = transport
            .take()
            .iter()
            .filter(|s| s.node == NodeId(4))
            .filter_map(|s| s.envelope.request.seq())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_start_counts_as_success() {
        let (dispatcher, transport, _) = setup(ReplicaPolicy::MultiPrimary { num_primaries: 1 });
        let (done, slot) = capture();
        dispatcher.start_tx(key(), TxId(1), done);
        for s in transport.take() {
            (s.responder)(Err(AmError::Duplicate("tx:1".into())));
        }
        assert_eq!(*slot.lock().unwrap(), Some(Ok(())));
    }

    #[test]
    fn start_under_new_dmt_waits_for_previous_epoch_start() {
        let (dispatcher, transport, topology) = setup(ReplicaPolicy::MultiPrimary { num_primaries: 3 });
        let (done, first) = capture();
        dispatcher.start_tx(key(), TxId(1), done);
        let v1_starts = transport.take();
        assert!(v1_starts.iter().all(|s| s.envelope.table_version == TableVersion(1)));

        let mut retired = topology
            .install_dmt(Dmt::new(TableVersion(2), vec![nodes(&[4, 5, 6])]).unwrap())
            .unwrap();
        let (done, second) = capture();
        dispatcher.start_tx(key(), TxId(2), done);
        assert!(transport.take().is_empty(), "second start must wait");
        assert_eq!(dispatcher.barrier.state(&key()), Some((TableVersion(1), 1, 1)));

        for s in v1_starts {
            (s.responder)(Ok(Response::Ack));
        }
        assert_eq!(*first.lock().unwrap(), Some(Ok(())));
        assert_eq!(retired.try_recv().unwrap(), TableVersion(1));

        let queued = transport.take();
        assert_eq!(queued.len(), 3);
        for s in queued {
            assert!(matches!(s.envelope.request, Request::StartTx { tx: TxId(2), .. }));
            assert_eq!(s.envelope.table_version, TableVersion(2));
            (s.responder)(Ok(Response::Ack));
        }
        assert_eq!(*second.lock().unwrap(), Some(Ok(())));
        assert!(dispatcher.barrier.is_empty());
    }

    #[test]
    fn open_transaction_does_not_hold_back_next_epoch() {
        let (dispatcher, transport, topology) = setup(ReplicaPolicy::MultiPrimary { num_primaries: 3 });
        let (done, first) = capture();
        dispatcher.start_tx(key(), TxId(1), done);
        for s in transport.take() {
            (s.responder)(Ok(Response::Ack));
        }
        assert_eq!(*first.lock().unwrap(), Some(Ok(())));
        assert!(dispatcher.barrier.is_empty());

        topology
            .install_dmt(Dmt::new(TableVersion(2), vec![nodes(&[4, 5, 6])]).unwrap())
            .unwrap();
        let (done, _) = capture();
        dispatcher.start_tx(key(), TxId(2), done);
        let sent = transport.take();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| s.envelope.table_version == TableVersion(2)));

        let (done, committed) = capture();
        dispatcher.commit_tx(&key(), TxId(1), done);
        for s in transport.take() {
            (s.responder)(Ok(Response::Committed { size: 12 }));
        }
        assert_eq!(*committed.lock().unwrap(), Some(Ok(12)));
        assert_eq!(dispatcher.barrier.state(&key()), Some((TableVersion(2), 1, 0)));
    }

    #[test]
    fn failed_start_releases_the_barrier() {
        let (dispatcher, transport, topology) = setup(ReplicaPolicy::MultiPrimary { num_primaries: 1 });
        let (done, slot) = capture();
        dispatcher.start_tx(key(), TxId(1), done);
        let sent = transport.take();
        topology
            .install_dmt(Dmt::new(TableVersion(2), vec![nodes(&[4, 5, 6])]).unwrap())
            .unwrap();
        let (queued_done, queued) = capture();
        dispatcher.start_tx(key(), TxId(2), queued_done);
        assert!(transport.take().is_empty());

        for s in sent {
            (s.responder)(Err(AmError::VolumeNotActivated(VolumeId(1))));
        }
        assert_eq!(*slot.lock().unwrap(), Some(Err(AmError::VolumeNotActivated(VolumeId(1)))));
        let dispatched = transport.take();
        assert_eq!(dispatched.len(), 3);
        for s in dispatched {
            (s.responder)(Ok(Response::Ack));
        }
        assert_eq!(*queued.lock().unwrap(), Some(Ok(())));
    }

    #[test]
    fn old_dlt_retires_after_in_flight_put_drains() {
        let (dispatcher, transport, topology) = setup(ReplicaPolicy::default());
        let (done, _) = capture();
        dispatcher.put_object(&key(), ObjectId::from_hash([3; 32]), Bytes::new(), done);

        let mut retired = topology
            .install_dlt(Dlt::new(TableVersion(2), 0, vec![nodes(&[1, 2])]).unwrap())
            .unwrap();
        let sent = transport.take();
        assert!(sent.iter().all(|s| s.envelope.table_version == TableVersion(1)));
        assert!(retired.try_recv().is_err());
        for s in sent {
            (s.responder)(Ok(Response::Ack));
        }
        assert_eq!(retired.try_recv().unwrap(), TableVersion(1));
    }

    #[test]
    fn serialization_modes_choose_affinity() {
        let transport: Arc<dyn Transport> = Arc::new(ManualTransport::default());
        for (mode, expected) in [
            (SerializationMode::None, None),
            (SerializationMode::Volume, Some(volume_affinity(VolumeId(1)))),
            (SerializationMode::Blob, Some(blob_affinity(&key()))),
        ] {
            let dispatcher = ReplicaDispatcher::new(
                Arc::clone(&transport),
                topology(),
                DispatcherConfig {
                    serialization: mode,
                    replica_policy: ReplicaPolicy::default(),
                },
            );
            assert_eq!(dispatcher.affinity(&key()), expected);
        }
    }
}

use am_fabric::Response;
use am_types::{AmError, ErrorClass, NodeId};

/// Tracks the replies of one request sent to every node of a group.
pub trait FanoutTracker: Send {
    /// Record the reply of the `index`-th node of the group. Returns the
    /// request's outcome the first time it becomes known.
    fn record(&mut self, index: usize, result: Result<Response, AmError>) -> Option<Result<Response, AmError>>;

    /// Every node has replied.
    fn finished(&self) -> bool;

    /// Worst error across every reply so far.
    fn overall(&self) -> Result<(), AmError>;
}

/// Succeeds once `min(group, 2)` replicas acknowledged; fails as soon as
/// that is out of reach.
#[derive(Debug)]
pub struct QuorumTracker {
    total: usize,
    required: usize,
    acked: usize,
    failed: usize,
    first_ok: Option<Response>,
    worst: Option<AmError>,
    decided: bool,
}

impl QuorumTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            required: total.min(2),
            acked: 0,
            failed: 0,
            first_ok: None,
            worst: None,
            decided: false,
        }
    }

    pub fn required(&self) -> usize {
        self.required
    }

    fn failure(&self) -> AmError {
        match &self.worst {
            Some(error) if error.class() == ErrorClass::AccessDenied => error.clone(),
            _ => AmError::QuorumUnreachable {
                acked: self.acked,
                required: self.required,
                failed: self.failed,
            },
        }
    }
}

impl FanoutTracker for QuorumTracker {
    fn record(&mut self, _index: usize, result: Result<Response, AmError>) -> Option<Result<Response, AmError>> {
        match result {
            Ok(response) => {
                self.acked += 1;
                self.first_ok.get_or_insert(response);
            }
            Err(error) => {
                self.failed += 1;
                AmError::keep_worst(&mut self.worst, &error);
            }
        }
        if self.decided {
            return None;
        }
        if self.acked >= self.required {
            self.decided = true;
            return self.first_ok.clone().map(Ok);
        }
        if self.total - self.failed < self.required {
            self.decided = true;
            return Some(Err(self.failure()));
        }
        None
    }

    fn finished(&self) -> bool {
        self.acked + self.failed >= self.total
    }

    fn overall(&self) -> Result<(), AmError> {
        self.worst.clone().map_or(Ok(()), Err)
    }
}

/// Answers once the leading `primaries` nodes replied, with their worst
/// error if any failed. Optional replicas only contribute to
/// [`FanoutTracker::overall`].
#[derive(Debug)]
pub struct MultiPrimaryTracker {
    total: usize,
    primaries: usize,
    responded: usize,
    primaries_responded: usize,
    primary_ok: Option<Response>,
    primary_error: Option<AmError>,
    any_error: Option<AmError>,
    decided: bool,
}

impl MultiPrimaryTracker {
    pub fn new(total: usize, num_primaries: usize) -> Self {
        Self {
            total,
            primaries: num_primaries.max(1).min(total),
            responded: 0,
            primaries_responded: 0,
            primary_ok: None,
            primary_error: None,
            any_error: None,
            decided: false,
        }
    }

    pub fn primaries(&self) -> usize {
        self.primaries
    }
}

impl FanoutTracker for MultiPrimaryTracker {
    fn record(&mut self, index: usize, result: Result<Response, AmError>) -> Option<Result<Response, AmError>> {
        self.responded += 1;
        let primary = index < self.primaries;
        match result {
            Ok(response) if primary => {
                self.primary_ok.get_or_insert(response);
            }
            Ok(_) => {}
            Err(error) => {
                if primary {
                    AmError::keep_worst(&mut self.primary_error, &error);
                }
                AmError::keep_worst(&mut self.any_error, &error);
            }
        }
        if primary {
            self.primaries_responded += 1;
        }
        if self.decided || self.primaries_responded < self.primaries {
            return None;
        }
        self.decided = true;
        match (&self.primary_error, &self.primary_ok) {
            (Some(error), _) => Some(Err(error.clone())),
            (None, Some(response)) => Some(Ok(response.clone())),
            (None, None) => Some(Err(AmError::NoReplicas("multi-primary group".into()))),
        }
    }

    fn finished(&self) -> bool {
        self.responded >= self.total
    }

    fn overall(&self) -> Result<(), AmError> {
        self.any_error.clone().map_or(Ok(()), Err)
    }
}

/// Ordered walk over a replica group for first-success reads.
#[derive(Debug)]
pub struct FailoverCursor {
    nodes: Vec<NodeId>,
    next: usize,
    worst: Option<AmError>,
}

impl FailoverCursor {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self {
            nodes,
            next: 0,
            worst: None,
        }
    }

    /// The node to try next, or `None` once the group is exhausted.
    pub fn next_node(&mut self) -> Option<NodeId> {
        let node = self.nodes.get(self.next).copied();
        self.next += 1;
        node
    }

    pub fn attempts(&self) -> usize {
        self.next.min(self.nodes.len())
    }

    pub fn record_failure(&mut self, error: &AmError) {
        AmError::keep_worst(&mut self.worst, error);
    }

    /// The error to report once every replica failed.
    pub fn into_error(self) -> AmError {
        self.worst
            .unwrap_or_else(|| AmError::NoReplicas(format!("{} replicas tried", self.nodes.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ok() -> Result<Response, AmError> {
        Ok(Response::Ack)
    }

    #[test]
    fn quorum_of_three_needs_two() {
        let mut tracker = QuorumTracker::new(3);
        assert_eq!(tracker.required(), 2);
        assert_eq!(tracker.record(0, ok()), None);
        assert_eq!(tracker.record(1, Err(AmError::Timeout)), None);
        assert_eq!(tracker.record(2, ok()), Some(Ok(Response::Ack)));
        assert!(tracker.finished());
        assert_eq!(tracker.overall(), Err(AmError::Timeout));
    }

    #[test]
    fn quorum_fails_when_unreachable() {
        let mut tracker = QuorumTracker::new(3);
        assert_eq!(tracker.record(0, Err(AmError::Timeout)), None);
        let outcome = tracker.record(1, Err(AmError::Transport("reset".into())));
        assert_eq!(
            outcome,
            Some(Err(AmError::QuorumUnreachable {
                acked: 0,
                required: 2,
                failed: 2
            }))
        );
        // Late ack does not produce a second outcome.
        assert_eq!(tracker.record(2, ok()), None);
    }

    #[test]
    fn quorum_surfaces_access_denied() {
        let mut tracker = QuorumTracker::new(2);
        let denied = AmError::AccessDenied("not coordinator".into());
        assert_eq!(tracker.record(0, Err(denied.clone())), Some(Err(denied)));
    }

    #[test]
    fn single_replica_quorum() {
        let mut tracker = QuorumTracker::new(1);
        assert_eq!(tracker.required(), 1);
        assert_eq!(tracker.record(0, ok()), Some(Ok(Response::Ack)));
    }

    #[test]
    fn multi_primary_waits_for_primaries_only() {
        let mut tracker = MultiPrimaryTracker::new(4, 2);
        assert_eq!(tracker.record(3, Err(AmError::Timeout)), None);
        assert_eq!(tracker.record(0, Ok(Response::Committed { size: 9 })), None);
        assert_eq!(tracker.record(1, ok()), Some(Ok(Response::Committed { size: 9 })));
        assert!(!tracker.finished());
        assert_eq!(tracker.record(2, ok()), None);
        assert!(tracker.finished());
        assert_eq!(tracker.overall(), Err(AmError::Timeout));
    }

    #[test]
    fn multi_primary_reports_primary_failure() {
        let mut tracker = MultiPrimaryTracker::new(3, 2);
        tracker.record(0, ok());
        assert_eq!(
            tracker.record(1, Err(AmError::Backend("disk".into()))),
            Some(Err(AmError::Backend("disk".into())))
        );
    }

    #[test]
    fn multi_primary_clamps_to_group() {
        let tracker = MultiPrimaryTracker::new(1, 3);
        assert_eq!(tracker.primaries(), 1);
    }

    #[test]
    fn failover_cursor_walks_in_order() {
        let mut cursor = FailoverCursor::new(vec![NodeId(3), NodeId(1)]);
        assert_eq!(cursor.next_node(), Some(NodeId(3)));
        cursor.record_failure(&AmError::Timeout);
        assert_eq!(cursor.next_node(), Some(NodeId(1)));
        cursor.record_failure(&AmError::Backend("x".into()));
        assert_eq!(cursor.next_node(), None);
        assert_eq!(cursor.attempts(), 2);
        assert_eq!(cursor.into_error(), AmError::Backend("x".into()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// A quorum decides exactly once, and succeeds iff enough replicas
        /// acknowledged.
        #[test]
        fn quorum_decides_once(replies in proptest::collection::vec(any::<bool>(), 1..7)) {
            let mut tracker = QuorumTracker::new(replies.len());
            let mut outcomes = Vec::new();
            for (index, success) in replies.iter().enumerate() {
                let result = if *success { ok() } else { Err(AmError::Timeout) };
                if let Some(outcome) = tracker.record(index, result) {
                    outcomes.push(outcome);
                }
            }
            prop_assert_eq!(outcomes.len(), 1);
            let acks = replies.iter().filter(|s| **s).count();
            prop_assert_eq!(outcomes[0].is_ok(), acks >= replies.len().min(2));
        }
    }
}

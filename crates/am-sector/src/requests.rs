use std::collections::{BTreeSet, HashMap};

use am_types::{AmError, RequestId};

/// A client write whose every sector has resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub request: RequestId,
    pub result: Result<(), AmError>,
}

#[derive(Debug)]
struct RequestEntry {
    expected: BTreeSet<u64>,
    /// Requests (including this one) that must all resolve before any of
    /// them completes. Shared by every member of the group.
    dependencies: BTreeSet<RequestId>,
    error: Option<AmError>,
}

/// Arena of in-progress client writes for one blob.
///
/// When two requests' updates are merged into one sector payload neither can
/// be acknowledged until both are durable, so they are linked into a single
/// dependency group. Groups are transitive and complete together, each member
/// receiving the worst error seen by any of them.
#[derive(Debug, Default)]
pub struct RequestTable {
    entries: HashMap<RequestId, RequestEntry>,
    completed: Vec<Completion>,
}

impl RequestTable {
    /// Track `request` until every offset in `offsets` has resolved. A
    /// request with no offsets completes immediately.
    pub fn register(&mut self, request: RequestId, offsets: impl IntoIterator<Item = u64>) {
        let entry = RequestEntry {
            expected: offsets.into_iter().collect(),
            dependencies: BTreeSet::from([request]),
            error: None,
        };
        self.entries.insert(request, entry);
        self.try_complete(request);
    }

    pub fn contains(&self, request: RequestId) -> bool {
        self.entries.contains_key(&request)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offsets `request` is still waiting on.
    pub fn expected(&self, request: RequestId) -> Option<&BTreeSet<u64>> {
        self.entries.get(&request).map(|e| &e.expected)
    }

    pub fn dependencies(&self, request: RequestId) -> Option<&BTreeSet<RequestId>> {
        self.entries.get(&request).map(|e| &e.dependencies)
    }

    pub fn error_of(&self, request: RequestId) -> Option<&AmError> {
        self.entries.get(&request).and_then(|e| e.error.as_ref())
    }

    /// Join the groups of every live request in `members`.
    pub fn link(&mut self, members: &BTreeSet<RequestId>) {
        let mut group = BTreeSet::new();
        for member in members {
            if let Some(entry) = self.entries.get(member) {
                group.extend(entry.dependencies.iter().copied());
            }
        }
        if group.len() <= 1 {
            return;
        }
        for member in &group {
            if let Some(entry) = self.entries.get_mut(member) {
                entry.dependencies.clone_from(&group);
            }
        }
    }

    /// Mark `offset` of `request` resolved, recording `error` if any.
    /// Returns `true` once the request's whole group has completed.
    pub fn resolve(&mut self, request: RequestId, offset: u64, error: Option<&AmError>) -> bool {
        let Some(entry) = self.entries.get_mut(&request) else {
            return true;
        };
        entry.expected.remove(&offset);
        if let Some(error) = error {
            AmError::keep_worst(&mut entry.error, error);
        }
        self.try_complete(request)
    }

    /// Completions produced since the last call.
    pub fn take_completed(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completed)
    }

    fn try_complete(&mut self, request: RequestId) -> bool {
        let Some(group) = self.entries.get(&request).map(|e| e.dependencies.clone()) else {
            return true;
        };
        let mut worst = None;
        for member in &group {
            if let Some(entry) = self.entries.get(member) {
                if !entry.expected.is_empty() {
                    return false;
                }
                if let Some(error) = &entry.error {
                    AmError::keep_worst(&mut worst, error);
                }
            }
        }
        for member in group {
            if self.entries.remove(&member).is_some() {
                let result = match &worst {
                    Some(error) => Err(error.clone()),
                    None => Ok(()),
                };
                self.completed.push(Completion {
                    request: member,
                    result,
                });
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_when_all_offsets_resolve() {
        let mut table = RequestTable::default();
        table.register(RequestId(1), [0, 4096]);
        assert!(!table.resolve(RequestId(1), 0, None));
        assert!(table.take_completed().is_empty());
        assert!(table.resolve(RequestId(1), 4096, None));
        assert_eq!(
            table.take_completed(),
            vec![Completion {
                request: RequestId(1),
                result: Ok(())
            }]
        );
        assert!(table.is_empty());
    }

    #[test]
    fn empty_request_completes_on_register() {
        let mut table = RequestTable::default();
        table.register(RequestId(7), []);
        assert_eq!(table.take_completed().len(), 1);
        assert!(!table.contains(RequestId(7)));
    }

    #[test]
    fn linked_requests_complete_together_with_worst_error() {
        let mut table = RequestTable::default();
        table.register(RequestId(1), [0]);
        table.register(RequestId(2), [0, 4096]);
        table.link(&BTreeSet::from([RequestId(1), RequestId(2)]));

        // Request 1 is done with its own offset but must wait for 2.
        assert!(!table.resolve(RequestId(1), 0, None));
        assert!(!table.resolve(RequestId(2), 0, None));
        assert!(table.take_completed().is_empty());

        assert!(table.resolve(RequestId(2), 4096, Some(&AmError::Timeout)));
        let mut done = table.take_completed();
        done.sort_by_key(|c| c.request);
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.result == Err(AmError::Timeout)));
    }

    #[test]
    fn links_are_transitive() {
        let mut table = RequestTable::default();
        for id in 1..=3 {
            table.register(RequestId(id), [0]);
        }
        table.link(&BTreeSet::from([RequestId(1), RequestId(2)]));
        table.link(&BTreeSet::from([RequestId(2), RequestId(3)]));
        assert_eq!(table.dependencies(RequestId(1)).unwrap().len(), 3);
        assert_eq!(table.dependencies(RequestId(3)).unwrap().len(), 3);
    }

    #[test]
    fn resolving_unknown_request_is_harmless() {
        let mut table = RequestTable::default();
        assert!(table.resolve(RequestId(99), 0, Some(&AmError::Timeout)));
        assert!(table.take_completed().is_empty());
    }
}

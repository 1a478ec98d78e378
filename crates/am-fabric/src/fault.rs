use std::time::Duration;

use am_types::{AmError, NodeId};

use crate::message::RequestKind;

/// What happens to a request matched by a [`FaultRule`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultAction {
    /// Reply with this error without executing the request.
    Fail(AmError),
    /// Hold the request on its lane, then execute it.
    Delay(Duration),
}

/// Applies `action` to the next `remaining` matching requests on `node`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultRule {
    pub node: NodeId,
    /// `None` matches every request kind.
    pub kind: Option<RequestKind>,
    pub remaining: usize,
    pub action: FaultAction,
}

impl FaultRule {
    pub fn fail(node: NodeId, kind: Option<RequestKind>, count: usize, error: AmError) -> Self {
        Self {
            node,
            kind,
            remaining: count,
            action: FaultAction::Fail(error),
        }
    }

    pub fn delay(node: NodeId, kind: Option<RequestKind>, count: usize, delay: Duration) -> Self {
        Self {
            node,
            kind,
            remaining: count,
            action: FaultAction::Delay(delay),
        }
    }

    pub fn matches(&self, node: NodeId, kind: RequestKind) -> bool {
        self.remaining > 0 && self.node == node && self.kind.map_or(true, |k| k == kind)
    }
}

/// Consume the first rule matching `(node, kind)`, dropping exhausted rules.
pub(crate) fn take_fault(rules: &mut Vec<FaultRule>, node: NodeId, kind: RequestKind) -> Option<FaultAction> {
    let index = rules.iter().position(|rule| rule.matches(node, kind))?;
    let rule = &mut rules[index];
    rule.remaining -= 1;
    let action = rule.action.clone();
    if rule.remaining == 0 {
        rules.remove(index);
    }
    Some(action)
}

//! Cancellation with a recorded cause.
//!
//! A [`CauseToken`] wraps a `CancellationToken` and remembers the first
//! [`StopReason`] it was cancelled with. Child tokens are cancelled along with
//! their parent and report the parent's reason unless they were cancelled
//! directly first.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Why a group, rule or evaluation was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The group definition changed and a new group replaces it.
    GroupUpdated,
    /// The group no longer exists in the rule store.
    GroupDeleted,
    /// The rule is gone from the store.
    RuleDeleted,
    /// The rule still exists but its definition changed.
    RuleRestarted,
    /// The scheduler is shutting down.
    Shutdown,
    /// The evaluation ran past its deadline.
    Timeout,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::GroupUpdated => "rule group updated",
            StopReason::GroupDeleted => "rule group deleted",
            StopReason::RuleDeleted => "rule deleted",
            StopReason::RuleRestarted => "rule restarted",
            StopReason::Shutdown => "scheduler shutdown",
            StopReason::Timeout => "evaluation timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
    parent: Option<CauseToken>,
}

#[derive(Debug, Clone)]
pub struct CauseToken {
    inner: Arc<Inner>,
}

impl Default for CauseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CauseToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                reason: Mutex::new(None),
                parent: None,
            }),
        }
    }

    pub fn child_token(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                reason: Mutex::new(None),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel with `reason`. Later calls keep the first reason.
    pub fn cancel(&self, reason: StopReason) {
        if self.inner.token.is_cancelled() {
            return;
        }
        {
            let mut slot = self.inner.reason.lock().expect("cause lock poisoned");
            slot.get_or_insert(reason);
        }
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// The recorded cause, falling back to the nearest cancelled ancestor.
    pub fn reason(&self) -> Option<StopReason> {
        let own = *self.inner.reason.lock().expect("cause lock poisoned");
        own.or_else(|| self.inner.parent.as_ref().and_then(CauseToken::reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let token = CauseToken::new();
        assert_eq!(token.reason(), None);

        token.cancel(StopReason::GroupUpdated);
        token.cancel(StopReason::Shutdown);

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(StopReason::GroupUpdated));
    }

    #[test]
    fn child_inherits_parent_reason() {
        let parent = CauseToken::new();
        let child = parent.child_token();

        parent.cancel(StopReason::GroupDeleted);

        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some(StopReason::GroupDeleted));
        // Already cancelled through the parent, so a late timeout is ignored.
        child.cancel(StopReason::Timeout);
        assert_eq!(child.reason(), Some(StopReason::GroupDeleted));
    }

    #[test]
    fn child_cancel_does_not_touch_parent() {
        let parent = CauseToken::new();
        let child = parent.child_token();

        child.cancel(StopReason::Timeout);

        assert!(!parent.is_cancelled());
        assert_eq!(parent.reason(), None);
        assert_eq!(child.reason(), Some(StopReason::Timeout));
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CauseToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel(StopReason::Shutdown);
        handle.await.unwrap();
    }
}

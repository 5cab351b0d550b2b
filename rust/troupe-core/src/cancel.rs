//! Cancellation tokens with hierarchical scopes
//!
//! Cooperative cancellation for async tasks. Tokens can be cloned and
//! shared; cancelling a token cancels all of its children. A cause is
//! recorded so observers can distinguish shutdown from interruption
//! from deadline expiry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;

/// Why a token was cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    /// Engine or lane shutdown
    Shutdown,
    /// Interrupt signal addressed to the task
    Interrupted {
        /// Whether the interrupt allowed a cleanup window
        graceful: bool,
        /// Operator supplied reason
        reason: String,
    },
    /// A deadline elapsed
    DeadlineExceeded,
    /// Cancelled through the parent token
    Parent,
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelCause::Shutdown => write!(f, "shutdown"),
            CancelCause::Interrupted { reason, .. } => write!(f, "interrupted: {}", reason),
            CancelCause::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelCause::Parent => write!(f, "parent cancelled"),
        }
    }
}

struct TokenState {
    cancelled: bool,
    cause: Option<CancelCause>,
}

struct TokenInner {
    state: RwLock<TokenState>,
    notify: Notify,
    /// Weak so an abandoned child frees itself; dead entries are swept
    /// whenever the registry is traversed. A long-lived token (a lane
    /// shutdown token, say) stays bounded by its live children no
    /// matter how many attempts it has fathered.
    children: RwLock<Vec<Weak<TokenInner>>>,
}

/// A token for cooperative task cancellation
///
/// The token can be cloned and shared across tasks. When cancelled,
/// all instances and all child tokens are notified.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a new, un-cancelled token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: RwLock::new(TokenState {
                    cancelled: false,
                    cause: None,
                }),
                notify: Notify::new(),
                children: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Create a child token
    ///
    /// When this token is cancelled, the child is cancelled as well
    /// (with [`CancelCause::Parent`] unless the child was already
    /// cancelled with its own cause). Cancelling the child does not
    /// affect the parent.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        // A child created after cancellation is cancelled immediately.
        if self.is_cancelled() {
            child.cancel(CancelCause::Parent);
            return child;
        }
        {
            let mut children = self.inner.children.write();
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // Re-check: a cancel racing the registration may have walked
        // the registry before the child landed in it.
        if self.is_cancelled() {
            child.cancel(CancelCause::Parent);
        }
        child
    }

    /// Cancel this token and all children
    pub fn cancel(&self, cause: CancelCause) {
        cancel_inner(&self.inner, cause);
    }

    /// Cancel after a delay, unless cancelled earlier.
    ///
    /// Used for graceful interrupts: the task keeps its cleanup window
    /// and is cut off when it elapses.
    pub fn cancel_after(&self, delay: Duration, cause: CancelCause) {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel(cause);
        });
    }

    /// Whether the token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.read().cancelled
    }

    /// The recorded cancellation cause, if cancelled
    pub fn cause(&self) -> Option<CancelCause> {
        self.inner.state.read().cause.clone()
    }

    /// Wait until the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after arming the notifier so a cancel between
            // the first check and `notified()` is not missed.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn cancel_inner(inner: &Arc<TokenInner>, cause: CancelCause) {
    {
        let mut state = inner.state.write();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.cause = Some(cause);
    }
    inner.notify.notify_waiters();

    let children: Vec<Arc<TokenInner>> = {
        let mut children = inner.children.write();
        children.retain(|weak| weak.strong_count() > 0);
        children.iter().filter_map(Weak::upgrade).collect()
    };
    for child in children {
        cancel_inner(&child, CancelCause::Parent);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_notifies_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.cause()
        });
        token.cancel(CancelCause::Shutdown);
        let cause = handle.await.unwrap();
        assert_eq!(cause, Some(CancelCause::Shutdown));
    }

    #[tokio::test]
    async fn test_child_cancelled_with_parent() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        parent.cancel(CancelCause::Shutdown);
        assert!(child.is_cancelled());
        assert_eq!(child.cause(), Some(CancelCause::Parent));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_alone() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        child.cancel(CancelCause::DeadlineExceeded);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelToken::new();
        parent.cancel(CancelCause::Shutdown);
        assert!(parent.child_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_second_cancel_keeps_first_cause() {
        let token = CancelToken::new();
        token.cancel(CancelCause::DeadlineExceeded);
        token.cancel(CancelCause::Shutdown);
        assert_eq!(token.cause(), Some(CancelCause::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_after_fires() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(10), CancelCause::DeadlineExceeded);
        token.cancelled().await;
        assert_eq!(token.cause(), Some(CancelCause::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_dropped_children_are_pruned() {
        let parent = CancelToken::new();
        for _ in 0..256 {
            drop(parent.child_token());
        }
        let _live = parent.child_token();
        // Dead entries are swept on registration; only live children
        // remain, however many attempts the parent has outlived.
        assert!(parent.inner.children.read().len() <= 2);
    }

    #[tokio::test]
    async fn test_cancel_still_reaches_live_children_after_churn() {
        let parent = CancelToken::new();
        for _ in 0..64 {
            drop(parent.child_token());
        }
        let live = parent.child_token();
        parent.cancel(CancelCause::Shutdown);
        assert!(live.is_cancelled());
        assert_eq!(live.cause(), Some(CancelCause::Parent));
    }
}

//! Dismissible user-facing notices.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// How prominently a notice should be shown.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Severity {
    /// Completed operation.
    Info,
    /// Degraded but usable state.
    Warning,
    /// Failed operation.
    Error,
}

/// Operation a notice is about.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NoticeKind {
    /// Region discovery.
    RegionLoad,
    /// Inventory refresh with failing regions.
    PartialInventory,
    /// Instance creation.
    Spawn,
    /// Instance teardown.
    Terminate,
    /// Tunnel open.
    Connect,
    /// Tunnel close.
    Disconnect,
    /// Metrics subscription.
    Subscription,
    /// Credential update.
    Credentials,
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::RegionLoad => "regions",
            Self::PartialInventory => "inventory",
            Self::Spawn => "spawn",
            Self::Terminate => "terminate",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Subscription => "metrics",
            Self::Credentials => "credentials",
        };
        f.write_str(label)
    }
}

/// One notice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notice {
    /// Monotonic identifier.
    pub id: u64,
    /// Display severity.
    pub severity: Severity,
    /// Operation the notice concerns.
    pub kind: NoticeKind,
    /// Message shown to the user.
    pub message: String,
}

/// Ordered collection of active notices.
#[derive(Debug)]
pub struct NoticeBoard {
    state: watch::Sender<Vec<Notice>>,
    last_id: AtomicU64,
}

impl Default for NoticeBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(Vec::new());
        Self {
            state,
            last_id: AtomicU64::new(0),
        }
    }

    /// Posts a notice and returns its id.
    pub fn post(&self, severity: Severity, kind: NoticeKind, message: impl Into<String>) -> u64 {
        let message = message.into();
        let mut id = 0;
        self.state.send_modify(|notices| {
            id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
            notices.push(Notice {
                id,
                severity,
                kind,
                message,
            });
        });
        id
    }

    /// Removes the notice with `id`. Returns `false` when it was not active.
    pub fn dismiss(&self, id: u64) -> bool {
        self.state.send_if_modified(|notices| {
            let before = notices.len();
            notices.retain(|notice| notice.id != id);
            notices.len() != before
        })
    }

    /// Removes every notice.
    pub fn clear(&self) {
        self.state.send_if_modified(|notices| {
            let had_notices = !notices.is_empty();
            notices.clear();
            had_notices
        });
    }

    /// Active notices in posting order.
    #[must_use]
    pub fn active(&self) -> Vec<Notice> {
        self.state.borrow().clone()
    }

    /// Subscribes to changes of the active notices.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Notice>> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn notices_keep_posting_order_and_ids_grow() {
        let board = NoticeBoard::new();
        let first = board.post(Severity::Error, NoticeKind::Spawn, "spawn failed");
        let second = board.post(Severity::Info, NoticeKind::Connect, "connected");

        assert!(second > first);
        let kinds: Vec<NoticeKind> = board.active().iter().map(|notice| notice.kind).collect();
        assert_eq!(kinds, vec![NoticeKind::Spawn, NoticeKind::Connect]);
    }

    #[rstest]
    fn dismiss_removes_only_the_named_notice() {
        let board = NoticeBoard::new();
        let first = board.post(Severity::Warning, NoticeKind::PartialInventory, "eu down");
        let second = board.post(Severity::Error, NoticeKind::RegionLoad, "no regions");

        assert!(board.dismiss(first));
        assert!(!board.dismiss(first));
        let ids: Vec<u64> = board.active().iter().map(|notice| notice.id).collect();
        assert_eq!(ids, vec![second]);
    }

    #[rstest]
    fn ids_are_not_reused_after_clear() {
        let board = NoticeBoard::new();
        let first = board.post(Severity::Info, NoticeKind::Terminate, "gone");
        board.clear();
        assert!(board.active().is_empty());

        let next = board.post(Severity::Info, NoticeKind::Terminate, "gone again");
        assert!(next > first);
    }

    #[rstest]
    #[tokio::test]
    async fn subscribers_receive_new_notices() {
        let board = NoticeBoard::new();
        let mut rx = board.subscribe();

        board.post(Severity::Error, NoticeKind::Credentials, "rejected");
        rx.changed().await.expect("board alive");

        let notices = rx.borrow_and_update().clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices.first().map(|notice| notice.kind), Some(NoticeKind::Credentials));
    }
}

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use ptyhub_protocol::SessionEvent;
use tokio::sync::mpsc;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// A UI channel that receives a session's events. The UI holds the only
/// strong reference; dropping it unbinds every session it owned.
#[derive(Debug)]
pub struct OwnerChannel {
    id: OwnerId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl OwnerChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed));
        (Arc::new(Self { id, tx }), rx)
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn downgrade(self: &Arc<Self>) -> OwnerRef {
        OwnerRef {
            id: self.id,
            channel: Arc::downgrade(self),
        }
    }

    /// False when the receiving side has gone away.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Lookup-only binding stored by the registry.
#[derive(Debug, Clone)]
pub struct OwnerRef {
    id: OwnerId,
    channel: Weak<OwnerChannel>,
}

impl OwnerRef {
    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|channel| !channel.tx.is_closed())
    }

    /// Delivers `event` if the owner still exists. Returns whether it did.
    pub fn send(&self, event: SessionEvent) -> bool {
        match self.channel.upgrade() {
            Some(channel) => channel.send(event),
            None => false,
        }
    }
}

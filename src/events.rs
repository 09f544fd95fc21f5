//! Core-to-UI notifications
//!
//! Observers register a channel rather than a callback-plus-thread pair:
//! each subscription is an unbounded sender, and the subscriber consumes
//! the receiver on whatever execution context it likes. The core never
//! assumes a particular notification thread.

use bitcoin::Txid;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::provider::TipStatus;

#[derive(Debug, Clone)]
pub enum WalletEvent {
    /// Spendable balance changed (new total in satoshis)
    BalanceChanged(u64),
    /// A transaction paying the wallet was discovered
    Received { txid: Txid, value: u64 },
    /// A transaction spending from the wallet was discovered or broadcast
    Sent { txid: Txid, value: u64 },
    /// Confirmation depth reached the commit policy threshold
    Committed { txid: Txid, depth: u32 },
    /// A sync cycle began
    DownloadStarted,
    /// Progress during a sync cycle
    BlocksDownloaded { local_height: u32, remote_height: u32 },
    /// Local tip caught up with the remote tip
    DownloadCompleted { height: u32, status: TipStatus },
    /// A transient error occurred; the engine retries on its own
    Exception(String),
}

/// Ordered set of subscriptions, fanned out via message passing.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<UnboundedSender<WalletEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The returned receiver is consumed wherever the
    /// caller wants; a dropped receiver unsubscribes implicitly.
    pub fn subscribe(&mut self) -> UnboundedReceiver<WalletEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: WalletEvent) {
        log::debug!("Event: {:?}", event);
        self.subscribers.retain(|sub| sub.send(event.clone()).is_ok());
    }
}

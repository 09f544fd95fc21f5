//! Synchronization engine
//!
//! Reconciles local wallet state with the remote chain tip. A cycle is
//! either an initial full scan (no local tip yet) or an incremental
//! catch-up; a new-block notification exactly one ahead of the local tip
//! takes a fast path that only fetches the listed transaction ids.
//!
//! Provider errors are the normal case for a mobile wallet, not an
//! exceptional one: a failed cycle sleeps a fixed backoff and retries the
//! whole cycle. No mid-flight cancellation exists; a cycle completes a
//! bounded step or fails and retries.

pub mod scanner;

pub use scanner::{scan_chain, ScanOutcome};

use bitcoin::{BlockHash, Txid};
use std::collections::HashMap;
use std::time::Duration;

use crate::context::{build_wallet_data, WalletContext};
use crate::error::WalletError;
use crate::events::{EventBus, WalletEvent};
use crate::keys::KeyChain;
use crate::provider::{ChainProvider, ChainTip, ProviderTx};
use crate::store::{BlockRef, Direction, IngestReport};

/// What kind of sync a cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Initial,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing(SyncKind),
    /// Local tip diverges from the remote tip at the same height
    Reconciling,
}

/// Push notification that a new block appeared, carrying the ids of
/// transactions relevant to this wallet.
#[derive(Debug, Clone)]
pub struct BlockNotification {
    pub height: u32,
    pub hash: BlockHash,
    pub time: u64,
    pub txids: Vec<Txid>,
}

#[derive(Debug, Default)]
pub struct SyncEngine {
    state: SyncState,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::Idle
    }
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Fixed-backoff retry policy. Extracted so the retry loop stays an
    /// explicit iteration rather than self-recursion.
    fn backoff(&self, ctx: &WalletContext, _attempt: u32) -> Duration {
        ctx.config.retry_backoff
    }

    /// Run sync cycles until one succeeds. `max_attempts` bounds the loop
    /// for tests; production passes `None` and retries for as long as the
    /// wallet is active.
    pub async fn run_with_retry(
        &mut self,
        ctx: &mut WalletContext,
        provider: &dyn ChainProvider,
        events: &mut EventBus,
        max_attempts: Option<u32>,
    ) -> Result<(), WalletError> {
        let mut attempt = 0u32;
        loop {
            match self.sync_once(ctx, provider, events).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    log::warn!("Sync cycle failed (attempt {}): {}", attempt, e);
                    events.emit(WalletEvent::Exception(e.to_string()));
                    if let Some(max) = max_attempts {
                        if attempt >= max {
                            return Err(e);
                        }
                    }
                    tokio::time::sleep(self.backoff(ctx, attempt)).await;
                }
            }
        }
    }

    /// One full sync cycle: pick initial vs incremental, reconcile, update
    /// depths and the local tip, emit completion.
    pub async fn sync_once(
        &mut self,
        ctx: &mut WalletContext,
        provider: &dyn ChainProvider,
        events: &mut EventBus,
    ) -> Result<(), WalletError> {
        let tip = provider.chain_tip().await?;
        events.emit(WalletEvent::DownloadStarted);

        let result = if ctx.local_height() <= 0 {
            self.state = SyncState::Syncing(SyncKind::Initial);
            self.initial_sync(ctx, provider, events, &tip).await
        } else if let Some(local) = ctx.last_block.clone() {
            if local.height == tip.height && local.hash == tip.hash {
                // Already at the tip; nothing to download.
                Ok(())
            } else {
                if local.height >= tip.height {
                    log::warn!(
                        "Local tip {} diverges from remote {} at height {}",
                        local.hash,
                        tip.hash,
                        tip.height
                    );
                    self.state = SyncState::Reconciling;
                } else {
                    self.state = SyncState::Syncing(SyncKind::Incremental);
                }
                self.incremental_sync(ctx, provider, events, &tip).await
            }
        } else {
            self.state = SyncState::Syncing(SyncKind::Initial);
            self.initial_sync(ctx, provider, events, &tip).await
        };

        self.state = SyncState::Idle;
        result?;

        self.finish_cycle(ctx, events, &tip)?;
        Ok(())
    }

    /// Handle a new-block push notification.
    ///
    /// Exactly one ahead of the local tip: ingest only the listed ids and
    /// advance the tip by one. More than one ahead: blocks were missed,
    /// fall back to a full incremental cycle. Behind or equal: stale
    /// duplicate, ignored.
    pub async fn on_block_notification(
        &mut self,
        ctx: &mut WalletContext,
        provider: &dyn ChainProvider,
        events: &mut EventBus,
        notification: BlockNotification,
    ) -> Result<(), WalletError> {
        let local = ctx.local_height();

        if (notification.height as i64) <= local {
            log::debug!(
                "Ignoring stale block notification at height {} (local {})",
                notification.height,
                local
            );
            return Ok(());
        }

        if notification.height as i64 > local + 1 {
            log::info!(
                "Block notification skips ahead ({} -> {}), running full sync",
                local,
                notification.height
            );
            return self.sync_once(ctx, provider, events).await;
        }

        let mut batch = Vec::with_capacity(notification.txids.len());
        for txid in &notification.txids {
            match provider.transaction(*txid).await? {
                Some(ptx) => batch.push(ptx),
                None => {
                    // The indexer has not seen the notified transaction yet.
                    // Advancing the tip anyway would put it below the next
                    // incremental window and lose it, so fail the whole
                    // notification and let the retry path pick it up.
                    log::warn!("Notified transaction {} not indexed yet, deferring", txid);
                    return Err(WalletError::DependencyFetchFailure { txid: *txid });
                }
            }
        }

        let report = ingest(ctx, batch, provider).await?;
        ctx.last_block = Some(BlockRef {
            hash: notification.hash,
            height: notification.height,
            time: notification.time,
        });
        self.emit_depth_events(ctx, events, notification.height);
        ctx.persist()?;
        emit_ingest_events(ctx, events, &report);
        events.emit(WalletEvent::DownloadCompleted {
            height: notification.height,
            status: crate::provider::TipStatus::Synchronized,
        });
        Ok(())
    }

    /// Full gap-limit scan of both chains from index 0. Both scans finish
    /// before any chain state is issued, so a provider error cannot leave
    /// addresses issued without their causal activity recorded.
    async fn initial_sync(
        &mut self,
        ctx: &mut WalletContext,
        provider: &dyn ChainProvider,
        events: &mut EventBus,
        tip: &ChainTip,
    ) -> Result<(), WalletError> {
        log::info!("Initial sync against remote tip {}", tip.height);

        let batch_size = ctx.config.scan_batch_size;
        let threshold = ctx.config.inactivity_threshold;

        let external =
            scan_chain(&ctx.keys, KeyChain::External, 0, batch_size, threshold, provider).await?;
        let internal =
            scan_chain(&ctx.keys, KeyChain::Internal, 0, batch_size, threshold, provider).await?;

        // Addresses may already be issued before the first sync (a receive
        // address shown to the user); only issue the shortfall.
        for (chain, active) in [
            (KeyChain::External, external.issued),
            (KeyChain::Internal, internal.issued),
        ] {
            let already = ctx.chain_state.issued(chain);
            if active > already {
                ctx.issue_keys(chain, active - already)?;
            }
        }

        let mut batch: HashMap<Txid, ProviderTx> = HashMap::new();
        for ptx in external.transactions.into_iter().chain(internal.transactions) {
            batch.entry(ptx.txid()).or_insert(ptx);
        }

        events.emit(WalletEvent::BlocksDownloaded {
            local_height: 0,
            remote_height: tip.height,
        });

        let report = ingest(ctx, batch.into_values().collect(), provider).await?;
        emit_ingest_events(ctx, events, &report);
        Ok(())
    }

    /// Catch-up after being offline: re-derive all issued addresses and
    /// query activity since the local tip, then a bounded gap-limit-1 pass
    /// per chain to catch addresses that became active past the issued
    /// range.
    async fn incremental_sync(
        &mut self,
        ctx: &mut WalletContext,
        provider: &dyn ChainProvider,
        events: &mut EventBus,
        tip: &ChainTip,
    ) -> Result<(), WalletError> {
        let since_height = match &ctx.last_block {
            // Reconciling a diverged tip re-queries the full history.
            Some(local) if local.hash != tip.hash && local.height >= tip.height => 0,
            Some(local) => local.height + 1,
            None => 0,
        };
        log::info!(
            "Incremental sync from height {} to remote tip {}",
            since_height,
            tip.height
        );

        let issued = ctx.issued_addresses()?;
        if !issued.is_empty() {
            let history = provider.history(&issued, since_height).await?;
            events.emit(WalletEvent::BlocksDownloaded {
                local_height: ctx.local_height().max(0) as u32,
                remote_height: tip.height,
            });
            let report = ingest(ctx, history, provider).await?;
            emit_ingest_events(ctx, events, &report);
        }

        // Second pass: catch addresses just past the issued range.
        let batch_size = ctx.config.scan_batch_size;
        for chain in [KeyChain::External, KeyChain::Internal] {
            let from = ctx.chain_state.issued(chain);
            let outcome = scan_chain(&ctx.keys, chain, from, batch_size, 1, provider).await?;
            if outcome.issued > 0 {
                ctx.issue_keys(chain, outcome.issued)?;
                let report = ingest(ctx, outcome.transactions, provider).await?;
                emit_ingest_events(ctx, events, &report);
            }
        }
        Ok(())
    }

    /// Set the local tip to the remote tip, refresh confirmation depths
    /// and persist. Completion is per cycle: a new block starts the next.
    fn finish_cycle(
        &mut self,
        ctx: &mut WalletContext,
        events: &mut EventBus,
        tip: &ChainTip,
    ) -> Result<(), WalletError> {
        ctx.last_block = Some(BlockRef {
            hash: tip.hash,
            height: tip.height,
            time: tip.time,
        });
        self.emit_depth_events(ctx, events, tip.height);
        ctx.persist()?;
        log::info!("Fully synced at height {}", tip.height);
        events.emit(WalletEvent::DownloadCompleted {
            height: tip.height,
            status: tip.status,
        });
        Ok(())
    }

    fn emit_depth_events(&self, ctx: &mut WalletContext, events: &mut EventBus, tip_height: u32) {
        let commit_depth = ctx.config.commit_depth;
        for change in ctx.store.update_depths(tip_height) {
            if change.old < commit_depth && change.new >= commit_depth {
                events.emit(WalletEvent::Committed {
                    txid: change.txid,
                    depth: change.new,
                });
            }
        }
    }
}

/// Ingest a batch through the store, persisting the whole wallet file
/// after each fully resolved transaction.
pub async fn ingest(
    ctx: &mut WalletContext,
    batch: Vec<ProviderTx>,
    provider: &dyn ChainProvider,
) -> Result<IngestReport, WalletError> {
    if batch.is_empty() {
        return Ok(IngestReport::default());
    }
    let WalletContext {
        config,
        keys,
        chain_state,
        store,
        last_block,
        encrypted_seed,
        created_at,
        file,
        ..
    } = ctx;
    store
        .add_transactions(batch, provider, &mut |snapshot| {
            let data = build_wallet_data(
                config,
                keys,
                chain_state,
                encrypted_seed,
                last_block,
                created_at,
                snapshot,
            );
            file.save(&data)
        })
        .await
}

/// Balance and per-transaction direction notifications for an ingestion
/// batch that changed the store.
pub fn emit_ingest_events(ctx: &WalletContext, events: &mut EventBus, report: &IngestReport) {
    if report.is_empty() {
        return;
    }
    for txid in &report.inserted {
        let Some(tracked) = ctx.store.find(txid) else { continue };
        match tracked.direction(&ctx.scripts) {
            Some(Direction::Received) => events.emit(WalletEvent::Received {
                txid: *txid,
                value: tracked.value_received(&ctx.scripts),
            }),
            Some(Direction::Sent) => events.emit(WalletEvent::Sent {
                txid: *txid,
                value: tracked.value_sent(&ctx.scripts),
            }),
            None => {}
        }
    }
    events.emit(WalletEvent::BalanceChanged(ctx.balance()));
}

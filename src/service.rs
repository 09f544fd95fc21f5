//! Wallet service
//!
//! One dedicated worker task per wallet serializes every operation: sync,
//! scan, build, sign and broadcast all run on the same task, so the
//! key-chain and the transaction store are never mutated concurrently.
//! UI-facing calls go through [`WalletHandle`], which passes messages to
//! the worker and awaits a oneshot reply. Suspension only happens inside
//! provider round-trips; there is no concurrent fan-out within one wallet.

use bitcoin::Txid;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::WalletConfig;
use crate::context::WalletContext;
use crate::error::WalletError;
use crate::events::{EventBus, WalletEvent};
use crate::provider::{ChainProvider, ProviderTx};
use crate::store::{Confidence, Direction, WalletFile};
use crate::sync::{self, BlockNotification, SyncEngine};
use crate::tx::{self, PendingPayment};

/// Result of `authenticate`: either a wallet was created (the mnemonic
/// must be shown to the user for backup) or an existing one unlocked.
#[derive(Debug)]
pub enum AuthOutcome {
    Created { mnemonic: String },
    Unlocked,
}

/// Wallet-relative view of a tracked transaction for display.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub txid: Txid,
    pub time: u64,
    pub depth: u32,
    pub confidence: Confidence,
    pub direction: Option<Direction>,
    pub value_sent: u64,
    pub value_received: u64,
    pub fee: Option<u64>,
}

enum Command {
    WalletExists {
        reply: oneshot::Sender<bool>,
    },
    Authenticate {
        token: String,
        reply: oneshot::Sender<Result<AuthOutcome, WalletError>>,
    },
    Restore {
        phrase: String,
        token: String,
        reply: oneshot::Sender<Result<(), WalletError>>,
    },
    Balance {
        reply: oneshot::Sender<Result<u64, WalletError>>,
    },
    Transactions {
        reply: oneshot::Sender<Result<Vec<TransactionInfo>, WalletError>>,
    },
    FreshAddress {
        reply: oneshot::Sender<Result<String, WalletError>>,
    },
    CreateTransaction {
        destination: String,
        amount: u64,
        fee_rate_per_kb: u64,
        reply: oneshot::Sender<Result<PendingPayment, WalletError>>,
    },
    SendTransaction {
        payment: Box<PendingPayment>,
        token: String,
        reply: oneshot::Sender<Result<Txid, WalletError>>,
    },
    Sync {
        max_attempts: Option<u32>,
        reply: oneshot::Sender<Result<(), WalletError>>,
    },
    BlockNotification {
        notification: BlockNotification,
    },
    RegisterPush {
        push_token: String,
        reply: oneshot::Sender<Result<bool, WalletError>>,
    },
    SubscribeEvents {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<WalletEvent>>,
    },
    Delete {
        reply: oneshot::Sender<Result<(), WalletError>>,
    },
}

/// Cloneable handle to a wallet worker.
#[derive(Clone)]
pub struct WalletHandle {
    commands: mpsc::Sender<Command>,
}

macro_rules! request {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .commands
            .send(Command::$variant { $($field: $value,)* reply })
            .await
            .map_err(|_| WalletError::Internal("wallet worker stopped".into()))?;
        rx.await
            .map_err(|_| WalletError::Internal("wallet worker stopped".into()))?
    }};
}

impl WalletHandle {
    /// Spawn the worker task for a wallet backed by `wallet_path`.
    pub fn spawn(
        config: WalletConfig,
        wallet_path: PathBuf,
        provider: Arc<dyn ChainProvider>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(64);
        let service = WalletService {
            config,
            file_path: wallet_path,
            provider,
            ctx: None,
            engine: SyncEngine::new(),
            events: EventBus::new(),
            push_token: None,
            rx,
        };
        tokio::spawn(service.run());
        Self { commands }
    }

    pub async fn wallet_exists(&self) -> Result<bool, WalletError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::WalletExists { reply })
            .await
            .map_err(|_| WalletError::Internal("wallet worker stopped".into()))?;
        rx.await
            .map_err(|_| WalletError::Internal("wallet worker stopped".into()))
    }

    /// Create the wallet on first use or verify the token against an
    /// existing one.
    pub async fn authenticate(&self, token: String) -> Result<AuthOutcome, WalletError> {
        request!(self, Authenticate { token: token })
    }

    /// Restore from a 12-word mnemonic; history is recovered by the next
    /// sync.
    pub async fn restore(&self, phrase: String, token: String) -> Result<(), WalletError> {
        request!(self, Restore { phrase: phrase, token: token })
    }

    pub async fn balance(&self) -> Result<u64, WalletError> {
        request!(self, Balance {})
    }

    pub async fn transactions(&self) -> Result<Vec<TransactionInfo>, WalletError> {
        request!(self, Transactions {})
    }

    pub async fn fresh_address(&self) -> Result<String, WalletError> {
        request!(self, FreshAddress {})
    }

    pub async fn create_transaction(
        &self,
        destination: String,
        amount: u64,
        fee_rate_per_kb: u64,
    ) -> Result<PendingPayment, WalletError> {
        request!(self, CreateTransaction {
            destination: destination,
            amount: amount,
            fee_rate_per_kb: fee_rate_per_kb,
        })
    }

    pub async fn send_transaction(
        &self,
        payment: PendingPayment,
        token: String,
    ) -> Result<Txid, WalletError> {
        request!(self, SendTransaction { payment: Box::new(payment), token: token })
    }

    /// Run sync cycles until one succeeds. `None` retries indefinitely.
    pub async fn sync(&self, max_attempts: Option<u32>) -> Result<(), WalletError> {
        request!(self, Sync { max_attempts: max_attempts })
    }

    /// Fire-and-forget push notification of a new block.
    pub async fn notify_block(&self, notification: BlockNotification) -> Result<(), WalletError> {
        self.commands
            .send(Command::BlockNotification { notification })
            .await
            .map_err(|_| WalletError::Internal("wallet worker stopped".into()))
    }

    pub async fn register_push(&self, push_token: String) -> Result<bool, WalletError> {
        request!(self, RegisterPush { push_token: push_token })
    }

    /// Register an event listener. The receiver is consumed on whatever
    /// execution context the caller chooses.
    pub async fn subscribe_events(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<WalletEvent>, WalletError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SubscribeEvents { reply })
            .await
            .map_err(|_| WalletError::Internal("wallet worker stopped".into()))?;
        rx.await
            .map_err(|_| WalletError::Internal("wallet worker stopped".into()))
    }

    /// Delete the wallet. Runs after in-flight operations drain naturally;
    /// the worker stops afterwards.
    pub async fn delete(&self) -> Result<(), WalletError> {
        request!(self, Delete {})
    }
}

struct WalletService {
    config: WalletConfig,
    file_path: PathBuf,
    provider: Arc<dyn ChainProvider>,
    ctx: Option<WalletContext>,
    engine: SyncEngine,
    events: EventBus,
    push_token: Option<String>,
    rx: mpsc::Receiver<Command>,
}

impl WalletService {
    async fn run(mut self) {
        log::debug!("Wallet worker started for {:?}", self.file_path);
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::WalletExists { reply } => {
                    let _ = reply.send(self.file().exists());
                }
                Command::Authenticate { token, reply } => {
                    let _ = reply.send(self.authenticate(&token));
                }
                Command::Restore {
                    phrase,
                    token,
                    reply,
                } => {
                    let _ = reply.send(self.restore(&phrase, &token));
                }
                Command::Balance { reply } => {
                    let _ = reply.send(self.ctx().map(|ctx| ctx.balance()));
                }
                Command::Transactions { reply } => {
                    let _ = reply.send(self.transactions());
                }
                Command::FreshAddress { reply } => {
                    let _ = reply.send(self.fresh_address());
                }
                Command::CreateTransaction {
                    destination,
                    amount,
                    fee_rate_per_kb,
                    reply,
                } => {
                    let _ = reply.send(self.create_transaction(
                        &destination,
                        amount,
                        fee_rate_per_kb,
                    ));
                }
                Command::SendTransaction {
                    payment,
                    token,
                    reply,
                } => {
                    let _ = reply.send(self.send_transaction(*payment, &token).await);
                }
                Command::Sync {
                    max_attempts,
                    reply,
                } => {
                    let _ = reply.send(self.sync(max_attempts).await);
                }
                Command::BlockNotification { notification } => {
                    self.handle_block_notification(notification).await;
                }
                Command::RegisterPush { push_token, reply } => {
                    let _ = reply.send(self.register_push(push_token).await);
                }
                Command::SubscribeEvents { reply } => {
                    let _ = reply.send(self.events.subscribe());
                }
                Command::Delete { reply } => {
                    let _ = reply.send(self.delete());
                    break;
                }
            }
        }
        log::debug!("Wallet worker stopped for {:?}", self.file_path);
    }

    fn file(&self) -> WalletFile {
        WalletFile::new(self.file_path.clone())
    }

    fn ctx(&self) -> Result<&WalletContext, WalletError> {
        self.ctx.as_ref().ok_or(WalletError::WalletNotInitialized)
    }

    fn ctx_mut(&mut self) -> Result<&mut WalletContext, WalletError> {
        self.ctx.as_mut().ok_or(WalletError::WalletNotInitialized)
    }

    fn authenticate(&mut self, token: &str) -> Result<AuthOutcome, WalletError> {
        if self.ctx.is_none() && self.file().exists() {
            self.ctx = Some(WalletContext::load(self.config.clone(), self.file())?);
        }
        match &self.ctx {
            Some(ctx) => {
                // Verifies the token; the seed is dropped immediately.
                ctx.unlock(token)?;
                Ok(AuthOutcome::Unlocked)
            }
            None => {
                let (ctx, mnemonic) =
                    WalletContext::create_new(self.config.clone(), self.file(), token)?;
                self.ctx = Some(ctx);
                Ok(AuthOutcome::Created {
                    mnemonic: mnemonic.to_string(),
                })
            }
        }
    }

    fn restore(&mut self, phrase: &str, token: &str) -> Result<(), WalletError> {
        let ctx = WalletContext::restore(self.config.clone(), self.file(), phrase, token)?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn transactions(&self) -> Result<Vec<TransactionInfo>, WalletError> {
        let ctx = self.ctx()?;
        Ok(ctx
            .store
            .transactions_by_time()
            .into_iter()
            .map(|tracked| TransactionInfo {
                txid: tracked.txid,
                time: tracked.time,
                depth: tracked.depth,
                confidence: tracked.confidence,
                direction: tracked.direction(&ctx.scripts),
                value_sent: tracked.value_sent(&ctx.scripts),
                value_received: tracked.value_received(&ctx.scripts),
                fee: tracked.fee(),
            })
            .collect())
    }

    fn fresh_address(&mut self) -> Result<String, WalletError> {
        let ctx = self.ctx_mut()?;
        let address = ctx.fresh_receive_address()?;
        ctx.persist()?;
        Ok(address.to_string())
    }

    fn create_transaction(
        &mut self,
        destination: &str,
        amount: u64,
        fee_rate_per_kb: u64,
    ) -> Result<PendingPayment, WalletError> {
        let ctx = self.ctx_mut()?;
        let payment = tx::create_transaction(ctx, destination, amount, fee_rate_per_kb)?;
        // The change index, if any, was issued.
        ctx.persist()?;
        Ok(payment)
    }

    /// Sign, broadcast and track a payment. The token unlocks the seed
    /// only for the duration of the call; a signing failure discards the
    /// transaction rather than tracking a partially signed one.
    async fn send_transaction(
        &mut self,
        mut payment: PendingPayment,
        token: &str,
    ) -> Result<Txid, WalletError> {
        let network = self.config.network;
        let provider = Arc::clone(&self.provider);
        let ctx = self.ctx.as_mut().ok_or(WalletError::WalletNotInitialized)?;

        {
            let seed = ctx.unlock(token)?;
            tx::sign_transaction(&mut payment.tx, &payment.selected, &seed, network)?;
        }

        if !provider.broadcast(&payment.tx).await? {
            return Err(WalletError::BroadcastRejected);
        }
        let txid = payment.tx.compute_txid();
        log::info!("Broadcast transaction {}", txid);

        let pending = ProviderTx {
            tx: payment.tx.clone(),
            block: None,
            time: Utc::now().timestamp() as u64,
        };
        let report = sync::ingest(ctx, vec![pending], provider.as_ref()).await?;
        sync::emit_ingest_events(ctx, &mut self.events, &report);
        Ok(txid)
    }

    async fn sync(&mut self, max_attempts: Option<u32>) -> Result<(), WalletError> {
        let provider = Arc::clone(&self.provider);
        let ctx = self.ctx.as_mut().ok_or(WalletError::WalletNotInitialized)?;
        self.engine
            .run_with_retry(ctx, provider.as_ref(), &mut self.events, max_attempts)
            .await?;
        self.resubscribe_push().await;
        Ok(())
    }

    /// Provider errors while handling a notification degrade to a full
    /// retried sync cycle; connectivity loss is normal operation.
    async fn handle_block_notification(&mut self, notification: BlockNotification) {
        let provider = Arc::clone(&self.provider);
        let Some(ctx) = self.ctx.as_mut() else {
            log::debug!("Ignoring block notification: no wallet loaded");
            return;
        };
        let result = self
            .engine
            .on_block_notification(ctx, provider.as_ref(), &mut self.events, notification)
            .await;
        if let Err(e) = result {
            log::warn!("Block notification handling failed: {}", e);
            self.events.emit(WalletEvent::Exception(e.to_string()));
            if let Err(e) = self
                .engine
                .run_with_retry(ctx, provider.as_ref(), &mut self.events, None)
                .await
            {
                log::error!("Recovery sync failed: {}", e);
            }
        }
    }

    async fn register_push(&mut self, push_token: String) -> Result<bool, WalletError> {
        self.push_token = Some(push_token.clone());
        let provider = Arc::clone(&self.provider);
        let ctx = self.ctx()?;
        let addresses = ctx.issued_addresses()?;
        Ok(provider
            .subscribe(&push_token, &ctx.keys.wallet_id(), &addresses)
            .await?)
    }

    /// Keep the provider's watched address set current after a sync may
    /// have issued new addresses. Best-effort by design.
    async fn resubscribe_push(&mut self) {
        let Some(push_token) = self.push_token.clone() else { return };
        let provider = Arc::clone(&self.provider);
        let Ok(ctx) = self.ctx() else { return };
        let Ok(addresses) = ctx.issued_addresses() else { return };
        match provider
            .subscribe(&push_token, &ctx.keys.wallet_id(), &addresses)
            .await
        {
            Ok(true) => log::debug!("Push subscription refreshed"),
            Ok(false) => log::warn!("Push subscription refused by provider"),
            Err(e) => log::warn!("Push subscription failed: {}", e),
        }
    }

    fn delete(&mut self) -> Result<(), WalletError> {
        self.ctx = None;
        let file = self.file();
        if file.exists() {
            file.delete()?;
        }
        log::info!("Wallet deleted");
        Ok(())
    }
}

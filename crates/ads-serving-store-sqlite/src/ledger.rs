//! Asynchronous handle to the deposit ledger.
//!
//! One worker thread owns the `SQLite` connection and applies jobs in
//! submission order. Callers await a oneshot reply; dropping the future
//! before the worker picks the job up cancels it.

use std::path::Path;
use std::thread::JoinHandle;

use ads_serving_core::{CreativeAd, Deposit};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{LedgerError, SqliteAdsStore};

type Reply<T> = oneshot::Sender<Result<T, LedgerError>>;

enum LedgerJob {
    InsertOrUpdate {
        deposits: Vec<Deposit>,
        reply: Reply<()>,
    },
    InsertOrUpdateCreativeAds {
        creative_ads: Vec<CreativeAd>,
        reply: Reply<()>,
    },
    Get {
        creative_instance_id: String,
        reply: Reply<Option<Deposit>>,
    },
    PurgeExpired {
        reply: Reply<usize>,
    },
}

pub struct DepositLedger {
    sender: Option<mpsc::UnboundedSender<LedgerJob>>,
    worker: Option<JoinHandle<()>>,
}

impl DepositLedger {
    /// Opens and migrates the database at `path`, then starts the worker.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let store = SqliteAdsStore::open(path)?;
        store.migrate()?;
        Self::spawn(store)
    }

    /// Starts a worker thread that takes ownership of `store`.
    pub fn spawn(store: SqliteAdsStore) -> Result<Self, LedgerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("deposit-ledger".to_string())
            .spawn(move || run_worker(&store, receiver))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub async fn save(&self, deposit: Deposit) -> Result<(), LedgerError> {
        deposit.validate()?;
        self.insert_or_update(vec![deposit]).await
    }

    pub async fn insert_or_update(&self, deposits: Vec<Deposit>) -> Result<(), LedgerError> {
        if deposits.is_empty() {
            return Ok(());
        }
        for deposit in &deposits {
            deposit.validate()?;
        }
        self.submit(|reply| LedgerJob::InsertOrUpdate { deposits, reply })
            .await
    }

    pub async fn insert_or_update_creative_ads(
        &self,
        creative_ads: Vec<CreativeAd>,
    ) -> Result<(), LedgerError> {
        if creative_ads.is_empty() {
            return Ok(());
        }
        self.submit(|reply| LedgerJob::InsertOrUpdateCreativeAds {
            creative_ads,
            reply,
        })
        .await
    }

    pub async fn get_for_creative_instance_id(
        &self,
        creative_instance_id: &str,
    ) -> Result<Option<Deposit>, LedgerError> {
        if creative_instance_id.is_empty() {
            return Err(LedgerError::Validation(
                "creative_instance_id MUST NOT be empty".to_string(),
            ));
        }
        let creative_instance_id = creative_instance_id.to_string();
        self.submit(|reply| LedgerJob::Get {
            creative_instance_id,
            reply,
        })
        .await
    }

    pub async fn purge_expired(&self) -> Result<usize, LedgerError> {
        self.submit(|reply| LedgerJob::PurgeExpired { reply }).await
    }

    async fn submit<T>(
        &self,
        job: impl FnOnce(Reply<T>) -> LedgerJob,
    ) -> Result<T, LedgerError> {
        let sender = self.sender.as_ref().ok_or(LedgerError::WorkerUnavailable)?;
        let (reply, response) = oneshot::channel();
        sender
            .send(job(reply))
            .map_err(|_| LedgerError::WorkerUnavailable)?;
        response.await.map_err(|_| LedgerError::WorkerUnavailable)?
    }
}

impl Drop for DepositLedger {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("deposit ledger worker panicked");
            }
        }
    }
}

fn run_worker(store: &SqliteAdsStore, mut receiver: mpsc::UnboundedReceiver<LedgerJob>) {
    while let Some(job) = receiver.blocking_recv() {
        match job {
            LedgerJob::InsertOrUpdate { deposits, reply } => {
                if skip_cancelled(&reply, "insert_or_update") {
                    continue;
                }
                let _ = reply.send(store.insert_or_update_deposits(&deposits));
            }
            LedgerJob::InsertOrUpdateCreativeAds {
                creative_ads,
                reply,
            } => {
                if skip_cancelled(&reply, "insert_or_update_creative_ads") {
                    continue;
                }
                let _ = reply.send(store.insert_or_update_creative_ads(&creative_ads));
            }
            LedgerJob::Get {
                creative_instance_id,
                reply,
            } => {
                if skip_cancelled(&reply, "get") {
                    continue;
                }
                let _ = reply.send(store.get_deposit(&creative_instance_id));
            }
            LedgerJob::PurgeExpired { reply } => {
                if skip_cancelled(&reply, "purge_expired") {
                    continue;
                }
                let _ = reply.send(store.purge_expired_deposits());
            }
        }
    }
    debug!("deposit ledger worker stopped");
}

fn skip_cancelled<T>(reply: &Reply<T>, operation: &'static str) -> bool {
    let cancelled = reply.is_closed();
    if cancelled {
        debug!(operation, "skipping cancelled ledger job");
    }
    cancelled
}

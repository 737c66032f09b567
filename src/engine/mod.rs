mod admission;
mod availability;
mod error;
mod ledger;
mod mutations;
mod queries;
mod txn;

pub use availability::{bucket_loads, full_buckets, hour_buckets};
pub use error::{EngineError, ErrorKind};
pub use ledger::{Ledger, SharedPartition};
pub use mutations::ReservationRequest;
pub use queries::ReservationFilter;
pub use txn::Txn;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::catalog::FacilityCatalog;
use crate::model::*;
use crate::notify::{Notice, NotificationSender};
use crate::observability;
use crate::wal::Wal;

/// Tunables for admission and display.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// First hour shown by the availability grid.
    pub open_hour: u32,
    /// Hour at which the availability grid ends (exclusive).
    pub close_hour: u32,
    /// Lock-wait attempts before a transaction reports a conflict.
    pub max_attempts: u32,
    /// How long one attempt waits for the partition lock.
    pub lock_wait: Duration,
    /// Deadline applied to admissions that don't bring their own.
    pub admission_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            open_hour: 8,
            close_hour: 22,
            max_attempts: 5,
            lock_wait: Duration::from_millis(200),
            admission_timeout: None,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches concurrent commits into one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (events, response) = match cmd {
            WalCommand::Append { events, response } => (events, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<PendingCommit> = vec![(events, response)];
        let mut deferred = None;

        // Everything already queued joins this fsync.
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingCommit]) -> io::Result<()> {
    // Nothing from a failed batch may reach a later fsync.
    match batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events))
    {
        Ok(()) => wal.flush_sync(),
        Err(e) => {
            wal.discard_pending();
            Err(e)
        }
    }
}

fn respond_batch(batch: Vec<PendingCommit>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Stand-in writer for engines without a log: acknowledges everything.
async fn null_writer_loop(mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { response, .. } | WalCommand::Compact { response, .. } => {
                let _ = response.send(Ok(()));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(0);
            }
        }
    }
}

pub(super) async fn wal_append(
    wal_tx: &mpsc::Sender<WalCommand>,
    events: Vec<Event>,
) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { events, response: tx })
        .await
        .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::Storage(e.to_string()))
}

/// The reservation core. Every collaborator is injected here; nothing is global.
pub struct Engine {
    pub(super) ledger: Arc<Ledger>,
    /// Held shared by every transaction, exclusively by compaction.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) catalog: Arc<dyn FacilityCatalog>,
    pub(super) notifier: Arc<dyn NotificationSender>,
    pub(super) config: EngineConfig,
}

impl Engine {
    /// Durable engine: replays `wal_path` and appends every commit to it.
    /// Must be called from inside a tokio runtime.
    pub fn open(
        wal_path: &Path,
        catalog: Arc<dyn FacilityCatalog>,
        notifier: Arc<dyn NotificationSender>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Ledger::new();
        ledger.replay(&events);
        info!(
            "replayed {} events into {} partitions from {}",
            events.len(),
            ledger.partition_count(),
            wal_path.display()
        );
        Ok(Self::assemble(ledger, wal_tx, catalog, notifier, config))
    }

    /// Engine whose ledger lives only in memory.
    pub fn ephemeral(
        catalog: Arc<dyn FacilityCatalog>,
        notifier: Arc<dyn NotificationSender>,
        config: EngineConfig,
    ) -> Self {
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(null_writer_loop(wal_rx));
        Self::assemble(Ledger::new(), wal_tx, catalog, notifier, config)
    }

    fn assemble(
        ledger: Ledger,
        wal_tx: mpsc::Sender<WalCommand>,
        catalog: Arc<dyn FacilityCatalog>,
        notifier: Arc<dyn NotificationSender>,
        mut config: EngineConfig,
    ) -> Self {
        config.max_attempts = config.max_attempts.clamp(1, crate::limits::MAX_TXN_RETRIES);
        config.close_hour = config.close_hour.min(24);
        config.open_hour = config.open_hour.min(config.close_hour);
        Self {
            ledger: Arc::new(ledger),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            catalog,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn FacilityCatalog> {
        &self.catalog
    }

    /// Hand a notice to the sender without waiting. Failures are logged only.
    pub(super) fn dispatch(&self, notice: Notice) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(notice).await {
                metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                tracing::warn!("notification dropped: {e}");
            }
        });
    }

    /// Rewrite the WAL as a snapshot of the current ledger.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no transaction is open while the snapshot is cut
        // and the log is swapped.
        let _gate = self.commit_gate.write().await;
        let snapshot = self.ledger.snapshot().await;
        let count = snapshot.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        self.ledger.recount_all().await;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

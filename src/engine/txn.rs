//! Scoped transactions over one ledger partition.
//!
//! `begin` acquires the partition exclusively (bounded lock-wait retries),
//! reads go through `partition()`, writes are staged, and `commit` makes the
//! staged events durable before applying them. Dropping a `Txn` aborts it.

use std::time::Instant;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::debug;

use crate::model::*;
use crate::observability;

use super::{wal_append, Engine, EngineError};

pub struct Txn {
    key: PartitionKey,
    guard: OwnedRwLockWriteGuard<Partition>,
    gate: OwnedRwLockReadGuard<()>,
    staged: Vec<Event>,
    attempts: u32,
}

impl Txn {
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Consistent view of the partition; nobody else can write it until
    /// this transaction ends.
    pub fn partition(&self) -> &Partition {
        &self.guard
    }

    pub fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    pub fn staged(&self) -> &[Event] {
        &self.staged
    }

    /// Lock-wait attempts it took to open this transaction.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Engine {
    /// Open a transaction on `key`. Each attempt waits at most `lock_wait`
    /// (less if `deadline` is closer); after `max_attempts` the caller gets
    /// `TransactionConflict`, past the deadline `Timeout`.
    pub async fn begin(
        &self,
        key: &PartitionKey,
        deadline: Option<Instant>,
    ) -> Result<Txn, EngineError> {
        let partition = self.ledger.partition_or_create(key);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut wait = self.config.lock_wait;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(EngineError::Timeout);
                }
                wait = wait.min(remaining);
            }

            let gate = self.commit_gate.clone();
            let part = partition.clone();
            let acquire = async move {
                let gate = gate.read_owned().await;
                let guard = part.write_owned().await;
                (gate, guard)
            };
            match tokio::time::timeout(wait, acquire).await {
                Ok((gate, guard)) => {
                    return Ok(Txn {
                        key: key.clone(),
                        guard,
                        gate,
                        staged: Vec::new(),
                        attempts,
                    });
                }
                Err(_) => {
                    metrics::counter!(observability::TXN_LOCK_TIMEOUTS_TOTAL).increment(1);
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(EngineError::Timeout);
                    }
                    if attempts >= self.config.max_attempts {
                        return Err(EngineError::TransactionConflict { attempts });
                    }
                    debug!("lock wait on {key} expired, attempt {attempts}");
                }
            }
        }
    }

    /// Make the staged events durable, then apply them. Past this point the
    /// commit finishes even if the caller's future is dropped.
    pub async fn commit(&self, txn: Txn) -> Result<(), EngineError> {
        let Txn {
            mut guard,
            gate,
            staged,
            ..
        } = txn;
        if staged.is_empty() {
            return Ok(());
        }
        let ledger = self.ledger.clone();
        let wal_tx = self.wal_tx.clone();
        let task = tokio::spawn(async move {
            let _gate = gate;
            wal_append(&wal_tx, staged.clone()).await?;
            for event in &staged {
                ledger.apply(&mut guard, event);
            }
            Ok::<(), EngineError>(())
        });
        task.await
            .map_err(|e| EngineError::Storage(format!("commit task failed: {e}")))?
    }
}

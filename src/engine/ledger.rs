use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedPartition = Arc<RwLock<Partition>>;

/// Reservation ledger: one locked partition per facility/date, plus a
/// reservation id → partition index.
pub struct Ledger {
    partitions: DashMap<PartitionKey, SharedPartition>,
    index: DashMap<Ulid, PartitionKey>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            index: DashMap::new(),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn get_partition(&self, key: &PartitionKey) -> Option<SharedPartition> {
        self.partitions.get(key).map(|e| e.value().clone())
    }

    pub fn partition_or_create(&self, key: &PartitionKey) -> SharedPartition {
        self.partitions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Partition::new(key.clone()))))
            .clone()
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self.partitions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Which partition holds a reservation (cancelled ones included).
    pub fn locate(&self, id: &Ulid) -> Option<PartitionKey> {
        self.index.get(id).map(|e| e.value().clone())
    }

    /// Apply one committed event. The caller holds the partition write lock.
    pub fn apply(&self, p: &mut Partition, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                if reservation.is_active() {
                    p.occupancy = p.occupancy.saturating_add(1);
                }
                self.index.insert(reservation.id, reservation.key());
                p.insert_reservation(reservation.clone());
            }
            Event::ReservationConfirmed { id, .. } => {
                if let Some(r) = p.get_mut(id)
                    && r.status == ReservationStatus::Pending
                {
                    r.status = ReservationStatus::Confirmed;
                }
            }
            Event::ReservationCancelled { id, .. } => {
                if let Some(r) = p.get_mut(id)
                    && r.is_active()
                {
                    r.status = ReservationStatus::Cancelled;
                    p.occupancy = p.occupancy.saturating_sub(1);
                }
            }
        }
    }

    /// Rebuild from a replayed log. We are the sole owner of every lock here,
    /// so `try_write` cannot fail; it is used instead of `blocking_write`
    /// because replay may run inside the runtime.
    pub fn replay(&self, events: &[Event]) {
        for event in events {
            let partition = self.partition_or_create(&event.key());
            if let Ok(mut guard) = partition.try_write() {
                self.apply(&mut guard, event);
            }
        }
        for entry in self.partitions.iter() {
            if let Ok(mut guard) = entry.value().try_write() {
                guard.recount();
            }
        }
    }

    /// Minimal event list that recreates the current ledger, statuses included.
    pub async fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for key in self.partition_keys() {
            let Some(partition) = self.get_partition(&key) else { continue };
            let guard = partition.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }
        events
    }

    /// Restore every advisory counter from the ledger.
    pub async fn recount_all(&self) {
        let partitions: Vec<SharedPartition> =
            self.partitions.iter().map(|e| e.value().clone()).collect();
        for partition in partitions {
            partition.write().await.recount();
        }
    }
}

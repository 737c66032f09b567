use std::time::Instant;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{bucket_loads, full_buckets, hour_buckets};
use super::{Engine, EngineError};

/// Narrowing for `list_reservations`. Empty filter means everything visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub facility_id: Option<FacilityId>,
    pub date: Option<NaiveDate>,
    pub include_cancelled: bool,
}

impl ReservationFilter {
    fn admits_key(&self, key: &PartitionKey) -> bool {
        self.facility_id.as_ref().is_none_or(|f| *f == key.facility_id)
            && self.date.is_none_or(|d| d == key.date)
    }
}

impl Engine {
    async fn facility_or_missing(&self, id: &FacilityId) -> Result<Facility, EngineError> {
        self.catalog
            .facility(id)
            .await
            .ok_or_else(|| EngineError::FacilityNotFound(id.clone()))
    }

    /// Hourly buckets that are already full for one facility and date.
    /// Never creates a partition.
    pub async fn availability(&self, facility_id: &FacilityId, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let started = Instant::now();
        let facility = self.facility_or_missing(facility_id).await?;
        let buckets = hour_buckets(self.config.open_hour, self.config.close_hour);
        let key = PartitionKey::new(facility_id.clone(), date);
        let full = match self.ledger.get_partition(&key) {
            Some(partition) => {
                let guard = partition.read().await;
                full_buckets(Some(&guard), &buckets, facility.max_capacity)
            }
            None => full_buckets(None, &buckets, facility.max_capacity),
        };
        metrics::histogram!(observability::OPERATION_DURATION_SECONDS, "op" => "availability")
            .record(started.elapsed().as_secs_f64());
        Ok(full)
    }

    /// Per-bucket load with counts, for the availability grid.
    pub async fn bucket_loads(&self, facility_id: &FacilityId, date: NaiveDate) -> Result<Vec<BucketInfo>, EngineError> {
        let facility = self.facility_or_missing(facility_id).await?;
        let buckets = hour_buckets(self.config.open_hour, self.config.close_hour);
        let key = PartitionKey::new(facility_id.clone(), date);
        Ok(match self.ledger.get_partition(&key) {
            Some(partition) => {
                let guard = partition.read().await;
                bucket_loads(Some(&guard), &buckets, facility.max_capacity)
            }
            None => bucket_loads(None, &buckets, facility.max_capacity),
        })
    }

    /// Any reservation by id, cancelled ones included.
    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let key = self.ledger.locate(id)?;
        let partition = self.ledger.get_partition(&key)?;
        let guard = partition.read().await;
        guard.get(id).cloned()
    }

    /// Reservations visible to `actor`: all of them for admins, only their
    /// own for everyone else. Newest first, ties broken by id.
    pub async fn list_reservations(&self, actor: &Actor, filter: &ReservationFilter) -> Vec<Reservation> {
        let started = Instant::now();
        let mut out = Vec::new();
        for key in self.ledger.partition_keys() {
            if !filter.admits_key(&key) {
                continue;
            }
            let Some(partition) = self.ledger.get_partition(&key) else { continue };
            let guard = partition.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| filter.include_cancelled || r.is_active())
                    .filter(|r| actor.is_admin() || r.owner == actor.user_id)
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        out.truncate(MAX_LIST_ROWS);
        metrics::histogram!(observability::OPERATION_DURATION_SECONDS, "op" => "list")
            .record(started.elapsed().as_secs_f64());
        out
    }

    /// Every catalog facility with its advisory occupancy on `date`.
    pub async fn facility_overview(&self, date: NaiveDate) -> Vec<FacilitySummary> {
        let mut out = Vec::new();
        for facility in self.catalog.facilities().await {
            let key = PartitionKey::new(facility.id.clone(), date);
            let occupancy = match self.ledger.get_partition(&key) {
                Some(partition) => partition.read().await.occupancy,
                None => 0,
            };
            out.push(FacilitySummary {
                facility,
                date,
                occupancy,
            });
        }
        out
    }
}

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::Notice;
use crate::observability;

use super::admission::{check_capacity, check_duplicate, check_facility, check_room, validate_request};
use super::{Engine, EngineError};

/// Input to `create_reservation`. Times are milliseconds since local midnight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub facility_id: FacilityId,
    pub date: NaiveDate,
    pub start: Ms,
    pub end: Ms,
    /// Requester display label; the actor's profile name when absent.
    pub label: Option<String>,
    /// Overrides `EngineConfig::admission_timeout`.
    pub timeout: Option<Duration>,
}

impl ReservationRequest {
    pub fn new(facility_id: FacilityId, date: NaiveDate, start: Ms, end: Ms) -> Self {
        Self {
            facility_id,
            date,
            start,
            end,
            label: None,
            timeout: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn record(op: &'static str, started: Instant, result: &Result<Reservation, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(observability::RESERVATIONS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(observability::OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}

impl Engine {
    /// Admit a new pending reservation if the facility has room for it over
    /// the whole requested interval.
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        req: ReservationRequest,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.admit(actor, req).await;
        record("create", started, &result);
        if let Ok(reservation) = &result {
            info!(
                "reservation {} admitted for {} at {} on {} {}",
                reservation.id, reservation.owner, reservation.facility_id, reservation.date, reservation.span
            );
            self.dispatch(Notice::ReservationCreated(reservation.clone()));
        }
        result
    }

    async fn admit(&self, actor: &Actor, req: ReservationRequest) -> Result<Reservation, EngineError> {
        let span = validate_request(&req)?;
        let deadline = req
            .timeout
            .or(self.config.admission_timeout)
            .map(|t| Instant::now() + t);

        let facility = check_facility(self.catalog.facility(&req.facility_id).await, &req.facility_id)?;
        let key = PartitionKey::new(req.facility_id, req.date);

        let mut txn = self.begin(&key, deadline).await?;
        let partition = txn.partition();
        check_room(partition)?;
        check_duplicate(partition, &actor.user_id, span.start)?;
        check_capacity(partition, &span, facility.max_capacity)?;

        let reservation = Reservation {
            id: Ulid::new(),
            owner: actor.user_id.clone(),
            requester_name: req.label.unwrap_or_else(|| actor.name.clone()),
            facility_id: key.facility_id.clone(),
            date: key.date,
            span,
            status: ReservationStatus::Pending,
            created_at: now_ms(),
        };
        txn.stage(Event::ReservationCreated {
            reservation: reservation.clone(),
        });
        self.commit(txn).await?;
        Ok(reservation)
    }

    /// Withdraw an active reservation. Owner or admin only. The record stays
    /// as `Cancelled`; a second cancel reports `NotFound`.
    pub async fn cancel_reservation(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.withdraw(actor, id).await;
        record("cancel", started, &result);
        if let Ok(reservation) = &result {
            info!("reservation {} cancelled by {}", reservation.id, actor.user_id);
        }
        result
    }

    async fn withdraw(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let key = self.ledger.locate(&id).ok_or(EngineError::NotFound(id))?;
        let mut txn = self.begin(&key, None).await?;
        let current = txn
            .partition()
            .get(&id)
            .filter(|r| r.is_active())
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if current.owner != actor.user_id && !actor.is_admin() {
            return Err(EngineError::Unauthorized("only the owner or an admin may cancel"));
        }

        txn.stage(Event::ReservationCancelled {
            id,
            key,
            cancelled_by: actor.user_id.clone(),
        });
        self.commit(txn).await?;
        Ok(Reservation {
            status: ReservationStatus::Cancelled,
            ..current
        })
    }

    /// Move a pending reservation to confirmed. Admins only. Approving an
    /// already confirmed reservation succeeds without writing anything.
    pub async fn approve_reservation(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.confirm(actor, id).await;
        record("approve", started, &result);
        if let Ok(reservation) = &result {
            info!("reservation {} approved by {}", reservation.id, actor.user_id);
        }
        result
    }

    async fn confirm(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized("approval requires an admin"));
        }
        let key = self.ledger.locate(&id).ok_or(EngineError::NotFound(id))?;
        let mut txn = self.begin(&key, None).await?;
        let current = txn
            .partition()
            .get(&id)
            .filter(|r| r.is_active())
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if current.status == ReservationStatus::Confirmed {
            debug!("reservation {id} already confirmed");
            return Ok(current);
        }

        txn.stage(Event::ReservationConfirmed { id, key });
        self.commit(txn).await?;
        let confirmed = Reservation {
            status: ReservationStatus::Confirmed,
            ..current
        };
        self.dispatch(Notice::ReservationApproved(confirmed.clone()));
        Ok(confirmed)
    }

    /// Load pre-built reservations such as sample data, one transaction
    /// each. Seeds that duplicate an existing reservation or no longer fit
    /// are skipped. Returns how many were added.
    pub async fn restore_reservations(&self, seeds: Vec<Reservation>) -> Result<usize, EngineError> {
        let mut added = 0;
        for seed in seeds {
            let Some(facility) = self.catalog.facility(&seed.facility_id).await else {
                warn!("skipping sample reservation for unknown facility {}", seed.facility_id);
                continue;
            };
            let mut txn = self.begin(&seed.key(), None).await?;
            let partition = txn.partition();
            if check_duplicate(partition, &seed.owner, seed.span.start).is_err() {
                debug!("sample reservation for {} already present", seed.owner);
                continue;
            }
            if let Err(e) = check_capacity(partition, &seed.span, facility.max_capacity) {
                warn!("skipping sample reservation {}: {e}", seed.id);
                continue;
            }
            txn.stage(Event::ReservationCreated { reservation: seed });
            self.commit(txn).await?;
            added += 1;
        }
        Ok(added)
    }
}

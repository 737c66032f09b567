use crate::limits::*;
use crate::model::*;

use super::mutations::ReservationRequest;
use super::EngineError;

/// Shape checks that need no store access.
pub(crate) fn validate_request(req: &ReservationRequest) -> Result<Span, EngineError> {
    let span = Span::try_new(req.start, req.end).ok_or(EngineError::InvalidInterval {
        start: req.start,
        end: req.end,
    })?;
    if span.start < 0 || span.end > DAY_MS {
        return Err(EngineError::Validation("times must fall within the booking day"));
    }
    if req.facility_id.as_str().is_empty() || req.facility_id.as_str().len() > MAX_ID_LEN {
        return Err(EngineError::Validation("facility id missing or too long"));
    }
    if let Some(label) = &req.label
        && label.len() > MAX_LABEL_LEN
    {
        return Err(EngineError::Validation("label too long"));
    }
    Ok(span)
}

pub(crate) fn check_facility(
    facility: Option<Facility>,
    id: &FacilityId,
) -> Result<Facility, EngineError> {
    let facility = facility.ok_or_else(|| EngineError::FacilityNotFound(id.clone()))?;
    if !facility.is_open() {
        return Err(EngineError::FacilityUnavailable(id.clone()));
    }
    Ok(facility)
}

pub(crate) fn check_room(partition: &Partition) -> Result<(), EngineError> {
    if partition.active_count() as usize >= MAX_ACTIVE_PER_PARTITION {
        return Err(EngineError::Validation("too many reservations for this facility and date"));
    }
    Ok(())
}

/// Same requester, same slot start, still active. Overlap alone is not a
/// duplicate, so a user may retry a different slot.
pub(crate) fn check_duplicate(
    partition: &Partition,
    owner: &UserId,
    start: Ms,
) -> Result<(), EngineError> {
    match partition
        .active()
        .find(|r| r.owner == *owner && r.span.start == start)
    {
        Some(existing) => Err(EngineError::DuplicateRequest(existing.id)),
        None => Ok(()),
    }
}

/// Authoritative capacity check against exact intervals.
pub(crate) fn check_capacity(
    partition: &Partition,
    span: &Span,
    capacity: u32,
) -> Result<(), EngineError> {
    if partition.active_overlap_count(span) >= capacity {
        return Err(EngineError::CapacityExceeded {
            capacity,
            span: *span,
        });
    }
    Ok(())
}

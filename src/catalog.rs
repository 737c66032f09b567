//! Facility catalog accessor.
//!
//! The engine only reads facilities. Editing happens through the
//! administrative methods on [`InMemoryCatalog`], outside the reservation core.

use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

#[async_trait]
pub trait FacilityCatalog: Send + Sync {
    async fn facility(&self, id: &FacilityId) -> Option<Facility>;

    /// All facilities, ordered by id.
    async fn facilities(&self) -> Vec<Facility>;
}

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
    TooMany,
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "catalog io error: {e}"),
            CatalogError::Parse(e) => write!(f, "catalog parse error: {e}"),
            CatalogError::Invalid(e) => write!(f, "invalid facility: {e}"),
            CatalogError::TooMany => write!(f, "too many facilities"),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<std::io::Error> for CatalogError {
    fn from(e: std::io::Error) -> Self {
        CatalogError::Io(e)
    }
}

pub struct InMemoryCatalog {
    facilities: DashMap<FacilityId, Facility>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            facilities: DashMap::new(),
        }
    }

    /// The stock campus facilities.
    pub fn seeded() -> Self {
        let catalog = Self::new();
        for facility in default_facilities() {
            // Seed data is known-good.
            let _ = catalog.upsert(facility);
        }
        catalog
    }

    /// Load a JSON array of facilities.
    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let facilities: Vec<Facility> =
            serde_json::from_str(raw).map_err(|e| CatalogError::Parse(e.to_string()))?;
        let catalog = Self::new();
        for facility in facilities {
            catalog.upsert(facility)?;
        }
        Ok(catalog)
    }

    pub fn upsert(&self, facility: Facility) -> Result<(), CatalogError> {
        validate_facility(&facility)?;
        if !self.facilities.contains_key(&facility.id) && self.facilities.len() >= MAX_FACILITIES {
            return Err(CatalogError::TooMany);
        }
        self.facilities.insert(facility.id.clone(), facility);
        Ok(())
    }

    /// Returns false if the facility does not exist.
    pub fn set_status(&self, id: &FacilityId, status: FacilityStatus) -> bool {
        match self.facilities.get_mut(id) {
            Some(mut f) => {
                f.status = status;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.facilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facilities.is_empty()
    }
}

#[async_trait]
impl FacilityCatalog for InMemoryCatalog {
    async fn facility(&self, id: &FacilityId) -> Option<Facility> {
        self.facilities.get(id).map(|e| e.value().clone())
    }

    async fn facilities(&self) -> Vec<Facility> {
        let mut all: Vec<Facility> = self.facilities.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

fn validate_facility(f: &Facility) -> Result<(), CatalogError> {
    if f.id.as_str().is_empty() || f.id.as_str().len() > MAX_ID_LEN {
        return Err(CatalogError::Invalid(format!("bad id length: {:?}", f.id.as_str())));
    }
    if f.name.len() > MAX_LABEL_LEN {
        return Err(CatalogError::Invalid(format!("{}: name too long", f.id)));
    }
    if f.max_capacity == 0 {
        return Err(CatalogError::Invalid(format!("{}: maxCapacity must be positive", f.id)));
    }
    Ok(())
}

fn default_facilities() -> Vec<Facility> {
    let make = |id: &str, name: &str, kind: &str, cap: u32, status: FacilityStatus| Facility {
        id: FacilityId::new(id),
        name: name.into(),
        kind: kind.into(),
        label: None,
        max_capacity: cap,
        status,
    };
    vec![
        make("badminton-a", "Badminton Court A", "badminton", 4, FacilityStatus::Open),
        make("badminton-b", "Badminton Court B", "badminton", 4, FacilityStatus::Open),
        make("pool", "Swimming Pool", "pool", 30, FacilityStatus::Open),
        make("football", "Football Field", "field", 22, FacilityStatus::Maintenance),
        make("discussion-1", "Discussion Room 1", "room", 6, FacilityStatus::Open),
    ]
}

/// Two confirmed sample reservations that go with the stock facilities.
/// Loaded through `Engine::restore_reservations`.
pub fn sample_reservations() -> Vec<Reservation> {
    let make = |owner: &str, facility: &str, (y, m, d): (i32, u32, u32), hour: Ms| {
        NaiveDate::from_ymd_opt(y, m, d).map(|date| Reservation {
            id: Ulid::new(),
            owner: UserId::new(owner),
            requester_name: owner.into(),
            facility_id: FacilityId::new(facility),
            date,
            span: Span::new(hour * HOUR_MS, (hour + 1) * HOUR_MS),
            status: ReservationStatus::Confirmed,
            created_at: now_ms(),
        })
    };
    [
        make("SW01081337", "badminton-a", (2023, 12, 5), 10),
        make("SW02299881", "pool", (2023, 12, 6), 14),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_catalog_has_stock_facilities() {
        let catalog = InMemoryCatalog::seeded();
        assert_eq!(catalog.len(), 5);
        let football = catalog.facility(&FacilityId::new("football")).await.unwrap();
        assert_eq!(football.status, FacilityStatus::Maintenance);
        let ids: Vec<String> = catalog
            .facilities()
            .await
            .into_iter()
            .map(|f| f.id.0)
            .collect();
        assert_eq!(ids, vec!["badminton-a", "badminton-b", "discussion-1", "football", "pool"]);
    }

    #[tokio::test]
    async fn sample_reservations_point_at_stock_facilities() {
        let catalog = InMemoryCatalog::seeded();
        let samples = sample_reservations();
        assert_eq!(samples.len(), 2);
        for r in &samples {
            assert!(catalog.facility(&r.facility_id).await.is_some());
            assert_eq!(r.status, ReservationStatus::Confirmed);
            assert_eq!(r.span.duration_ms(), HOUR_MS);
        }
    }

    #[tokio::test]
    async fn set_status_changes_visible_record() {
        let catalog = InMemoryCatalog::seeded();
        let pool = FacilityId::new("pool");
        assert!(catalog.set_status(&pool, FacilityStatus::Closed));
        assert!(!catalog.facility(&pool).await.unwrap().is_open());
        assert!(!catalog.set_status(&FacilityId::new("nope"), FacilityStatus::Open));
    }

    #[test]
    fn json_rejects_zero_capacity() {
        let raw = r#"[{"id":"x","name":"X","maxCapacity":0,"status":"Open"}]"#;
        assert!(matches!(InMemoryCatalog::from_json(raw), Err(CatalogError::Invalid(_))));
    }

    #[test]
    fn json_rejects_missing_fields() {
        let raw = r#"[{"id":"x","name":"X"}]"#;
        assert!(matches!(InMemoryCatalog::from_json(raw), Err(CatalogError::Parse(_))));
    }

    #[tokio::test]
    async fn json_loads_valid_facilities() {
        let raw = r#"[{"id":"gym","name":"Gym","type":"gym","label":"Main Gym","maxCapacity":12,"status":"Open"}]"#;
        let catalog = InMemoryCatalog::from_json(raw).unwrap();
        let gym = catalog.facility(&FacilityId::new("gym")).await.unwrap();
        assert_eq!(gym.display_label(), "Main Gym");
        assert_eq!(gym.max_capacity, 12);
    }
}

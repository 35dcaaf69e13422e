//! Storage seams. `db::PgStore` is the production backend,
//! `memory::MemoryStore` backs tests and local runs.
//!
//! Metric writes are conditional: a write whose `last_update` is older than
//! the stored one is dropped and reported as `Ok(false)`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::geo::GeoPoint;
use crate::help::HelpRequest;
use crate::models::{
    Boundary, CustomSymptom, Metric, NudgeKind, Poi, Profile, ProfilePoi, Report, ReportKind,
};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_profile(&self, id: &str) -> EngineResult<Option<Profile>>;
    async fn upsert_profile(&self, profile: &Profile) -> EngineResult<()>;
    async fn update_profile_location(&self, id: &str, location: GeoPoint) -> EngineResult<()>;
    async fn update_profile_metric(&self, id: &str, metric: &Metric) -> EngineResult<bool>;
    async fn record_nudge(&self, id: &str, kind: NudgeKind, at: i64) -> EngineResult<()>;
    async fn list_profile_ids(&self) -> EngineResult<Vec<String>>;

    async fn get_poi(&self, id: &str) -> EngineResult<Option<Poi>>;
    async fn insert_poi(&self, poi: &Poi) -> EngineResult<()>;
    async fn update_poi_metric(&self, id: &str, metric: &Metric) -> EngineResult<bool>;
    async fn list_poi_ids(&self) -> EngineResult<Vec<String>>;

    async fn add_profile_poi(&self, profile_id: &str, poi_id: &str, alias: &str) -> EngineResult<()>;
    /// Every subscription to `poi_id` with the subscriber's snapshot.
    async fn profile_pois(&self, poi_id: &str) -> EngineResult<Vec<ProfilePoi>>;
    async fn update_profile_poi_metric(
        &self,
        profile_id: &str,
        poi_id: &str,
        metric: &Metric,
    ) -> EngineResult<()>;

    async fn upsert_custom_symptom(&self, symptom: &CustomSymptom) -> EngineResult<()>;
    async fn custom_symptoms(&self, ids: &[String]) -> EngineResult<Vec<CustomSymptom>>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// `Conflict` when the profile already reported at `ts`.
    async fn insert_report(&self, report: &Report) -> EngineResult<()>;

    /// Reports of `kind` within `radius_m` of `center` with `from <= ts < to`.
    async fn reports_near(
        &self,
        kind: ReportKind,
        center: GeoPoint,
        radius_m: f64,
        from: i64,
        to: i64,
    ) -> EngineResult<Vec<Report>>;

    async fn reports_of(
        &self,
        kind: ReportKind,
        profile_id: &str,
        from: i64,
        to: i64,
    ) -> EngineResult<Vec<Report>>;

    async fn latest_report(&self, kind: ReportKind, profile_id: &str) -> EngineResult<Option<Report>>;

    /// Profiles with a known location, nearest first, as `(id, meters)`.
    async fn nearest_profiles(
        &self,
        center: GeoPoint,
        radius_m: Option<f64>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(String, f64)>>;
}

#[async_trait]
pub trait ConfirmSource: Send + Sync {
    async fn boundaries(&self) -> EngineResult<Vec<Boundary>>;

    /// Last `days` daily counts for a county, oldest first.
    async fn confirmed_daily(
        &self,
        country: &str,
        state: &str,
        county: &str,
        days: usize,
    ) -> EngineResult<Vec<i64>>;
}

#[async_trait]
pub trait HelpStore: Send + Sync {
    /// Inserts `help` unless its requester has a pending request created at
    /// or after `since`, in which case `Conflict`. Check and insert are atomic.
    async fn insert_help(&self, help: &HelpRequest, since: i64) -> EngineResult<()>;
    async fn get_help(&self, id: Uuid) -> EngineResult<Option<HelpRequest>>;
    /// Marks a pending request accepted; false if it was no longer pending.
    async fn accept_help(&self, id: Uuid, helper: &str, at: i64) -> EngineResult<bool>;
}

//! In-process backend for every storage seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::geo::GeoPoint;
use crate::help::{HelpRequest, HelpState};
use crate::models::{
    Boundary, CustomSymptom, Metric, NudgeKind, Poi, Profile, ProfilePoi, Report, ReportKind,
};
use crate::store::{ConfirmSource, HelpStore, ReportStore, StateStore};

#[derive(Default)]
struct Inner {
    profiles: HashMap<String, Profile>,
    pois: HashMap<String, Poi>,
    // (profile_id, poi_id) -> (alias, snapshot)
    subscriptions: HashMap<(String, String), (String, Metric)>,
    reports: Vec<Report>,
    symptoms: HashMap<String, CustomSymptom>,
    boundaries: Vec<Boundary>,
    // (country, state, county) -> daily counts, oldest first
    confirmed: HashMap<(String, String, String), Vec<i64>>,
    help: HashMap<Uuid, HelpRequest>,
}

#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_boundary(&self, boundary: Boundary) {
        self.inner.write().boundaries.push(boundary);
    }

    pub fn set_confirmed(&self, country: &str, state: &str, county: &str, daily: Vec<i64>) {
        self.inner.write().confirmed.insert(
            (country.to_string(), state.to_string(), county.to_string()),
            daily,
        );
    }

    /// Overwrites a profile's metric without the `last_update` guard.
    pub fn put_profile_metric(&self, id: &str, metric: Metric) {
        if let Some(profile) = self.inner.write().profiles.get_mut(id) {
            profile.metric = metric;
        }
    }

    pub fn put_profile_poi_metric(&self, profile_id: &str, poi_id: &str, metric: Metric) {
        let key = (profile_id.to_string(), poi_id.to_string());
        if let Some(entry) = self.inner.write().subscriptions.get_mut(&key) {
            entry.1 = metric;
        }
    }

    pub fn report_count(&self) -> usize {
        self.inner.read().reports.len()
    }
}

fn check_metric_order(current: &Metric, next: &Metric) -> bool {
    next.last_update >= current.last_update
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_profile(&self, id: &str) -> EngineResult<Option<Profile>> {
        Ok(self.inner.read().profiles.get(id).cloned())
    }

    async fn upsert_profile(&self, profile: &Profile) -> EngineResult<()> {
        let mut guard = self.inner.write();
        let duplicate_number = guard
            .profiles
            .values()
            .any(|p| p.account_number == profile.account_number && p.id != profile.id);
        if duplicate_number {
            return Err(EngineError::Conflict(format!(
                "account number {} already registered",
                profile.account_number
            )));
        }
        match guard.profiles.get_mut(&profile.id) {
            Some(existing) => {
                existing.account_number = profile.account_number.clone();
                existing.timezone = profile.timezone.clone();
                if profile.location.is_some() {
                    existing.location = profile.location;
                }
            }
            None => {
                guard.profiles.insert(profile.id.clone(), profile.clone());
            }
        }
        Ok(())
    }

    async fn update_profile_location(&self, id: &str, location: GeoPoint) -> EngineResult<()> {
        let mut guard = self.inner.write();
        let profile = guard
            .profiles
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("profile {id}")))?;
        profile.location = Some(location);
        Ok(())
    }

    async fn update_profile_metric(&self, id: &str, metric: &Metric) -> EngineResult<bool> {
        let mut guard = self.inner.write();
        let profile = guard
            .profiles
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("profile {id}")))?;
        if !check_metric_order(&profile.metric, metric) {
            return Ok(false);
        }
        profile.metric = metric.clone();
        Ok(true)
    }

    async fn record_nudge(&self, id: &str, kind: NudgeKind, at: i64) -> EngineResult<()> {
        let mut guard = self.inner.write();
        let profile = guard
            .profiles
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("profile {id}")))?;
        profile.nudge_time.record(kind, at);
        Ok(())
    }

    async fn list_profile_ids(&self) -> EngineResult<Vec<String>> {
        let mut ids: Vec<String> = self.inner.read().profiles.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_poi(&self, id: &str) -> EngineResult<Option<Poi>> {
        Ok(self.inner.read().pois.get(id).cloned())
    }

    async fn insert_poi(&self, poi: &Poi) -> EngineResult<()> {
        let mut guard = self.inner.write();
        if guard.pois.contains_key(&poi.id) {
            return Err(EngineError::Conflict(format!("poi {} exists", poi.id)));
        }
        guard.pois.insert(poi.id.clone(), poi.clone());
        Ok(())
    }

    async fn update_poi_metric(&self, id: &str, metric: &Metric) -> EngineResult<bool> {
        let mut guard = self.inner.write();
        let poi = guard
            .pois
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("poi {id}")))?;
        if !check_metric_order(&poi.metric, metric) {
            return Ok(false);
        }
        poi.metric = metric.clone();
        Ok(true)
    }

    async fn list_poi_ids(&self) -> EngineResult<Vec<String>> {
        let mut ids: Vec<String> = self.inner.read().pois.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn add_profile_poi(&self, profile_id: &str, poi_id: &str, alias: &str) -> EngineResult<()> {
        let mut guard = self.inner.write();
        if !guard.profiles.contains_key(profile_id) {
            return Err(EngineError::not_found(format!("profile {profile_id}")));
        }
        let metric = guard
            .pois
            .get(poi_id)
            .map(|poi| poi.metric.clone())
            .ok_or_else(|| EngineError::not_found(format!("poi {poi_id}")))?;
        guard
            .subscriptions
            .entry((profile_id.to_string(), poi_id.to_string()))
            .and_modify(|entry| entry.0 = alias.to_string())
            .or_insert_with(|| (alias.to_string(), metric));
        Ok(())
    }

    async fn profile_pois(&self, poi_id: &str) -> EngineResult<Vec<ProfilePoi>> {
        let guard = self.inner.read();
        let mut out: Vec<ProfilePoi> = guard
            .subscriptions
            .iter()
            .filter(|((_, poi), _)| poi == poi_id)
            .filter_map(|((profile_id, poi), (alias, metric))| {
                guard.profiles.get(profile_id).map(|profile| ProfilePoi {
                    profile_id: profile_id.clone(),
                    account_number: profile.account_number.clone(),
                    timezone: profile.timezone.clone(),
                    poi_id: poi.clone(),
                    alias: alias.clone(),
                    metric: metric.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        Ok(out)
    }

    async fn update_profile_poi_metric(
        &self,
        profile_id: &str,
        poi_id: &str,
        metric: &Metric,
    ) -> EngineResult<()> {
        let key = (profile_id.to_string(), poi_id.to_string());
        let mut guard = self.inner.write();
        let entry = guard
            .subscriptions
            .get_mut(&key)
            .ok_or_else(|| EngineError::not_found(format!("poi {poi_id} of profile {profile_id}")))?;
        if check_metric_order(&entry.1, metric) {
            entry.1 = metric.clone();
        }
        Ok(())
    }

    async fn upsert_custom_symptom(&self, symptom: &CustomSymptom) -> EngineResult<()> {
        self.inner
            .write()
            .symptoms
            .insert(symptom.id.clone(), symptom.clone());
        Ok(())
    }

    async fn custom_symptoms(&self, ids: &[String]) -> EngineResult<Vec<CustomSymptom>> {
        let guard = self.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| guard.symptoms.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn insert_report(&self, report: &Report) -> EngineResult<()> {
        let mut guard = self.inner.write();
        let duplicate = guard.reports.iter().any(|r| {
            r.kind == report.kind && r.profile_id == report.profile_id && r.ts == report.ts
        });
        if duplicate {
            return Err(EngineError::Conflict(format!(
                "{} report of {} at {} exists",
                report.kind.as_str(),
                report.profile_id,
                report.ts
            )));
        }
        guard.reports.push(report.clone());
        Ok(())
    }

    async fn reports_near(
        &self,
        kind: ReportKind,
        center: GeoPoint,
        radius_m: f64,
        from: i64,
        to: i64,
    ) -> EngineResult<Vec<Report>> {
        Ok(self
            .inner
            .read()
            .reports
            .iter()
            .filter(|r| r.kind == kind && r.ts >= from && r.ts < to)
            .filter(|r| r.location.within(&center, radius_m))
            .cloned()
            .collect())
    }

    async fn reports_of(
        &self,
        kind: ReportKind,
        profile_id: &str,
        from: i64,
        to: i64,
    ) -> EngineResult<Vec<Report>> {
        Ok(self
            .inner
            .read()
            .reports
            .iter()
            .filter(|r| r.kind == kind && r.profile_id == profile_id && r.ts >= from && r.ts < to)
            .cloned()
            .collect())
    }

    async fn latest_report(&self, kind: ReportKind, profile_id: &str) -> EngineResult<Option<Report>> {
        Ok(self
            .inner
            .read()
            .reports
            .iter()
            .filter(|r| r.kind == kind && r.profile_id == profile_id)
            .max_by_key(|r| r.ts)
            .cloned())
    }

    async fn nearest_profiles(
        &self,
        center: GeoPoint,
        radius_m: Option<f64>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(String, f64)>> {
        let guard = self.inner.read();
        let mut found: Vec<(String, f64)> = guard
            .profiles
            .values()
            .filter_map(|p| p.location.map(|loc| (p.id.clone(), loc.distance_to(&center))))
            .filter(|(_, d)| radius_m.map_or(true, |r| *d <= r))
            .collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

#[async_trait]
impl ConfirmSource for MemoryStore {
    async fn boundaries(&self) -> EngineResult<Vec<Boundary>> {
        Ok(self.inner.read().boundaries.clone())
    }

    async fn confirmed_daily(
        &self,
        country: &str,
        state: &str,
        county: &str,
        days: usize,
    ) -> EngineResult<Vec<i64>> {
        let key = (country.to_string(), state.to_string(), county.to_string());
        let guard = self.inner.read();
        let daily = guard.confirmed.get(&key).cloned().unwrap_or_default();
        let skip = daily.len().saturating_sub(days);
        Ok(daily[skip..].to_vec())
    }
}

#[async_trait]
impl HelpStore for MemoryStore {
    async fn insert_help(&self, help: &HelpRequest, since: i64) -> EngineResult<()> {
        let mut guard = self.inner.write();
        let open = guard.help.values().any(|h| {
            h.requester == help.requester && h.state == HelpState::Pending && h.created_at >= since
        });
        if open {
            return Err(EngineError::Conflict(format!(
                "profile {} already has a pending help request",
                help.requester
            )));
        }
        guard.help.insert(help.id, help.clone());
        Ok(())
    }

    async fn get_help(&self, id: Uuid) -> EngineResult<Option<HelpRequest>> {
        Ok(self.inner.read().help.get(&id).cloned())
    }

    async fn accept_help(&self, id: Uuid, helper: &str, at: i64) -> EngineResult<bool> {
        let mut guard = self.inner.write();
        let Some(help) = guard.help.get_mut(&id) else {
            return Ok(false);
        };
        if help.state != HelpState::Pending {
            return Ok(false);
        }
        help.state = HelpState::Accepted;
        help.helper = Some(helper.to_string());
        help.accepted_at = Some(at);
        Ok(true)
    }
}

//! Spatial aggregation over the report streams.
//!
//! A report is nearby iff its great-circle distance to the center is at most
//! the radius. Community windows are UTC days, personal windows are days in
//! the profile's timezone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::clock::{self, DAY};
use crate::error::{EngineError, EngineResult};
use crate::geo::GeoPoint;
use crate::models::{Boundary, ProfilePoi, ReportKind};
use crate::scoring::{Snapshot, CONFIRM_WINDOW};
use crate::store::{ConfirmSource, ReportStore, StateStore};

/// How `nearest_profiles` bounds its answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proximity {
    Within(f64),
    Nearest(usize),
    NearestWithin(f64, usize),
}

pub struct Aggregator {
    reports: Arc<dyn ReportStore>,
    state: Arc<dyn StateStore>,
    confirm: Arc<dyn ConfirmSource>,
    boundaries: RwLock<Option<Arc<Vec<Boundary>>>>,
}

fn check_query(radius_m: f64, from: i64, to: i64) -> EngineResult<()> {
    if !(radius_m >= 0.0) {
        return Err(EngineError::invalid(format!("negative radius: {radius_m}")));
    }
    if from >= to {
        return Err(EngineError::invalid(format!("empty window: [{from}, {to})")));
    }
    Ok(())
}

impl Aggregator {
    pub fn new(
        reports: Arc<dyn ReportStore>,
        state: Arc<dyn StateStore>,
        confirm: Arc<dyn ConfirmSource>,
    ) -> Self {
        Self {
            reports,
            state,
            confirm,
            boundaries: RwLock::new(None),
        }
    }

    /// Distinct profiles reporting `kind` nearby in `[from, to)`.
    pub async fn count_reports(
        &self,
        kind: ReportKind,
        center: GeoPoint,
        radius_m: f64,
        from: i64,
        to: i64,
    ) -> EngineResult<i64> {
        check_query(radius_m, from, to)?;
        let reports = self.reports.reports_near(kind, center, radius_m, from, to).await?;
        let profiles: BTreeSet<&str> = reports.iter().map(|r| r.profile_id.as_str()).collect();
        Ok(profiles.len() as i64)
    }

    /// Item id -> occurrences across all nearby reports in `[from, to)`.
    pub async fn distribution(
        &self,
        kind: ReportKind,
        center: GeoPoint,
        radius_m: f64,
        from: i64,
        to: i64,
    ) -> EngineResult<BTreeMap<String, i64>> {
        check_query(radius_m, from, to)?;
        let reports = self.reports.reports_near(kind, center, radius_m, from, to).await?;
        let mut counts = BTreeMap::new();
        for report in &reports {
            for item in report.items() {
                *counts.entry(item.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Distinct reporting profiles during the UTC day containing `day`.
    pub async fn nearby_user_count(
        &self,
        kind: ReportKind,
        center: GeoPoint,
        radius_m: f64,
        day: i64,
    ) -> EngineResult<i64> {
        let (from, to) = clock::day_window(day, clock::utc_offset());
        self.count_reports(kind, center, radius_m, from, to).await
    }

    pub async fn nearest_profiles(
        &self,
        center: GeoPoint,
        proximity: Proximity,
    ) -> EngineResult<Vec<String>> {
        let (radius, limit) = match proximity {
            Proximity::Within(r) => (Some(r), None),
            Proximity::Nearest(n) => (None, Some(n)),
            Proximity::NearestWithin(r, n) => (Some(r), Some(n)),
        };
        if let Some(r) = radius {
            if !(r >= 0.0) {
                return Err(EngineError::invalid(format!("negative radius: {r}")));
            }
        }
        let found = self.reports.nearest_profiles(center, radius, limit).await?;
        Ok(found.into_iter().map(|(id, _)| id).collect())
    }

    pub async fn profiles_by_poi(&self, poi_id: &str) -> EngineResult<Vec<ProfilePoi>> {
        if self.state.get_poi(poi_id).await?.is_none() {
            return Err(EngineError::not_found(format!("poi {poi_id}")));
        }
        self.state.profile_pois(poi_id).await
    }

    /// `(today, yesterday)` report counts of one profile over its local days.
    pub async fn personal_report_count(
        &self,
        kind: ReportKind,
        profile_id: &str,
        now: i64,
    ) -> EngineResult<(i64, i64)> {
        let profile = self
            .state
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("profile {profile_id}")))?;
        let tz = clock::parse_timezone(&profile.timezone)?;
        let (today_start, today_end) = clock::day_window(now, tz);
        let reports = self
            .reports
            .reports_of(kind, profile_id, today_start - DAY, today_end)
            .await?;
        let today = reports.iter().filter(|r| r.ts >= today_start).count() as i64;
        let yesterday = reports.len() as i64 - today;
        Ok((today, yesterday))
    }

    /// Daily confirmed cases of the county containing `point`; empty when the
    /// point is outside every known boundary.
    pub async fn confirmed_series(&self, point: GeoPoint) -> EngineResult<Vec<i64>> {
        let boundaries = self.load_boundaries().await?;
        let Some(boundary) = boundaries.iter().find(|b| b.geometry.contains(&point)) else {
            return Ok(Vec::new());
        };
        self.confirm
            .confirmed_daily(&boundary.country, &boundary.state, &boundary.county, CONFIRM_WINDOW)
            .await
    }

    async fn load_boundaries(&self) -> EngineResult<Arc<Vec<Boundary>>> {
        if let Some(cached) = self.boundaries.read().clone() {
            return Ok(cached);
        }
        let loaded = Arc::new(self.confirm.boundaries().await?);
        *self.boundaries.write() = Some(loaded.clone());
        tracing::debug!(count = loaded.len(), "boundaries loaded");
        Ok(loaded)
    }

    /// Everything the scoring kernel needs for one location at `now`.
    pub async fn snapshot(&self, center: GeoPoint, radius_m: f64, now: i64) -> EngineResult<Snapshot> {
        let (today, tomorrow) = clock::day_window(now, clock::utc_offset());
        let yesterday = today - DAY;

        Ok(Snapshot {
            symptoms_today: self
                .distribution(ReportKind::Symptom, center, radius_m, today, tomorrow)
                .await?,
            symptoms_yesterday: self
                .distribution(ReportKind::Symptom, center, radius_m, yesterday, today)
                .await?,
            symptom_users_today: self
                .count_reports(ReportKind::Symptom, center, radius_m, today, tomorrow)
                .await?,
            symptom_users_yesterday: self
                .count_reports(ReportKind::Symptom, center, radius_m, yesterday, today)
                .await?,
            behaviors_today: self
                .distribution(ReportKind::Behavior, center, radius_m, today, tomorrow)
                .await?,
            behavior_users_today: self
                .count_reports(ReportKind::Behavior, center, radius_m, today, tomorrow)
                .await?,
            behavior_users_yesterday: self
                .count_reports(ReportKind::Behavior, center, radius_m, yesterday, today)
                .await?,
            confirmed_daily: self.confirmed_series(center).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HOUR;
    use crate::geo::Geometry;
    use crate::memory::MemoryStore;
    use crate::models::{Profile, Report};

    // 2026-03-10T00:00:00Z
    const MIDNIGHT: i64 = 1_773_100_800;

    fn aggregator(store: &MemoryStore) -> Aggregator {
        let store = Arc::new(store.clone());
        Aggregator::new(store.clone(), store.clone(), store)
    }

    fn symptom(profile: &str, ts: i64, lat: f64, items: &[&str]) -> Report {
        Report {
            profile_id: profile.to_string(),
            kind: ReportKind::Symptom,
            location: GeoPoint::new(lat, 121.5),
            ts,
            official: items.iter().map(|s| s.to_string()).collect(),
            customized: vec![],
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let reports = [
            symptom("a", MIDNIGHT + HOUR, 25.0, &["fever", "cough"]),
            symptom("a", MIDNIGHT + 2 * HOUR, 25.0, &["cough"]),
            symptom("b", MIDNIGHT + 3 * HOUR, 25.001, &["cough"]),
            // outside radius
            symptom("c", MIDNIGHT + 3 * HOUR, 26.0, &["fever"]),
            // yesterday
            symptom("d", MIDNIGHT - HOUR, 25.0, &["fever"]),
        ];
        for report in &reports {
            store.insert_report(report).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn counts_deduplicate_profiles_distribution_does_not() {
        let store = seeded().await;
        let agg = aggregator(&store);
        let center = GeoPoint::new(25.0, 121.5);
        let (from, to) = (MIDNIGHT, MIDNIGHT + DAY);

        let users = agg.count_reports(ReportKind::Symptom, center, 1_000.0, from, to).await.unwrap();
        assert_eq!(users, 2);

        let dist = agg.distribution(ReportKind::Symptom, center, 1_000.0, from, to).await.unwrap();
        assert_eq!(dist.get("cough"), Some(&3));
        assert_eq!(dist.get("fever"), Some(&1));

        let day_users = agg
            .nearby_user_count(ReportKind::Symptom, center, 1_000.0, MIDNIGHT + 12 * HOUR)
            .await
            .unwrap();
        assert_eq!(day_users, 2);
    }

    #[tokio::test]
    async fn empty_window_gives_empty_mapping() {
        let store = MemoryStore::new();
        let agg = aggregator(&store);
        let dist = agg
            .distribution(ReportKind::Behavior, GeoPoint::new(0.0, 0.0), 10.0, 0, 10)
            .await
            .unwrap();
        assert!(dist.is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_queries() {
        let store = MemoryStore::new();
        let agg = aggregator(&store);
        let center = GeoPoint::new(0.0, 0.0);
        let err = agg.count_reports(ReportKind::Symptom, center, -1.0, 0, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        let err = agg.distribution(ReportKind::Symptom, center, 1.0, 10, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        let err = agg.nearest_profiles(center, Proximity::Within(-5.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn personal_counts_follow_local_day() {
        let store = seeded().await;
        // GMT+8: local day of 2026-03-10 starts at 2026-03-09T16:00Z
        store.upsert_profile(&Profile::new("a", "acct-a", "GMT+8")).await.unwrap();
        store
            .insert_report(&symptom("a", MIDNIGHT - 10 * HOUR, 25.0, &["nasal"]))
            .await
            .unwrap();
        let agg = aggregator(&store);
        let (today, yesterday) = agg
            .personal_report_count(ReportKind::Symptom, "a", MIDNIGHT + 4 * HOUR)
            .await
            .unwrap();
        assert_eq!((today, yesterday), (2, 1));

        let err = agg
            .personal_report_count(ReportKind::Symptom, "ghost", MIDNIGHT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn confirmed_series_resolves_boundary() {
        let store = MemoryStore::new();
        store.add_boundary(Boundary {
            country: "Taiwan".into(),
            state: "".into(),
            county: "Taipei".into(),
            geometry: Geometry::Polygon(vec![vec![
                [121.0, 24.5],
                [122.0, 24.5],
                [122.0, 25.5],
                [121.0, 25.5],
                [121.0, 24.5],
            ]]),
        });
        store.set_confirmed("Taiwan", "", "Taipei", vec![9, 8, 7, 6, 5, 4, 3, 2, 1]);
        let agg = aggregator(&store);

        let inside = agg.confirmed_series(GeoPoint::new(25.0, 121.5)).await.unwrap();
        assert_eq!(inside, vec![7, 6, 5, 4, 3, 2, 1]);
        let outside = agg.confirmed_series(GeoPoint::new(35.0, 139.0)).await.unwrap();
        assert!(outside.is_empty());
    }

    #[tokio::test]
    async fn profiles_by_missing_poi_is_not_found() {
        let store = MemoryStore::new();
        let agg = aggregator(&store);
        let err = agg.profiles_by_poi("deadbeef").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}

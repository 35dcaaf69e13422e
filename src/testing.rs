//! Shared test fixtures.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::ManualClock;
use crate::engine::{Engine, Settings, Stores};
use crate::error::{EngineError, EngineResult, ErrorReporter};
use crate::geo::GeoPoint;
use crate::i18n::{Catalog, Lang};
use crate::memory::MemoryStore;
use crate::models::{CustomSymptom, Metric, NudgeKind, Poi, Profile, ProfilePoi, Report, ReportKind};
use crate::notify::{Filter, NotificationType, Notifier, PushError, PushRequest, PushSink};
use crate::runtime::{ActivityOptions, RetryPolicy, Runtime};
use crate::store::{ReportStore, StateStore};

/// 2026-03-10T02:00:00Z, 10:00 in GMT+8.
pub const TS: i64 = 1_773_108_000;

#[derive(Default)]
struct SinkState {
    requests: Vec<PushRequest>,
    failures: HashMap<usize, PushError>,
    attempts: usize,
}

/// Push sink that records every delivered request.
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<SinkState>,
}

impl RecordingSink {
    /// Makes the `index`-th call (zero based) fail with `err`.
    pub fn fail_call(&self, index: usize, err: PushError) {
        self.state.lock().failures.insert(index, err);
    }

    pub fn requests(&self) -> Vec<PushRequest> {
        self.state.lock().requests.clone()
    }

    pub fn of_type(&self, kind: NotificationType) -> Vec<PushRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.data.notification_type == kind)
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.requests.clear();
        state.attempts = 0;
    }
}

#[async_trait]
impl PushSink for RecordingSink {
    async fn send(&self, request: &PushRequest) -> Result<(), PushError> {
        let mut state = self.state.lock();
        let index = state.attempts;
        state.attempts += 1;
        if let Some(err) = state.failures.remove(&index) {
            return Err(err);
        }
        state.requests.push(request.clone());
        Ok(())
    }
}

/// Account numbers a request is addressed to.
pub fn targets(request: &PushRequest) -> Vec<String> {
    request
        .filters
        .iter()
        .filter_map(|f| match f {
            Filter::Tag { value, .. } => Some(value.clone()),
            Filter::Operator { .. } => None,
        })
        .collect()
}

#[derive(Default)]
pub struct RecordingReporter {
    errors: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, workflow_id: &str, err: &EngineError) {
        self.errors
            .lock()
            .push((workflow_id.to_string(), err.to_string()));
    }
}

struct Fault {
    op: &'static str,
    id: Option<String>,
    remaining: usize,
}

/// State store over a `MemoryStore` that fails chosen calls with a store
/// error before they touch the data.
#[derive(Clone)]
pub struct FlakyStore {
    inner: MemoryStore,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    /// Fails the next `times` calls of `op`, only those about `id` if given.
    pub fn fail(&self, op: &'static str, id: Option<&str>, times: usize) {
        self.faults.lock().push(Fault {
            op,
            id: id.map(str::to_string),
            remaining: times,
        });
    }

    fn check(&self, op: &'static str, id: &str) -> EngineResult<()> {
        let mut faults = self.faults.lock();
        let hit = faults.iter_mut().find(|f| {
            f.op == op && f.remaining > 0 && f.id.as_deref().map_or(true, |want| want == id)
        });
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                Err(EngineError::Store(format!("{op}({id}) unavailable")))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get_profile(&self, id: &str) -> EngineResult<Option<Profile>> {
        self.inner.get_profile(id).await
    }

    async fn upsert_profile(&self, profile: &Profile) -> EngineResult<()> {
        self.inner.upsert_profile(profile).await
    }

    async fn update_profile_location(&self, id: &str, location: GeoPoint) -> EngineResult<()> {
        self.inner.update_profile_location(id, location).await
    }

    async fn update_profile_metric(&self, id: &str, metric: &Metric) -> EngineResult<bool> {
        self.check("update_profile_metric", id)?;
        self.inner.update_profile_metric(id, metric).await
    }

    async fn record_nudge(&self, id: &str, kind: NudgeKind, at: i64) -> EngineResult<()> {
        self.check("record_nudge", id)?;
        self.inner.record_nudge(id, kind, at).await
    }

    async fn list_profile_ids(&self) -> EngineResult<Vec<String>> {
        self.inner.list_profile_ids().await
    }

    async fn get_poi(&self, id: &str) -> EngineResult<Option<Poi>> {
        self.inner.get_poi(id).await
    }

    async fn insert_poi(&self, poi: &Poi) -> EngineResult<()> {
        self.inner.insert_poi(poi).await
    }

    async fn update_poi_metric(&self, id: &str, metric: &Metric) -> EngineResult<bool> {
        self.check("update_poi_metric", id)?;
        self.inner.update_poi_metric(id, metric).await
    }

    async fn list_poi_ids(&self) -> EngineResult<Vec<String>> {
        self.inner.list_poi_ids().await
    }

    async fn add_profile_poi(&self, profile_id: &str, poi_id: &str, alias: &str) -> EngineResult<()> {
        self.inner.add_profile_poi(profile_id, poi_id, alias).await
    }

    async fn profile_pois(&self, poi_id: &str) -> EngineResult<Vec<ProfilePoi>> {
        self.inner.profile_pois(poi_id).await
    }

    async fn update_profile_poi_metric(
        &self,
        profile_id: &str,
        poi_id: &str,
        metric: &Metric,
    ) -> EngineResult<()> {
        self.check("update_profile_poi_metric", profile_id)?;
        self.inner
            .update_profile_poi_metric(profile_id, poi_id, metric)
            .await
    }

    async fn upsert_custom_symptom(&self, symptom: &CustomSymptom) -> EngineResult<()> {
        self.inner.upsert_custom_symptom(symptom).await
    }

    async fn custom_symptoms(&self, ids: &[String]) -> EngineResult<Vec<CustomSymptom>> {
        self.check("custom_symptoms", "")?;
        self.inner.custom_symptoms(ids).await
    }
}

pub fn catalog() -> Catalog {
    Catalog::from_yaml(&[
        (Lang::En, include_str!("../i18n/en.yaml")),
        (Lang::ZhHant, include_str!("../i18n/zh_tw.yaml")),
    ])
    .expect("shipped catalog parses")
}

pub struct Fixture {
    pub engine: Arc<Engine>,
    pub store: MemoryStore,
    /// The engine's state seam; inject failures here.
    pub faults: FlakyStore,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub reporter: Arc<RecordingReporter>,
}

pub fn fixture(now: i64) -> Fixture {
    let store = MemoryStore::new();
    let faults = FlakyStore::new(store.clone());
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(now));
    let reporter = Arc::new(RecordingReporter::default());
    let options = ActivityOptions {
        retry: RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        },
        ..ActivityOptions::default()
    };
    let runtime = Runtime::new(4, options, reporter.clone());
    let shared = Arc::new(store.clone());
    let stores = Stores {
        state: Arc::new(faults.clone()),
        reports: shared.clone(),
        confirm: shared.clone(),
        help: shared,
    };
    let engine = Engine::new(
        stores,
        Notifier::new(sink.clone()),
        Arc::new(catalog()),
        clock.clone(),
        Settings::default(),
        runtime,
    );
    Fixture {
        engine,
        store,
        faults,
        sink,
        clock,
        reporter,
    }
}

impl Fixture {
    /// Profile `id` with account number `acct-{id}` located at `(lat, lng)`.
    pub async fn profile_at(&self, id: &str, tz: &str, lat: f64, lng: f64) -> Profile {
        let mut profile = Profile::new(id, &format!("acct-{id}"), tz);
        profile.location = Some(GeoPoint::new(lat, lng));
        self.store.upsert_profile(&profile).await.unwrap();
        profile
    }

    pub async fn report(&self, kind: ReportKind, profile: &str, ts: i64, at: GeoPoint, items: &[&str]) {
        let (official, customized): (Vec<String>, Vec<String>) = items
            .iter()
            .map(|s| s.to_string())
            .partition(|id| match kind {
                ReportKind::Symptom => self.engine.kernel().symptoms.is_official(id),
                _ => self.engine.kernel().behaviors.is_official(id),
            });
        self.store
            .insert_report(&Report {
                profile_id: profile.to_string(),
                kind,
                location: at,
                ts,
                official,
                customized,
            })
            .await
            .unwrap();
    }
}

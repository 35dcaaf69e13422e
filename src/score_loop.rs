//! Score loops. `account-state-{id}` is the only writer of a profile's
//! metric and `poi-state-{id}` the only writer of a POI's metric and of the
//! per-profile snapshots of that POI.
//!
//! Each iteration parks on `timer(5m)` or the check signal, then runs
//! calculate, refresh, spike enrichment and dispatch, and continues-as-new
//! whatever happened.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::FixedOffset;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::geo::GeoPoint;
use crate::models::{Metric, NudgeKind, NudgeTime, SymptomDescriptor, SymptomDetail};
use crate::notify::{NotificationType, Payload};
use crate::nudge::{
    NotifyBehaviorFollowUpOnEnteringSymptomSpikeAreaWorkflow, NotifyBehaviorOnEnteringRiskAreaWorkflow,
    NotifySymptomSpikeWorkflow, SpikeNotice,
};
use crate::runtime::{IdReusePolicy, Next, Selected, StartOutcome, Workflow, WorkflowContext};
use crate::scoring::{band, band_changed, Band};

pub const ACCOUNT_CHECK_SIGNAL: &str = "accountCheckSignal";
pub const POI_CHECK_SIGNAL: &str = "poiCheckSignal";
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Refreshes closer together than this are dropped as duplicates.
pub const MIN_REFRESH_GAP: i64 = 5;

pub fn account_workflow_id(profile_id: &str) -> String {
    format!("account-state-{profile_id}")
}

pub fn poi_workflow_id(poi_id: &str) -> String {
    format!("poi-state-{poi_id}")
}

/// Whether `next` is news to someone holding `prev`: the list strictly
/// grew, or the last spike was announced on an earlier local day.
pub fn is_spike(prev: &SymptomDetail, next: &BTreeSet<String>, now: i64, tz: FixedOffset) -> bool {
    if next.is_empty() {
        return false;
    }
    let extends = next.len() > prev.last_spike_list.len() && next.is_superset(&prev.last_spike_list);
    let stale = clock::local_midnight(prev.last_spike_update, tz) < clock::local_midnight(now, tz);
    extends || stale
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountChanges {
    pub state_changed: bool,
    pub spike: bool,
    pub report_risk_area: bool,
    pub remind_good_behavior: bool,
}

impl AccountChanges {
    pub fn is_empty(&self) -> bool {
        *self == AccountChanges::default()
    }
}

/// Classifies an account refresh and stamps `next` with its spike time.
/// A metric that was never computed has no band to leave.
pub fn classify_account(
    prev: &Metric,
    nudges: &NudgeTime,
    next: &mut Metric,
    tz: FixedOffset,
    spike_cooldown: i64,
) -> AccountChanges {
    let now = next.last_update;
    let baseline = prev.last_update > 0;

    let spike = is_spike(
        &prev.details.symptoms,
        &next.details.symptoms.last_spike_list,
        now,
        tz,
    );
    next.details.symptoms.last_spike_update = if spike {
        now
    } else {
        prev.details.symptoms.last_spike_update
    };

    AccountChanges {
        state_changed: baseline && band_changed(prev.score, next.score),
        spike,
        report_risk_area: baseline && band(prev.score) == Band::Green && band(next.score) != Band::Green,
        remind_good_behavior: next.symptom_delta > 0.0
            && next.symptom_delta > prev.symptom_delta
            && now - nudges.last(NudgeKind::BehaviorOnSymptomSpike) > spike_cooldown,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRefresh {
    pub account_number: String,
    pub metric: Metric,
    pub changes: AccountChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub profile_id: String,
    pub account_number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoiRefresh {
    pub metric: Metric,
    /// Account numbers whose snapshot of the POI changed band.
    pub state_changed: Vec<String>,
    pub spikes: Vec<Subscriber>,
}

impl Engine {
    /// Candidate metric at `location`, without persisting anything.
    pub async fn score_at(&self, location: GeoPoint) -> EngineResult<Metric> {
        let now = self.now();
        let snapshot = self
            .aggregator
            .snapshot(location, self.settings.cohort_radius_m, now)
            .await?;
        Ok(self.kernel.metric(&snapshot, now))
    }

    pub async fn calculate_account(&self, profile_id: &str) -> EngineResult<Metric> {
        let profile = self.profile(profile_id).await?;
        let location = profile.location.ok_or(EngineError::InvalidLocation)?;
        if self.now() - profile.metric.last_update < MIN_REFRESH_GAP {
            return Err(EngineError::TooFrequent);
        }
        self.score_at(location).await
    }

    pub async fn refresh_account(&self, profile_id: &str, mut metric: Metric) -> EngineResult<AccountRefresh> {
        let profile = self.profile(profile_id).await?;
        let tz = clock::parse_timezone(&profile.timezone)?;
        let changes = classify_account(
            &profile.metric,
            &profile.nudge_time,
            &mut metric,
            tz,
            self.settings.spike_behavior_cooldown,
        );
        if !self.state.update_profile_metric(profile_id, &metric).await? {
            tracing::debug!(account = profile_id, "stale metric write dropped");
        }
        tracing::debug!(
            account = profile_id,
            prev_score = profile.metric.score,
            score = metric.score,
            ?changes,
            "account refreshed"
        );
        Ok(AccountRefresh {
            account_number: profile.account_number,
            metric,
            changes,
        })
    }

    pub async fn calculate_poi(&self, poi_id: &str) -> EngineResult<Metric> {
        let poi = self
            .state
            .get_poi(poi_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("poi {poi_id}")))?;
        if self.now() - poi.metric.last_update < MIN_REFRESH_GAP {
            return Err(EngineError::TooFrequent);
        }
        self.score_at(poi.location).await
    }

    /// Classifies every subscriber on its own previous snapshot, persists
    /// the POI metric, then mirrors it into each snapshot. A subscriber whose
    /// snapshot write fails is left out of the returned transitions; its old
    /// snapshot stays, so the next refresh classifies it again.
    pub async fn refresh_poi(&self, poi_id: &str, mut metric: Metric) -> EngineResult<PoiRefresh> {
        let poi = self
            .state
            .get_poi(poi_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("poi {poi_id}")))?;
        let now = metric.last_update;
        let spike_list = metric.details.symptoms.last_spike_list.clone();

        metric.details.symptoms.last_spike_update =
            if is_spike(&poi.metric.details.symptoms, &spike_list, now, clock::utc_offset()) {
                now
            } else {
                poi.metric.details.symptoms.last_spike_update
            };

        let mut mirrors = Vec::new();
        for sub in self.aggregator.profiles_by_poi(poi_id).await? {
            let tz = match clock::parse_timezone(&sub.timezone) {
                Ok(tz) => tz,
                Err(err) => {
                    tracing::warn!(account = %sub.profile_id, error = %err, "bad timezone, using UTC");
                    clock::utc_offset()
                }
            };
            let mut mirror = metric.clone();
            let spike = is_spike(&sub.metric.details.symptoms, &spike_list, now, tz);
            mirror.details.symptoms.last_spike_update = if spike {
                now
            } else {
                sub.metric.details.symptoms.last_spike_update
            };
            let changed = sub.metric.last_update > 0 && band_changed(sub.metric.score, mirror.score);
            mirrors.push((sub, mirror, changed, spike));
        }

        if !self.state.update_poi_metric(poi_id, &metric).await? {
            tracing::debug!(poi_id, "stale metric write dropped");
        }

        let mut refresh = PoiRefresh::default();
        let mut failed = Vec::new();
        for (sub, mirror, changed, spike) in mirrors {
            if let Err(err) = self
                .state
                .update_profile_poi_metric(&sub.profile_id, poi_id, &mirror)
                .await
            {
                tracing::warn!(poi_id, account = %sub.profile_id, error = %err, "snapshot write failed");
                failed.push((sub.profile_id, err));
                continue;
            }
            if changed {
                refresh.state_changed.push(sub.account_number.clone());
            }
            if spike {
                refresh.spikes.push(Subscriber {
                    profile_id: sub.profile_id,
                    account_number: sub.account_number,
                });
            }
        }

        tracing::debug!(
            poi_id,
            score = metric.score,
            state_changed = refresh.state_changed.len(),
            spikes = refresh.spikes.len(),
            failed = failed.len(),
            "poi refreshed"
        );
        refresh.metric = metric;
        Ok(refresh)
    }

    pub async fn notify_risk_level_changed(&self, recipients: &[String], poi_id: Option<&str>) -> EngineResult<()> {
        let payload = Payload::new(NotificationType::RiskLevelChanged).with_poi(poi_id);
        self.notifier
            .notify_accounts(recipients, &self.settings.risk_template_id, &payload)
            .await
    }

    pub fn start_account_loop(self: &Arc<Self>, profile_id: &str) -> EngineResult<StartOutcome> {
        let workflow = Arc::new(AccountStateWorkflow {
            engine: self.clone(),
        });
        self.runtime.start_workflow(
            &account_workflow_id(profile_id),
            workflow,
            profile_id.to_string(),
            IdReusePolicy::AllowDuplicate,
        )
    }

    /// Starts the account loop if needed and asks it for an immediate refresh.
    pub fn check_account(self: &Arc<Self>, profile_id: &str) -> EngineResult<()> {
        self.start_account_loop(profile_id)?;
        self.runtime
            .signal(&account_workflow_id(profile_id), ACCOUNT_CHECK_SIGNAL, &())
    }

    pub fn start_poi_loop(self: &Arc<Self>, poi_id: &str) -> EngineResult<StartOutcome> {
        let workflow = Arc::new(PoiStateWorkflow {
            engine: self.clone(),
        });
        self.runtime.start_workflow(
            &poi_workflow_id(poi_id),
            workflow,
            poi_id.to_string(),
            IdReusePolicy::AllowDuplicate,
        )
    }

    pub fn check_poi(self: &Arc<Self>, poi_id: &str) -> EngineResult<()> {
        self.start_poi_loop(poi_id)?;
        self.runtime.signal(&poi_workflow_id(poi_id), POI_CHECK_SIGNAL, &())
    }
}

async fn describe_spikes(
    engine: &Arc<Engine>,
    ctx: &WorkflowContext,
    metric: &Metric,
) -> EngineResult<Vec<SymptomDescriptor>> {
    let ids: Vec<String> = metric.details.symptoms.last_spike_list.iter().cloned().collect();
    let engine = engine.clone();
    ctx.execute_activity("GetSymptomsFromSpikeList", &ids, move |_hb, ids: Vec<String>| {
        let engine = engine.clone();
        async move { engine.describe_symptoms(&ids).await }
    })
    .await
}

/// Starts a one-shot child under a per-transition id so a retried dispatch
/// cannot notify twice.
fn start_once<W: Workflow>(ctx: &WorkflowContext, id: String, workflow: W, input: W::Input) -> EngineResult<()> {
    let outcome = ctx.start_child(&id, Arc::new(workflow), input, IdReusePolicy::RejectDuplicate)?;
    tracing::debug!(workflow_id = ctx.id(), child = %id, ?outcome, "child workflow");
    Ok(())
}

pub struct AccountStateWorkflow {
    engine: Arc<Engine>,
}

impl AccountStateWorkflow {
    async fn step(&self, ctx: &mut WorkflowContext, profile_id: &str) -> EngineResult<()> {
        let engine = self.engine.clone();
        let candidate: Metric = ctx
            .execute_activity(
                "CalculateAccountState",
                &profile_id.to_string(),
                move |_hb, id: String| {
                    let engine = engine.clone();
                    async move { engine.calculate_account(&id).await }
                },
            )
            .await?;

        let engine = self.engine.clone();
        let refresh: AccountRefresh = ctx
            .execute_activity(
                "RefreshAccountState",
                &(profile_id.to_string(), candidate),
                move |_hb, (id, metric): (String, Metric)| {
                    let engine = engine.clone();
                    async move { engine.refresh_account(&id, metric).await }
                },
            )
            .await?;
        if refresh.changes.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        if refresh.changes.state_changed {
            let engine = self.engine.clone();
            let sent = ctx
                .execute_activity(
                    "NotifyRiskLevelChanged",
                    &vec![refresh.account_number.clone()],
                    move |_hb, recipients: Vec<String>| {
                        let engine = engine.clone();
                        async move { engine.notify_risk_level_changed(&recipients, None).await }
                    },
                )
                .await;
            if let Err(err) = sent {
                first_error.get_or_insert(err);
            }
        }

        // The metric is stored by now: no dispatch may stop the ones after it.
        let at = refresh.metric.last_update;
        if refresh.changes.spike {
            let started = match describe_spikes(&self.engine, ctx, &refresh.metric).await {
                Ok(symptoms) => start_once(
                    ctx,
                    format!("notify-symptom-spike-{profile_id}-{at}"),
                    NotifySymptomSpikeWorkflow::new(self.engine.clone()),
                    SpikeNotice {
                        profile_id: profile_id.to_string(),
                        account_number: refresh.account_number.clone(),
                        poi_id: None,
                        symptoms,
                    },
                ),
                Err(err) => Err(err),
            };
            if let Err(err) = started {
                first_error.get_or_insert(err);
            }
        }
        if refresh.changes.report_risk_area {
            let started = start_once(
                ctx,
                format!("notify-behavior-risk-area-{profile_id}-{at}"),
                NotifyBehaviorOnEnteringRiskAreaWorkflow::new(self.engine.clone()),
                profile_id.to_string(),
            );
            if let Err(err) = started {
                first_error.get_or_insert(err);
            }
        }
        if refresh.changes.remind_good_behavior {
            let started = start_once(
                ctx,
                format!("notify-behavior-symptom-spike-{profile_id}-{at}"),
                NotifyBehaviorFollowUpOnEnteringSymptomSpikeAreaWorkflow::new(self.engine.clone()),
                profile_id.to_string(),
            );
            if let Err(err) = started {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Workflow for AccountStateWorkflow {
    type Input = String;

    fn name(&self) -> &'static str {
        "AccountStateWorkflow"
    }

    async fn run(&self, ctx: &mut WorkflowContext, profile_id: String) -> EngineResult<Next<String>> {
        let woke = ctx
            .select_timer_or_signal::<IgnoredAny>(ACCOUNT_CHECK_SIGNAL, REFRESH_INTERVAL)
            .await?;
        tracing::debug!(
            workflow_id = ctx.id(),
            run = ctx.run_number(),
            signalled = matches!(woke, Selected::Signal(_)),
            "account state iteration"
        );
        if let Err(err) = self.step(ctx, &profile_id).await {
            self.engine.step_failed(ctx.id(), &err);
        }
        Ok(Next::ContinueAsNew(profile_id))
    }
}

pub struct PoiStateWorkflow {
    engine: Arc<Engine>,
}

impl PoiStateWorkflow {
    async fn step(&self, ctx: &mut WorkflowContext, poi_id: &str) -> EngineResult<()> {
        let engine = self.engine.clone();
        let candidate: Metric = ctx
            .execute_activity("CalculatePOIState", &poi_id.to_string(), move |_hb, id: String| {
                let engine = engine.clone();
                async move { engine.calculate_poi(&id).await }
            })
            .await?;

        let engine = self.engine.clone();
        let refresh: PoiRefresh = ctx
            .execute_activity(
                "RefreshPOIState",
                &(poi_id.to_string(), candidate),
                move |hb, (id, metric): (String, Metric)| {
                    let engine = engine.clone();
                    async move {
                        hb.beat();
                        engine.refresh_poi(&id, metric).await
                    }
                },
            )
            .await?;

        let mut first_error = None;
        if !refresh.state_changed.is_empty() {
            let engine = self.engine.clone();
            let sent = ctx
                .execute_activity(
                    "NotifyRiskLevelChanged",
                    &(refresh.state_changed.clone(), poi_id.to_string()),
                    move |_hb, (recipients, poi): (Vec<String>, String)| {
                        let engine = engine.clone();
                        async move { engine.notify_risk_level_changed(&recipients, Some(&poi)).await }
                    },
                )
                .await;
            if let Err(err) = sent {
                first_error.get_or_insert(err);
            }
        }

        if !refresh.spikes.is_empty() {
            match describe_spikes(&self.engine, ctx, &refresh.metric).await {
                Ok(symptoms) => {
                    let at = refresh.metric.last_update;
                    for sub in &refresh.spikes {
                        let started = start_once(
                            ctx,
                            format!("notify-symptom-spike-{}-{poi_id}-{at}", sub.profile_id),
                            NotifySymptomSpikeWorkflow::new(self.engine.clone()),
                            SpikeNotice {
                                profile_id: sub.profile_id.clone(),
                                account_number: sub.account_number.clone(),
                                poi_id: Some(poi_id.to_string()),
                                symptoms: symptoms.clone(),
                            },
                        );
                        if let Err(err) = started {
                            first_error.get_or_insert(err);
                        }
                    }
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Workflow for PoiStateWorkflow {
    type Input = String;

    fn name(&self) -> &'static str {
        "POIStateWorkflow"
    }

    async fn run(&self, ctx: &mut WorkflowContext, poi_id: String) -> EngineResult<Next<String>> {
        let woke = ctx
            .select_timer_or_signal::<IgnoredAny>(POI_CHECK_SIGNAL, REFRESH_INTERVAL)
            .await?;
        tracing::debug!(
            workflow_id = ctx.id(),
            run = ctx.run_number(),
            signalled = matches!(woke, Selected::Signal(_)),
            "poi state iteration"
        );
        if let Err(err) = self.step(ctx, &poi_id).await {
            self.engine.step_failed(ctx.id(), &err);
        }
        Ok(Next::ContinueAsNew(poi_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DAY, HOUR, MINUTE};
    use crate::models::{Poi, ReportKind};
    use crate::notify::PushError;
    use crate::runtime::WorkflowStatus;
    use crate::store::StateStore;
    use crate::testing::{fixture, targets, Fixture, TS};
    use tracing_test::traced_test;

    fn tz8() -> FixedOffset {
        clock::parse_timezone("GMT+8").unwrap()
    }

    fn metric(score: f64, last_update: i64) -> Metric {
        Metric {
            score,
            last_update,
            ..Metric::default()
        }
    }

    fn spikes(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    /// Long enough for every activity retry, well short of the next timer.
    async fn settle_retries() {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }

    async fn poi(fx: &Fixture, id: &str, place: GeoPoint) {
        fx.store
            .insert_poi(&Poi {
                id: id.into(),
                location: place,
                address: "market".into(),
                metric: Metric::default(),
            })
            .await
            .unwrap();
    }

    async fn subscriber(fx: &Fixture, id: &str, snapshot: Metric) {
        fx.profile_at(id, "GMT+8", 25.05, 121.60).await;
        fx.store.add_profile_poi(id, "p1", "market").await.unwrap();
        fx.store.put_profile_poi_metric(id, "p1", snapshot);
    }

    #[test]
    fn band_crossing_marks_state_change() {
        let prev = metric(77.0, TS - 600);
        let mut next = metric(55.0, TS);
        let changes = classify_account(&prev, &NudgeTime::default(), &mut next, tz8(), 90 * MINUTE);
        assert!(changes.state_changed);
        assert!(changes.report_risk_area);
        assert!(!changes.spike);
        assert!(!changes.remind_good_behavior);
    }

    #[test]
    fn staying_in_band_changes_nothing() {
        let prev = metric(55.0, TS - 600);
        let mut next = metric(55.0, TS);
        let changes = classify_account(&prev, &NudgeTime::default(), &mut next, tz8(), 90 * MINUTE);
        assert!(changes.is_empty());
        assert_eq!(next.score, 55.0);
    }

    #[test]
    fn first_refresh_has_no_band_to_leave() {
        let prev = Metric::default();
        let mut next = metric(75.0, TS);
        let changes = classify_account(&prev, &NudgeTime::default(), &mut next, tz8(), 90 * MINUTE);
        assert!(!changes.state_changed);
    }

    #[test]
    fn spike_needs_growth_or_a_new_day() {
        let mut prev = SymptomDetail {
            last_spike_list: spikes(&["cough"]),
            last_spike_update: TS - HOUR,
            ..SymptomDetail::default()
        };
        assert!(is_spike(&prev, &spikes(&["cough", "fever"]), TS, tz8()));
        assert!(!is_spike(&prev, &spikes(&["cough"]), TS, tz8()));
        assert!(!is_spike(&prev, &spikes(&["fever"]), TS, tz8()));
        assert!(!is_spike(&prev, &spikes(&[]), TS, tz8()));

        prev.last_spike_update = TS - DAY;
        assert!(is_spike(&prev, &spikes(&["cough"]), TS, tz8()));
    }

    #[test]
    fn spike_time_is_carried_when_nothing_fires() {
        let mut prev = metric(80.0, TS - 600);
        prev.details.symptoms.last_spike_list = spikes(&["cough"]);
        prev.details.symptoms.last_spike_update = TS - HOUR;

        let mut quiet = metric(80.0, TS);
        quiet.details.symptoms.last_spike_list = spikes(&["cough"]);
        classify_account(&prev, &NudgeTime::default(), &mut quiet, tz8(), 90 * MINUTE);
        assert_eq!(quiet.details.symptoms.last_spike_update, TS - HOUR);

        let mut loud = metric(80.0, TS);
        loud.details.symptoms.last_spike_list = spikes(&["cough", "fever"]);
        assert!(classify_account(&prev, &NudgeTime::default(), &mut loud, tz8(), 90 * MINUTE).spike);
        assert_eq!(loud.details.symptoms.last_spike_update, TS);
    }

    #[test]
    fn good_behavior_reminder_respects_cooldown() {
        let mut prev = metric(80.0, TS - 600);
        prev.symptom_delta = 10.0;
        let mut nudges = NudgeTime::default();

        let mut next = metric(80.0, TS);
        next.symptom_delta = 50.0;
        assert!(classify_account(&prev, &nudges, &mut next.clone(), tz8(), 90 * MINUTE).remind_good_behavior);

        nudges.record(NudgeKind::BehaviorOnSymptomSpike, TS - 60 * MINUTE);
        assert!(!classify_account(&prev, &nudges, &mut next.clone(), tz8(), 90 * MINUTE).remind_good_behavior);

        nudges.record(NudgeKind::BehaviorOnSymptomSpike, TS - 91 * MINUTE);
        assert!(classify_account(&prev, &nudges, &mut next.clone(), tz8(), 90 * MINUTE).remind_good_behavior);

        next.symptom_delta = 10.0;
        assert!(!classify_account(&prev, &nudges, &mut next, tz8(), 90 * MINUTE).remind_good_behavior);
    }

    async fn account(fx: &Fixture, prev_score: f64) {
        fx.profile_at("a", "GMT+8", 25.0330, 121.5654).await;
        fx.store.put_profile_metric("a", metric(prev_score, TS - 600));
    }

    #[tokio::test(start_paused = true)]
    async fn band_crossing_notifies_the_account_once() {
        let fx = fixture(TS);
        // an empty neighbourhood scores 75
        account(&fx, 20.0).await;

        fx.engine.check_account("a").unwrap();
        settle().await;

        let sent = fx.sink.of_type(NotificationType::RiskLevelChanged);
        assert_eq!(sent.len(), 1);
        assert_eq!(targets(&sent[0]), vec!["acct-a"]);
        assert_eq!(sent[0].template_id.as_deref(), Some("risk-level-changed"));
        assert_eq!(sent[0].data.poi_id, None);

        let stored = fx.store.get_profile("a").await.unwrap().unwrap();
        assert_eq!(stored.metric.score, 75.0);
        assert_eq!(stored.metric.last_update, TS);
        assert!(fx.reporter.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_snapshot_persists_without_notifying() {
        let fx = fixture(TS);
        account(&fx, 75.0).await;

        fx.engine.check_account("a").unwrap();
        settle().await;

        assert!(fx.sink.requests().is_empty());
        let stored = fx.store.get_profile("a").await.unwrap().unwrap();
        assert_eq!(stored.metric.score, 75.0);
        assert_eq!(stored.metric.last_update, TS);
    }

    #[tokio::test(start_paused = true)]
    async fn too_frequent_signals_write_nothing() {
        let fx = fixture(TS);
        fx.profile_at("a", "GMT+8", 25.0330, 121.5654).await;
        fx.store.put_profile_metric("a", metric(20.0, TS - 2));

        fx.engine.check_account("a").unwrap();
        settle().await;
        fx.clock.advance(1);
        fx.engine.check_account("a").unwrap();
        settle().await;

        assert!(fx.sink.requests().is_empty());
        assert!(fx.reporter.errors().is_empty());
        let stored = fx.store.get_profile("a").await.unwrap().unwrap();
        assert_eq!(stored.metric, metric(20.0, TS - 2));
        assert_eq!(
            fx.engine.runtime().status(&account_workflow_id("a")),
            Some(WorkflowStatus::Running)
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn skipped_iterations_are_logged_not_reported() {
        let fx = fixture(TS);
        fx.profile_at("a", "GMT+8", 25.0330, 121.5654).await;
        fx.store.put_profile_metric("a", metric(20.0, TS - 2));

        let err = fx.engine.calculate_account("a").await.unwrap_err();
        assert!(matches!(err, EngineError::TooFrequent));
        fx.engine.step_failed("account-state-a", &err);

        assert!(logs_contain("TOO_FREQUENT"));
        assert!(fx.reporter.errors().is_empty());
    }

    #[tokio::test]
    async fn missing_location_is_invalid() {
        let fx = fixture(TS);
        fx.store
            .upsert_profile(&crate::models::Profile::new("a", "acct-a", "GMT+8"))
            .await
            .unwrap();
        let err = fx.engine.calculate_account("a").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidLocation));
    }

    #[tokio::test(start_paused = true)]
    async fn poi_spike_reaches_every_subscriber() {
        let fx = fixture(TS);
        let place = GeoPoint::new(25.0330, 121.5654);
        fx.store
            .insert_poi(&Poi {
                id: "p1".into(),
                location: place,
                address: "Taipei 101".into(),
                metric: Metric::default(),
            })
            .await
            .unwrap();

        for id in ["s1", "s2"] {
            fx.profile_at(id, "GMT+8", 25.05, 121.60).await;
            fx.store.add_profile_poi(id, "p1", "office").await.unwrap();
            let mut snapshot = metric(60.0, TS - DAY);
            snapshot.details.symptoms.last_spike_list = spikes(&["cough"]);
            snapshot.details.symptoms.last_spike_update = TS - DAY;
            fx.store.put_profile_poi_metric(id, "p1", snapshot);
        }
        for reporter in ["r1", "r2", "r3"] {
            fx.profile_at(reporter, "GMT+8", 25.0331, 121.5655).await;
            fx.report(ReportKind::Symptom, reporter, TS - 30 * MINUTE, place, &["fever", "cough"])
                .await;
        }

        fx.engine.check_poi("p1").unwrap();
        settle().await;

        assert!(fx.sink.of_type(NotificationType::RiskLevelChanged).is_empty());
        let spike = fx.sink.of_type(NotificationType::AccountSymptomSpike);
        let mut who: Vec<String> = spike.iter().flat_map(targets).collect();
        who.sort();
        assert_eq!(who, vec!["acct-s1", "acct-s2"]);
        assert_eq!(spike[0].data.poi_id.as_deref(), Some("p1"));
        assert_eq!(spike[0].data.symptoms, vec!["cough".to_string(), "fever".to_string()]);
        assert!(spike[0].contents["en"].contains("Fever"), "{:?}", spike[0].contents);

        let poi = fx.store.get_poi("p1").await.unwrap().unwrap();
        assert_eq!(poi.metric.details.symptoms.last_spike_list, spikes(&["cough", "fever"]));
        for sub in fx.store.profile_pois("p1").await.unwrap() {
            assert_eq!(sub.metric.details.symptoms.last_spike_update, TS);
            assert_eq!(sub.metric.score, poi.metric.score);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poi_band_change_is_judged_per_subscriber() {
        let fx = fixture(TS);
        let place = GeoPoint::new(25.0330, 121.5654);
        fx.store
            .insert_poi(&Poi {
                id: "p1".into(),
                location: place,
                address: "market".into(),
                metric: Metric::default(),
            })
            .await
            .unwrap();
        fx.profile_at("red", "GMT+8", 25.05, 121.60).await;
        fx.profile_at("green", "GMT+8", 25.05, 121.60).await;
        fx.store.add_profile_poi("red", "p1", "market").await.unwrap();
        fx.store.add_profile_poi("green", "p1", "market").await.unwrap();
        fx.store.put_profile_poi_metric("red", "p1", metric(20.0, TS - HOUR));
        fx.store.put_profile_poi_metric("green", "p1", metric(80.0, TS - HOUR));

        fx.engine.check_poi("p1").unwrap();
        settle().await;

        let sent = fx.sink.of_type(NotificationType::RiskLevelChanged);
        assert_eq!(sent.len(), 1);
        assert_eq!(targets(&sent[0]), vec!["acct-red"]);
        assert_eq!(sent[0].data.poi_id.as_deref(), Some("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn partly_delivered_band_change_is_not_resent() {
        let fx = fixture(TS);
        poi(&fx, "p1", GeoPoint::new(25.0330, 121.5654)).await;
        for i in 0..150 {
            subscriber(&fx, &format!("s{i}"), metric(20.0, TS - HOUR)).await;
        }
        fx.sink.fail_call(0, PushError::Rejected("503".into()));

        fx.engine.check_poi("p1").unwrap();
        settle_retries().await;

        assert_eq!(fx.sink.attempts(), 2);
        let mut notified: Vec<String> = fx
            .sink
            .of_type(NotificationType::RiskLevelChanged)
            .iter()
            .flat_map(targets)
            .collect();
        let deliveries = notified.len();
        notified.sort();
        notified.dedup();
        assert_eq!(deliveries, 50);
        assert_eq!(notified.len(), deliveries);

        let errors = fx.reporter.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, poi_workflow_id("p1"));
        assert!(errors[0].1.contains("partial delivery"), "{errors:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_snapshot_write_defers_that_subscriber() {
        let fx = fixture(TS);
        poi(&fx, "p1", GeoPoint::new(25.0330, 121.5654)).await;
        subscriber(&fx, "s1", metric(20.0, TS - HOUR)).await;
        subscriber(&fx, "s2", metric(20.0, TS - HOUR)).await;
        fx.faults.fail("update_profile_poi_metric", Some("s1"), 1);

        fx.engine.check_poi("p1").unwrap();
        settle().await;

        let sent = fx.sink.of_type(NotificationType::RiskLevelChanged);
        assert_eq!(sent.len(), 1);
        assert_eq!(targets(&sent[0]), vec!["acct-s2"]);
        let snapshots = fx.store.profile_pois("p1").await.unwrap();
        let s1 = snapshots.iter().find(|s| s.profile_id == "s1").unwrap();
        assert_eq!(s1.metric.score, 20.0);

        fx.clock.advance(MINUTE);
        fx.engine.check_poi("p1").unwrap();
        settle().await;

        let sent = fx.sink.of_type(NotificationType::RiskLevelChanged);
        assert_eq!(sent.len(), 2);
        assert_eq!(targets(&sent[1]), vec!["acct-s1"]);
        assert!(fx.reporter.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_spike_lookup_keeps_other_nudges() {
        let fx = fixture(TS);
        let place = GeoPoint::new(25.0330, 121.5654);
        account(&fx, 75.0).await;
        for reporter in ["r1", "r2", "r3"] {
            fx.profile_at(reporter, "GMT+8", 25.0331, 121.5655).await;
            fx.report(ReportKind::Symptom, reporter, TS - 30 * MINUTE, place, &["fever", "cough"])
                .await;
        }
        fx.faults.fail("custom_symptoms", None, 10);

        fx.engine.check_account("a").unwrap();
        settle_retries().await;

        assert!(fx.sink.of_type(NotificationType::AccountSymptomSpike).is_empty());
        let reminders: Vec<_> = fx
            .sink
            .of_type(NotificationType::BehaviorReportOnRiskArea)
            .into_iter()
            .filter(|r| r.headings["en"] == "Symptoms are rising nearby")
            .collect();
        assert_eq!(reminders.len(), 1);
        assert_eq!(targets(&reminders[0]), vec!["acct-a"]);

        let stored = fx.store.get_profile("a").await.unwrap().unwrap();
        assert_eq!(stored.nudge_time.last(NudgeKind::BehaviorOnSymptomSpike), TS);
        let errors = fx.reporter.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, account_workflow_id("a"));
        assert!(errors[0].1.contains("custom_symptoms"), "{errors:?}");
    }
}

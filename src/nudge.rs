//! Nudges: periodic follow-up loops per account and the one-shot
//! notification workflows the score loops start.
//!
//! | kind                        | cadence                                   |
//! |-----------------------------|-------------------------------------------|
//! | `symptom_follow_up`         | once per window, 08-12 and 13-17 local    |
//! | `behavior_on_high_risk`     | once per window, 08-12 and 13-17 local    |
//! | `behavior_on_symptom_spike` | cooldown, 90 minutes by default           |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::clock::{self, HOUR};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::models::{NudgeKind, ReportKind, SymptomDescriptor};
use crate::notify::{NotificationType, Payload};
use crate::runtime::{IdReusePolicy, Next, Workflow, WorkflowContext};

pub const SYMPTOM_FOLLOW_UP_INTERVAL: Duration = Duration::from_secs(3600);
pub const HIGH_RISK_FOLLOW_UP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// How far back a symptom report keeps an account under high-risk follow-up.
pub const HIGH_RISK_LOOKBACK: i64 = 72 * HOUR;

pub fn symptom_follow_up_workflow_id(profile_id: &str) -> String {
    format!("symptom-follow-up-{profile_id}")
}

pub fn high_risk_follow_up_workflow_id(profile_id: &str) -> String {
    format!("account-high-risk-follow-up-{profile_id}")
}

/// Follow up on a report made yesterday (local), in the morning unless
/// already done this morning, and once more in the afternoon after a
/// morning nudge.
pub fn follow_up_due(report_ts: i64, last_nudge: i64, now: i64, tz: FixedOffset) -> bool {
    let midnight = clock::local_midnight(now, tz);
    let age = midnight - report_ts;
    if !(0 < age && age < 24 * HOUR) {
        return false;
    }
    let hour = clock::local_hour(now, tz);
    let morning = last_nudge < midnight + 8 * HOUR && (8..12).contains(&hour);
    let afternoon = (8 * HOUR..12 * HOUR).contains(&(last_nudge - midnight)) && (13..17).contains(&hour);
    morning || afternoon
}

/// Start of the nudge window `now` falls in, if any.
pub fn window_start(now: i64, tz: FixedOffset) -> Option<i64> {
    let midnight = clock::local_midnight(now, tz);
    match clock::local_hour(now, tz) {
        8..=11 => Some(midnight + 8 * HOUR),
        13..=16 => Some(midnight + 13 * HOUR),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeNotice {
    pub profile_id: String,
    pub account_number: String,
    pub poi_id: Option<String>,
    pub symptoms: Vec<SymptomDescriptor>,
}

impl Engine {
    /// Starts both follow-up loops; a no-op for loops already running.
    pub fn start_nudge_loops(self: &Arc<Self>, profile_id: &str) -> EngineResult<()> {
        self.runtime.start_workflow(
            &symptom_follow_up_workflow_id(profile_id),
            Arc::new(SymptomFollowUpWorkflow {
                engine: self.clone(),
            }),
            profile_id.to_string(),
            IdReusePolicy::AllowDuplicate,
        )?;
        self.runtime.start_workflow(
            &high_risk_follow_up_workflow_id(profile_id),
            Arc::new(HighRiskFollowUpWorkflow {
                engine: self.clone(),
            }),
            profile_id.to_string(),
            IdReusePolicy::AllowDuplicate,
        )?;
        Ok(())
    }

    /// Stamps a nudge that already went out. A failed write is logged, not
    /// returned, so the activity is not retried into a second send.
    async fn record_sent(&self, profile_id: &str, kind: NudgeKind, at: i64) {
        if let Err(err) = self.state.record_nudge(profile_id, kind, at).await {
            tracing::warn!(
                account = profile_id,
                kind = kind.as_str(),
                error = %err,
                "nudge sent but not recorded"
            );
        }
    }

    /// Returns whether a follow-up was sent.
    pub async fn symptom_follow_up(&self, profile_id: &str) -> EngineResult<bool> {
        let profile = self.profile(profile_id).await?;
        let Some(report) = self.reports.latest_report(ReportKind::Symptom, profile_id).await? else {
            return Ok(false);
        };
        let tz = clock::parse_timezone(&profile.timezone)?;
        let now = self.now();
        let last = profile.nudge_time.last(NudgeKind::SymptomFollowUp);
        if !follow_up_due(report.ts, last, now, tz) {
            return Ok(false);
        }

        let ids: Vec<String> = report.items().map(str::to_string).collect();
        let symptoms = self.describe_symptoms(&ids).await?;
        let payload = Payload::new(NotificationType::AccountSymptomFollowUp).with_symptoms(ids);
        self.send_text(&[profile.account_number], "symptom_follow_up", &symptoms, &payload)
            .await?;
        self.record_sent(profile_id, NudgeKind::SymptomFollowUp, now).await;
        tracing::info!(account = profile_id, report_ts = report.ts, "symptom follow-up sent");
        Ok(true)
    }

    /// Returns whether a follow-up was sent; `StopRenew` once the account
    /// has never reported a symptom.
    pub async fn high_risk_follow_up(&self, profile_id: &str) -> EngineResult<bool> {
        let profile = self.profile(profile_id).await?;
        let Some(report) = self.reports.latest_report(ReportKind::Symptom, profile_id).await? else {
            return Err(EngineError::StopRenew);
        };
        let now = self.now();
        if report.ts < now - HIGH_RISK_LOOKBACK {
            return Ok(false);
        }
        let tz = clock::parse_timezone(&profile.timezone)?;
        let Some(start) = window_start(now, tz) else {
            return Ok(false);
        };
        if profile.nudge_time.last(NudgeKind::BehaviorOnHighRisk) >= start {
            return Ok(false);
        }

        let payload = Payload::new(NotificationType::BehaviorReportOnRiskArea);
        self.send_text(&[profile.account_number], "behavior_on_high_risk", &[], &payload)
            .await?;
        self.record_sent(profile_id, NudgeKind::BehaviorOnHighRisk, now).await;
        tracing::info!(account = profile_id, "high-risk follow-up sent");
        Ok(true)
    }

    pub async fn notify_symptom_spike(&self, notice: &SpikeNotice) -> EngineResult<()> {
        let ids = notice.symptoms.iter().map(|s| s.id.clone()).collect();
        let payload = Payload::new(NotificationType::AccountSymptomSpike)
            .with_poi(notice.poi_id.as_deref())
            .with_symptoms(ids);
        self.send_text(
            &[notice.account_number.clone()],
            "symptom_spike",
            &notice.symptoms,
            &payload,
        )
        .await
    }

    pub async fn notify_behavior_on_risk_area(&self, profile_id: &str) -> EngineResult<()> {
        let profile = self.profile(profile_id).await?;
        let payload = Payload::new(NotificationType::BehaviorReportOnRiskArea);
        self.send_text(&[profile.account_number], "behavior_on_risk_area", &[], &payload)
            .await
    }

    /// Re-checks the cooldown against the stored nudge time before sending.
    pub async fn notify_behavior_on_symptom_spike(&self, profile_id: &str) -> EngineResult<bool> {
        let profile = self.profile(profile_id).await?;
        let now = self.now();
        let last = profile.nudge_time.last(NudgeKind::BehaviorOnSymptomSpike);
        if now - last <= self.settings.spike_behavior_cooldown {
            tracing::debug!(account = profile_id, last, "symptom spike reminder cooling down");
            return Ok(false);
        }
        let payload = Payload::new(NotificationType::BehaviorReportOnRiskArea);
        self.send_text(&[profile.account_number], "behavior_on_symptom_spike", &[], &payload)
            .await?;
        self.record_sent(profile_id, NudgeKind::BehaviorOnSymptomSpike, now).await;
        Ok(true)
    }
}

pub struct SymptomFollowUpWorkflow {
    engine: Arc<Engine>,
}

#[async_trait]
impl Workflow for SymptomFollowUpWorkflow {
    type Input = String;

    fn name(&self) -> &'static str {
        "SymptomFollowUpWorkflow"
    }

    async fn run(&self, ctx: &mut WorkflowContext, profile_id: String) -> EngineResult<Next<String>> {
        ctx.timer(SYMPTOM_FOLLOW_UP_INTERVAL).await;
        let engine = self.engine.clone();
        let sent = ctx
            .execute_activity("SymptomFollowUp", &profile_id, move |_hb, id: String| {
                let engine = engine.clone();
                async move { engine.symptom_follow_up(&id).await }
            })
            .await;
        if let Err(err) = sent {
            self.engine.step_failed(ctx.id(), &err);
        }
        Ok(Next::ContinueAsNew(profile_id))
    }
}

pub struct HighRiskFollowUpWorkflow {
    engine: Arc<Engine>,
}

#[async_trait]
impl Workflow for HighRiskFollowUpWorkflow {
    type Input = String;

    fn name(&self) -> &'static str {
        "AccountSelfReportedHighRiskFollowUpWorkflow"
    }

    async fn run(&self, ctx: &mut WorkflowContext, profile_id: String) -> EngineResult<Next<String>> {
        ctx.timer(HIGH_RISK_FOLLOW_UP_INTERVAL).await;
        let engine = self.engine.clone();
        let sent = ctx
            .execute_activity("HighRiskFollowUp", &profile_id, move |_hb, id: String| {
                let engine = engine.clone();
                async move { engine.high_risk_follow_up(&id).await }
            })
            .await;
        match sent {
            Err(EngineError::StopRenew) => return Err(EngineError::StopRenew),
            Err(err) => self.engine.step_failed(ctx.id(), &err),
            Ok(_) => {}
        }
        Ok(Next::ContinueAsNew(profile_id))
    }
}

pub struct NotifySymptomSpikeWorkflow {
    engine: Arc<Engine>,
}

impl NotifySymptomSpikeWorkflow {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Workflow for NotifySymptomSpikeWorkflow {
    type Input = SpikeNotice;

    fn name(&self) -> &'static str {
        "NotifySymptomSpikeWorkflow"
    }

    async fn run(&self, ctx: &mut WorkflowContext, notice: SpikeNotice) -> EngineResult<Next<SpikeNotice>> {
        let engine = self.engine.clone();
        ctx.execute_activity("NotifySymptomSpike", &notice, move |_hb, notice: SpikeNotice| {
            let engine = engine.clone();
            async move { engine.notify_symptom_spike(&notice).await }
        })
        .await?;
        Ok(Next::Complete)
    }
}

pub struct NotifyBehaviorOnEnteringRiskAreaWorkflow {
    engine: Arc<Engine>,
}

impl NotifyBehaviorOnEnteringRiskAreaWorkflow {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Workflow for NotifyBehaviorOnEnteringRiskAreaWorkflow {
    type Input = String;

    fn name(&self) -> &'static str {
        "NotifyBehaviorOnEnteringRiskAreaWorkflow"
    }

    async fn run(&self, ctx: &mut WorkflowContext, profile_id: String) -> EngineResult<Next<String>> {
        let engine = self.engine.clone();
        ctx.execute_activity("NotifyBehaviorOnRiskArea", &profile_id, move |_hb, id: String| {
            let engine = engine.clone();
            async move { engine.notify_behavior_on_risk_area(&id).await }
        })
        .await?;
        Ok(Next::Complete)
    }
}

pub struct NotifyBehaviorFollowUpOnEnteringSymptomSpikeAreaWorkflow {
    engine: Arc<Engine>,
}

impl NotifyBehaviorFollowUpOnEnteringSymptomSpikeAreaWorkflow {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Workflow for NotifyBehaviorFollowUpOnEnteringSymptomSpikeAreaWorkflow {
    type Input = String;

    fn name(&self) -> &'static str {
        "NotifyBehaviorFollowUpOnEnteringSymptomSpikeAreaWorkflow"
    }

    async fn run(&self, ctx: &mut WorkflowContext, profile_id: String) -> EngineResult<Next<String>> {
        let engine = self.engine.clone();
        ctx.execute_activity("NotifyBehaviorOnSymptomSpike", &profile_id, move |_hb, id: String| {
            let engine = engine.clone();
            async move { engine.notify_behavior_on_symptom_spike(&id).await }
        })
        .await?;
        Ok(Next::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DAY, MINUTE};
    use crate::geo::GeoPoint;
    use crate::runtime::WorkflowStatus;
    use crate::store::StateStore;
    use crate::testing::{fixture, targets, Fixture, TS};

    // TS is 10:00 GMT+8; local midnight is 8h earlier.
    const MIDNIGHT_GMT8: i64 = TS - 10 * HOUR;

    fn tz8() -> FixedOffset {
        clock::parse_timezone("GMT+8").unwrap()
    }

    fn at(hour: i64) -> i64 {
        MIDNIGHT_GMT8 + hour * HOUR
    }

    #[test]
    fn morning_follow_up_for_yesterdays_report() {
        let report = at(9) - DAY;
        assert!(follow_up_due(report, at(9) - DAY, at(10), tz8()));
        // already nudged this morning
        assert!(!follow_up_due(report, at(10), at(11), tz8()));
        // outside both windows
        assert!(!follow_up_due(report, 0, at(7), tz8()));
        assert!(!follow_up_due(report, 0, at(12), tz8()));
    }

    #[test]
    fn afternoon_follow_up_needs_a_morning_nudge() {
        let report = at(9) - DAY;
        assert!(follow_up_due(report, at(10), at(15), tz8()));
        assert!(!follow_up_due(report, at(7), at(15), tz8()));
        assert!(!follow_up_due(report, at(15), at(16), tz8()));
    }

    #[test]
    fn report_age_boundary() {
        let just_under = MIDNIGHT_GMT8 - DAY + 1;
        let just_over = MIDNIGHT_GMT8 - DAY - 1;
        assert!(follow_up_due(just_under, 0, at(10), tz8()));
        assert!(!follow_up_due(just_over, 0, at(10), tz8()));
        // today's reports are not followed up yet
        assert!(!follow_up_due(at(9), 0, at(10), tz8()));
    }

    #[test]
    fn windows() {
        assert_eq!(window_start(at(8), tz8()), Some(at(8)));
        assert_eq!(window_start(at(11) + 59 * MINUTE, tz8()), Some(at(8)));
        assert_eq!(window_start(at(12), tz8()), None);
        assert_eq!(window_start(at(16), tz8()), Some(at(13)));
        assert_eq!(window_start(at(17), tz8()), None);
    }

    async fn reporter(fx: &Fixture, report_ts: i64) {
        fx.profile_at("a", "GMT+8", 25.0330, 121.5654).await;
        fx.report(
            ReportKind::Symptom,
            "a",
            report_ts,
            GeoPoint::new(25.0330, 121.5654),
            &["fever", "cough"],
        )
        .await;
    }

    #[tokio::test]
    async fn morning_follow_up_is_sent_and_recorded() {
        let fx = fixture(at(10));
        reporter(&fx, at(9) - DAY).await;
        fx.store
            .record_nudge("a", NudgeKind::SymptomFollowUp, at(9) - DAY)
            .await
            .unwrap();

        assert!(fx.engine.symptom_follow_up("a").await.unwrap());
        let sent = fx.sink.of_type(NotificationType::AccountSymptomFollowUp);
        assert_eq!(sent.len(), 1);
        assert_eq!(targets(&sent[0]), vec!["acct-a"]);
        assert_eq!(sent[0].data.symptoms, vec!["fever".to_string(), "cough".to_string()]);
        assert!(sent[0].contents["en"].contains("Fever, Dry cough"), "{:?}", sent[0].contents);
        assert!(sent[0].headings.contains_key("zh-Hant"));

        let profile = fx.store.get_profile("a").await.unwrap().unwrap();
        assert_eq!(profile.nudge_time.last(NudgeKind::SymptomFollowUp), at(10));

        // once per window
        fx.clock.set(at(11));
        assert!(!fx.engine.symptom_follow_up("a").await.unwrap());
    }

    #[tokio::test]
    async fn afternoon_gate() {
        let fx = fixture(at(15));
        reporter(&fx, at(9) - DAY).await;

        fx.store
            .record_nudge("a", NudgeKind::SymptomFollowUp, at(7))
            .await
            .unwrap();
        assert!(!fx.engine.symptom_follow_up("a").await.unwrap());

        fx.store
            .record_nudge("a", NudgeKind::SymptomFollowUp, at(10))
            .await
            .unwrap();
        assert!(fx.engine.symptom_follow_up("a").await.unwrap());
        assert_eq!(fx.sink.requests().len(), 1);
    }

    #[tokio::test]
    async fn high_risk_follow_up_once_per_window() {
        let fx = fixture(at(9));
        reporter(&fx, at(9) - 2 * DAY).await;

        assert!(fx.engine.high_risk_follow_up("a").await.unwrap());
        fx.clock.set(at(11));
        assert!(!fx.engine.high_risk_follow_up("a").await.unwrap());
        fx.clock.set(at(12) + 30 * MINUTE);
        assert!(!fx.engine.high_risk_follow_up("a").await.unwrap());
        fx.clock.set(at(13));
        assert!(fx.engine.high_risk_follow_up("a").await.unwrap());

        let sent = fx.sink.of_type(NotificationType::BehaviorReportOnRiskArea);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].headings["en"], "Keep yourself and others safe");
    }

    #[tokio::test]
    async fn high_risk_follow_up_ignores_old_reports() {
        let fx = fixture(at(9));
        reporter(&fx, at(9) - 4 * DAY).await;
        assert!(!fx.engine.high_risk_follow_up("a").await.unwrap());
        assert!(fx.sink.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn high_risk_loop_stops_without_reports() {
        let fx = fixture(at(9));
        fx.profile_at("a", "GMT+8", 25.0330, 121.5654).await;
        fx.engine.start_nudge_loops("a").unwrap();

        tokio::time::sleep(HIGH_RISK_FOLLOW_UP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(
            fx.engine.runtime().status(&high_risk_follow_up_workflow_id("a")),
            Some(WorkflowStatus::Completed)
        );
        assert_eq!(
            fx.engine.runtime().status(&symptom_follow_up_workflow_id("a")),
            Some(WorkflowStatus::Running)
        );
        assert!(fx.reporter.errors().is_empty());
    }

    #[tokio::test]
    async fn unrecorded_follow_up_still_counts_as_sent() {
        let fx = fixture(at(10));
        reporter(&fx, at(9) - DAY).await;
        fx.faults.fail("record_nudge", Some("a"), 1);

        assert!(fx.engine.symptom_follow_up("a").await.unwrap());
        assert_eq!(fx.sink.requests().len(), 1);
        let profile = fx.store.get_profile("a").await.unwrap().unwrap();
        assert_eq!(profile.nudge_time.last(NudgeKind::SymptomFollowUp), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_nudge_record_does_not_resend() {
        let fx = fixture(at(9));
        fx.profile_at("a", "GMT+8", 25.0330, 121.5654).await;
        fx.faults.fail("record_nudge", Some("a"), 5);

        let id = format!("notify-behavior-symptom-spike-a-{}", at(9));
        fx.engine
            .runtime()
            .start_workflow(
                &id,
                Arc::new(NotifyBehaviorFollowUpOnEnteringSymptomSpikeAreaWorkflow::new(
                    fx.engine.clone(),
                )),
                "a".to_string(),
                IdReusePolicy::RejectDuplicate,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(fx.sink.attempts(), 1);
        assert_eq!(fx.engine.runtime().status(&id), Some(WorkflowStatus::Completed));
        assert!(fx.reporter.errors().is_empty());
    }

    #[tokio::test]
    async fn symptom_spike_reminder_cooldown() {
        let fx = fixture(at(9));
        fx.profile_at("a", "GMT+8", 25.0330, 121.5654).await;

        assert!(fx.engine.notify_behavior_on_symptom_spike("a").await.unwrap());
        fx.clock.advance(90 * MINUTE);
        assert!(!fx.engine.notify_behavior_on_symptom_spike("a").await.unwrap());
        fx.clock.advance(1);
        assert!(fx.engine.notify_behavior_on_symptom_spike("a").await.unwrap());

        let sent = fx.sink.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].headings["en"], "Symptoms are rising nearby");
    }
}

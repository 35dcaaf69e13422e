//! Report ingest. Every accepted report wakes the reporter's score loop;
//! symptom reports also start the reporter's nudge loops.

use std::sync::Arc;

use serde::Deserialize;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::geo::GeoPoint;
use crate::models::{validate_account_id, Report, ReportKind};
use crate::scoring::ItemWeights;

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymptomReportRequest {
    pub account: String,
    pub symptoms: Vec<String>,
    pub location: Location,
    pub ts: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorReportRequest {
    pub account: String,
    pub behaviors: Vec<String>,
    pub location: Location,
    pub ts: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingRequest {
    pub account: String,
    pub location: Location,
    pub ts: i64,
}

/// Splits items into official and customized ids, dropping blanks and
/// duplicates.
pub(crate) fn split_items(items: &[String], weights: &ItemWeights) -> EngineResult<(Vec<String>, Vec<String>)> {
    let mut official = Vec::new();
    let mut customized = Vec::new();
    for item in items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let bucket = if weights.is_official(item) {
            &mut official
        } else {
            &mut customized
        };
        if !bucket.iter().any(|s| s == item) {
            bucket.push(item.to_string());
        }
    }
    if official.is_empty() && customized.is_empty() {
        return Err(EngineError::invalid("report has no items"));
    }
    Ok((official, customized))
}

fn checked_common(account: &str, location: &Location, ts: i64) -> EngineResult<GeoPoint> {
    validate_account_id(account)?;
    if ts <= 0 {
        return Err(EngineError::invalid(format!("bad timestamp: {ts}")));
    }
    GeoPoint::checked(location.lat, location.lng)
}

impl Engine {
    pub async fn submit_symptom_report(self: &Arc<Self>, req: SymptomReportRequest) -> EngineResult<()> {
        let location = checked_common(&req.account, &req.location, req.ts)?;
        let (official, customized) = split_items(&req.symptoms, &self.kernel.symptoms)?;
        self.accept(Report {
            profile_id: req.account,
            kind: ReportKind::Symptom,
            location,
            ts: req.ts,
            official,
            customized,
        })
        .await
    }

    pub async fn submit_behavior_report(self: &Arc<Self>, req: BehaviorReportRequest) -> EngineResult<()> {
        let location = checked_common(&req.account, &req.location, req.ts)?;
        let (official, customized) = split_items(&req.behaviors, &self.kernel.behaviors)?;
        self.accept(Report {
            profile_id: req.account,
            kind: ReportKind::Behavior,
            location,
            ts: req.ts,
            official,
            customized,
        })
        .await
    }

    pub async fn submit_ping(self: &Arc<Self>, req: PingRequest) -> EngineResult<()> {
        let location = checked_common(&req.account, &req.location, req.ts)?;
        self.accept(Report {
            profile_id: req.account,
            kind: ReportKind::Geographic,
            location,
            ts: req.ts,
            official: Vec::new(),
            customized: Vec::new(),
        })
        .await
    }

    async fn accept(self: &Arc<Self>, report: Report) -> EngineResult<()> {
        let id = report.profile_id.clone();
        self.profile(&id).await?;
        self.reports.insert_report(&report).await?;
        if report.kind == ReportKind::Geographic {
            self.state.update_profile_location(&id, report.location).await?;
        }
        tracing::debug!(account = %id, kind = report.kind.as_str(), ts = report.ts, "report accepted");

        self.check_account(&id)?;
        if report.kind == ReportKind::Symptom {
            self.start_nudge_loops(&id)?;
        }
        Ok(())
    }

    /// `(today, yesterday)` report counts over the profile's local days.
    pub async fn personal_report_count(&self, kind: ReportKind, profile_id: &str) -> EngineResult<(i64, i64)> {
        self.aggregator
            .personal_report_count(kind, profile_id, self.now())
            .await
    }
}

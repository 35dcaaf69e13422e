use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::geo::{GeoPoint, Geometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Symptom,
    Behavior,
    Geographic,
}

impl ReportKind {
    pub fn table(&self) -> &'static str {
        match self {
            ReportKind::Symptom => "symptom_report",
            ReportKind::Behavior => "behavior_report",
            ReportKind::Geographic => "geographic",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Symptom => "symptom",
            ReportKind::Behavior => "behavior",
            ReportKind::Geographic => "geographic",
        }
    }
}

impl std::str::FromStr for ReportKind {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "symptom" => Ok(ReportKind::Symptom),
            "behavior" => Ok(ReportKind::Behavior),
            "geographic" | "ping" => Ok(ReportKind::Geographic),
            other => Err(crate::error::EngineError::invalid(format!(
                "unknown report type: {other}"
            ))),
        }
    }
}

/// An immutable self-report. Pings carry no items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub profile_id: String,
    pub kind: ReportKind,
    pub location: GeoPoint,
    pub ts: i64,
    pub official: Vec<String>,
    pub customized: Vec<String>,
}

impl Report {
    pub fn items(&self) -> impl Iterator<Item = &str> {
        self.official
            .iter()
            .chain(self.customized.iter())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub confirmed_count: i64,
    pub confirmed_delta: f64,
    pub symptom_count: i64,
    pub symptom_delta: f64,
    pub behavior_count: i64,
    pub behavior_delta: f64,
    pub score: f64,
    pub last_update: i64,
    pub details: Details,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Details {
    pub confirm: ConfirmDetail,
    pub symptoms: SymptomDetail,
    pub behaviors: BehaviorDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfirmDetail {
    /// Daily case counts, most recent last.
    pub daily: Vec<i64>,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymptomDetail {
    pub score: f64,
    pub users: i64,
    pub today: BTreeMap<String, i64>,
    pub last_spike_list: BTreeSet<String>,
    pub last_spike_update: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDetail {
    pub score: f64,
    pub users: i64,
    pub today: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeKind {
    SymptomFollowUp,
    BehaviorOnHighRisk,
    BehaviorOnSymptomSpike,
}

impl NudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NudgeKind::SymptomFollowUp => "symptom_follow_up",
            NudgeKind::BehaviorOnHighRisk => "behavior_on_high_risk",
            NudgeKind::BehaviorOnSymptomSpike => "behavior_on_symptom_spike",
        }
    }
}

/// Last successful send per nudge kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NudgeTime(pub BTreeMap<NudgeKind, i64>);

impl NudgeTime {
    /// Zero when the kind was never sent.
    pub fn last(&self, kind: NudgeKind) -> i64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn record(&mut self, kind: NudgeKind, at: i64) {
        self.0.insert(kind, at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub account_number: String,
    pub timezone: String,
    pub location: Option<GeoPoint>,
    pub metric: Metric,
    pub nudge_time: NudgeTime,
}

impl Profile {
    pub fn new(id: &str, account_number: &str, timezone: &str) -> Self {
        Self {
            id: id.to_string(),
            account_number: account_number.to_string(),
            timezone: timezone.to_string(),
            location: None,
            metric: Metric::default(),
            nudge_time: NudgeTime::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub id: String,
    pub location: GeoPoint,
    pub address: String,
    pub metric: Metric,
}

/// A profile's subscription to a POI, carrying the score as that profile
/// last saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoi {
    pub profile_id: String,
    pub account_number: String,
    pub timezone: String,
    pub poi_id: String,
    pub alias: String,
    pub metric: Metric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub country: String,
    pub state: String,
    pub county: String,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomSymptom {
    pub id: String,
    pub name: String,
}

/// A symptom resolved for message formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymptomDescriptor {
    pub id: String,
    pub name: String,
    pub official: bool,
}

/// New POI identifier: 12 random bytes as lowercase hex.
pub fn new_poi_id() -> String {
    hex::encode(rand::random::<[u8; 12]>())
}

/// Account ids are printable ASCII, at most 64 bytes.
pub fn validate_account_id(id: &str) -> Result<(), crate::error::EngineError> {
    if id.is_empty() || id.len() > 64 || !id.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(crate::error::EngineError::invalid(format!(
            "malformed account id: {id:?}"
        )));
    }
    Ok(())
}

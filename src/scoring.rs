//! Scoring kernel: pure functions from aggregated report counts to a
//! multi-factor score in `[0, 100]`.
//!
//! score = 0.25 * symptom + 0.25 * behavior + 0.5 * confirmed

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::models::{BehaviorDetail, ConfirmDetail, Details, Metric, SymptomDetail};

/// Days of confirmed cases feeding the confirmed score.
pub const CONFIRM_WINDOW: usize = 7;

pub const OFFICIAL_SYMPTOMS: &[(&str, f64)] = &[
    ("fever", 3.0),
    ("cough", 2.0),
    ("chest", 2.0),
    ("face", 2.0),
    ("breath", 1.0),
    ("nasal", 1.0),
];

pub const OFFICIAL_BEHAVIORS: &[(&str, f64)] = &[
    ("clean_hand", 1.0),
    ("social_distancing", 1.0),
    ("touch_face", 1.0),
    ("wear_mask", 1.0),
    ("cover_coughs", 1.0),
    ("clean_surface", 1.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Red,
    Yellow,
    Green,
}

impl Band {
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Red => "red",
            Band::Yellow => "yellow",
            Band::Green => "green",
        }
    }
}

/// red `[0,33]`, yellow `(33,66]`, green `(66,100]`
pub fn band(score: f64) -> Band {
    if score <= 33.0 {
        Band::Red
    } else if score <= 66.0 {
        Band::Yellow
    } else {
        Band::Green
    }
}

pub fn band_changed(old: f64, new: f64) -> bool {
    band(old) != band(new)
}

/// Weights for the official items of one report kind. Items outside the
/// table are customized.
#[derive(Debug, Clone)]
pub struct ItemWeights {
    official: BTreeMap<String, f64>,
}

impl ItemWeights {
    pub fn new(table: &[(&str, f64)]) -> Self {
        Self {
            official: table
                .iter()
                .map(|(id, weight)| (id.to_string(), *weight))
                .collect(),
        }
    }

    pub fn symptoms() -> Self {
        Self::new(OFFICIAL_SYMPTOMS)
    }

    pub fn behaviors() -> Self {
        Self::new(OFFICIAL_BEHAVIORS)
    }

    pub fn official_weight(&self, id: &str) -> Option<f64> {
        self.official.get(id).copied()
    }

    pub fn is_official(&self, id: &str) -> bool {
        self.official.contains_key(id)
    }

    pub fn total(&self) -> f64 {
        self.official.values().sum()
    }
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

/// Confirmed-case score over the last `CONFIRM_WINDOW` days, most recent
/// last. Recent days weigh `e^((i+1)/2)`.
pub fn confirmed_score(daily: &[i64]) -> f64 {
    let window = last_window(daily);
    let mut weighted_cases = 0.0;
    let mut weighted_total = 0.0;
    for (i, cases) in window.iter().enumerate() {
        let weight = ((i as f64 + 1.0) / 2.0).exp();
        let cases = (*cases).max(0) as f64;
        weighted_cases += weight * cases;
        weighted_total += weight * (cases + 1.0);
    }
    if weighted_total <= 0.0 {
        return 100.0;
    }
    clamp_score(100.0 * (1.0 - weighted_cases / weighted_total))
}

/// Left-pads with zeros to exactly `CONFIRM_WINDOW` entries.
fn last_window(daily: &[i64]) -> [i64; CONFIRM_WINDOW] {
    let mut window = [0i64; CONFIRM_WINDOW];
    let take = daily.len().min(CONFIRM_WINDOW);
    window[CONFIRM_WINDOW - take..].copy_from_slice(&daily[daily.len() - take..]);
    window
}

/// Behavior score. Customized items count weight 1 each but can make up at
/// most half of the nearby weight.
pub fn behavior_score(distribution: &BTreeMap<String, i64>, users: i64, weights: &ItemWeights) -> f64 {
    let mut official_weight = 0.0;
    let mut customized_weight = 0.0;
    for (id, count) in distribution {
        let count = (*count).max(0) as f64;
        match weights.official_weight(id) {
            Some(weight) => official_weight += weight * count,
            None => customized_weight += count,
        }
    }

    let total_weight = users.max(0) as f64 * weights.total() + customized_weight;
    if total_weight <= 0.0 {
        return 0.0;
    }

    let nearby = if customized_weight / total_weight > 0.5 {
        total_weight / 2.0 + official_weight
    } else {
        official_weight + customized_weight
    };
    clamp_score(100.0 * nearby / total_weight)
}

pub fn symptom_score(distribution: &BTreeMap<String, i64>, users: i64, weights: &ItemWeights) -> f64 {
    let mut weighted = 0.0;
    let mut customized = 0.0;
    for (id, count) in distribution {
        let count = (*count).max(0) as f64;
        match weights.official_weight(id) {
            Some(weight) => weighted += weight * count,
            None => {
                weighted += count;
                customized += count;
            }
        }
    }

    let max = users.max(0) as f64 * weights.total() + customized;
    if max <= 0.0 {
        return 100.0;
    }
    clamp_score(100.0 * (1.0 - weighted / max))
}

pub fn total_score(symptom: f64, behavior: f64, confirmed: f64) -> f64 {
    clamp_score(0.25 * symptom + 0.25 * behavior + 0.5 * confirmed)
}

/// Percent change from `old` to `new`.
pub fn change_rate(new: f64, old: f64) -> f64 {
    if old > 0.0 {
        (new - old) / old * 100.0
    } else if new > 0.0 {
        100.0
    } else {
        0.0
    }
}

/// Symptom ids whose count today reached `threshold` and grew since yesterday.
pub fn spike_list(
    yesterday: &BTreeMap<String, i64>,
    today: &BTreeMap<String, i64>,
    threshold: i64,
) -> BTreeSet<String> {
    today
        .iter()
        .filter(|(id, count)| {
            **count >= threshold && **count > yesterday.get(*id).copied().unwrap_or(0)
        })
        .map(|(id, _)| id.clone())
        .collect()
}

/// Aggregates feeding one metric refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub symptoms_today: BTreeMap<String, i64>,
    pub symptoms_yesterday: BTreeMap<String, i64>,
    pub symptom_users_today: i64,
    pub symptom_users_yesterday: i64,
    pub behaviors_today: BTreeMap<String, i64>,
    pub behavior_users_today: i64,
    pub behavior_users_yesterday: i64,
    pub confirmed_daily: Vec<i64>,
}

/// Kernel configuration: item weights plus the spike threshold.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub symptoms: ItemWeights,
    pub behaviors: ItemWeights,
    pub spike_threshold: i64,
}

impl Kernel {
    pub fn new(spike_threshold: i64) -> Self {
        Self {
            symptoms: ItemWeights::symptoms(),
            behaviors: ItemWeights::behaviors(),
            spike_threshold,
        }
    }

    /// Candidate metric for `snapshot`. `last_spike_update` is left at zero;
    /// the refresh step decides it against the persisted metric.
    pub fn metric(&self, snapshot: &Snapshot, now: i64) -> Metric {
        let symptom = symptom_score(
            &snapshot.symptoms_today,
            snapshot.symptom_users_today,
            &self.symptoms,
        );
        let behavior = behavior_score(
            &snapshot.behaviors_today,
            snapshot.behavior_users_today,
            &self.behaviors,
        );
        let confirmed = confirmed_score(&snapshot.confirmed_daily);

        let daily = snapshot.confirmed_daily.as_slice();
        let confirmed_today = daily.last().copied().unwrap_or(0);
        let confirmed_yesterday = daily.iter().rev().nth(1).copied().unwrap_or(0);

        Metric {
            confirmed_count: confirmed_today,
            confirmed_delta: change_rate(confirmed_today as f64, confirmed_yesterday as f64),
            symptom_count: snapshot.symptom_users_today,
            symptom_delta: change_rate(
                snapshot.symptom_users_today as f64,
                snapshot.symptom_users_yesterday as f64,
            ),
            behavior_count: snapshot.behavior_users_today,
            behavior_delta: change_rate(
                snapshot.behavior_users_today as f64,
                snapshot.behavior_users_yesterday as f64,
            ),
            score: total_score(symptom, behavior, confirmed),
            last_update: now,
            details: Details {
                confirm: ConfirmDetail {
                    daily: last_window(daily).to_vec(),
                    score: confirmed,
                },
                symptoms: SymptomDetail {
                    score: symptom,
                    users: snapshot.symptom_users_today,
                    today: snapshot.symptoms_today.clone(),
                    last_spike_list: spike_list(
                        &snapshot.symptoms_yesterday,
                        &snapshot.symptoms_today,
                        self.spike_threshold,
                    ),
                    last_spike_update: 0,
                },
                behaviors: BehaviorDetail {
                    score: behavior,
                    users: snapshot.behavior_users_today,
                    today: snapshot.behaviors_today.clone(),
                },
            },
        }
    }
}

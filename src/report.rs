use std::collections::BTreeMap;
use std::fmt::{self, Write};

use chrono::DateTime;

use crate::models::{NudgeKind, Profile};
use crate::scoring::band;

/// Item counts, most reported first, ties by id.
pub fn summarize_mix(today: &BTreeMap<String, i64>) -> Vec<(&str, i64)> {
    let mut mix: Vec<(&str, i64)> = today.iter().map(|(id, n)| (id.as_str(), *n)).collect();
    mix.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    mix
}

fn timestamp(ts: i64) -> String {
    if ts <= 0 {
        return "never".to_string();
    }
    DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn delta(rate: f64) -> String {
    format!("{rate:+.0}%")
}

pub fn build_report(profile: &Profile, generated_at: i64) -> Result<String, fmt::Error> {
    let mut output = String::new();
    write_report(&mut output, profile, generated_at)?;
    Ok(output)
}

fn write_report<W: Write>(output: &mut W, profile: &Profile, generated_at: i64) -> fmt::Result {
    let metric = &profile.metric;
    let details = &metric.details;

    writeln!(output, "# Community Health Report")?;
    writeln!(
        output,
        "Generated for account {} at {}",
        profile.account_number,
        timestamp(generated_at)
    )?;
    writeln!(output)?;

    if metric.last_update == 0 {
        writeln!(output, "No score has been computed for this account yet.")?;
        return Ok(());
    }

    writeln!(output, "## Score")?;
    writeln!(
        output,
        "- Score {:.1} ({}), last updated {}",
        metric.score,
        band(metric.score).as_str(),
        timestamp(metric.last_update)
    )?;
    writeln!(
        output,
        "- Confirmed cases today: {} ({})",
        metric.confirmed_count,
        delta(metric.confirmed_delta)
    )?;
    writeln!(
        output,
        "- People reporting symptoms today: {} ({})",
        metric.symptom_count,
        delta(metric.symptom_delta)
    )?;
    writeln!(
        output,
        "- People reporting healthy behaviors today: {} ({})",
        metric.behavior_count,
        delta(metric.behavior_delta)
    )?;

    writeln!(output)?;
    writeln!(output, "## Factors")?;
    writeln!(output, "- Confirmed cases: {:.1}", details.confirm.score)?;
    writeln!(output, "- Symptoms: {:.1}", details.symptoms.score)?;
    writeln!(output, "- Behaviors: {:.1}", details.behaviors.score)?;

    writeln!(output)?;
    writeln!(output, "## Symptom Spikes")?;
    if details.symptoms.last_spike_list.is_empty() {
        writeln!(output, "No symptom is spiking nearby.")?;
    } else {
        let spiking: Vec<&str> = details
            .symptoms
            .last_spike_list
            .iter()
            .map(String::as_str)
            .collect();
        writeln!(
            output,
            "- {} (since {})",
            spiking.join(", "),
            timestamp(details.symptoms.last_spike_update)
        )?;
    }

    writeln!(output)?;
    writeln!(output, "## Nearby Symptom Mix")?;
    let mix = summarize_mix(&details.symptoms.today);
    if mix.is_empty() {
        writeln!(output, "No symptoms reported nearby today.")?;
    } else {
        for (id, count) in mix {
            writeln!(output, "- {id}: {count}")?;
        }
    }

    writeln!(output)?;
    writeln!(output, "## Reminders")?;
    for kind in [
        NudgeKind::SymptomFollowUp,
        NudgeKind::BehaviorOnHighRisk,
        NudgeKind::BehaviorOnSymptomSpike,
    ] {
        writeln!(
            output,
            "- {}: {}",
            kind.as_str(),
            timestamp(profile.nudge_time.last(kind))
        )?;
    }

    Ok(())
}

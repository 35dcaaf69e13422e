//! Postgres backend. Proximity uses `cube`/`earthdistance`: the GiST index
//! on `ll_to_earth(lat, lng)` prefilters with `earth_box`, then the exact
//! haversine distance (`health.haversine_m`) decides.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::geo::{GeoPoint, Geometry};
use crate::help::{HelpRequest, HelpState};
use crate::ingest::split_items;
use crate::models::{
    Boundary, CustomSymptom, Metric, NudgeKind, NudgeTime, Poi, Profile, ProfilePoi, Report,
    ReportKind,
};
use crate::scoring::ItemWeights;
use crate::store::{ConfirmSource, HelpStore, ReportStore, StateStore};

/// `earthdistance` measures on a 6 378 168 m sphere; padding the box keeps
/// it a superset of the 6 371 000 m haversine circle.
const BOX_PADDING: f64 = 1.01;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn profile_exists(&self, id: &str) -> EngineResult<bool> {
        let row = sqlx::query("SELECT 1 FROM health.profile WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn location_of(row: &PgRow) -> EngineResult<Option<GeoPoint>> {
    let lat: Option<f64> = row.try_get("lat")?;
    let lng: Option<f64> = row.try_get("lng")?;
    Ok(lat.zip(lng).map(|(lat, lng)| GeoPoint::new(lat, lng)))
}

fn profile_from_row(row: &PgRow) -> EngineResult<Profile> {
    let metric: Json<Metric> = row.try_get("metric")?;
    let nudge_time: Json<NudgeTime> = row.try_get("nudge_time")?;
    Ok(Profile {
        id: row.try_get("id")?,
        account_number: row.try_get("account_number")?,
        timezone: row.try_get("timezone")?,
        location: location_of(row)?,
        metric: metric.0,
        nudge_time: nudge_time.0,
    })
}

fn poi_from_row(row: &PgRow) -> EngineResult<Poi> {
    let metric: Json<Metric> = row.try_get("metric")?;
    Ok(Poi {
        id: row.try_get("id")?,
        location: GeoPoint::new(row.try_get("lat")?, row.try_get("lng")?),
        address: row.try_get("address")?,
        metric: metric.0,
    })
}

fn report_from_row(kind: ReportKind, row: &PgRow) -> EngineResult<Report> {
    Ok(Report {
        profile_id: row.try_get("profile_id")?,
        kind,
        location: GeoPoint::new(row.try_get("lat")?, row.try_get("lng")?),
        ts: row.try_get("ts")?,
        official: row.try_get("official")?,
        customized: row.try_get("customized")?,
    })
}

fn help_from_row(row: &PgRow) -> EngineResult<HelpRequest> {
    let state: String = row.try_get("state")?;
    let state = match state.as_str() {
        "pending" => HelpState::Pending,
        "accepted" => HelpState::Accepted,
        other => return Err(EngineError::Store(format!("unknown help state {other:?}"))),
    };
    Ok(HelpRequest {
        id: row.try_get("id")?,
        requester: row.try_get("requester")?,
        subject: row.try_get("subject")?,
        needs: row.try_get("needs")?,
        meeting_location: row.try_get("meeting_location")?,
        contact_info: row.try_get("contact_info")?,
        location: GeoPoint::new(row.try_get("lat")?, row.try_get("lng")?),
        state,
        helper: row.try_get("helper")?,
        created_at: row.try_get("created_at")?,
        accepted_at: row.try_get("accepted_at")?,
    })
}

const PROFILE_COLUMNS: &str = "id, account_number, timezone, lat, lng, metric, nudge_time";
const REPORT_COLUMNS: &str = "profile_id, lat, lng, ts, official, customized";
const HELP_COLUMNS: &str = "id, requester, subject, needs, meeting_location, contact_info, \
                            lat, lng, state, helper, created_at, accepted_at";

#[async_trait]
impl StateStore for PgStore {
    async fn get_profile(&self, id: &str) -> EngineResult<Option<Profile>> {
        let row = sqlx::query(&format!("SELECT {PROFILE_COLUMNS} FROM health.profile WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn upsert_profile(&self, profile: &Profile) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO health.profile (id, account_number, timezone, lat, lng, metric, nudge_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET account_number = EXCLUDED.account_number,
                timezone = EXCLUDED.timezone,
                lat = COALESCE(EXCLUDED.lat, health.profile.lat),
                lng = COALESCE(EXCLUDED.lng, health.profile.lng)
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.account_number)
        .bind(&profile.timezone)
        .bind(profile.location.map(|l| l.lat))
        .bind(profile.location.map(|l| l.lng))
        .bind(Json(&profile.metric))
        .bind(Json(&profile.nudge_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_profile_location(&self, id: &str, location: GeoPoint) -> EngineResult<()> {
        let result = sqlx::query("UPDATE health.profile SET lat = $2, lng = $3 WHERE id = $1")
            .bind(id)
            .bind(location.lat)
            .bind(location.lng)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("profile {id}")));
        }
        Ok(())
    }

    async fn update_profile_metric(&self, id: &str, metric: &Metric) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE health.profile SET metric = $2
            WHERE id = $1 AND COALESCE((metric->>'last_update')::bigint, 0) <= $3
            "#,
        )
        .bind(id)
        .bind(Json(metric))
        .bind(metric.last_update)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.profile_exists(id).await? {
            return Err(EngineError::not_found(format!("profile {id}")));
        }
        Ok(false)
    }

    async fn record_nudge(&self, id: &str, kind: NudgeKind, at: i64) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE health.profile SET nudge_time = nudge_time || jsonb_build_object($2::text, $3::bigint) WHERE id = $1",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("profile {id}")));
        }
        Ok(())
    }

    async fn list_profile_ids(&self) -> EngineResult<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM health.profile ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(EngineError::from))
            .collect()
    }

    async fn get_poi(&self, id: &str) -> EngineResult<Option<Poi>> {
        let row = sqlx::query("SELECT id, lat, lng, address, metric FROM health.poi WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(poi_from_row).transpose()
    }

    async fn insert_poi(&self, poi: &Poi) -> EngineResult<()> {
        sqlx::query("INSERT INTO health.poi (id, lat, lng, address, metric) VALUES ($1, $2, $3, $4, $5)")
            .bind(&poi.id)
            .bind(poi.location.lat)
            .bind(poi.location.lng)
            .bind(&poi.address)
            .bind(Json(&poi.metric))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_poi_metric(&self, id: &str, metric: &Metric) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE health.poi SET metric = $2
            WHERE id = $1 AND COALESCE((metric->>'last_update')::bigint, 0) <= $3
            "#,
        )
        .bind(id)
        .bind(Json(metric))
        .bind(metric.last_update)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.get_poi(id).await?.is_none() {
            return Err(EngineError::not_found(format!("poi {id}")));
        }
        Ok(false)
    }

    async fn list_poi_ids(&self) -> EngineResult<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM health.poi ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(EngineError::from))
            .collect()
    }

    async fn add_profile_poi(&self, profile_id: &str, poi_id: &str, alias: &str) -> EngineResult<()> {
        if !self.profile_exists(profile_id).await? {
            return Err(EngineError::not_found(format!("profile {profile_id}")));
        }
        let result = sqlx::query(
            r#"
            INSERT INTO health.profile_poi (profile_id, poi_id, alias, metric)
            SELECT $1, p.id, $3, p.metric FROM health.poi p WHERE p.id = $2
            ON CONFLICT (profile_id, poi_id) DO UPDATE SET alias = EXCLUDED.alias
            "#,
        )
        .bind(profile_id)
        .bind(poi_id)
        .bind(alias)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("poi {poi_id}")));
        }
        Ok(())
    }

    async fn profile_pois(&self, poi_id: &str) -> EngineResult<Vec<ProfilePoi>> {
        let rows = sqlx::query(
            r#"
            SELECT pp.profile_id, p.account_number, p.timezone, pp.poi_id, pp.alias, pp.metric
            FROM health.profile_poi pp
            JOIN health.profile p ON p.id = pp.profile_id
            WHERE pp.poi_id = $1
            ORDER BY pp.profile_id
            "#,
        )
        .bind(poi_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let metric: Json<Metric> = row.try_get("metric")?;
            out.push(ProfilePoi {
                profile_id: row.try_get("profile_id")?,
                account_number: row.try_get("account_number")?,
                timezone: row.try_get("timezone")?,
                poi_id: row.try_get("poi_id")?,
                alias: row.try_get("alias")?,
                metric: metric.0,
            });
        }
        Ok(out)
    }

    async fn update_profile_poi_metric(
        &self,
        profile_id: &str,
        poi_id: &str,
        metric: &Metric,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE health.profile_poi SET metric = $3
            WHERE profile_id = $1 AND poi_id = $2
              AND COALESCE((metric->>'last_update')::bigint, 0) <= $4
            "#,
        )
        .bind(profile_id)
        .bind(poi_id)
        .bind(Json(metric))
        .bind(metric.last_update)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_custom_symptom(&self, symptom: &CustomSymptom) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO health.symptom (id, name) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name",
        )
        .bind(&symptom.id)
        .bind(&symptom.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn custom_symptoms(&self, ids: &[String]) -> EngineResult<Vec<CustomSymptom>> {
        let rows = sqlx::query("SELECT id, name FROM health.symptom WHERE id = ANY($1) ORDER BY id")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(CustomSymptom {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl ReportStore for PgStore {
    async fn insert_report(&self, report: &Report) -> EngineResult<()> {
        let sql = format!(
            "INSERT INTO health.{} ({REPORT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)",
            report.kind.table()
        );
        sqlx::query(&sql)
            .bind(&report.profile_id)
            .bind(report.location.lat)
            .bind(report.location.lng)
            .bind(report.ts)
            .bind(&report.official)
            .bind(&report.customized)
            .execute(&self.pool)
            .await?;
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
        let sql = format!(
            r#"
            SELECT {REPORT_COLUMNS} FROM health.{}
            WHERE earth_box(ll_to_earth($1, $2), $3 * {BOX_PADDING}) @> ll_to_earth(lat, lng)
              AND health.haversine_m($1, $2, lat, lng) <= $3
              AND ts >= $4 AND ts < $5
            "#,
            kind.table()
        );
        let rows = sqlx::query(&sql)
            .bind(center.lat)
            .bind(center.lng)
            .bind(radius_m)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| report_from_row(kind, row)).collect()
    }

    async fn reports_of(
        &self,
        kind: ReportKind,
        profile_id: &str,
        from: i64,
        to: i64,
    ) -> EngineResult<Vec<Report>> {
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM health.{} WHERE profile_id = $1 AND ts >= $2 AND ts < $3 ORDER BY ts",
            kind.table()
        );
        let rows = sqlx::query(&sql)
            .bind(profile_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| report_from_row(kind, row)).collect()
    }

    async fn latest_report(&self, kind: ReportKind, profile_id: &str) -> EngineResult<Option<Report>> {
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM health.{} WHERE profile_id = $1 ORDER BY ts DESC LIMIT 1",
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|row| report_from_row(kind, row)).transpose()
    }

    async fn nearest_profiles(
        &self,
        center: GeoPoint,
        radius_m: Option<f64>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(String, f64)>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, health.haversine_m($1, $2, lat, lng) AS distance
            FROM health.profile
            WHERE lat IS NOT NULL AND lng IS NOT NULL
              AND ($3::float8 IS NULL OR (
                    earth_box(ll_to_earth($1, $2), $3 * {BOX_PADDING}) @> ll_to_earth(lat, lng)
                    AND health.haversine_m($1, $2, lat, lng) <= $3))
            ORDER BY distance, id
            LIMIT $4
            "#
        ))
        .bind(center.lat)
        .bind(center.lng)
        .bind(radius_m)
        .bind(limit.map(|n| n as i64))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push((row.try_get("id")?, row.try_get("distance")?));
        }
        Ok(out)
    }
}

#[async_trait]
impl ConfirmSource for PgStore {
    async fn boundaries(&self) -> EngineResult<Vec<Boundary>> {
        let rows = sqlx::query("SELECT country, state, county, geometry FROM health.boundary ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let geometry: Json<Geometry> = row.try_get("geometry")?;
            out.push(Boundary {
                country: row.try_get("country")?,
                state: row.try_get("state")?,
                county: row.try_get("county")?,
                geometry: geometry.0,
            });
        }
        Ok(out)
    }

    async fn confirmed_daily(
        &self,
        country: &str,
        state: &str,
        county: &str,
        days: usize,
    ) -> EngineResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT count FROM health.confirm
            WHERE country = $1 AND state = $2 AND county = $3
            ORDER BY day DESC
            LIMIT $4
            "#,
        )
        .bind(country)
        .bind(state)
        .bind(county)
        .bind(days as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut daily = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("count"))
            .collect::<Result<Vec<_>, _>>()?;
        daily.reverse();
        Ok(daily)
    }
}

#[async_trait]
impl HelpStore for PgStore {
    async fn insert_help(&self, help: &HelpRequest, since: i64) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        // one writer per requester until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&help.requester)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(&format!(
            "INSERT INTO health.help_request ({HELP_COLUMNS}) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12 \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM health.help_request \
                 WHERE requester = $2 AND state = 'pending' AND created_at >= $13 \
             )"
        ))
        .bind(help.id)
        .bind(&help.requester)
        .bind(&help.subject)
        .bind(&help.needs)
        .bind(&help.meeting_location)
        .bind(&help.contact_info)
        .bind(help.location.lat)
        .bind(help.location.lng)
        .bind(help.state.as_str())
        .bind(&help.helper)
        .bind(help.created_at)
        .bind(help.accepted_at)
        .bind(since)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "profile {} already has a pending help request",
                help.requester
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_help(&self, id: Uuid) -> EngineResult<Option<HelpRequest>> {
        let row = sqlx::query(&format!("SELECT {HELP_COLUMNS} FROM health.help_request WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(help_from_row).transpose()
    }

    async fn accept_help(&self, id: Uuid, helper: &str, at: i64) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE health.help_request
            SET state = 'accepted', helper = $2, accepted_at = $3
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(id)
        .bind(helper)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let now = Utc::now().timestamp();
    let fresh = Json(Metric::default());
    let profiles = vec![
        ("avery", "acct-avery", "GMT+8", 25.0330, 121.5654),
        ("jules", "acct-jules", "GMT+8", 25.0418, 121.5436),
        ("kiara", "acct-kiara", "GMT+8", 25.0478, 121.5170),
        ("mateo", "acct-mateo", "GMT+8", 25.0375, 121.5637),
    ];
    for (id, account_number, timezone, lat, lng) in &profiles {
        sqlx::query(
            r#"
            INSERT INTO health.profile (id, account_number, timezone, lat, lng, metric)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET timezone = EXCLUDED.timezone, lat = EXCLUDED.lat, lng = EXCLUDED.lng
            "#,
        )
        .bind(id)
        .bind(account_number)
        .bind(timezone)
        .bind(lat)
        .bind(lng)
        .bind(&fresh)
        .execute(pool)
        .await?;
    }

    let poi_id = "5f0c3b2a9d1e4c7b8a6f2e10";
    sqlx::query(
        r#"
        INSERT INTO health.poi (id, lat, lng, address, metric)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(poi_id)
    .bind(25.0340)
    .bind(121.5645)
    .bind("No. 7, Section 5, Xinyi Road, Taipei")
    .bind(&fresh)
    .execute(pool)
    .await?;
    for (profile_id, alias) in [("avery", "office"), ("mateo", "gym")] {
        sqlx::query(
            r#"
            INSERT INTO health.profile_poi (profile_id, poi_id, alias, metric)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (profile_id, poi_id) DO NOTHING
            "#,
        )
        .bind(profile_id)
        .bind(poi_id)
        .bind(alias)
        .bind(&fresh)
        .execute(pool)
        .await?;
    }

    let taipei = serde_json::json!({
        "type": "Polygon",
        "coordinates": [[[121.45, 24.96], [121.67, 24.96], [121.67, 25.21], [121.45, 25.21], [121.45, 24.96]]]
    });
    sqlx::query(
        r#"
        INSERT INTO health.boundary (country, state, county, geometry)
        VALUES ('Taiwan', '', 'Taipei City', $1)
        ON CONFLICT (country, state, county) DO NOTHING
        "#,
    )
    .bind(Json(taipei))
    .execute(pool)
    .await?;

    let today: NaiveDate = Utc::now().date_naive();
    for (days_ago, count) in [(6, 0i64), (5, 1), (4, 0), (3, 2), (2, 1), (1, 3), (0, 2)] {
        sqlx::query(
            r#"
            INSERT INTO health.confirm (country, state, county, day, count)
            VALUES ('Taiwan', '', 'Taipei City', $1, $2)
            ON CONFLICT (country, state, county, day) DO UPDATE SET count = EXCLUDED.count
            "#,
        )
        .bind(today - Duration::days(days_ago))
        .bind(count)
        .execute(pool)
        .await?;
    }

    sqlx::query("INSERT INTO health.symptom (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
        .bind("loss_of_smell")
        .bind("Loss of smell")
        .execute(pool)
        .await?;

    let reports: Vec<(ReportKind, &str, i64, Vec<&str>, Vec<&str>)> = vec![
        (ReportKind::Symptom, "avery", now - 3600, vec!["fever", "cough"], vec![]),
        (ReportKind::Symptom, "jules", now - 7200, vec!["cough"], vec!["loss_of_smell"]),
        (ReportKind::Symptom, "kiara", now - 90_000, vec!["nasal"], vec![]),
        (ReportKind::Behavior, "mateo", now - 1800, vec!["wear_mask", "clean_hand"], vec![]),
        (ReportKind::Behavior, "avery", now - 5400, vec!["social_distancing"], vec![]),
    ];
    for (kind, profile_id, ts, official, customized) in reports {
        let Some(&(_, _, _, lat, lng)) = profiles.iter().find(|p| p.0 == profile_id) else {
            continue;
        };
        sqlx::query(&format!(
            "INSERT INTO health.{} ({REPORT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (profile_id, ts) DO NOTHING",
            kind.table()
        ))
        .bind(profile_id)
        .bind(lat)
        .bind(lng)
        .bind(ts)
        .bind(official)
        .bind(customized)
        .execute(pool)
        .await?;
    }

    Ok(())
}

#[derive(Debug, Default, PartialEq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    account: String,
    kind: String,
    #[serde(default)]
    items: String,
    lat: f64,
    lng: f64,
    ts: i64,
}

fn items_of(field: &str) -> Vec<String> {
    field.split('|').map(str::to_string).collect()
}

/// Parses one CSV row into a report, splitting `items` (`a|b|c`) into
/// official and customized ids.
fn report_from_csv(row: CsvRow) -> EngineResult<Report> {
    crate::models::validate_account_id(&row.account)?;
    let kind: ReportKind = row.kind.parse()?;
    let location = GeoPoint::checked(row.lat, row.lng)?;
    let (official, customized) = match kind {
        ReportKind::Symptom => split_items(&items_of(&row.items), &ItemWeights::symptoms())?,
        ReportKind::Behavior => split_items(&items_of(&row.items), &ItemWeights::behaviors())?,
        ReportKind::Geographic => (Vec::new(), Vec::new()),
    };
    Ok(Report {
        profile_id: row.account,
        kind,
        location,
        ts: row.ts,
        official,
        customized,
    })
}

pub async fn import_csv(store: &PgStore, csv_path: &Path) -> anyhow::Result<ImportSummary> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("cannot open {}", csv_path.display()))?;
    let mut summary = ImportSummary::default();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed row {}", line + 2))?;
        let report = report_from_csv(row).with_context(|| format!("invalid row {}", line + 2))?;

        if store.get_profile(&report.profile_id).await?.is_none() {
            let mut profile = Profile::new(&report.profile_id, &report.profile_id, "");
            profile.location = Some(report.location);
            store.upsert_profile(&profile).await?;
        }
        match store.insert_report(&report).await {
            Ok(()) => summary.inserted += 1,
            Err(EngineError::Conflict(_)) => summary.skipped += 1,
            Err(err) => return Err(err.into()),
        }
        if report.kind == ReportKind::Geographic {
            store
                .update_profile_location(&report.profile_id, report.location)
                .await?;
        }
    }

    Ok(summary)
}

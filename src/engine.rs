//! Wiring shared by every loop and entry point.

use std::sync::Arc;

use crate::aggregate::Aggregator;
use crate::clock::{Clock, MINUTE};
use crate::error::{EngineError, EngineResult};
use crate::i18n::{Lang, Localizer};
use crate::models::{Profile, SymptomDescriptor};
use crate::notify::{Notifier, Payload};
use crate::runtime::Runtime;
use crate::scoring::Kernel;
use crate::store::{ConfirmSource, HelpStore, ReportStore, StateStore};

#[derive(Debug, Clone)]
pub struct Settings {
    pub cohort_radius_m: f64,
    pub nearby_radius_m: f64,
    pub spike_threshold: i64,
    /// Minimum gap between two `behavior_on_symptom_spike` nudges, seconds.
    pub spike_behavior_cooldown: i64,
    pub risk_template_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cohort_radius_m: 5000.0,
            nearby_radius_m: 5000.0,
            spike_threshold: 3,
            spike_behavior_cooldown: 90 * MINUTE,
            risk_template_id: "risk-level-changed".to_string(),
        }
    }
}

pub struct Stores {
    pub state: Arc<dyn StateStore>,
    pub reports: Arc<dyn ReportStore>,
    pub confirm: Arc<dyn ConfirmSource>,
    pub help: Arc<dyn HelpStore>,
}

impl Stores {
    /// One backend serving every seam.
    pub fn shared<S>(store: S) -> Self
    where
        S: StateStore + ReportStore + ConfirmSource + HelpStore + 'static,
    {
        let store = Arc::new(store);
        Stores {
            state: store.clone(),
            reports: store.clone(),
            confirm: store.clone(),
            help: store,
        }
    }
}

pub struct Engine {
    pub(crate) state: Arc<dyn StateStore>,
    pub(crate) reports: Arc<dyn ReportStore>,
    pub(crate) help: Arc<dyn HelpStore>,
    pub(crate) aggregator: Aggregator,
    pub(crate) kernel: Kernel,
    pub(crate) notifier: Notifier,
    pub(crate) localizer: Arc<dyn Localizer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: Settings,
    pub(crate) runtime: Runtime,
}

impl Engine {
    pub fn new(
        stores: Stores,
        notifier: Notifier,
        localizer: Arc<dyn Localizer>,
        clock: Arc<dyn Clock>,
        settings: Settings,
        runtime: Runtime,
    ) -> Arc<Self> {
        let aggregator = Aggregator::new(
            stores.reports.clone(),
            stores.state.clone(),
            stores.confirm.clone(),
        );
        Arc::new(Engine {
            state: stores.state,
            reports: stores.reports,
            help: stores.help,
            aggregator,
            kernel: Kernel::new(settings.spike_threshold),
            notifier,
            localizer,
            clock,
            settings,
            runtime,
        })
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) async fn profile(&self, id: &str) -> EngineResult<Profile> {
        self.state
            .get_profile(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("profile {id}")))
    }

    /// Resolves symptom ids for message formatting: official ids keep their
    /// English catalog name, customized ids their stored name. Unknown ids
    /// are dropped.
    pub async fn describe_symptoms(&self, ids: &[String]) -> EngineResult<Vec<SymptomDescriptor>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let customized: Vec<String> = ids
            .iter()
            .filter(|id| !self.kernel.symptoms.is_official(id))
            .cloned()
            .collect();
        let stored = self.state.custom_symptoms(&customized).await?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if self.kernel.symptoms.is_official(id) {
                out.push(SymptomDescriptor {
                    id: id.clone(),
                    name: self.localizer.localize(Lang::En, &symptom_key(id), &[]),
                    official: true,
                });
            } else if let Some(custom) = stored.iter().find(|s| &s.id == id) {
                out.push(SymptomDescriptor {
                    id: id.clone(),
                    name: custom.name.clone(),
                    official: false,
                });
            }
        }
        Ok(out)
    }

    /// Comma-separated symptom names in `lang`.
    pub(crate) fn symptom_names(&self, lang: Lang, symptoms: &[SymptomDescriptor]) -> String {
        symptoms
            .iter()
            .map(|s| {
                if s.official {
                    self.localizer.localize(lang, &symptom_key(&s.id), &[])
                } else {
                    s.name.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Sends `notification.<key>` as a localized text notification.
    /// `symptoms` fills the `{{.Symptoms}}` variable.
    pub(crate) async fn send_text(
        &self,
        recipients: &[String],
        key: &str,
        symptoms: &[SymptomDescriptor],
        payload: &Payload,
    ) -> EngineResult<()> {
        let mut headings = std::collections::BTreeMap::new();
        let mut contents = std::collections::BTreeMap::new();
        for lang in Lang::ALL {
            let names = self.symptom_names(lang, symptoms);
            let vars = [("Symptoms", names.as_str())];
            headings.insert(
                lang.code().to_string(),
                self.localizer
                    .localize(lang, &format!("notification.{key}.heading"), &vars),
            );
            contents.insert(
                lang.code().to_string(),
                self.localizer
                    .localize(lang, &format!("notification.{key}.content"), &vars),
            );
        }
        self.notifier
            .notify_accounts_text(recipients, &headings, &contents, payload)
            .await
    }

    /// Error policy at a loop's activity boundary: invariant violations skip
    /// the iteration quietly, everything else goes to the reporter.
    pub(crate) fn step_failed(&self, workflow_id: &str, err: &EngineError) {
        if err.is_skip() {
            tracing::info!(workflow_id, reason = %err, "iteration skipped");
        } else {
            self.runtime.reporter().report(workflow_id, err);
        }
    }

    /// Starts the score loop of every profile and POI, and the nudge loops
    /// of every profile that ever reported a symptom.
    pub async fn resume(self: &Arc<Self>) -> EngineResult<()> {
        let profiles = self.state.list_profile_ids().await?;
        let mut nudged = 0;
        for id in &profiles {
            self.start_account_loop(id)?;
            if self
                .reports
                .latest_report(crate::models::ReportKind::Symptom, id)
                .await?
                .is_some()
            {
                self.start_nudge_loops(id)?;
                nudged += 1;
            }
        }
        let pois = self.state.list_poi_ids().await?;
        for id in &pois {
            self.start_poi_loop(id)?;
        }
        tracing::info!(
            profiles = profiles.len(),
            pois = pois.len(),
            nudged,
            "score loops started"
        );
        Ok(())
    }
}

fn symptom_key(id: &str) -> String {
    format!("symptoms.{id}.name")
}

//! Message catalog: `en.yaml` and `zh_tw.yaml` under `I18N_DIR`, keyed by
//! dotted paths. Values may contain `{{.Name}}` placeholders.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lang {
    En,
    ZhHant,
}

impl Lang {
    pub const ALL: [Lang; 2] = [Lang::En, Lang::ZhHant];

    /// Language code used by the push vendor.
    pub fn code(&self) -> &'static str {
        match self {
            Lang::En => "en",
            Lang::ZhHant => "zh-Hant",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            Lang::En => "en.yaml",
            Lang::ZhHant => "zh_tw.yaml",
        }
    }
}

pub trait Localizer: Send + Sync {
    fn localize(&self, lang: Lang, key: &str, vars: &[(&str, &str)]) -> String;

    /// The message in every supported language, keyed by vendor code.
    fn localize_all(&self, key: &str, vars: &[(&str, &str)]) -> BTreeMap<String, String> {
        Lang::ALL
            .iter()
            .map(|lang| (lang.code().to_string(), self.localize(*lang, key, vars)))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    bundles: HashMap<Lang, serde_yaml::Value>,
}

impl Catalog {
    pub fn load(dir: &Path) -> EngineResult<Self> {
        let mut catalog = Catalog::default();
        for lang in Lang::ALL {
            let path = dir.join(lang.file_name());
            let text = std::fs::read_to_string(&path).map_err(|e| {
                EngineError::Fatal(format!("cannot read {}: {e}", path.display()))
            })?;
            catalog.insert(lang, &text)?;
        }
        tracing::info!(dir = %dir.display(), "message catalog loaded");
        Ok(catalog)
    }

    pub fn from_yaml(sources: &[(Lang, &str)]) -> EngineResult<Self> {
        let mut catalog = Catalog::default();
        for (lang, text) in sources {
            catalog.insert(*lang, text)?;
        }
        Ok(catalog)
    }

    fn insert(&mut self, lang: Lang, text: &str) -> EngineResult<()> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        self.bundles.insert(lang, value);
        Ok(())
    }

    fn lookup(&self, lang: Lang, key: &str) -> Option<&str> {
        let mut node = self.bundles.get(&lang)?;
        for part in key.split('.') {
            node = node.get(part)?;
        }
        node.as_str()
    }
}

/// Replaces `{{.Name}}` with the value bound to `Name`.
pub fn expand(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{.{name}}}}}"), value);
    }
    out
}

impl Localizer for Catalog {
    /// Falls back to English, then to the key itself.
    fn localize(&self, lang: Lang, key: &str, vars: &[(&str, &str)]) -> String {
        let template = self
            .lookup(lang, key)
            .or_else(|| self.lookup(Lang::En, key));
        match template {
            Some(template) => expand(template, vars),
            None => {
                tracing::warn!(lang = lang.code(), key, "missing message");
                key.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EN: &str = r#"
notification:
  symptom_follow_up:
    heading: How are you feeling today?
    content: "Yesterday you reported {{.Symptoms}}."
symptoms:
  fever:
    name: Fever
"#;

    const ZH: &str = r#"
notification:
  symptom_follow_up:
    heading: 今天感覺如何？
symptoms:
  fever:
    name: 發燒
"#;

    fn catalog() -> Catalog {
        Catalog::from_yaml(&[(Lang::En, EN), (Lang::ZhHant, ZH)]).unwrap()
    }

    #[test]
    fn expands_template_variables() {
        let catalog = catalog();
        let text = catalog.localize(
            Lang::En,
            "notification.symptom_follow_up.content",
            &[("Symptoms", "Fever, Cough")],
        );
        assert_eq!(text, "Yesterday you reported Fever, Cough.");
    }

    #[test]
    fn falls_back_to_english_then_key() {
        let catalog = catalog();
        assert_eq!(catalog.localize(Lang::ZhHant, "symptoms.fever.name", &[]), "發燒");
        assert_eq!(
            catalog.localize(Lang::ZhHant, "notification.symptom_follow_up.content", &[("Symptoms", "x")]),
            "Yesterday you reported x."
        );
        assert_eq!(catalog.localize(Lang::En, "no.such.key", &[]), "no.such.key");
    }

    #[test]
    fn localize_all_uses_vendor_codes() {
        let all = catalog().localize_all("notification.symptom_follow_up.heading", &[]);
        assert_eq!(all.get("en").map(String::as_str), Some("How are you feeling today?"));
        assert_eq!(all.get("zh-Hant").map(String::as_str), Some("今天感覺如何？"));
    }

    #[test]
    fn shipped_catalog_has_every_notification_key() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("i18n");
        let catalog = Catalog::load(&dir).unwrap();
        for key in [
            "notification.symptom_follow_up.heading",
            "notification.symptom_follow_up.content",
            "notification.behavior_on_high_risk.heading",
            "notification.behavior_on_high_risk.content",
            "notification.behavior_on_risk_area.heading",
            "notification.behavior_on_risk_area.content",
            "notification.behavior_on_symptom_spike.heading",
            "notification.behavior_on_symptom_spike.content",
            "notification.symptom_spike.heading",
            "notification.symptom_spike.content",
            "notification.new_help.heading",
            "notification.new_help.content",
            "notification.help_accepted.heading",
            "notification.help_accepted.content",
            "symptoms.fever.name",
            "symptoms.nasal.name",
        ] {
            for lang in Lang::ALL {
                assert!(catalog.lookup(lang, key).is_some(), "{key} missing for {lang:?}");
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What to do with a matched element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymizationAction {
    /// Delete the element.
    Remove,
    /// Replace the value with a VR-appropriate zero value.
    Blank,
    /// Set the value to the rule's replacement, coerced to the VR.
    Replace,
    /// Replace the value with a truncated SHA-256 digest of itself.
    Hash,
    /// Leave the element untouched; documents intent in a template.
    Keep,
    /// Shift DA/DT values by the template's day offset.
    DateShift,
    /// Replace the UID through the run-scoped mapping table.
    UidRemap,
}

/// How to anonymize one tag. The selector is either a dictionary keyword
/// (`"PatientName"`) or a literal `(GGGG,EEEE)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymizationRule {
    pub tag: String,
    pub action: AnonymizationAction,
    #[serde(default)]
    pub replacement_value: String,
    #[serde(default)]
    pub description: String,
}

impl AnonymizationRule {
    pub fn new<S: Into<String>>(tag: S, action: AnonymizationAction) -> Self {
        AnonymizationRule {
            tag: tag.into(),
            action,
            replacement_value: String::new(),
            description: String::new(),
        }
    }

    pub fn with_replacement<S: Into<String>, R: Into<String>>(
        tag: S,
        action: AnonymizationAction,
        replacement: R,
    ) -> Self {
        AnonymizationRule {
            tag: tag.into(),
            action,
            replacement_value: replacement.into(),
            description: String::new(),
        }
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

/// A named, versioned anonymization strategy: an ordered rule list plus
/// run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizationTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<AnonymizationRule>,
    /// Day offset applied run-wide by DATE_SHIFT rules; `None` disables
    /// shifting.
    #[serde(default)]
    pub date_shift_days: Option<i64>,
    #[serde(default = "default_true")]
    pub preserve_relationships: bool,
    #[serde(default)]
    pub remove_private_tags: bool,
    #[serde(default)]
    pub remove_curves: bool,
    #[serde(default)]
    pub remove_overlays: bool,
    #[serde(default = "Utc::now")]
    pub created_date: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_date: DateTime<Utc>,
}

impl AnonymizationTemplate {
    pub fn new<S: Into<String>, D: Into<String>>(name: S, description: D) -> Self {
        AnonymizationTemplate {
            name: name.into(),
            description: description.into(),
            version: default_version(),
            rules: Vec::new(),
            date_shift_days: None,
            preserve_relationships: true,
            remove_private_tags: false,
            remove_curves: false,
            remove_overlays: false,
            created_date: Utc::now(),
            modified_date: Utc::now(),
        }
    }

    pub fn add_rule(&mut self, rule: AnonymizationRule) {
        self.rules.push(rule);
        self.modified_date = Utc::now();
    }

    /// Removes every rule targeting `tag`.
    pub fn remove_rule(&mut self, tag: &str) {
        self.rules.retain(|rule| rule.tag != tag);
        self.modified_date = Utc::now();
    }

    pub fn get_rule(&self, tag: &str) -> Option<&AnonymizationRule> {
        self.rules.iter().find(|rule| rule.tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_use_snake_case() {
        assert_eq!(
            serde_json::to_string(&AnonymizationAction::DateShift).unwrap(),
            "\"date_shift\""
        );
        assert_eq!(
            serde_json::from_str::<AnonymizationAction>("\"uid_remap\"").unwrap(),
            AnonymizationAction::UidRemap
        );
    }

    #[test]
    fn template_roundtrips_through_json() {
        let mut template = AnonymizationTemplate::new("Test", "A test template");
        template.add_rule(AnonymizationRule::with_replacement(
            "PatientName",
            AnonymizationAction::Replace,
            "ANON",
        ));
        template.date_shift_days = Some(-365);

        let json = serde_json::to_string(&template).unwrap();
        let back: AnonymizationTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "Test");
        assert_eq!(back.rules.len(), 1);
        assert_eq!(back.date_shift_days, Some(-365));
        assert!(back.preserve_relationships);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let json = r#"{"name": "Sparse", "rules": [{"tag": "PatientID", "action": "hash"}]}"#;
        let template: AnonymizationTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(template.version, "1.0");
        assert!(template.preserve_relationships);
        assert!(template.date_shift_days.is_none());
        assert_eq!(template.rules[0].action, AnonymizationAction::Hash);
        assert!(template.rules[0].replacement_value.is_empty());
    }

    #[test]
    fn rule_removal_matches_by_tag() {
        let mut template = AnonymizationTemplate::new("T", "");
        template.add_rule(AnonymizationRule::new("PatientID", AnonymizationAction::Hash));
        template.add_rule(AnonymizationRule::new("PatientName", AnonymizationAction::Remove));
        template.remove_rule("PatientID");
        assert!(template.get_rule("PatientID").is_none());
        assert!(template.get_rule("PatientName").is_some());
    }
}

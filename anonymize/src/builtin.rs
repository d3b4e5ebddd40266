use crate::template::{AnonymizationAction, AnonymizationRule, AnonymizationTemplate};

use AnonymizationAction::{Blank, DateShift, Hash, Keep, Remove, Replace, UidRemap};

/// The built-in templates. They are injected into every template store
/// at load time, regardless of what the user's template file contains.
pub fn builtin_templates() -> Vec<AnonymizationTemplate> {
    vec![
        research_standard(),
        clinical_review(),
        teaching_collection(),
        minimal_anonymization(),
    ]
}

fn rules(template: &mut AnonymizationTemplate, specs: &[(&str, AnonymizationAction, &str)]) {
    for (tag, action, replacement) in specs {
        if replacement.is_empty() {
            template.add_rule(AnonymizationRule::new(*tag, *action));
        } else {
            template.add_rule(AnonymizationRule::with_replacement(*tag, *action, *replacement));
        }
    }
}

fn research_standard() -> AnonymizationTemplate {
    let mut template = AnonymizationTemplate::new(
        "Research Standard",
        "Remove all patient identifiers for research use",
    );
    rules(
        &mut template,
        &[
            ("PatientName", Replace, "RESEARCH_PATIENT"),
            ("PatientID", Hash, ""),
            ("PatientBirthDate", Blank, ""),
            ("PatientSex", Keep, ""),
            ("PatientAge", Keep, ""),
            ("PatientWeight", Keep, ""),
            ("PatientSize", Keep, ""),
            ("OtherPatientNames", Remove, ""),
            ("OtherPatientIDs", Remove, ""),
            ("PatientBirthTime", Remove, ""),
            ("PatientComments", Remove, ""),
            ("StudyDate", DateShift, ""),
            ("SeriesDate", DateShift, ""),
            ("AcquisitionDate", DateShift, ""),
            ("ContentDate", DateShift, ""),
            ("StudyTime", Keep, ""),
            ("SeriesTime", Keep, ""),
            ("AcquisitionTime", Keep, ""),
            ("ContentTime", Keep, ""),
            ("StudyDescription", Keep, ""),
            ("SeriesDescription", Keep, ""),
            ("StudyInstanceUID", UidRemap, ""),
            ("SeriesInstanceUID", UidRemap, ""),
            ("SOPInstanceUID", UidRemap, ""),
            ("ReferringPhysicianName", Remove, ""),
            ("PerformingPhysicianName", Remove, ""),
            ("OperatorsName", Remove, ""),
            ("PhysiciansOfRecord", Remove, ""),
        ],
    );
    template.date_shift_days = Some(-365);
    template.preserve_relationships = true;
    template.remove_private_tags = true;
    template
}

fn clinical_review() -> AnonymizationTemplate {
    let mut template = AnonymizationTemplate::new(
        "Clinical Review",
        "Remove patient identifiers but keep clinical information",
    );
    rules(
        &mut template,
        &[
            ("PatientName", Replace, "CLINICAL_PATIENT"),
            ("PatientID", Hash, ""),
            ("PatientBirthDate", Blank, ""),
            ("PatientSex", Keep, ""),
            ("PatientAge", Keep, ""),
            ("PatientWeight", Keep, ""),
            ("PatientSize", Keep, ""),
            ("StudyDate", Keep, ""),
            ("SeriesDate", Keep, ""),
            ("StudyDescription", Keep, ""),
            ("SeriesDescription", Keep, ""),
            ("StudyInstanceUID", UidRemap, ""),
            ("SeriesInstanceUID", UidRemap, ""),
            ("SOPInstanceUID", UidRemap, ""),
        ],
    );
    template.preserve_relationships = true;
    template.remove_private_tags = false;
    template
}

fn teaching_collection() -> AnonymizationTemplate {
    let mut template = AnonymizationTemplate::new(
        "Teaching Collection",
        "Anonymize for educational/teaching purposes",
    );
    rules(
        &mut template,
        &[
            ("PatientName", Replace, "TEACHING_CASE"),
            ("PatientID", Replace, "EDU_001"),
            ("PatientBirthDate", Replace, "19800101"),
            ("PatientSex", Keep, ""),
            ("PatientAge", Keep, ""),
            ("StudyDate", DateShift, ""),
            ("SeriesDate", DateShift, ""),
            ("StudyDescription", Keep, ""),
            ("SeriesDescription", Keep, ""),
            ("StudyInstanceUID", UidRemap, ""),
            ("SeriesInstanceUID", UidRemap, ""),
            ("SOPInstanceUID", UidRemap, ""),
        ],
    );
    template.date_shift_days = Some(-730);
    template.preserve_relationships = true;
    template.remove_private_tags = true;
    template
}

fn minimal_anonymization() -> AnonymizationTemplate {
    let mut template = AnonymizationTemplate::new(
        "Minimal Anonymization",
        "Remove only essential patient identifiers",
    );
    rules(
        &mut template,
        &[
            ("PatientName", Hash, ""),
            ("PatientID", Hash, ""),
            ("PatientBirthDate", Blank, ""),
        ],
    );
    template.preserve_relationships = true;
    template.remove_private_tags = false;
    template
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_builtins_with_expected_names() {
        let names: Vec<String> = builtin_templates().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            [
                "Research Standard",
                "Clinical Review",
                "Teaching Collection",
                "Minimal Anonymization"
            ]
        );
    }

    #[test]
    fn research_standard_shifts_dates_back_a_year() {
        let template = research_standard();
        assert_eq!(template.date_shift_days, Some(-365));
        assert!(template.remove_private_tags);
        assert_eq!(
            template.get_rule("StudyInstanceUID").unwrap().action,
            AnonymizationAction::UidRemap
        );
        assert_eq!(
            template.get_rule("PatientName").unwrap().replacement_value,
            "RESEARCH_PATIENT"
        );
    }

    #[test]
    fn minimal_template_touches_only_core_identity() {
        let template = minimal_anonymization();
        assert_eq!(template.rules.len(), 3);
        assert!(template.date_shift_days.is_none());
    }
}

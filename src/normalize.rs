//! Normalization: parsed mwTab document → entity rows.
//!
//! The output is a pure function of the document (and the optional source
//! file id). Entities are deduplicated by their unique keys and emitted in
//! key order, so running the pipeline twice on the same input yields
//! identical batches. Re-run idempotence rests on that.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result, Warning};
use crate::models::{
    AnalysisRow, FeatureRow, MeasurementRow, SampleFactorRow, SampleRow, StudyRow,
};
use crate::mwtab::{MwTabDocument, SectionBody, ANNOTATION_TABLE};

/// Separator between `key:value` segments in a factor string.
pub const FACTOR_DELIMITER: char = '|';

const MAX_FEATURE_NAME_LEN: usize = 100;
const BINNED_TABLE: &str = "NMR_BINNED_DATA";

/// Kind of measured feature, which decides its uid namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Metabolite,
    NmrBin,
}

impl FeatureKind {
    fn for_table(name: &str) -> Self {
        if name == BINNED_TABLE {
            FeatureKind::NmrBin
        } else {
            FeatureKind::Metabolite
        }
    }

    fn uid_segment(&self) -> &'static str {
        match self {
            FeatureKind::Metabolite => "met",
            FeatureKind::NmrBin => "bin",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Metabolite => "metabolite",
            FeatureKind::NmrBin => "nmr_bin",
        }
    }
}

/// Entity rows for one document, in upsert dependency order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityBatch {
    pub studies: Vec<StudyRow>,
    pub analyses: Vec<AnalysisRow>,
    pub samples: Vec<SampleRow>,
    pub sample_factors: Vec<SampleFactorRow>,
    pub features: Vec<FeatureRow>,
    pub measurements: Vec<MeasurementRow>,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub batch: EntityBatch,
    pub warnings: Vec<Warning>,
}

pub fn sample_uid(study_id: &str, label: &str) -> String {
    format!("{}:{}", study_id, label.trim())
}

pub fn feature_uid(analysis_id: &str, kind: FeatureKind, name_raw: &str) -> Option<String> {
    let normalized = normalize_feature_name(name_raw);
    if normalized.is_empty() {
        return None;
    }
    Some(format!("{}:{}:{}", analysis_id, kind.uid_segment(), normalized))
}

/// Canonical form of a feature name.
///
/// Lower-cased, whitespace collapsed, characters outside
/// `[a-z0-9 ._-,()']` replaced by `_`, underscore runs collapsed and
/// trimmed. Results longer than 100 characters become the first 16 hex
/// digits of their SHA-256.
pub fn normalize_feature_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut out = String::with_capacity(collapsed.len());
    for c in collapsed.chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || " ._-,()'".contains(c) {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let out = out.trim_matches('_').to_string();

    if out.chars().count() > MAX_FEATURE_NAME_LEN {
        let digest = hex::encode(Sha256::digest(out.as_bytes()));
        return digest[..16].to_string();
    }
    out
}

/// Split a raw factor string into `(key, value)` pairs.
///
/// Segments without a colon or with an empty key are reported through
/// `on_invalid` and skipped. `-` or blank means no factors.
pub fn split_factors(raw: &str, mut on_invalid: impl FnMut(&str)) -> Vec<(String, String)> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        return Vec::new();
    }

    let mut pairs = Vec::new();
    for segment in raw.split(FACTOR_DELIMITER).map(str::trim) {
        if segment.is_empty() {
            continue;
        }
        match segment.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                pairs.push((key.trim().to_string(), value.trim().to_string()));
            }
            _ => on_invalid(segment),
        }
    }
    pairs
}

/// Turn a parsed document into entity rows.
///
/// `file_id` is recorded on the Analysis as its source file. Fails only when
/// the study or analysis id contains `:`, which would make uids ambiguous.
pub fn normalize(doc: &MwTabDocument, file_id: Option<&str>) -> Result<Normalized> {
    check_identifier("STUDY_ID", &doc.study_id)?;
    if let Some(analysis_id) = &doc.analysis_id {
        check_identifier("ANALYSIS_ID", analysis_id)?;
    }

    let mut warnings = Vec::new();
    let study_id = doc.study_id.as_str();

    let mut samples: BTreeMap<String, SampleRow> = BTreeMap::new();
    let mut factors: BTreeMap<(String, String), SampleFactorRow> = BTreeMap::new();
    let mut features: BTreeMap<String, FeatureRow> = BTreeMap::new();
    let mut measurements: BTreeMap<(String, String), MeasurementRow> = BTreeMap::new();

    for row in doc.sample_factor_rows() {
        let uid = sample_uid(study_id, &row.key);
        if samples.contains_key(&uid) {
            warnings.push(Warning::at(
                row.line,
                format!("sample '{}' listed again, later row wins", row.key),
            ));
            factors.retain(|(sample, _), _| sample != &uid);
        }

        let factors_raw = Some(row.value.clone()).filter(|v| !v.is_empty() && v != "-");
        samples.insert(
            uid.clone(),
            SampleRow {
                sample_uid: uid.clone(),
                study_id: study_id.to_string(),
                sample_label: row.key.trim().to_string(),
                subject: row.subject.clone(),
                factors_raw,
            },
        );

        let pairs = split_factors(&row.value, |segment| {
            warnings.push(Warning::at(
                row.line,
                format!("factor segment '{}' is not key:value, skipped", segment),
            ));
        });
        for (key, value) in pairs {
            factors.insert(
                (uid.clone(), key.clone()),
                SampleFactorRow {
                    sample_uid: uid.clone(),
                    factor_key: key,
                    factor_value: value,
                },
            );
        }
    }

    for (table_name, table) in doc.measurement_tables() {
        let Some(analysis_id) = doc.analysis_id.as_deref() else {
            warnings.push(Warning::general(format!(
                "{} skipped: document has no ANALYSIS_ID",
                table_name
            )));
            continue;
        };
        let kind = FeatureKind::for_table(table_name);

        let resolved: Vec<Option<String>> = table
            .columns
            .iter()
            .map(|label| {
                if label.is_empty() {
                    return None;
                }
                let uid = sample_uid(study_id, label);
                if samples.contains_key(&uid) {
                    Some(uid)
                } else {
                    warnings.push(Warning::general(format!(
                        "{} column '{}' does not match any sample, skipped",
                        table_name, label
                    )));
                    None
                }
            })
            .collect();

        for row in &table.rows {
            let Some(uid) = feature_uid(analysis_id, kind, &row.name) else {
                warnings.push(Warning::at(
                    row.line,
                    format!("feature name '{}' normalizes to nothing, skipped", row.name),
                ));
                continue;
            };

            match features.get(&uid) {
                Some(existing) if existing.name_raw != row.name => {
                    warnings.push(Warning::at(
                        row.line,
                        format!(
                            "feature '{}' shares uid {} with '{}'",
                            row.name, uid, existing.name_raw
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    features.insert(
                        uid.clone(),
                        FeatureRow {
                            feature_uid: uid.clone(),
                            analysis_id: analysis_id.to_string(),
                            feature_type: kind.as_str().to_string(),
                            name_raw: row.name.clone(),
                            refmet_name: None,
                        },
                    );
                }
            }

            for (cell, sample) in row.cells.iter().zip(&resolved) {
                let Some(sample) = sample else { continue };
                let Some(value) = cell.reading() else { continue };
                measurements.insert(
                    (sample.clone(), uid.clone()),
                    MeasurementRow {
                        sample_uid: sample.clone(),
                        feature_uid: uid.clone(),
                        value,
                        unit: table.units.clone(),
                    },
                );
            }
        }
    }

    if let Some(analysis_id) = doc.analysis_id.as_deref() {
        attach_refmet_names(doc, analysis_id, &mut features);
    }

    let batch = EntityBatch {
        studies: vec![StudyRow {
            study_id: study_id.to_string(),
        }],
        analyses: doc
            .analysis_id
            .iter()
            .map(|analysis_id| AnalysisRow {
                study_id: study_id.to_string(),
                analysis_id: analysis_id.clone(),
                file_id: file_id.map(str::to_string),
            })
            .collect(),
        samples: samples.into_values().collect(),
        sample_factors: factors.into_values().collect(),
        features: features.into_values().collect(),
        measurements: measurements.into_values().collect(),
    };

    Ok(Normalized { batch, warnings })
}

fn check_identifier(field: &str, value: &str) -> Result<()> {
    if value.contains(':') {
        return Err(Error::InvalidInput(format!(
            "{} '{}' contains ':' and cannot form unique ids",
            field, value
        )));
    }
    Ok(())
}

/// Copy `refmet_name` from the METABOLITES annotation table onto features
/// already emitted from measurement tables.
fn attach_refmet_names(
    doc: &MwTabDocument,
    analysis_id: &str,
    features: &mut BTreeMap<String, FeatureRow>,
) {
    let Some(section) = doc.section(ANNOTATION_TABLE) else {
        return;
    };
    let SectionBody::Table(table) = &section.body else {
        return;
    };
    let Some(col) = table.column_index("refmet_name") else {
        return;
    };

    for row in &table.rows {
        let Some(refmet) = row.cells.get(col).and_then(|c| c.text()) else {
            continue;
        };
        let Some(uid) = feature_uid(analysis_id, FeatureKind::Metabolite, &row.name) else {
            continue;
        };
        if let Some(feature) = features.get_mut(&uid) {
            feature.refmet_name = Some(refmet.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mwtab;

    const SCENARIO: &str = "#METABOLOMICS WORKBENCH\n\
STUDY_ID ST000315\n\
ANALYSIS_ID AN000501\n\
#SUBJECT_SAMPLE_FACTORS:\n\
SUBJECT_SAMPLE_FACTORS\t-\tS1\tGroup:Exercise | Visit:1\n\
#MS_METABOLITE_DATA\n\
MS_METABOLITE_DATA:UNITS\tmM\n\
MS_METABOLITE_DATA_START\n\
Samples\tS1\n\
Glucose\t12.5\n\
MS_METABOLITE_DATA_END\n";

    fn run(text: &str) -> Normalized {
        let parsed = mwtab::parse(text).unwrap();
        normalize(&parsed.document, Some("file-1")).unwrap()
    }

    #[test]
    fn scenario_entities() {
        let out = run(SCENARIO);
        assert!(out.warnings.is_empty(), "{:?}", out.warnings);
        let b = out.batch;

        assert_eq!(b.studies, vec![StudyRow { study_id: "ST000315".into() }]);
        assert_eq!(
            b.analyses,
            vec![AnalysisRow {
                study_id: "ST000315".into(),
                analysis_id: "AN000501".into(),
                file_id: Some("file-1".into()),
            }]
        );
        assert_eq!(b.samples.len(), 1);
        assert_eq!(b.samples[0].sample_uid, "ST000315:S1");
        assert_eq!(
            b.samples[0].factors_raw.as_deref(),
            Some("Group:Exercise | Visit:1")
        );

        let factors: Vec<_> = b
            .sample_factors
            .iter()
            .map(|f| (f.factor_key.as_str(), f.factor_value.as_str()))
            .collect();
        assert_eq!(factors, vec![("Group", "Exercise"), ("Visit", "1")]);

        assert_eq!(b.features.len(), 1);
        assert_eq!(b.features[0].feature_uid, "AN000501:met:glucose");
        assert_eq!(b.features[0].feature_type, "metabolite");
        assert_eq!(b.features[0].name_raw, "Glucose");

        assert_eq!(
            b.measurements,
            vec![MeasurementRow {
                sample_uid: "ST000315:S1".into(),
                feature_uid: "AN000501:met:glucose".into(),
                value: Some(12.5),
                unit: Some("mM".into()),
            }]
        );
    }

    #[test]
    fn units_line_inside_table_yields_same_entities() {
        let moved = SCENARIO
            .replace("MS_METABOLITE_DATA:UNITS\tmM\n", "")
            .replace(
                "MS_METABOLITE_DATA_START\n",
                "MS_METABOLITE_DATA_START\nMS_METABOLITE_DATA:UNITS\tmM\n",
            );
        let bare = moved.replace("MS_METABOLITE_DATA:UNITS\tmM", "UNITS\tmM");

        for text in [moved, bare] {
            let out = run(&text);
            assert!(out.warnings.is_empty(), "{:?}", out.warnings);
            assert_eq!(out.batch, run(SCENARIO).batch);
            let features: Vec<_> = out
                .batch
                .features
                .iter()
                .map(|f| f.feature_uid.as_str())
                .collect();
            assert_eq!(features, vec!["AN000501:met:glucose"]);
            assert_eq!(out.batch.measurements.len(), 1);
            assert_eq!(out.batch.measurements[0].unit.as_deref(), Some("mM"));
        }
    }

    #[test]
    fn deterministic() {
        assert_eq!(run(SCENARIO).batch, run(SCENARIO).batch);
    }

    #[test]
    fn malformed_factor_segment_warns() {
        let text = SCENARIO.replace("Group:Exercise | Visit:1", "Group | Visit:1 | :x");
        let out = run(&text);
        assert_eq!(out.batch.sample_factors.len(), 1);
        assert_eq!(out.batch.sample_factors[0].factor_key, "Visit");
        assert_eq!(out.warnings.len(), 2);
        assert_eq!(out.warnings[0].line, Some(5));
        assert!(out.warnings[0].message.contains("'Group'"));
        // the rest of the file still normalizes
        assert_eq!(out.batch.measurements.len(), 1);
    }

    #[test]
    fn unresolved_column_warns() {
        let text = SCENARIO
            .replace("Samples\tS1\n", "Samples\tS1\tS9\n")
            .replace("Glucose\t12.5\n", "Glucose\t12.5\t3\n");
        let out = run(&text);
        assert_eq!(out.batch.measurements.len(), 1);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].message.contains("'S9'"));
    }

    #[test]
    fn missing_value_is_null_measurement() {
        let out = run(&SCENARIO.replace("12.5", "NA"));
        assert_eq!(out.batch.measurements.len(), 1);
        assert_eq!(out.batch.measurements[0].value, None);
    }

    #[test]
    fn no_analysis_id_skips_measurements() {
        let out = run(&SCENARIO.replace("ANALYSIS_ID AN000501\n", ""));
        assert!(out.batch.analyses.is_empty());
        assert!(out.batch.features.is_empty());
        assert!(out.batch.measurements.is_empty());
        assert_eq!(out.batch.samples.len(), 1);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn colon_in_study_id_fails() {
        let parsed = mwtab::parse(&SCENARIO.replace("ST000315", "ST:315")).unwrap();
        assert!(matches!(
            normalize(&parsed.document, None),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn refmet_and_binned_features() {
        let text = "#METABOLOMICS WORKBENCH STUDY_ID:ST1 ANALYSIS_ID:AN1\n\
#SUBJECT_SAMPLE_FACTORS:\n\
SUBJECT_SAMPLE_FACTORS\t-\tA\tGroup:x\n\
MS_METABOLITE_DATA_START\n\
Samples\tA\n\
Glucose\t1\n\
MS_METABOLITE_DATA_END\n\
NMR_BINNED_DATA_START\n\
Bin range(ppm)\tA\n\
0.50...0.54\t0.25\n\
NMR_BINNED_DATA_END\n\
METABOLITES_START\n\
metabolite_name\trefmet_name\n\
glucose\tGlucose\n\
METABOLITES_END\n";
        let out = run(text);
        let uids: Vec<_> = out.batch.features.iter().map(|f| f.feature_uid.as_str()).collect();
        assert_eq!(uids, vec!["AN1:bin:0.50...0.54", "AN1:met:glucose"]);
        assert_eq!(out.batch.features[0].feature_type, "nmr_bin");
        assert_eq!(out.batch.features[1].refmet_name.as_deref(), Some("Glucose"));
        assert_eq!(out.batch.measurements.len(), 2);
    }

    #[test]
    fn feature_name_normalization() {
        assert_eq!(normalize_feature_name("  Glucose  "), "glucose");
        assert_eq!(normalize_feature_name("3-Hydroxy\t Butyrate"), "3-hydroxy butyrate");
        assert_eq!(normalize_feature_name("PC(34:1)"), "pc(34_1)");
        assert_eq!(normalize_feature_name("α-Tocopherol"), "-tocopherol");
        assert_eq!(normalize_feature_name("**"), "");
        let long = "x".repeat(150);
        let hashed = normalize_feature_name(&long);
        assert_eq!(hashed.len(), 16);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn uids_are_pure() {
        assert_eq!(sample_uid("ST1", " S1 "), "ST1:S1");
        assert_eq!(
            feature_uid("AN1", FeatureKind::Metabolite, "Glucose"),
            feature_uid("AN1", FeatureKind::Metabolite, " GLUCOSE ")
        );
        assert_eq!(feature_uid("AN1", FeatureKind::Metabolite, "##"), None);
    }

    #[test]
    fn empty_factor_string() {
        let mut invalid = Vec::new();
        assert!(split_factors("-", |s| invalid.push(s.to_string())).is_empty());
        assert!(split_factors("  ", |s| invalid.push(s.to_string())).is_empty());
        assert!(invalid.is_empty());
    }
}

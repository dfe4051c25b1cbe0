//! # Cohort Loading
//!
//! Reads one CSV per disease cohort, stacks them in the order given, and turns
//! the result into the numeric matrix and label vectors the evaluator consumes.
//!
//! Every cohort file shares a fixed schema: the reserved columns `ID`, `sex`,
//! `age`, `CLASS` (cohort label such as `HC` or `COVID_severe`) and `COVID`
//! (0/1 status), plus one numeric column per biomarker. Biomarker columns are
//! the features; `sex` and `age` join them only on request.
//!
//! Failures are user-input errors and `CohortError` names the file and column
//! at fault.

use crate::harness::{EvaluationData, EvaluationError};
use ahash::{AHashMap, AHashSet};
use ndarray::{Array2, ShapeBuilder};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const ID_COLUMN: &str = "ID";
pub const SEX_COLUMN: &str = "sex";
pub const AGE_COLUMN: &str = "age";
pub const CLASS_COLUMN: &str = "CLASS";
pub const COVID_COLUMN: &str = "COVID";

const RESERVED_COLUMNS: [&str; 5] = [ID_COLUMN, SEX_COLUMN, AGE_COLUMN, CLASS_COLUMN, COVID_COLUMN];

/// Cohort labels promoted to the third class under `LabelMode::Severity`.
const SEVERE_CLASSES: [&str; 2] = ["COVID_moderate", "COVID_severe"];

#[derive(Error, Debug)]
pub enum CohortError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error while reading {path:?}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("No cohort files were given.")]
    NoCohorts,
    #[error("Cohort file {0:?} contains no data rows.")]
    EmptyFile(PathBuf),
    #[error(
        "The required column '{column}' was not found in {path:?}. Please check spelling and case."
    )]
    ColumnNotFound { path: PathBuf, column: String },
    #[error(
        "The column '{column}' in {path:?} could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        path: PathBuf,
        column: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in column '{column}' of {path:?}. Complete data is required.")]
    MissingValuesFound { path: PathBuf, column: String },
    #[error("Non-finite values (NaN or Infinity) were found in column '{column}' of {path:?}.")]
    NonFiniteValuesFound { path: PathBuf, column: String },
    #[error("Row {row} of {path:?} has {column} = {value}; expected 0 or 1.")]
    NotBinary {
        path: PathBuf,
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error("Unknown label mode '{0}'. Expected 'binary' or 'severity'.")]
    UnknownLabelMode(String),
    #[error("Feature matrix could not be assembled: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// How the fitting target is derived from the `COVID` and `CLASS` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    /// COVID-positive (1) against every other cohort (0).
    #[default]
    Binary,
    /// Non-COVID (0), mild COVID (1), moderate or severe COVID (2).
    Severity,
}

impl FromStr for LabelMode {
    type Err = CohortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(LabelMode::Binary),
            "severity" => Ok(LabelMode::Severity),
            other => Err(CohortError::UnknownLabelMode(other.to_string())),
        }
    }
}

impl fmt::Display for LabelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelMode::Binary => write!(f, "binary"),
            LabelMode::Severity => write!(f, "severity"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOptions {
    /// Use exactly these columns, in this order. `None` selects every
    /// non-reserved column of the first file.
    pub features: Option<Vec<String>>,
    /// Append `sex` (F = 1, M = 0) and `age` to the features.
    pub include_demographics: bool,
}

/// All cohorts stacked into one table.
#[derive(Debug, Clone)]
pub struct Cohort {
    pub sample_ids: Vec<String>,
    pub feature_names: Vec<String>,
    /// Shape: [n_records, n_features].
    pub features: Array2<f64>,
    /// The `COVID` status of every record.
    pub covid: Vec<usize>,
    /// The `CLASS` label of every record.
    pub classes: Vec<String>,
    /// Index of the file each record was read from.
    pub sources: Vec<usize>,
}

impl Cohort {
    pub fn n_records(&self) -> usize {
        self.covid.len()
    }

    pub fn target(&self, mode: LabelMode) -> Vec<usize> {
        match mode {
            LabelMode::Binary => self.covid.clone(),
            LabelMode::Severity => self
                .covid
                .iter()
                .zip(&self.classes)
                .map(|(&covid, class)| {
                    if SEVERE_CLASSES.contains(&class.as_str()) {
                        2
                    } else {
                        covid
                    }
                })
                .collect(),
        }
    }

    /// Distinct `CLASS` labels in order of first appearance.
    pub fn class_names(&self) -> Vec<String> {
        let mut seen = AHashSet::new();
        self.classes
            .iter()
            .filter(|class| seen.insert(class.as_str()))
            .cloned()
            .collect()
    }

    /// `CLASS` labels as dense codes following `class_names`.
    pub fn stratification_codes(&self) -> Vec<usize> {
        let mut codes: AHashMap<&str, usize> = AHashMap::new();
        self.classes
            .iter()
            .map(|class| {
                let next = codes.len();
                *codes.entry(class.as_str()).or_insert(next)
            })
            .collect()
    }

    pub fn to_evaluation_data(&self, mode: LabelMode) -> Result<EvaluationData, EvaluationError> {
        let target = self.target(mode);
        let stratify = self.stratification_codes();
        log_counts("target", target.iter().map(|label| label.to_string()));
        EvaluationData::new(self.features.clone(), self.feature_names.clone(), target, stratify)
    }
}

fn log_counts(what: &str, labels: impl Iterator<Item = String>) {
    let mut counts: AHashMap<String, usize> = AHashMap::new();
    for label in labels {
        *counts.entry(label).or_default() += 1;
    }
    let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
    counts.sort();
    let rendered: Vec<String> = counts.iter().map(|(label, n)| format!("{label}: {n}")).collect();
    log::info!("{what} counts: {}", rendered.join(", "));
}

/// Columns of one cohort file, already validated.
struct CohortFile {
    sample_ids: Vec<String>,
    feature_columns: Vec<Vec<f64>>,
    covid: Vec<usize>,
    classes: Vec<String>,
}

/// Loads and stacks the given cohort files.
pub fn load_cohorts<P: AsRef<Path>>(
    paths: &[P],
    options: &LoadOptions,
) -> Result<Cohort, CohortError> {
    let Some(first) = paths.first() else {
        return Err(CohortError::NoCohorts);
    };

    let mut feature_names = match &options.features {
        Some(features) => features.clone(),
        None => {
            let df = read_csv(first.as_ref())?;
            df.get_column_names()
                .into_iter()
                .map(|name| name.to_string())
                .filter(|name| !RESERVED_COLUMNS.contains(&name.as_str()))
                .collect()
        }
    };
    if options.include_demographics {
        feature_names.push(SEX_COLUMN.to_string());
        feature_names.push(AGE_COLUMN.to_string());
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(load_file(path.as_ref(), &feature_names)?);
    }

    let n_records: usize = files.iter().map(|file| file.covid.len()).sum();
    let mut buffer = Vec::with_capacity(n_records * feature_names.len());
    for column in 0..feature_names.len() {
        for file in &files {
            buffer.extend_from_slice(&file.feature_columns[column]);
        }
    }
    let features = Array2::from_shape_vec((n_records, feature_names.len()).f(), buffer)?;

    let mut cohort = Cohort {
        sample_ids: Vec::with_capacity(n_records),
        feature_names,
        features,
        covid: Vec::with_capacity(n_records),
        classes: Vec::with_capacity(n_records),
        sources: Vec::with_capacity(n_records),
    };
    for (index, file) in files.into_iter().enumerate() {
        cohort.sources.extend(std::iter::repeat_n(index, file.covid.len()));
        cohort.sample_ids.extend(file.sample_ids);
        cohort.covid.extend(file.covid);
        cohort.classes.extend(file.classes);
    }

    log::info!(
        "Loaded {} records with {} features from {} cohort files.",
        cohort.n_records(),
        cohort.feature_names.len(),
        paths.len()
    );
    log_counts("CLASS", cohort.classes.iter().cloned());
    Ok(cohort)
}

fn read_csv(path: &Path) -> Result<DataFrame, CohortError> {
    let file = File::open(path).map_err(|source| CohortError::IoError {
        path: path.to_path_buf(),
        source,
    })?;
    let df = CsvReader::new(file)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;
    if df.height() == 0 {
        return Err(CohortError::EmptyFile(path.to_path_buf()));
    }
    Ok(df)
}

fn load_file(path: &Path, feature_names: &[String]) -> Result<CohortFile, CohortError> {
    log::info!("Loading cohort from '{}'", path.display());
    let df = read_csv(path)?;
    let columns: AHashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let require = |column: &str| {
        if columns.contains(column) {
            Ok(())
        } else {
            Err(CohortError::ColumnNotFound {
                path: path.to_path_buf(),
                column: column.to_string(),
            })
        }
    };
    require(CLASS_COLUMN)?;
    require(COVID_COLUMN)?;
    for name in feature_names {
        require(name)?;
    }

    let feature_columns = feature_names
        .iter()
        .map(|name| {
            if name == SEX_COLUMN {
                extract_sex_column(&df, path)
            } else {
                extract_numeric_column(&df, path, name)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let covid = extract_numeric_column(&df, path, COVID_COLUMN)?
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            if value == 0.0 || value == 1.0 {
                Ok(value as usize)
            } else {
                Err(CohortError::NotBinary {
                    path: path.to_path_buf(),
                    row: row + 1,
                    column: COVID_COLUMN,
                    value: value.to_string(),
                })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let classes = extract_string_column(&df, path, CLASS_COLUMN)?;
    let sample_ids = if columns.contains(ID_COLUMN) {
        extract_string_column(&df, path, ID_COLUMN)?
    } else {
        (1..=df.height()).map(|i| i.to_string()).collect()
    };

    Ok(CohortFile {
        sample_ids,
        feature_columns,
        covid,
        classes,
    })
}

fn extract_numeric_column(
    df: &DataFrame,
    path: &Path,
    column_name: &str,
) -> Result<Vec<f64>, CohortError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(CohortError::MissingValuesFound {
            path: path.to_path_buf(),
            column: column_name.to_string(),
        });
    }

    let wrong_type = || CohortError::ColumnWrongType {
        path: path.to_path_buf(),
        column: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", series.dtype()),
    };
    if matches!(series.dtype(), DataType::String) {
        return Err(wrong_type());
    }
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(CohortError::NonFiniteValuesFound {
            path: path.to_path_buf(),
            column: column_name.to_string(),
        });
    }
    Ok(values)
}

fn extract_string_column(
    df: &DataFrame,
    path: &Path,
    column_name: &str,
) -> Result<Vec<String>, CohortError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(CohortError::MissingValuesFound {
            path: path.to_path_buf(),
            column: column_name.to_string(),
        });
    }
    let casted = series.cast(&DataType::String)?;
    let values = casted
        .as_materialized_series()
        .str()?
        .into_iter()
        .map(|value| value.unwrap_or_default().to_string())
        .collect();
    Ok(values)
}

/// `sex` as 1 for `F` and 0 for `M`; numeric 0/1 columns pass through.
fn extract_sex_column(df: &DataFrame, path: &Path) -> Result<Vec<f64>, CohortError> {
    if !matches!(df.column(SEX_COLUMN)?.dtype(), DataType::String) {
        let values = extract_numeric_column(df, path, SEX_COLUMN)?;
        let not_binary = values.iter().enumerate().find(|&(_, &v)| v != 0.0 && v != 1.0);
        if let Some((row, value)) = not_binary {
            return Err(CohortError::NotBinary {
                path: path.to_path_buf(),
                row: row + 1,
                column: SEX_COLUMN,
                value: value.to_string(),
            });
        }
        return Ok(values);
    }

    extract_string_column(df, path, SEX_COLUMN)?
        .into_iter()
        .enumerate()
        .map(|(row, value)| match value.trim() {
            "F" => Ok(1.0),
            "M" => Ok(0.0),
            other => Err(CohortError::NotBinary {
                path: path.to_path_buf(),
                row: row + 1,
                column: SEX_COLUMN,
                value: other.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        write!(file, "{}", content)?;
        Ok(file)
    }

    const HEALTHY: &str = "ID,sex,age,CLASS,COVID,BCORP1,KAT2A\n\
                           h1,F,34,HC,0,1.5,0.2\n\
                           h2,M,51,HC,0,1.1,0.4\n";
    const COVID: &str = "ID,sex,age,CLASS,COVID,BCORP1,KAT2A\n\
                         c1,M,60,COVID_mild,1,2.5,1.2\n\
                         c2,F,70,COVID_severe,1,3.5,1.9\n\
                         c3,F,44,COVID_moderate,1,2.9,1.4\n";

    #[test]
    fn test_cohorts_are_stacked_in_order() {
        let healthy = create_test_csv(HEALTHY).unwrap();
        let covid = create_test_csv(COVID).unwrap();
        let cohort =
            load_cohorts(&[healthy.path(), covid.path()], &LoadOptions::default()).unwrap();

        assert_eq!(cohort.n_records(), 5);
        assert_eq!(cohort.feature_names, vec!["BCORP1", "KAT2A"]);
        assert_eq!(cohort.sample_ids, vec!["h1", "h2", "c1", "c2", "c3"]);
        assert_eq!(cohort.sources, vec![0, 0, 1, 1, 1]);
        assert_eq!(cohort.covid, vec![0, 0, 1, 1, 1]);
        assert_eq!(cohort.features.shape(), &[5, 2]);
        assert_abs_diff_eq!(cohort.features[[3, 0]], 3.5);
        assert_abs_diff_eq!(cohort.features[[1, 1]], 0.4);
    }

    #[test]
    fn test_label_modes_and_stratification() {
        let healthy = create_test_csv(HEALTHY).unwrap();
        let covid = create_test_csv(COVID).unwrap();
        let cohort =
            load_cohorts(&[healthy.path(), covid.path()], &LoadOptions::default()).unwrap();

        assert_eq!(cohort.target(LabelMode::Binary), vec![0, 0, 1, 1, 1]);
        assert_eq!(cohort.target(LabelMode::Severity), vec![0, 0, 1, 2, 2]);
        assert_eq!(
            cohort.class_names(),
            vec!["HC", "COVID_mild", "COVID_severe", "COVID_moderate"]
        );
        assert_eq!(cohort.stratification_codes(), vec![0, 0, 1, 2, 3]);

        let data = cohort.to_evaluation_data(LabelMode::Severity).unwrap();
        assert_eq!(data.n_classes(), 3);
        assert_eq!(data.n_records(), 5);
    }

    #[test]
    fn test_demographics_and_explicit_features() {
        let healthy = create_test_csv(HEALTHY).unwrap();
        let options = LoadOptions {
            features: Some(vec!["KAT2A".to_string()]),
            include_demographics: true,
        };
        let cohort = load_cohorts(&[healthy.path()], &options).unwrap();
        assert_eq!(cohort.feature_names, vec!["KAT2A", "sex", "age"]);
        assert_eq!(cohort.features.column(1).to_vec(), vec![1.0, 0.0]);
        assert_eq!(cohort.features.column(2).to_vec(), vec![34.0, 51.0]);
    }

    #[test]
    fn test_error_column_not_found() {
        let healthy = create_test_csv(HEALTHY).unwrap();
        let other = create_test_csv("ID,sex,age,CLASS,COVID,BCORP1\nx,F,1,SLE,0,0.5\n").unwrap();
        let err =
            load_cohorts(&[healthy.path(), other.path()], &LoadOptions::default()).unwrap_err();
        match err {
            CohortError::ColumnNotFound { column, .. } => assert_eq!(column, "KAT2A"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_error_wrong_type_and_missing_values() {
        let text = create_test_csv("CLASS,COVID,BCORP1\nHC,0,abc\nHC,0,1.0\n").unwrap();
        let err = load_cohorts(&[text.path()], &LoadOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CohortError::ColumnWrongType { ref column, .. } if column == "BCORP1"
        ));

        let missing = create_test_csv("CLASS,COVID,BCORP1\nHC,0,\nHC,0,1.0\n").unwrap();
        let err = load_cohorts(&[missing.path()], &LoadOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CohortError::MissingValuesFound { ref column, .. } if column == "BCORP1"
        ));
    }

    #[test]
    fn test_error_non_binary_status() {
        let bad = create_test_csv("CLASS,COVID,BCORP1\nHC,2,1.0\n").unwrap();
        let err = load_cohorts(&[bad.path()], &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, CohortError::NotBinary { row: 1, column: "COVID", .. }));
    }

    #[test]
    fn test_no_cohorts_and_unknown_label_mode() {
        let none: [&Path; 0] = [];
        assert!(matches!(
            load_cohorts(&none, &LoadOptions::default()),
            Err(CohortError::NoCohorts)
        ));
        assert_eq!("Severity".parse::<LabelMode>().unwrap(), LabelMode::Severity);
        assert!("ternary".parse::<LabelMode>().is_err());
    }
}

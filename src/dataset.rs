//! Reading per-window units back and concatenating them into one dataset.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, warn};

use crate::assemble::{encode_csv, write_atomic};
use crate::{build_feature_schema, schema_fingerprint, FeatureRow, FeatureSchema, Mode};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("schema fingerprint mismatch in {path}: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("failed to encode dataset: {0}")]
    Encode(String),
}

pub fn dataset_file_name(mode: Mode, id_date: NaiveDate) -> String {
    format!("{}_dataset_{}.csv", mode.as_str(), id_date.format("%Y_%m_%d"))
}

/// Whether `name` looks like `{mode}_YYYY_MM_DD_HH_MM_SS.csv`.
pub fn is_window_table_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".csv") else {
        return false;
    };
    let Some(id) = stem
        .strip_prefix("train_")
        .or_else(|| stem.strip_prefix("score_"))
    else {
        return false;
    };

    let parts: Vec<&str> = id.split('_').collect();
    let widths = [4, 2, 2, 2, 2, 2];
    parts.len() == widths.len()
        && parts
            .iter()
            .zip(widths)
            .all(|(part, width)| part.len() == width && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Window units of `mode` whose window date is in `dates`, sorted by name.
pub fn window_table_paths(
    output_dir: &Path,
    mode: Mode,
    dates: &[NaiveDate],
) -> Result<Vec<PathBuf>, DatasetError> {
    let prefixes: Vec<String> = dates
        .iter()
        .map(|d| format!("{}_{}_", mode.as_str(), d.format("%Y_%m_%d")))
        .collect();

    let mut out = Vec::new();
    for name in list_file_names(output_dir)? {
        if is_window_table_name(&name) && prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            out.push(output_dir.join(name));
        }
    }
    out.sort();
    Ok(out)
}

pub fn read_window_table(
    path: &Path,
    schema: &FeatureSchema,
) -> Result<Vec<FeatureRow>, DatasetError> {
    let csv_err = |source: csv::Error| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let names: Vec<&str> = headers.iter().collect();
    let actual = schema_fingerprint(schema.version, schema.mode, &names);
    if actual != schema.fingerprint {
        return Err(DatasetError::SchemaFingerprintMismatch {
            path: path.to_path_buf(),
            expected: schema.fingerprint.clone(),
            actual,
        });
    }

    let mut rows = Vec::new();
    for row in reader.deserialize::<FeatureRow>() {
        rows.push(row.map_err(csv_err)?);
    }
    Ok(rows)
}

/// Concatenates every unit of `mode` for `dates` in window order.
pub fn concat_window_tables(
    output_dir: &Path,
    mode: Mode,
    dates: &[NaiveDate],
) -> Result<Vec<FeatureRow>, DatasetError> {
    let paths = window_table_paths(output_dir, mode, dates)?;
    concat_window_table_files(&paths, mode)
}

/// Concatenates exactly the given units, in the given order.
pub fn concat_window_table_files(
    paths: &[PathBuf],
    mode: Mode,
) -> Result<Vec<FeatureRow>, DatasetError> {
    let schema = build_feature_schema(mode);

    let mut rows = Vec::new();
    for path in paths {
        let mut table = read_window_table(path, &schema)?;
        rows.append(&mut table);
    }

    info!(
        component = "dataset",
        event = "dataset.concat.finish",
        mode = mode.as_str(),
        units = paths.len(),
        rows = rows.len()
    );

    Ok(rows)
}

pub fn write_dataset(rows: &[FeatureRow], mode: Mode, path: &Path) -> Result<(), DatasetError> {
    let io_err = |source: std::io::Error| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let schema = build_feature_schema(mode);
    let bytes = encode_csv(&schema, rows).map_err(DatasetError::Encode)?;
    write_atomic(path, &bytes).map_err(io_err)?;

    info!(
        component = "dataset",
        event = "dataset.write.finish",
        mode = mode.as_str(),
        path = %path.display(),
        rows = rows.len()
    );
    Ok(())
}

/// Removes stale window units from `output_dir`; other files are left alone.
pub fn clear_window_tables(output_dir: &Path) -> Result<usize, DatasetError> {
    if !output_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0usize;
    for name in list_file_names(output_dir)? {
        if !is_window_table_name(&name) {
            continue;
        }
        let path = output_dir.join(&name);
        fs::remove_file(&path).map_err(|source| DatasetError::Io { path, source })?;
        removed += 1;
    }

    if removed > 0 {
        warn!(
            component = "dataset",
            event = "dataset.output.cleared",
            output_dir = %output_dir.display(),
            removed
        );
    }
    Ok(removed)
}

fn list_file_names(dir: &Path) -> Result<Vec<String>, DatasetError> {
    let io_err = |source: std::io::Error| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_file() {
            out.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn window_table_names_are_recognized_strictly() {
        assert!(is_window_table_name("train_2025_01_06_14_10_00.csv"));
        assert!(is_window_table_name("score_2025_01_06_00_00_00.csv"));
        assert!(!is_window_table_name("train_dataset_2025_04_01.csv"));
        assert!(!is_window_table_name("train_2025_01_06_14_10_00.csv.tmp"));
        assert!(!is_window_table_name("other_2025_01_06_14_10_00.csv"));
        assert!(!is_window_table_name("train_2025_1_06_14_10_00.csv"));
    }

    #[test]
    fn clearing_only_touches_window_units() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("train_2025_01_06_14_10_00.csv"), "x").unwrap();
        fs::write(dir.path().join("score_2025_01_06_15_00_00.csv"), "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        assert_eq!(clear_window_tables(dir.path()).unwrap(), 2);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(clear_window_tables(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn header_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("train_2025_01_06_14_10_00.csv");
        fs::write(&path, "h3_cell,id_timestamp\n").unwrap();

        let err = read_window_table(&path, &build_feature_schema(Mode::Train)).unwrap_err();
        assert!(matches!(err, DatasetError::SchemaFingerprintMismatch { .. }));
    }

    #[test]
    fn paths_are_filtered_by_mode_and_date() {
        let dir = tempdir().unwrap();
        for name in [
            "train_2025_01_06_14_10_00.csv",
            "train_2025_01_06_09_00_00.csv",
            "train_2025_01_07_09_00_00.csv",
            "score_2025_01_06_09_00_00.csv",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let day = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        let paths = window_table_paths(dir.path(), Mode::Train, &[day]).unwrap();
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(
            names,
            vec!["train_2025_01_06_09_00_00.csv", "train_2025_01_06_14_10_00.csv"]
        );
    }
}

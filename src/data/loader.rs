//! CSV reader for session-level behavioral data.

use super::Dataset;
use crate::error::DataError;
use crate::features::FEATURE_DIM;
use ndarray::{Array1, Array2};
use std::fs::File;
use std::path::Path;

/// Columns that are never features.
pub const RESERVED_COLUMNS: [&str; 4] = ["user_id", "session_id", "is_fraud", "timestamp"];

const LABEL_COLUMN: &str = "is_fraud";

/// Read `path` into a dataset. Every non-reserved column is a feature, in file order.
/// Empty or `nan` cells become NaN and are zeroed later by the scaler.
pub fn load_csv(path: &Path) -> Result<Dataset, DataError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DataError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(DataError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let csv_err = |source| DataError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    let headers = reader.headers().map_err(csv_err)?.clone();

    let label_idx = headers
        .iter()
        .position(|h| h == LABEL_COLUMN)
        .ok_or_else(|| DataError::Schema(format!("missing `{LABEL_COLUMN}` column")))?;
    let feature_idx: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !RESERVED_COLUMNS.contains(h))
        .map(|(i, _)| i)
        .collect();
    if feature_idx.len() != FEATURE_DIM {
        return Err(DataError::Schema(format!(
            "expected {FEATURE_DIM} feature columns, found {}",
            feature_idx.len()
        )));
    }

    let mut values: Vec<f32> = Vec::new();
    let mut labels: Vec<u8> = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let label_cell = record.get(label_idx).unwrap_or("");
        labels.push(parse_label(label_cell).ok_or_else(|| {
            DataError::Schema(format!("row {}: invalid label `{label_cell}`", row + 1))
        })?);
        for &i in &feature_idx {
            let cell = record.get(i).unwrap_or("");
            values.push(parse_feature(cell).ok_or_else(|| {
                DataError::Schema(format!(
                    "row {}: column `{}` is not numeric: `{cell}`",
                    row + 1,
                    &headers[i]
                ))
            })?);
        }
    }

    let n = labels.len();
    let features = Array2::from_shape_vec((n, FEATURE_DIM), values)
        .map_err(|e| DataError::Schema(e.to_string()))?;
    Ok(Dataset {
        features,
        labels: Array1::from(labels),
    })
}

fn parse_feature(cell: &str) -> Option<f32> {
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") || cell.eq_ignore_ascii_case("na") {
        return Some(f32::NAN);
    }
    cell.parse().ok()
}

fn parse_label(cell: &str) -> Option<u8> {
    match cell.to_ascii_lowercase().as_str() {
        "1" | "1.0" | "true" => Some(1),
        "0" | "0.0" | "false" => Some(0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn header() -> String {
        let mut cols = vec!["user_id".to_string(), "session_id".to_string()];
        cols.extend((0..FEATURE_DIM).map(|i| format!("f{i}")));
        cols.push("is_fraud".into());
        cols.push("timestamp".into());
        cols.join(",")
    }

    fn row(label: &str, first: &str) -> String {
        let mut cells = vec!["u1".to_string(), "s1".to_string(), first.to_string()];
        cells.extend((1..FEATURE_DIM).map(|i| format!("{}", i as f32 * 0.5)));
        cells.push(label.into());
        cells.push("2024-01-01T00:00:00Z".into());
        cells.join(",")
    }

    #[test]
    fn reads_features_in_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{}", header()).unwrap();
        writeln!(f, "{}", row("0", "1.5")).unwrap();
        writeln!(f, "{}", row("1", "")).unwrap();
        writeln!(f, "{}", row("1.0", "nan")).unwrap();
        drop(f);

        let ds = load_csv(&path).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.labels.to_vec(), vec![0, 1, 1]);
        assert_eq!(ds.features[[0, 0]], 1.5);
        assert!(ds.features[[1, 0]].is_nan());
        assert!(ds.features[[2, 0]].is_nan());
        assert_eq!(ds.features[[0, 33]], 16.5);
    }

    #[test]
    fn missing_file_is_not_found() {
        assert!(matches!(
            load_csv(Path::new("/nonexistent/data.csv")),
            Err(DataError::NotFound(_))
        ));
    }

    #[test]
    fn wrong_feature_count_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.csv");
        std::fs::write(&path, "user_id,is_fraud,a,b\nu,0,1,2\n").unwrap();
        assert!(matches!(load_csv(&path), Err(DataError::Schema(_))));
    }
}

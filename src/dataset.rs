use crate::error::GatingError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type EventId = u64;

/// Tabular single-cell event data: one row per event, one column per
/// channel. Rows are addressed by a stable event id so population indices
/// survive any subsetting of the table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTable {
    columns: Vec<String>,
    ids: Vec<EventId>,
    rows: Vec<Vec<f64>>,
    #[serde(skip)]
    column_lookup: HashMap<String, usize>,
    #[serde(skip)]
    id_lookup: HashMap<EventId, usize>,
}

impl EventTable {
    pub fn new(columns: Vec<String>) -> Result<Self, GatingError> {
        let mut column_lookup = HashMap::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            if column_lookup.insert(name.clone(), i).is_some() {
                return Err(GatingError::validation(format!(
                    "Duplicate column name '{name}'"
                )));
            }
        }
        Ok(Self {
            columns,
            ids: vec![],
            rows: vec![],
            column_lookup,
            id_lookup: HashMap::new(),
        })
    }

    pub fn push_row(&mut self, id: EventId, values: Vec<f64>) -> Result<(), GatingError> {
        if values.len() != self.columns.len() {
            return Err(GatingError::validation(format!(
                "Row for event {id} has {} values, expected {}",
                values.len(),
                self.columns.len()
            )));
        }
        if self.id_lookup.insert(id, self.ids.len()).is_some() {
            return Err(GatingError::validation(format!(
                "Duplicate event id {id}"
            )));
        }
        self.ids.push(id);
        self.rows.push(values);
        Ok(())
    }

    /// Rebuild the lookup maps after deserialization.
    pub fn reindex(&mut self) {
        self.column_lookup = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        self.id_lookup = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[EventId] {
        &self.ids
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_lookup.contains_key(name)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.id_lookup.contains_key(&id)
    }

    fn column_position(&self, name: &str) -> Result<usize, GatingError> {
        self.column_lookup
            .get(name)
            .copied()
            .ok_or_else(|| GatingError::not_found(format!("Channel '{name}' not in dataset")))
    }

    pub fn value(&self, id: EventId, column: &str) -> Result<f64, GatingError> {
        let col = self.column_position(column)?;
        let row = self
            .id_lookup
            .get(&id)
            .ok_or_else(|| GatingError::not_found(format!("Event {id} not in dataset")))?;
        Ok(self.rows[*row][col])
    }

    /// Project one channel over an event subset, preserving the order of `ids`.
    pub fn axis_values(&self, axis: &str, ids: &[EventId]) -> Result<Vec<f64>, GatingError> {
        let col = self.column_position(axis)?;
        ids.iter()
            .map(|id| {
                self.id_lookup
                    .get(id)
                    .map(|row| self.rows[*row][col])
                    .ok_or_else(|| GatingError::not_found(format!("Event {id} not in dataset")))
            })
            .collect()
    }

    /// Project a pair of channels over an event subset. Events missing from
    /// the table are skipped, so an index computed against a richer table
    /// can still be projected onto a control.
    pub fn axis_pair(
        &self,
        x: &str,
        y: &str,
        ids: &[EventId],
    ) -> Result<Vec<(EventId, [f64; 2])>, GatingError> {
        let xcol = self.column_position(x)?;
        let ycol = self.column_position(y)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.id_lookup.get(id) {
                out.push((*id, [self.rows[*row][xcol], self.rows[*row][ycol]]));
            }
        }
        Ok(out)
    }

    /// New table holding the given events only, in the given order.
    pub fn subset(&self, ids: &[EventId]) -> Result<EventTable, GatingError> {
        let mut table = EventTable::new(self.columns.clone())?;
        for id in ids {
            let row = self
                .id_lookup
                .get(id)
                .ok_or_else(|| GatingError::not_found(format!("Event {id} not in dataset")))?;
            table.push_row(*id, self.rows[*row].clone())?;
        }
        Ok(table)
    }

    /// Median of one channel over an event subset; None for an empty subset.
    pub fn column_median(&self, column: &str, ids: &[EventId]) -> Result<Option<f64>, GatingError> {
        let mut values = self.axis_values(column, ids)?;
        if values.is_empty() {
            return Ok(None);
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };
        Ok(Some(median))
    }

    /// Read an event table from CSV. The header names the channels; a
    /// leading `event_id` column supplies stable ids, otherwise the row
    /// number is used.
    pub fn from_csv_path(path: &Path) -> Result<Self, GatingError> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            GatingError::io(format!("Could not read event CSV '{}': {e}", path.display()))
        })?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| {
                GatingError::io(format!("Could not read CSV header '{}': {e}", path.display()))
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let has_id_column = headers.first().map(|h| h.as_str()) == Some("event_id");
        let columns: Vec<String> = if has_id_column {
            headers[1..].to_vec()
        } else {
            headers
        };
        let mut table = Self::new(columns)?;
        for (row_number, record) in reader.records().enumerate() {
            let record = record.map_err(|e| {
                GatingError::io(format!(
                    "Could not read CSV row {} of '{}': {e}",
                    row_number + 1,
                    path.display()
                ))
            })?;
            let mut fields = record.iter();
            let id: EventId = if has_id_column {
                let raw = fields.next().unwrap_or_default();
                raw.trim().parse().map_err(|_| {
                    GatingError::validation(format!(
                        "Invalid event id '{raw}' in row {} of '{}'",
                        row_number + 1,
                        path.display()
                    ))
                })?
            } else {
                row_number as EventId
            };
            let values: Result<Vec<f64>, GatingError> = fields
                .map(|f| {
                    f.trim().parse::<f64>().map_err(|_| {
                        GatingError::validation(format!(
                            "Invalid numeric value '{f}' in row {} of '{}'",
                            row_number + 1,
                            path.display()
                        ))
                    })
                })
                .collect();
            table.push_row(id, values?)?;
        }
        Ok(table)
    }
}

/// Source of primary and control event data for one sample. Retrieval and
/// instrument-file parsing live behind this seam; the engine only sees
/// tables.
pub trait DatasetProvider {
    fn primary_dataset(&self, sample_id: &str) -> Result<EventTable, GatingError>;
    fn control_datasets(&self, sample_id: &str)
        -> Result<HashMap<String, EventTable>, GatingError>;
}

/// Directory of CSV event tables: `<dir>/<sample_id>.csv` holds the primary
/// data, `<dir>/<sample_id>_<control>.csv` one table per control.
#[derive(Debug, Clone)]
pub struct CsvDatasetProvider {
    base_dir: PathBuf,
}

impl CsvDatasetProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl DatasetProvider for CsvDatasetProvider {
    fn primary_dataset(&self, sample_id: &str) -> Result<EventTable, GatingError> {
        EventTable::from_csv_path(&self.base_dir.join(format!("{sample_id}.csv")))
    }

    fn control_datasets(
        &self,
        sample_id: &str,
    ) -> Result<HashMap<String, EventTable>, GatingError> {
        let mut controls = HashMap::new();
        let prefix = format!("{sample_id}_");
        let entries = std::fs::read_dir(&self.base_dir).map_err(|e| {
            GatingError::io(format!(
                "Could not list dataset directory '{}': {e}",
                self.base_dir.display()
            ))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                GatingError::io(format!(
                    "Could not list dataset directory '{}': {e}",
                    self.base_dir.display()
                ))
            })?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = file_name.strip_suffix(".csv") {
                if let Some(control) = stem.strip_prefix(&prefix) {
                    if !control.is_empty() {
                        controls.insert(
                            control.to_string(),
                            EventTable::from_csv_path(&entry.path())?,
                        );
                    }
                }
            }
        }
        Ok(controls)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn table_from(columns: &[&str], rows: &[(EventId, &[f64])]) -> EventTable {
        let mut table = EventTable::new(columns.iter().map(|c| c.to_string()).collect()).unwrap();
        for (id, values) in rows {
            table.push_row(*id, values.to_vec()).unwrap();
        }
        table
    }

    #[test]
    fn test_axis_projection_preserves_order() {
        let table = table_from(
            &["CD4", "CD8"],
            &[(1, &[1.0, 10.0]), (2, &[2.0, 20.0]), (3, &[3.0, 30.0])],
        );
        assert_eq!(table.axis_values("CD4", &[3, 1]).unwrap(), vec![3.0, 1.0]);
        let pair = table.axis_pair("CD4", "CD8", &[2, 99, 1]).unwrap();
        assert_eq!(pair, vec![(2, [2.0, 20.0]), (1, [1.0, 10.0])]);
    }

    #[test]
    fn test_duplicate_event_id_rejected() {
        let mut table = EventTable::new(vec!["CD4".to_string()]).unwrap();
        table.push_row(7, vec![1.0]).unwrap();
        let err = table.push_row(7, vec![2.0]).unwrap_err();
        assert!(err.message.contains("Duplicate event id"));
    }

    #[test]
    fn test_column_median_even_and_odd() {
        let table = table_from(
            &["CD4"],
            &[(1, &[4.0]), (2, &[1.0]), (3, &[3.0]), (4, &[2.0])],
        );
        assert_eq!(
            table.column_median("CD4", &[1, 2, 3, 4]).unwrap(),
            Some(2.5)
        );
        assert_eq!(table.column_median("CD4", &[1, 2, 3]).unwrap(), Some(3.0));
        assert_eq!(table.column_median("CD4", &[]).unwrap(), None);
    }

    #[test]
    fn test_csv_round_trip_with_id_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "event_id,CD4,CD8").unwrap();
        writeln!(file, "10,1.5,2.5").unwrap();
        writeln!(file, "11,3.5,4.5").unwrap();
        drop(file);

        let table = EventTable::from_csv_path(&path).unwrap();
        assert_eq!(table.ids(), &[10, 11]);
        assert_eq!(table.value(11, "CD8").unwrap(), 4.5);
    }

    #[test]
    fn test_csv_provider_discovers_controls() {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("s1.csv", "CD4\n1.0\n2.0\n"),
            ("s1_CD4-FMO.csv", "CD4\n0.1\n"),
            ("s2.csv", "CD4\n9.0\n"),
        ] {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let provider = CsvDatasetProvider::new(dir.path());
        let primary = provider.primary_dataset("s1").unwrap();
        assert_eq!(primary.len(), 2);
        let controls = provider.control_datasets("s1").unwrap();
        assert_eq!(controls.len(), 1);
        assert!(controls.contains_key("CD4-FMO"));
    }
}

//! In-memory tabular data returned by the remote API and fed to the model
//! layer.
//!
//! Columns are typed by scanning their values: a column whose non-empty
//! cells all parse as numbers becomes numeric (empty cells turn into NaN),
//! anything else stays text. Row order follows the payload.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Values of a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// An ordered collection of equally long named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    columns: Vec<Column>,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.data.len())
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Numeric values of `name`, or a `Data` error naming the column when it
    /// is absent or non-numeric.
    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        match self.column(name) {
            Some(Column {
                data: ColumnData::Numeric(values),
                ..
            }) => Ok(values),
            Some(_) => Err(Error::data(
                "table",
                format!("column `{name}` is not numeric"),
            )),
            None => Err(Error::data("table", format!("no column named `{name}`"))),
        }
    }

    /// Append a numeric column. Length must match existing columns.
    pub fn push_numeric(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        self.push_column(Column {
            name: name.into(),
            data: ColumnData::Numeric(values),
        })
    }

    /// Append a text column. Length must match existing columns.
    pub fn push_text(&mut self, name: impl Into<String>, values: Vec<String>) -> Result<()> {
        self.push_column(Column {
            name: name.into(),
            data: ColumnData::Text(values),
        })
    }

    fn push_column(&mut self, column: Column) -> Result<()> {
        if !self.columns.is_empty() && column.data.len() != self.n_rows() {
            return Err(Error::data(
                "table",
                format!(
                    "column `{}` has {} rows, table has {}",
                    column.name,
                    column.data.len(),
                    self.n_rows()
                ),
            ));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Parse a delimited payload. The first record is the header row; column
    /// types are inferred from the cells below it.
    pub fn from_csv_str(text: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| Error::data("parse", format!("reading CSV header: {e}")))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for record in reader.records() {
            let record = record.map_err(|e| Error::data("parse", format!("reading CSV row: {e}")))?;
            if record.len() != headers.len() {
                return Err(Error::data(
                    "parse",
                    format!(
                        "CSV row has {} fields, header has {}",
                        record.len(),
                        headers.len()
                    ),
                ));
            }
            for (i, field) in record.iter().enumerate() {
                cells[i].push(field.to_string());
            }
        }

        Self::from_string_columns(headers, cells)
    }

    /// Parse a JSON array of row objects. Keys are unioned across rows;
    /// missing keys become empty cells.
    pub fn from_json_rows(rows: &[Value]) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for row in rows {
            let obj = row.as_object().ok_or_else(|| {
                Error::data("parse", format!("JSON row is not an object: {row}"))
            })?;
            for key in obj.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }

        let mut cells: Vec<Vec<String>> = vec![Vec::new(); names.len()];
        for row in rows {
            let obj = row.as_object().unwrap();
            for (i, name) in names.iter().enumerate() {
                let cell = match obj.get(name) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                };
                cells[i].push(cell);
            }
        }

        Self::from_string_columns(names, cells)
    }

    /// Infer a type per column: all non-empty cells numeric → numeric column
    /// with NaN for the empty cells, otherwise keep the raw text.
    fn from_string_columns(names: Vec<String>, cells: Vec<Vec<String>>) -> Result<Self> {
        let mut table = DataTable::new();
        for (name, raw) in names.into_iter().zip(cells) {
            let numeric = raw
                .iter()
                .filter(|v| !v.is_empty())
                .all(|v| v.parse::<f64>().is_ok());
            if numeric && raw.iter().any(|v| !v.is_empty()) {
                let values = raw
                    .iter()
                    .map(|v| {
                        if v.is_empty() {
                            f64::NAN
                        } else {
                            v.parse::<f64>().unwrap()
                        }
                    })
                    .collect();
                table.push_numeric(name, values)?;
            } else {
                if numeric {
                    warn!(column = %name, "column has no non-empty cells, keeping as text");
                }
                table.push_text(name, raw)?;
            }
        }
        debug!(rows = table.n_rows(), cols = table.n_cols(), "parsed table");
        Ok(table)
    }

    /// Write the table as CSV, numeric cells in shortest round-trip form.
    pub fn to_csv_string(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(self.names())
            .map_err(|e| Error::data("write", format!("writing CSV header: {e}")))?;
        for row in 0..self.n_rows() {
            let record: Vec<String> = self
                .columns
                .iter()
                .map(|c| match &c.data {
                    ColumnData::Numeric(v) => {
                        if v[row].is_nan() {
                            String::new()
                        } else {
                            format!("{}", v[row])
                        }
                    }
                    ColumnData::Text(v) => v[row].clone(),
                })
                .collect();
            writer
                .write_record(&record)
                .map_err(|e| Error::data("write", format!("writing CSV row {row}: {e}")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| Error::data("write", format!("flushing CSV: {e}")))?;
        Ok(String::from_utf8(bytes).expect("CSV output is UTF-8"))
    }

    /// One row as a name → numeric value map, skipping text columns.
    pub fn numeric_row(&self, row: usize) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for column in &self.columns {
            if let ColumnData::Numeric(values) = &column.data {
                out.insert(column.name.clone(), values[row]);
            }
        }
        out
    }
}

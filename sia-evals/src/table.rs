//! Tabular data exchanged with telemetry and the judge.
//!
//! A [`Table`] is an ordered list of JSON-object rows, serialized as an array
//! of records (the shape telemetry exports and judge outputs use).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One record: column name to value.
pub type Row = Map<String, Value>;

/// Ordered rows of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Table {
    rows: Vec<Row>,
}

impl Table {
    /// Create a table from rows.
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Build a table from any serializable records.
    ///
    /// Every record must serialize to a JSON object.
    pub fn from_records<T: Serialize>(records: &[T]) -> crate::Result<Self> {
        let mut rows = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            match serde_json::to_value(record)? {
                Value::Object(row) => rows.push(row),
                other => {
                    return Err(crate::Error::shape(
                        index,
                        format!("expected an object record, got {}", kind_of(&other)),
                    ));
                }
            }
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Keep at most `limit` rows.
    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// Values of one column, `None` where a row lacks it.
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = Option<&'a Value>> + 'a {
        self.rows.iter().map(move |row| row.get(name))
    }

    /// Append a row.
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// The first row of a non-empty tabular JSON value.
    ///
    /// Returns `None` unless `value` is an array whose first element is an object.
    pub fn first_record(value: &Value) -> Option<Row> {
        match value {
            Value::Array(items) => match items.first() {
                Some(Value::Object(row)) => Some(row.clone()),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Vec<Row>> for Table {
    fn from(rows: Vec<Row>) -> Self {
        Self::new(rows)
    }
}

impl FromIterator<Row> for Table {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Short name of a JSON value's type, for error messages.
pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Minimal RFC 4180 style reader for alert segments.
//!
//! Fields may be double-quoted; quoted fields can contain commas, line
//! breaks and `""` escapes. Header names are matched case-insensitively.

use std::collections::HashMap;

/// A parsed segment: one header row plus data rows.
#[derive(Debug, Default)]
pub struct CsvTable {
    columns: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
}

impl CsvTable {
    /// Parse `text`. The first record is the header. Blank lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut records = parse_records(text).into_iter();
        let Some(header) = records.next() else {
            return Self::default();
        };

        let columns = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_ascii_lowercase(), i))
            .collect();

        Self {
            columns,
            rows: records.collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate over rows as named-column views.
    pub fn rows(&self) -> impl Iterator<Item = CsvRow<'_>> {
        self.rows.iter().map(|fields| CsvRow {
            columns: &self.columns,
            fields,
        })
    }
}

/// One data row.
pub struct CsvRow<'a> {
    columns: &'a HashMap<String, usize>,
    fields: &'a [String],
}

impl<'a> CsvRow<'a> {
    /// Field under `column` (case-insensitive). Missing columns and short
    /// rows yield `None`.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let idx = *self.columns.get(&column.to_ascii_lowercase())?;
        self.fields.get(idx).map(String::as_str)
    }
}

fn parse_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }

    records
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    let blank = record.len() == 1 && record[0].trim().is_empty();
    if !blank {
        records.push(record);
    }
}

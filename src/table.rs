//! In-memory adapters implementing the iterator/writer/registry
//! contracts. These back [crate::query_table] and the test suite; file
//! formats (CSV and friends) live outside this crate, behind the same
//! contracts.

use std::collections::HashMap;

use anyhow::Result;

use crate::engine::{InputIterator, OutputWriter, TableRegistry};
use crate::error::Error;
use crate::semantic::variables::{build_variable_map, VariableMap};
use crate::value::Record;

pub struct TableIterator {
    table: Vec<Record>,
    position: usize,
    header: Option<Vec<String>>,
    header_from_first_row: bool,
    prefix: char,
    normalize_column_names: bool,
    fields_info: HashMap<usize, i64>,
}

impl TableIterator {
    pub fn new(table: Vec<Record>) -> Self {
        TableIterator {
            table,
            position: 0,
            header: None,
            header_from_first_row: false,
            prefix: 'a',
            normalize_column_names: true,
            fields_info: HashMap::new(),
        }
    }

    pub fn with_column_names(mut self, names: Vec<String>) -> Self {
        self.header = Some(names);
        self
    }

    /// Consume the first record as the header, like `has_header` inputs.
    pub fn with_header_row(mut self) -> Self {
        if !self.table.is_empty() {
            let first = self.table.remove(0);
            self.header = Some(first.iter().map(|v| v.to_string()).collect());
            self.header_from_first_row = true;
        }
        self
    }

    pub fn with_prefix(mut self, prefix: char) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_normalized_column_names(mut self, normalize: bool) -> Self {
        self.normalize_column_names = normalize;
        self
    }
}

impl InputIterator for TableIterator {
    fn get_variables_map(&mut self, query_text: &str) -> Result<VariableMap> {
        build_variable_map(
            query_text,
            self.prefix,
            self.header.as_deref(),
            self.normalize_column_names,
        )
    }

    fn get_header(&self) -> Option<Vec<String>> {
        self.header.clone()
    }

    fn get_record(&mut self) -> Result<Option<Record>> {
        let Some(record) = self.table.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        self.fields_info
            .entry(record.len())
            .or_insert(self.position as i64);
        Ok(Some(record.clone()))
    }

    fn get_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.header_from_first_row && self.prefix == 'b' {
            warnings.push(
                "The first record in the JOIN table B was also treated as a header".to_string(),
            );
        }
        if self.fields_info.len() > 1 {
            let mut entries: Vec<(usize, i64)> =
                self.fields_info.iter().map(|(k, v)| (*k, *v)).collect();
            entries.sort_by_key(|(_, record)| *record);
            warnings.push(format!(
                "Inconsistent number of fields in the input table: e.g. record {} has {} fields and record {} has {} fields",
                entries[0].1, entries[0].0, entries[1].1, entries[1].0
            ));
        }
        warnings
    }
}

/// Collects output records (and the derived header) in memory.
#[derive(Default)]
pub struct TableWriter {
    pub table: Vec<Record>,
    pub header: Option<Vec<String>>,
}

impl TableWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputWriter for TableWriter {
    fn write(&mut self, record: Record) -> Result<bool> {
        self.table.push(record);
        Ok(true)
    }

    fn set_header(&mut self, header: Option<&[String]>) {
        self.header = header.map(|h| h.to_vec());
    }
}

/// Registry holding the single join table of a `query_table` call,
/// addressable as `B`.
pub struct SingleTableRegistry {
    table: Option<Vec<Record>>,
    column_names: Option<Vec<String>>,
    normalize_column_names: bool,
}

impl SingleTableRegistry {
    pub fn new(table: Vec<Record>) -> Self {
        SingleTableRegistry {
            table: Some(table),
            column_names: None,
            normalize_column_names: true,
        }
    }

    pub fn with_column_names(mut self, names: Vec<String>) -> Self {
        self.column_names = Some(names);
        self
    }

    pub fn with_normalized_column_names(mut self, normalize: bool) -> Self {
        self.normalize_column_names = normalize;
        self
    }
}

impl TableRegistry for SingleTableRegistry {
    fn get_iterator_by_table_id(
        &mut self,
        table_id: &str,
        single_char_alias: char,
    ) -> Result<Box<dyn InputIterator>> {
        if !table_id.eq_ignore_ascii_case("b") {
            return Err(Error::syntax(format!(
                "Unable to find join table \"{table_id}\""
            ))
            .into());
        }
        let table = self.table.take().ok_or_else(|| {
            Error::syntax(format!("Join table \"{table_id}\" was already consumed"))
        })?;
        let mut iterator = TableIterator::new(table)
            .with_prefix(single_char_alias)
            .with_normalized_column_names(self.normalize_column_names);
        if let Some(names) = &self.column_names {
            iterator = iterator.with_column_names(names.clone());
        }
        Ok(Box::new(iterator))
    }
}

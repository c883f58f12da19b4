//! RBQL is an embeddable query engine that applies a SQL-like surface
//! language to row-oriented tabular data.
//!
//! You probably want to start with the [query_table] wrapper, or [query]
//! for custom input/output adapters.
//!
//! For more granular access, refer to this diagram:
//! ```ascii
//!        query text
//!
//!   (pre-pass)  │   comments stripped, literals extracted,
//!               │   whitespace normalized
//!               ▼
//!        clause snippets     (statement splitter)
//!               │
//!   (resolve)   │   variable maps from the input iterators
//!               ▼
//!        compiled plan       (typed expressions, join keys,
//!               │             select items, output header)
//!               ▼
//!        streaming loop      input iterator → join expand →
//!               │             WHERE → project/update
//!               ▼
//!        writer stack        LIMIT / DISTINCT / SORT / AGGREGATE
//!               │
//!               ▼
//!        output writer
//! ```

mod ast;
mod engine;
mod error;
mod parser;
mod semantic;
mod table;
mod value;

pub use engine::functions::FunctionRegistry;
pub use engine::{InputIterator, OutputWriter, TableRegistry};
pub use error::{Error, ErrorKind, Result};
pub use semantic::variables::{build_variable_map, VariableInfo, VariableMap};
pub use table::{SingleTableRegistry, TableIterator, TableWriter};
pub use value::{Record, Value};

use std::sync::atomic::{AtomicBool, Ordering};

use engine::join::{JoinIndex, Joiner};
use parser::{preprocess, stmt};

pub const RBQL_VERSION: &str = env!("CARGO_PKG_VERSION");

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);

/// Process-wide: when set, internal error chains surface raw instead of
/// being reduced to one-line messages.
pub fn set_debug_mode(enable: bool) {
    DEBUG_MODE.store(enable, Ordering::Relaxed);
}

pub(crate) fn debug_mode() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

type InitHook = Box<dyn Fn(&mut FunctionRegistry) -> Result<(), String>>;

/// Knobs shared by [query] and [query_table].
pub struct QueryOptions {
    /// When false, header names become bare variables (legacy mode);
    /// names present in both tables then error as ambiguous on use.
    pub normalize_column_names: bool,
    /// Column names for the input table (`query_table` only).
    pub input_column_names: Option<Vec<String>>,
    /// Column names for the join table (`query_table` only).
    pub join_column_names: Option<Vec<String>>,
    init: Option<InitHook>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            normalize_column_names: true,
            input_column_names: None,
            join_column_names: None,
            init: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_column_names(mut self, names: Vec<String>) -> Self {
        self.input_column_names = Some(names);
        self
    }

    pub fn with_join_column_names(mut self, names: Vec<String>) -> Self {
        self.join_column_names = Some(names);
        self
    }

    pub fn with_normalized_column_names(mut self, normalize: bool) -> Self {
        self.normalize_column_names = normalize;
        self
    }

    /// Register custom query functions. The hook runs once per query,
    /// before compilation; a failure surfaces as a `user_init` error.
    pub fn with_init(
        mut self,
        hook: impl Fn(&mut FunctionRegistry) -> Result<(), String> + 'static,
    ) -> Self {
        self.init = Some(Box::new(hook));
        self
    }
}

/// Everything [query_table] produces: output rows, the derived header
/// (when the input had one), and non-fatal warnings.
#[derive(Debug)]
pub struct QueryResult {
    pub rows: Vec<Record>,
    pub header: Option<Vec<String>>,
    pub warnings: Vec<String>,
}

enum InputHandle<'a> {
    Borrowed(&'a mut dyn InputIterator),
    Owned(Box<dyn InputIterator>),
}

impl InputHandle<'_> {
    fn get(&mut self) -> &mut dyn InputIterator {
        match self {
            InputHandle::Borrowed(iterator) => &mut **iterator,
            InputHandle::Owned(iterator) => iterator.as_mut(),
        }
    }
}

/// Run one query against arbitrary adapters.
///
/// `input` may be omitted when the query has a FROM statement and the
/// registry can resolve it. Returns accumulated non-fatal warnings.
pub fn query(
    query_text: &str,
    input: Option<&mut dyn InputIterator>,
    output: &mut dyn OutputWriter,
    registry: Option<&mut dyn TableRegistry>,
    options: &QueryOptions,
) -> Result<Vec<String>, Error> {
    query_inner(query_text, input, output, registry, options).map_err(error::downcast)
}

fn query_inner(
    query_text: &str,
    input: Option<&mut dyn InputIterator>,
    output: &mut dyn OutputWriter,
    mut registry: Option<&mut dyn TableRegistry>,
    options: &QueryOptions,
) -> error::Result<Vec<String>> {
    let stripped = preprocess::strip_comments(query_text);
    let (format_expression, literals) = preprocess::separate_string_literals(&stripped)?;
    let normalized = preprocess::normalize_whitespace(&format_expression);
    let statements = stmt::split_query(&normalized)?;
    log::debug!("query split into statements: {statements:?}");

    let mut input_handle = match input {
        Some(iterator) => {
            if statements.from_table.is_some() {
                return Err(Error::parsing(
                    "FROM is not needed when the input table is already bound",
                )
                .into());
            }
            InputHandle::Borrowed(iterator)
        }
        None => {
            let Some(table_id) = &statements.from_table else {
                return Err(Error::parsing(
                    "Queries without a bound input table must contain a FROM statement",
                )
                .into());
            };
            let registry = registry.as_deref_mut().ok_or_else(|| {
                Error::io(format!(
                    "Unable to find table \"{table_id}\": no table registry provided"
                ))
            })?;
            InputHandle::Owned(registry.get_iterator_by_table_id(table_id, 'a')?)
        }
    };

    let mut join_iterator = match &statements.join {
        Some((_, join_text)) => {
            let (table_id, _) = semantic::parse_join_table_id(join_text)?;
            let registry = registry.as_deref_mut().ok_or_else(|| {
                Error::syntax(format!(
                    "Unable to find join table \"{table_id}\": no table registry provided"
                ))
            })?;
            Some(registry.get_iterator_by_table_id(&table_id, 'b')?)
        }
        None => None,
    };

    let a_map = input_handle.get().get_variables_map(query_text)?;
    let a_header = input_handle.get().get_header();
    let (b_map, b_header) = match join_iterator.as_mut() {
        Some(iterator) => (
            Some(iterator.get_variables_map(query_text)?),
            iterator.get_header(),
        ),
        None => (None, None),
    };

    let mut warnings = Vec::new();
    let mut functions = FunctionRegistry::new();
    if let Some(init) = &options.init {
        init(&mut functions).map_err(|message| {
            Error::user_init(format!(
                "Exception while executing user-provided init code: {message}"
            ))
        })?;
    }

    let compile_ctx = semantic::CompileContext {
        a_map: &a_map,
        b_map: b_map.as_ref(),
        a_header: a_header.as_deref(),
        b_header: b_header.as_deref(),
        functions: &functions,
    };
    let plan = semantic::compile(&statements, &literals, &compile_ctx)?;

    let mut joiner = match (&plan.join, join_iterator) {
        (Some(join_plan), Some(iterator)) => Joiner::new(
            join_plan.kind,
            JoinIndex::new(iterator, join_plan.rhs_keys.clone()),
        ),
        _ => Joiner::None,
    };

    engine::execute(&plan, input_handle.get(), &mut joiner, output, &functions)?;

    warnings.extend(input_handle.get().get_warnings());
    if let Some(source) = joiner.source_mut() {
        warnings.extend(source.get_warnings());
        source.finish();
    }
    warnings.extend(output.get_warnings());
    input_handle.get().finish();
    Ok(warnings)
}

/// Run one query against in-memory tables.
pub fn query_table(
    query_text: &str,
    input_table: Vec<Record>,
    join_table: Option<Vec<Record>>,
    options: &QueryOptions,
) -> Result<QueryResult, Error> {
    let mut iterator = TableIterator::new(input_table)
        .with_normalized_column_names(options.normalize_column_names);
    if let Some(names) = &options.input_column_names {
        iterator = iterator.with_column_names(names.clone());
    }
    let mut writer = TableWriter::new();
    let mut registry = join_table.map(|table| {
        let mut registry = SingleTableRegistry::new(table)
            .with_normalized_column_names(options.normalize_column_names);
        if let Some(names) = &options.join_column_names {
            registry = registry.with_column_names(names.clone());
        }
        registry
    });
    let registry_ref = registry
        .as_mut()
        .map(|registry| registry as &mut dyn TableRegistry);
    let warnings = query(
        query_text,
        Some(&mut iterator),
        &mut writer,
        registry_ref,
        options,
    )?;
    Ok(QueryResult {
        rows: writer.table,
        header: writer.header,
        warnings,
    })
}

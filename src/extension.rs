//! DuckDB registration of `query_assistant`.
//!
//! duckdb-rs registers scalar functions without a bind callback, so the
//! function is built through the C API directly. The bind callback sees the
//! argument expressions, maps them to [`Argument`]s and runs
//! [`QueryAssistant::bind`]; the bound prompt travels to execution as bind
//! data.

use std::ffi::{c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

use duckdb::{
    core::{Inserter, LogicalTypeId},
    ffi,
    vtab::arrow::WritableVector,
    Connection,
};

use crate::bridge::GenerationBridge;
use crate::error::{AssistantError, Result};
use crate::function::{Argument, BoundPrompt, QueryAssistant, FUNCTION_NAME};
use crate::introspect::Catalog;

/// Catalog connection shared by every invocation. The lock covers the DDL
/// query only.
pub(crate) struct SharedCatalog(Mutex<Connection>);

impl SharedCatalog {
    pub(crate) fn new(connection: Connection) -> Self {
        Self(Mutex::new(connection))
    }
}

impl Catalog for SharedCatalog {
    fn table_ddl(&self) -> Result<Vec<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).table_ddl()
    }
}

/// Function state, owned by DuckDB as the function's extra info.
pub(crate) struct QueryAssistantState {
    assistant: QueryAssistant,
    // Separate connection to the same database; DuckDB does not hand the
    // calling connection to scalar functions.
    catalog: Arc<SharedCatalog>,
}

impl QueryAssistantState {
    fn bind(&self, arguments: &[Argument]) -> Result<BoundPrompt> {
        self.assistant.bind(arguments)
    }

    fn execute(&self, bound: &BoundPrompt) -> Result<Option<String>> {
        self.assistant.execute(&*self.catalog, bound)
    }
}

/// Registers `query_assistant` on the database behind `database`, backed by
/// `bridge`.
///
/// # Safety
///
/// `database` must be a valid, open database handle for the duration of the
/// call.
pub unsafe fn register_query_assistant(database: ffi::duckdb_database, bridge: Arc<GenerationBridge>) -> Result<()> {
    let catalog = unsafe { Connection::open_from_raw(database) }
        .map_err(|e| AssistantError::Registration(format!("cannot open catalog connection: {e}")))?;
    let state = QueryAssistantState {
        assistant: QueryAssistant::new(bridge),
        catalog: Arc::new(SharedCatalog::new(catalog)),
    };

    let mut connection: ffi::duckdb_connection = ptr::null_mut();
    if unsafe { ffi::duckdb_connect(database, &mut connection) } != ffi::DuckDBSuccess {
        return Err(AssistantError::Registration("cannot connect to database".into()));
    }
    let registered = unsafe { register_on(connection, state) };
    unsafe { ffi::duckdb_disconnect(&mut connection) };
    registered?;

    tracing::info!(function = FUNCTION_NAME, "scalar function registered");
    Ok(())
}

unsafe fn register_on(connection: ffi::duckdb_connection, state: QueryAssistantState) -> Result<()> {
    let name = CString::new(FUNCTION_NAME).map_err(|e| AssistantError::Registration(e.to_string()))?;
    unsafe {
        let mut function = ffi::duckdb_create_scalar_function();
        ffi::duckdb_scalar_function_set_name(function, name.as_ptr());

        let mut varchar = ffi::duckdb_create_logical_type(ffi::DUCKDB_TYPE_DUCKDB_TYPE_VARCHAR);
        ffi::duckdb_scalar_function_add_parameter(function, varchar);
        ffi::duckdb_scalar_function_set_return_type(function, varchar);
        ffi::duckdb_destroy_logical_type(&mut varchar);

        ffi::duckdb_scalar_function_set_bind(function, Some(bind_query_assistant));
        ffi::duckdb_scalar_function_set_function(function, Some(invoke_query_assistant));
        ffi::duckdb_scalar_function_set_extra_info(
            function,
            Box::into_raw(Box::new(state)).cast(),
            Some(drop_boxed::<QueryAssistantState>),
        );

        let rc = ffi::duckdb_register_scalar_function(connection, function);
        ffi::duckdb_destroy_scalar_function(&mut function);
        if rc != ffi::DuckDBSuccess {
            return Err(AssistantError::Registration(format!(
                "{FUNCTION_NAME} could not be registered; is it already defined?"
            )));
        }
    }
    Ok(())
}

unsafe extern "C" fn bind_query_assistant(info: ffi::duckdb_bind_info) {
    match contained(|| unsafe { bind_arguments(info) }) {
        Ok(bound) => unsafe {
            ffi::duckdb_scalar_function_set_bind_data(
                info,
                Box::into_raw(Box::new(bound)).cast(),
                Some(drop_boxed::<BoundPrompt>),
            );
            ffi::duckdb_scalar_function_set_bind_data_copy(info, Some(copy_bound_prompt));
        },
        Err(message) => {
            tracing::warn!(error = %message, "query_assistant bind failed");
            let message = c_message(&message);
            unsafe { ffi::duckdb_scalar_function_bind_set_error(info, message.as_ptr()) };
        }
    }
}

unsafe fn bind_arguments(info: ffi::duckdb_bind_info) -> Result<BoundPrompt> {
    let state = unsafe { extra_info(ffi::duckdb_scalar_function_bind_get_extra_info(info))? };
    let count = unsafe { ffi::duckdb_scalar_function_bind_get_argument_count(info) };

    let mut context: ffi::duckdb_client_context = ptr::null_mut();
    unsafe { ffi::duckdb_scalar_function_get_client_context(info, &mut context) };
    let arguments = (0..count)
        .map(|index| unsafe {
            let mut expression = ffi::duckdb_scalar_function_bind_get_argument(info, index);
            let argument = describe_argument(context, expression);
            ffi::duckdb_destroy_expression(&mut expression);
            argument
        })
        .collect::<Result<Vec<_>>>();
    unsafe { ffi::duckdb_destroy_client_context(&mut context) };

    let arguments = arguments?;
    tracing::debug!(?arguments, "binding query_assistant");
    state.bind(&arguments)
}

/// Classifies one argument expression. Only foldable string expressions
/// become literals.
unsafe fn describe_argument(context: ffi::duckdb_client_context, expression: ffi::duckdb_expression) -> Result<Argument> {
    let type_id = unsafe {
        let mut logical_type = ffi::duckdb_expression_return_type(expression);
        let id = LogicalTypeId::from(ffi::duckdb_get_type_id(logical_type));
        ffi::duckdb_destroy_logical_type(&mut logical_type);
        id
    };

    if !unsafe { ffi::duckdb_expression_is_foldable(expression) } {
        return Ok(Argument::Expression {
            description: format!("{} expression evaluated per row", type_name(type_id)),
        });
    }
    match type_id {
        LogicalTypeId::Varchar | LogicalTypeId::StringLiteral => unsafe { fold_string(context, expression) },
        LogicalTypeId::SqlNull => Ok(Argument::Null),
        other => Ok(Argument::Constant {
            type_name: type_name(other),
        }),
    }
}

unsafe fn fold_string(context: ffi::duckdb_client_context, expression: ffi::duckdb_expression) -> Result<Argument> {
    unsafe {
        let mut value: ffi::duckdb_value = ptr::null_mut();
        let mut error = ffi::duckdb_expression_fold(context, expression, &mut value);
        if !error.is_null() {
            let failed = ffi::duckdb_error_data_has_error(error);
            let message = CStr::from_ptr(ffi::duckdb_error_data_message(error))
                .to_string_lossy()
                .into_owned();
            ffi::duckdb_destroy_error_data(&mut error);
            if failed {
                if !value.is_null() {
                    ffi::duckdb_destroy_value(&mut value);
                }
                return Err(AssistantError::Binding(format!("cannot evaluate prompt: {message}")));
            }
        }
        if value.is_null() {
            return Err(AssistantError::Binding("prompt literal folded to nothing".into()));
        }

        let argument = if ffi::duckdb_is_null_value(value) {
            Argument::Null
        } else {
            let text = ffi::duckdb_get_varchar(value);
            let prompt = CStr::from_ptr(text).to_string_lossy().into_owned();
            ffi::duckdb_free(text.cast());
            Argument::Literal(prompt)
        };
        ffi::duckdb_destroy_value(&mut value);
        Ok(argument)
    }
}

unsafe extern "C" fn invoke_query_assistant(
    info: ffi::duckdb_function_info,
    input: ffi::duckdb_data_chunk,
    output: ffi::duckdb_vector,
) {
    if let Err(message) = contained(|| unsafe { execute_chunk(info, input, output) }) {
        tracing::warn!(error = %message, "query_assistant failed");
        let message = c_message(&message);
        unsafe { ffi::duckdb_scalar_function_set_error(info, message.as_ptr()) };
    }
}

/// Runs the bound prompt once for the chunk and writes the answer to every
/// row; the prompt is a constant, so every row gets the same answer.
unsafe fn execute_chunk(
    info: ffi::duckdb_function_info,
    input: ffi::duckdb_data_chunk,
    mut output: ffi::duckdb_vector,
) -> Result<()> {
    let state = unsafe { extra_info(ffi::duckdb_scalar_function_get_extra_info(info))? };
    let bound = unsafe { (ffi::duckdb_scalar_function_get_bind_data(info) as *const BoundPrompt).as_ref() }
        .ok_or_else(|| AssistantError::Binding(format!("{FUNCTION_NAME} executed without bind data")))?;
    let rows = unsafe { ffi::duckdb_data_chunk_get_size(input) } as usize;
    tracing::debug!(rows, "query_assistant invoked");

    let answer = state.execute(bound)?;
    let mut results = output.flat_vector();
    for row in 0..rows {
        match &answer {
            Some(sql) => results.insert(row, sql.as_str()),
            None => results.set_null(row),
        }
    }
    Ok(())
}

unsafe fn extra_info<'a>(data: *mut c_void) -> Result<&'a QueryAssistantState> {
    unsafe { (data as *const QueryAssistantState).as_ref() }
        .ok_or_else(|| AssistantError::Registration(format!("{FUNCTION_NAME} has no state")))
}

fn type_name(id: LogicalTypeId) -> String {
    format!("{id:?}").to_uppercase()
}

/// Runs a callback body, turning errors and panics into a message for DuckDB.
/// Nothing may unwind across the C boundary.
fn contained<T>(body: impl FnOnce() -> Result<T>) -> std::result::Result<T, String> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(match payload.downcast_ref::<&str>() {
            Some(message) => format!("{FUNCTION_NAME} panicked: {message}"),
            None => match payload.downcast_ref::<String>() {
                Some(message) => format!("{FUNCTION_NAME} panicked: {message}"),
                None => format!("{FUNCTION_NAME} panicked"),
            },
        }),
    }
}

fn c_message(message: &str) -> CString {
    CString::new(message.replace('\0', "\\0")).unwrap_or_default()
}

unsafe extern "C" fn drop_boxed<T>(data: *mut c_void) {
    if !data.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(unsafe { Box::from_raw(data.cast::<T>()) })));
    }
}

unsafe extern "C" fn copy_bound_prompt(data: *mut c_void) -> *mut c_void {
    match unsafe { (data as *const BoundPrompt).as_ref() } {
        Some(bound) => Box::into_raw(Box::new(bound.clone())).cast(),
        None => ptr::null_mut(),
    }
}

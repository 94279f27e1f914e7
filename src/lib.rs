//! DuckDB extension that turns a natural-language prompt into SQL.
//!
//! `query_assistant('...')` collects the DDL of every table in the database
//! and hands it, together with the prompt, to a text-to-SQL model. The model
//! output is returned as-is.

pub mod bridge;
pub mod config;
pub mod error;
pub mod extension;
pub mod function;
pub mod introspect;
pub mod logging;
pub mod sql_code_generator;

pub use bridge::{GenerationBridge, SqlGenerator};
pub use config::GeneratorConfig;
pub use error::{AssistantError, Result};
pub use extension::register_query_assistant;
pub use function::{Argument, BoundPrompt, QueryAssistant};
pub use sql_code_generator::SqlCodeGenerator;

pub const EXTENSION_NAME: &str = "query_assistant";

pub fn extension_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// A bridge that loads the candle model on first use.
pub fn default_bridge(config: GeneratorConfig) -> GenerationBridge {
    GenerationBridge::new(move || {
        let generator = SqlCodeGenerator::new(&config)?;
        Ok(Box::new(generator) as Box<dyn SqlGenerator>)
    })
}

#[cfg(feature = "extension")]
mod entrypoint {
    use std::error::Error;
    use std::ffi::CString;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;

    use duckdb::ffi;

    use crate::{default_bridge, extension_version, logging, register_query_assistant, GeneratorConfig};

    /// Oldest DuckDB C API that has scalar-function bind callbacks.
    const MINIMUM_DUCKDB_VERSION: &str = "v1.5.6";

    /// Called by DuckDB on `LOAD query_assistant`.
    ///
    /// # Safety
    ///
    /// `info` and `access` must be the pointers DuckDB passes to C API
    /// extension entrypoints.
    #[no_mangle]
    pub unsafe extern "C" fn query_assistant_init_c_api(
        info: ffi::duckdb_extension_info,
        access: *const ffi::duckdb_extension_access,
    ) -> bool {
        let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { load(info, access) }));
        let message = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => err.to_string(),
            Err(_) => "query_assistant panicked while loading".to_string(),
        };
        if let Some(set_error) = unsafe { access.as_ref() }.and_then(|access| access.set_error) {
            let message = CString::new(message.replace('\0', "\\0")).unwrap_or_default();
            unsafe { set_error(info, message.as_ptr()) };
        }
        false
    }

    unsafe fn load(
        info: ffi::duckdb_extension_info,
        access: *const ffi::duckdb_extension_access,
    ) -> Result<(), Box<dyn Error>> {
        if !unsafe { ffi::duckdb_rs_extension_api_init(info, access, MINIMUM_DUCKDB_VERSION) }? {
            return Err(format!("DuckDB host does not provide C API {MINIMUM_DUCKDB_VERSION}").into());
        }
        let get_database = unsafe { access.as_ref() }
            .and_then(|access| access.get_database)
            .ok_or("extension access has no database accessor")?;
        let database = unsafe { get_database(info) };
        if database.is_null() {
            return Err("DuckDB passed no database to the extension".into());
        }

        logging::init_logging();
        let config = GeneratorConfig::load()?;
        tracing::info!(
            version = extension_version(),
            model = %config.model_id,
            "loading query_assistant"
        );
        unsafe { register_query_assistant(*database, Arc::new(default_bridge(config))) }?;
        Ok(())
    }
}

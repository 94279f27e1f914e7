//! Shared handle to the SQL generation backend.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::{AssistantError, Result};

/// A natural-language to SQL backend.
pub trait SqlGenerator: Send {
    fn generate(&mut self, prompt: &str, table_schemas: &str) -> anyhow::Result<String>;
}

impl<F> SqlGenerator for F
where
    F: FnMut(&str, &str) -> anyhow::Result<String> + Send,
{
    fn generate(&mut self, prompt: &str, table_schemas: &str) -> anyhow::Result<String> {
        self(prompt, table_schemas)
    }
}

type GeneratorFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn SqlGenerator>> + Send + Sync>;

/// Owns exactly one backend, built on first use.
///
/// The backend needs `&mut self` to generate, so calls are serialized
/// through a mutex. Share the bridge with `Arc`.
pub struct GenerationBridge {
    factory: Option<GeneratorFactory>,
    init: Mutex<()>,
    generator: OnceLock<Mutex<Box<dyn SqlGenerator>>>,
}

impl GenerationBridge {
    /// Defers construction until [`instance`](Self::instance) or
    /// [`generate`](Self::generate) is first called.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn SqlGenerator>> + Send + Sync + 'static,
    {
        Self {
            factory: Some(Box::new(factory)),
            init: Mutex::new(()),
            generator: OnceLock::new(),
        }
    }

    pub fn with_generator(generator: impl SqlGenerator + 'static) -> Self {
        let generator: Box<dyn SqlGenerator> = Box::new(generator);
        Self {
            factory: None,
            init: Mutex::new(()),
            generator: OnceLock::from(Mutex::new(generator)),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.generator.get().is_some()
    }

    /// Returns the backend, constructing it if this is the first call.
    ///
    /// Concurrent first callers block on the init lock so the factory runs
    /// once. A failed construction stores nothing.
    pub fn instance(&self) -> Result<&Mutex<Box<dyn SqlGenerator>>> {
        if let Some(generator) = self.generator.get() {
            return Ok(generator);
        }

        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(generator) = self.generator.get() {
            return Ok(generator);
        }

        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| AssistantError::Generation("no generator factory configured".into()))?;

        tracing::info!("constructing sql generator");
        let generator = factory().map_err(AssistantError::generation)?;
        Ok(self.generator.get_or_init(|| Mutex::new(generator)))
    }

    /// Runs the backend once and returns its output untouched.
    #[tracing::instrument(skip_all, fields(prompt_len = prompt.len(), context_len = context.len()))]
    pub fn generate(&self, prompt: &str, context: &str) -> Result<String> {
        let mut generator = lock(self.instance()?);
        let sql = generator
            .generate(prompt, context)
            .map_err(AssistantError::generation)?;
        tracing::debug!(output_len = sql.len(), "generation finished");
        Ok(sql)
    }
}

// Poisoning is ignored: backends reset their per-call state on entry.
fn lock(generator: &Mutex<Box<dyn SqlGenerator>>) -> MutexGuard<'_, Box<dyn SqlGenerator>> {
    generator.lock().unwrap_or_else(PoisonError::into_inner)
}

//! The bind/execute contract of `query_assistant(prompt VARCHAR) -> VARCHAR`.

use std::sync::Arc;

use crate::bridge::GenerationBridge;
use crate::error::{AssistantError, Result};
use crate::introspect::{schema_context, Catalog};

pub const FUNCTION_NAME: &str = "query_assistant";

/// How an argument appears in the calling expression, as seen at bind time.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// A constant string literal.
    Literal(String),
    /// A constant that is not a string.
    Constant { type_name: String },
    /// A constant NULL of a string type.
    Null,
    /// Anything evaluated per row, e.g. a column reference.
    Expression { description: String },
}

/// A prompt that passed binding. `None` is a NULL literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundPrompt {
    prompt: Option<String>,
}

impl BoundPrompt {
    pub fn as_str(&self) -> Option<&str> {
        self.prompt.as_deref()
    }
}

#[derive(Clone)]
pub struct QueryAssistant {
    bridge: Arc<GenerationBridge>,
}

impl QueryAssistant {
    pub fn new(bridge: Arc<GenerationBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<GenerationBridge> {
        &self.bridge
    }

    /// Validates the call site and brings up the backend.
    ///
    /// Arguments are checked before the backend is touched, so a rejected
    /// call never constructs a generator.
    pub fn bind(&self, arguments: &[Argument]) -> Result<BoundPrompt> {
        let prompt = match arguments {
            [Argument::Literal(prompt)] => Some(prompt.clone()),
            [Argument::Null] => None,
            [Argument::Constant { type_name }] => {
                return Err(AssistantError::Binding(format!(
                    "{FUNCTION_NAME} expects a VARCHAR prompt, got {type_name}"
                )))
            }
            [Argument::Expression { description }] => {
                return Err(AssistantError::Binding(format!(
                    "{FUNCTION_NAME} prompt must be a string literal, got `{description}`"
                )))
            }
            _ => {
                return Err(AssistantError::Binding(format!(
                    "{FUNCTION_NAME} takes exactly one argument, got {}",
                    arguments.len()
                )))
            }
        };

        self.bridge.instance()?;
        Ok(BoundPrompt { prompt })
    }

    /// Builds a fresh schema context and asks the backend for SQL.
    ///
    /// A NULL prompt yields `None` without touching the catalog or the
    /// backend.
    pub fn execute<C: Catalog + ?Sized>(&self, catalog: &C, bound: &BoundPrompt) -> Result<Option<String>> {
        let Some(prompt) = bound.as_str() else {
            return Ok(None);
        };
        let context = schema_context(catalog)?;
        self.bridge.generate(prompt, &context).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SqlGenerator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedCatalog(Vec<String>);

    impl Catalog for FixedCatalog {
        fn table_ddl(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenCatalog;

    impl Catalog for BrokenCatalog {
        fn table_ddl(&self) -> Result<Vec<String>> {
            Err(AssistantError::Introspection(duckdb::Error::InvalidParameterCount(1, 0)))
        }
    }

    fn counting_assistant(built: Arc<AtomicUsize>) -> QueryAssistant {
        let bridge = GenerationBridge::new(move || {
            built.fetch_add(1, Ordering::SeqCst);
            let generator = |_: &str, _: &str| -> anyhow::Result<String> { Ok("SELECT 1;".into()) };
            Ok(Box::new(generator) as Box<dyn SqlGenerator>)
        });
        QueryAssistant::new(Arc::new(bridge))
    }

    #[test]
    fn test_literal_binds_and_constructs_backend() {
        let built = Arc::new(AtomicUsize::new(0));
        let assistant = counting_assistant(built.clone());

        let bound = assistant
            .bind(&[Argument::Literal("list all rows".into())])
            .unwrap();
        assert_eq!(bound.as_str(), Some("list all rows"));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        assistant.bind(&[Argument::Literal("again".into())]).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_column_reference_fails_at_bind() {
        let built = Arc::new(AtomicUsize::new(0));
        let assistant = counting_assistant(built.clone());

        let err = assistant
            .bind(&[Argument::Expression {
                description: "prompts.text".into(),
            }])
            .unwrap_err();
        assert!(matches!(err, AssistantError::Binding(ref msg) if msg.contains("prompts.text")));
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert!(!assistant.bridge().is_initialized());
    }

    #[test]
    fn test_non_string_constant_and_arity_rejected() {
        let assistant = counting_assistant(Arc::new(AtomicUsize::new(0)));

        let err = assistant
            .bind(&[Argument::Constant {
                type_name: "INTEGER".into(),
            }])
            .unwrap_err();
        assert!(matches!(err, AssistantError::Binding(_)));

        assert!(matches!(assistant.bind(&[]), Err(AssistantError::Binding(_))));
        let two = [Argument::Literal("a".into()), Argument::Literal("b".into())];
        assert!(matches!(assistant.bind(&two), Err(AssistantError::Binding(_))));
    }

    #[test]
    fn test_empty_prompt_is_not_rejected() {
        let assistant = counting_assistant(Arc::new(AtomicUsize::new(0)));
        let bound = assistant.bind(&[Argument::Literal(String::new())]).unwrap();
        assert_eq!(bound.as_str(), Some(""));
    }

    #[test]
    fn test_null_literal_executes_to_null_without_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let bridge = GenerationBridge::with_generator(move |_: &str, _: &str| -> anyhow::Result<String> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("SELECT 1;".into())
        });
        let assistant = QueryAssistant::new(Arc::new(bridge));

        let bound = assistant.bind(&[Argument::Null]).unwrap();
        assert_eq!(bound.as_str(), None);
        assert_eq!(assistant.execute(&BrokenCatalog, &bound).unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backend_construction_failure_surfaces_at_bind() {
        let bridge = GenerationBridge::new(|| Err(anyhow::anyhow!("no network")));
        let assistant = QueryAssistant::new(Arc::new(bridge));

        let err = assistant
            .bind(&[Argument::Literal("x".into())])
            .unwrap_err();
        assert!(matches!(err, AssistantError::Generation(ref msg) if msg.contains("no network")));
    }

    #[test]
    fn test_execute_passes_prompt_and_fresh_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let bridge = GenerationBridge::with_generator(move |prompt: &str, context: &str| -> anyhow::Result<String> {
            log.lock().unwrap().push((prompt.to_string(), context.to_string()));
            Ok("SENTINEL".into())
        });
        let assistant = QueryAssistant::new(Arc::new(bridge));
        let bound = assistant.bind(&[Argument::Literal("list all rows".into())]).unwrap();

        let catalog = FixedCatalog(vec!["CREATE TABLE t(a INTEGER);".into()]);
        assert_eq!(assistant.execute(&catalog, &bound).unwrap().as_deref(), Some("SENTINEL"));

        let catalog = FixedCatalog(vec![
            "CREATE TABLE t(a INTEGER);".into(),
            "CREATE TABLE u(b VARCHAR);".into(),
        ]);
        assert_eq!(assistant.execute(&catalog, &bound).unwrap().as_deref(), Some("SENTINEL"));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("list all rows".to_string(), "CREATE TABLE t(a INTEGER);".to_string()),
                (
                    "list all rows".to_string(),
                    "CREATE TABLE t(a INTEGER);CREATE TABLE u(b VARCHAR);".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_introspection_error_skips_generation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let bridge = GenerationBridge::with_generator(move |_: &str, _: &str| -> anyhow::Result<String> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        });
        let assistant = QueryAssistant::new(Arc::new(bridge));
        let bound = assistant.bind(&[Argument::Literal("x".into())]).unwrap();

        let err = assistant.execute(&BrokenCatalog, &bound).unwrap_err();
        assert!(matches!(err, AssistantError::Introspection(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

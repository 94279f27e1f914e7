use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssistantError {
    /// The function was bound with arguments it cannot accept.
    #[error("binding error: {0}")]
    Binding(String),

    /// The generation backend failed to construct or to produce output.
    #[error("generation backend error: {0}")]
    Generation(String),

    /// The catalog query used to collect table DDL failed.
    #[error("schema introspection failed: {0}")]
    Introspection(#[from] duckdb::Error),

    #[error("failed to register function: {0}")]
    Registration(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AssistantError {
    /// Keeps the whole `anyhow` context chain in the message.
    pub(crate) fn generation(err: anyhow::Error) -> Self {
        AssistantError::Generation(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, AssistantError>;

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node group '{0}' not found")]
    GroupNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Raised before any instance is created.
    #[error("max size {max_size} exceeded (requested: {requested})")]
    CapacityExceeded { max_size: u32, requested: usize },

    /// Some instances were created and kept; the rest were not attempted
    /// or failed.
    #[error("only {created}/{requested} instances created successfully")]
    PartialIncrease { created: usize, requested: usize },

    #[error("startup script error: {0}")]
    StartupScript(String),

    #[error("unknown node/providerID '{0}'")]
    NodeNotFound(String),

    #[error("no node shape known for instance type '{instance_type}' of group '{group}'")]
    TemplateUnavailable { group: String, instance_type: String },
}

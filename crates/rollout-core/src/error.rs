use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("check '{check}' raised: {source}")]
    CheckFault {
        check: String,
        #[source]
        source: Box<RolloutError>,
    },

    #[error("command '{command}' raised: {source}")]
    CommandFault {
        command: String,
        #[source]
        source: Box<RolloutError>,
    },

    #[error("action {0} failed")]
    ActionFailed(String),

    #[error("failed to spawn shell for '{command}': {source}")]
    Shell {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shell command '{command}' exited with {code}: {stderr}")]
    ShellFailed {
        command: String,
        code: String,
        stderr: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("invalid plan: {0}")]
    Plan(String),

    #[error("unknown variable '${{{name}}}' in '{template}'")]
    UnknownVariable { name: String, template: String },

    #[error("{0}")]
    Operation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RolloutError {
    /// Free-form fault raised from inside a check or command closure.
    pub fn operation(msg: impl Into<String>) -> Self {
        Self::Operation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RolloutError>;

/// Behavioral error kinds surfaced by the coordination kernel.
///
/// Compute failures reported by managers are not errors: they are data,
/// stored on the record's compute history.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Malformed submission. Rejects the whole batch; no state change.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Request exceeds a configured api limit. Rejects the whole batch.
    #[error("limit exceeded: requested {requested} but the limit for {resource} is {limit}")]
    LimitExceeded {
        resource: &'static str,
        requested: usize,
        limit: usize,
    },

    /// A referenced id does not exist (and `missing_ok` was not set).
    #[error("missing data: {0}")]
    MissingData(String),

    /// The operation is not permitted by the record state machine.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// A compute manager violated its contract. When `shutdown` is set the
    /// manager must terminate rather than retry.
    #[error("compute manager error: {message}")]
    ComputeManager { message: String, shutdown: bool },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn compute_manager(message: impl Into<String>) -> Self {
        ServerError::ComputeManager {
            message: message.into(),
            shutdown: false,
        }
    }

    pub fn compute_manager_shutdown(message: impl Into<String>) -> Self {
        ServerError::ComputeManager {
            message: message.into(),
            shutdown: true,
        }
    }

    pub fn missing(what: impl std::fmt::Display) -> Self {
        ServerError::MissingData(what.to_string())
    }
}

#[cfg(feature = "sqlx-support")]
impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServerError::MissingData("row not found".to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Internal(format!("serialization failure: {err}"))
    }
}

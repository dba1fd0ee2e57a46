use thiserror::Error;

pub type OutreachResult<T> = Result<T, OutreachError>;

#[derive(Error, Debug)]
pub enum OutreachError {
    /// A lifecycle command is not legal from the instance's current status.
    #[error("Invalid state transition: cannot {command} an instance that is {from}")]
    InvalidStateTransition { from: String, command: String },

    /// An event was applied to a step whose status does not accept it.
    #[error("Invalid step state: step {ordinal} is {status}, cannot apply {event}")]
    InvalidStepState {
        ordinal: u32,
        status: String,
        event: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Delivery failure: {0}")]
    DeliveryFailure(String),

    #[error("Invalid campaign definition: {0}")]
    InvalidDefinition(String),

    /// Caller-supplied input rejected before any state is touched.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OutreachError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Local validation failures are rejected synchronously and leave state
    /// untouched; everything else comes from a collaborator.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidStateTransition { .. }
                | Self::InvalidStepState { .. }
                | Self::InvalidDefinition(_)
                | Self::InvalidInput(_)
        )
    }
}

impl From<config::ConfigError> for OutreachError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = OutreachError::InvalidStateTransition {
            from: "stopped".into(),
            command: "pause".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot pause an instance that is stopped"
        );
        assert!(err.is_validation());

        let err = OutreachError::not_found("instance", "abc");
        assert_eq!(err.to_string(), "instance abc not found");
        assert!(!err.is_validation());

        let err = OutreachError::InvalidInput("message body is empty".into());
        assert_eq!(err.to_string(), "Invalid input: message body is empty");
        assert!(err.is_validation());
    }
}

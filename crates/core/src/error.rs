use thiserror::Error;

pub type PaywallResult<T> = Result<T, PaywallError>;

#[derive(Error, Debug)]
pub enum PaywallError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rule evaluation error: {0}")]
    Evaluation(String),

    #[error("Paywall build error: {0}")]
    Build(String),

    #[error("Assignment persistence error: {0}")]
    Assignment(String),

    #[error("Presentation rejected: {0}")]
    Rejected(String),

    #[error("Purchase error: {0}")]
    Purchase(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

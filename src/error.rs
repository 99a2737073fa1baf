use thiserror::Error;

use crate::types::ProviderKind;

/// Errors surfaced by the CRM service and its providers.
#[derive(Debug, Error)]
pub enum CrmError {
    /// A required credential field was never supplied. Raised before any
    /// network call is attempted.
    #[error("{provider} requires {field} to be configured")]
    MissingCredential {
        provider: ProviderKind,
        field: &'static str,
    },

    /// The backend rejected the supplied credentials during a config update.
    #[error("authentication failed for {0}")]
    AuthenticationFailed(ProviderKind),

    /// An operation was attempted against a vendor provider that has not
    /// completed a successful `authenticate` yet.
    #[error("{0} provider is not authenticated")]
    NotAuthenticated(ProviderKind),

    /// Non-success HTTP status from a vendor API.
    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: ProviderKind,
        status: u16,
        message: String,
    },

    /// The request never produced a vendor response.
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: ProviderKind,
        #[source]
        source: reqwest::Error,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A record referenced an ID owned by a different provider namespace.
    #[error("{0} belongs to a different provider")]
    ProviderMismatch(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CrmError {
    fn from(err: rusqlite::Error) -> Self {
        CrmError::Storage(err.to_string())
    }
}

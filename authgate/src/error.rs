use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Provider errors
    #[error("provider not found: {0}")]
    ProviderNotFound(String),
    #[error("provider error: {0}")]
    Provider(String),

    // Token errors
    #[error("invalid token")]
    InvalidToken,
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("token already used")]
    TokenAlreadyUsed,

    // OAuth flow errors
    #[error("state mismatch")]
    StateMismatch,
    #[error("missing authorization code")]
    MissingAuthorizationCode,

    // Authorization errors
    #[error("identity has no email address")]
    EmailNotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate limited")]
    RateLimited,

    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("storage error: {0}")]
    Storage(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Any of the email token failure modes.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidToken | Error::TokenNotFound | Error::TokenExpired | Error::TokenAlreadyUsed
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidToken
            | Error::TokenNotFound
            | Error::TokenExpired
            | Error::TokenAlreadyUsed
            | Error::StateMismatch
            | Error::MissingAuthorizationCode
            | Error::InvalidRequest(_)
            | Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::EmailNotFound | Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::Provider(_) | Error::Storage(_) | Error::Crypto(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Text shown to the browser. Never carries internal detail.
    fn public_message(&self) -> &'static str {
        match self {
            e if e.is_token_error() => "This sign-in link or code is invalid or expired.",
            Error::StateMismatch => "The sign-in request could not be verified. Please try again.",
            Error::MissingAuthorizationCode => "The identity provider did not return a code.",
            Error::EmailNotFound => {
                "Your account did not share an email address, which is required to sign in."
            }
            Error::Forbidden(_) => "You are not allowed to access this resource.",
            Error::ProviderNotFound(_) => "Unknown sign-in provider.",
            Error::RateLimited => "Too many requests. Please wait a minute and try again.",
            Error::InvalidRequest(_) | Error::Validation(_) => "The request was invalid.",
            _ => "Something went wrong. Please try again later.",
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Provider(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {}", e))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::info!(error = %self, status = status.as_u16(), "request rejected");
        }

        let title = match status {
            StatusCode::FORBIDDEN => "Access denied",
            StatusCode::NOT_FOUND => "Not found",
            s if s.is_server_error() => "Server error",
            _ => "Sign-in failed",
        };
        let body = format!(
            "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
             <body><main><h1>{title}</h1><p>{}</p></main></body></html>",
            self.public_message()
        );

        (status, Html(body)).into_response()
    }
}

/// Every problem found while validating a configuration or request, reported at once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn messages(&self) -> &[String] {
        &self.errors
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s): {}", self.errors.len(), self.errors.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

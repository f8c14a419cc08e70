use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

/// Failures inside the persistence layer. BUSY is retried before it ever
/// surfaces here, so every variant is either fatal or a programming error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database corruption: {0}")]
    Corruption(String),

    #[error("unexpected row: {0}")]
    UnexpectedRow(String),

    #[error("bad migration: {0}")]
    BadMigration(String),

    #[error("{0}")]
    Custom(String),
}

impl StorageError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StorageError::Sqlite(_))
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("producer unreachable: {0}")]
    ProducerUnreachable(String),

    #[error("intersection not found: {0}")]
    IntersectionNotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serde error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("join error: {0}")]
    Join(#[from] JoinError),

    #[error("{0}")]
    Custom(String),
}

impl ChainError {
    pub fn new(msg: impl Into<String>) -> Self {
        ChainError::Custom(msg.into())
    }
}

/// HTTP-facing errors. Each variant has a stable code and an explanatory
/// hint; the pair is what goes over the wire.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid pattern")]
    InvalidPattern,

    #[error("invalid slot number")]
    InvalidSlotNo,

    #[error("invalid status flag")]
    InvalidStatusFlag,

    #[error("invalid match filter: {0}")]
    InvalidMatchFilter(String),

    #[error("invalid sort direction")]
    InvalidSortDirection,

    #[error("malformed point")]
    MalformedPoint,

    #[error("malformed datum hash")]
    MalformedDatumHash,

    #[error("malformed script hash")]
    MalformedScriptHash,

    #[error("non existing point")]
    NonExistingPoint,

    #[error("still active pattern")]
    StillActivePattern,

    #[error("unsafe rollback beyond safe zone")]
    UnsafeRollbackBeyondSafeZone,

    #[error("failed to rollback: {0}")]
    FailedToRollback(String),

    #[error("no ancestor")]
    NoAncestor,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("unsupported content type")]
    UnsupportedContentType,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound | AppError::NoAncestor => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::UnsupportedContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidPattern => "invalidPattern",
            AppError::InvalidSlotNo => "invalidSlotNo",
            AppError::InvalidStatusFlag => "invalidStatusFlag",
            AppError::InvalidMatchFilter(_) => "invalidMatchFilter",
            AppError::InvalidSortDirection => "invalidSortDirection",
            AppError::MalformedPoint => "malformedPoint",
            AppError::MalformedDatumHash => "malformedDatumHash",
            AppError::MalformedScriptHash => "malformedScriptHash",
            AppError::NonExistingPoint => "nonExistingPoint",
            AppError::StillActivePattern => "stillActivePattern",
            AppError::UnsafeRollbackBeyondSafeZone => "unsafeRollbackBeyondSafeZone",
            AppError::FailedToRollback(_) => "failedToRollback",
            AppError::NoAncestor => "noAncestor",
            AppError::BadRequest(_) => "badRequest",
            AppError::NotFound => "notFound",
            AppError::MethodNotAllowed => "methodNotAllowed",
            AppError::UnsupportedContentType => "unsupportedContentType",
            AppError::Internal(_) => "internalError",
        }
    }

    pub fn hint(&self) -> String {
        match self {
            AppError::InvalidPattern => {
                "Invalid pattern. Expecting one of: '*', an address, '<credential>/*', '*/<credential>', \
                 '<payment>/<delegation>', '<policy_id>.*', '<policy_id>.<asset_name>', '*@<transaction_id>' \
                 or '<output_index>@<transaction_id>'."
                    .to_string()
            }
            AppError::InvalidSlotNo => "Invalid slot number. Expecting a non-negative integer.".to_string(),
            AppError::InvalidStatusFlag => {
                "Invalid status flag. At most one of 'spent' or 'unspent' may be set.".to_string()
            }
            AppError::InvalidMatchFilter(detail) => format!("Invalid match filter: {}.", detail),
            AppError::InvalidSortDirection => {
                "Invalid sort direction. Expecting 'order=asc' or 'order=desc'.".to_string()
            }
            AppError::MalformedPoint => {
                "Malformed point. Expecting 'origin' or '<slot>.<64-character hex-encoded header hash>'.".to_string()
            }
            AppError::MalformedDatumHash => {
                "Malformed datum hash. Expecting a 64-character hex-encoded digest.".to_string()
            }
            AppError::MalformedScriptHash => {
                "Malformed script hash. Expecting a 56-character hex-encoded digest.".to_string()
            }
            AppError::NonExistingPoint => {
                "The provided point does not match any known checkpoint.".to_string()
            }
            AppError::StillActivePattern => {
                "Cannot delete matches for a pattern overlapping with an active pattern. \
                 Remove the pattern first."
                    .to_string()
            }
            AppError::UnsafeRollbackBeyondSafeZone => {
                "The rollback target is beyond the safe zone; pass 'limit: any' to force it.".to_string()
            }
            AppError::FailedToRollback(detail) => format!("Failed to rollback: {}.", detail),
            AppError::NoAncestor => "No known block at or before the given slot.".to_string(),
            AppError::BadRequest(detail) => detail.clone(),
            AppError::NotFound => "No route matches the request.".to_string(),
            AppError::MethodNotAllowed => "Method not allowed on this route.".to_string(),
            AppError::UnsupportedContentType => "Unsupported content type.".to_string(),
            AppError::Internal(detail) => detail.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub hint: String,
    pub code: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse { hint: self.hint(), code: self.code() };
        (status, axum::Json(body)).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<ChainError> for AppError {
    fn from(e: ChainError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<JoinError> for AppError {
    fn from(e: JoinError) -> Self {
        AppError::Internal(e.to_string())
    }
}

//! API handlers module

pub mod health;
pub mod papers;

use axum::http::Uri;
use worldthread_common::errors::AppError;

/// Fallback for unknown routes
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound {
        path: uri.path().to_string(),
    }
}

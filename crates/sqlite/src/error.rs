//! Errors raised while opening a store.
//!
//! Once open, every failure surfaces as the engine's
//! [`StoreError`](engine::store::StoreError).

/// Errors that can occur when opening a SQLite store.
#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for opening a store.
pub type Result<T> = std::result::Result<T, SqliteStoreError>;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Migration error: {0}")]
    MigrateError(String),
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        DbError::StoreUnavailable(e.to_string())
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("internal check failed: overlapping timeline entries for {0:?}")]
    TimelineOverlap((String, String, String)),
    #[error("internal check failed: multiple active reservations for {0:?}")]
    MultipleReservations((String, String)),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage invariant violated: {0}")]
    Invariant(String),
}

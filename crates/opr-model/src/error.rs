//! The tagged error shape of spec.md §7: every error carries a stable
//! `code` an (out-of-scope) HTTP layer can map to a status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no offer currently available for this request")]
    NoAvailableOffer,

    #[error("offer has changed since the given timestamp")]
    OfferHasChanged { current: Box<opr_patch::Offer> },

    #[error(transparent)]
    InvalidChain(#[from] opr_chain::ChainError),

    #[error(transparent)]
    PatchRejected(#[from] opr_patch::PatchError),

    #[error("offer failed schema validation: {0}")]
    SchemaInvalid(String),

    #[error("internal check failed: overlapping timeline entries")]
    InternalCheckFailedTimelineOverlap,

    #[error("internal check failed: multiple active reservations")]
    InternalCheckFailedMultipleReservations,

    #[error("internal error: malformed update set: {0}")]
    InternalErrorBadUpdateSet(String),

    #[error(transparent)]
    Database(#[from] opr_storage::StorageError),
}

impl ModelError {
    /// The stable string code named in spec.md §7, for an (out-of-scope)
    /// HTTP layer to map to a status and response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoAvailableOffer => "NO_AVAILABLE_OFFER",
            Self::OfferHasChanged { .. } => "OFFER_HAS_CHANGED",
            Self::InvalidChain(_) => "INVALID_CHAIN",
            Self::PatchRejected(_) => "PATCH_REJECTED",
            Self::SchemaInvalid(_) => "SCHEMA_INVALID",
            Self::InternalCheckFailedTimelineOverlap => {
                "INTERNAL_CHECK_FAILED_SQL_DATABASE_TIMELINE_OVERLAP"
            }
            Self::InternalCheckFailedMultipleReservations => {
                "INTERNAL_CHECK_FAILED_SQL_DATABASE_MULTIPLE_RESERVATIONS"
            }
            Self::InternalErrorBadUpdateSet(_) => "INTERNAL_ERROR_BAD_UPDATE_SET",
            Self::Database(storage_err) => match storage_err {
                opr_storage::StorageError::TimelineOverlap(_) => {
                    "INTERNAL_CHECK_FAILED_SQL_DATABASE_TIMELINE_OVERLAP"
                }
                opr_storage::StorageError::MultipleReservations(_) => {
                    "INTERNAL_CHECK_FAILED_SQL_DATABASE_MULTIPLE_RESERVATIONS"
                }
                _ => "ERROR_DATABASE",
            },
        }
    }

    /// The HTTP status an (out-of-scope) transport layer would use.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NoAvailableOffer | Self::OfferHasChanged { .. } => 409,
            Self::InvalidChain(_) => 400,
            Self::PatchRejected(_) | Self::SchemaInvalid(_) => 422,
            Self::InternalCheckFailedTimelineOverlap
            | Self::InternalCheckFailedMultipleReservations
            | Self::InternalErrorBadUpdateSet(_)
            | Self::Database(_) => 500,
        }
    }
}

//! The OPR orchestrator: binds a [`opr_storage::Storage`], a
//! [`opr_chain::Signer`]/[`opr_chain::Verifier`] pair, and a
//! [`opr_listing::ListingPolicy`] into the UPDATE/LIST/ACCEPT/RESERVE/REJECT
//! state machine (spec.md §4.7).

mod error;
mod model;
pub mod schema;
pub mod types;

pub use error::ModelError;
pub use model::OfferModel;
pub use types::*;

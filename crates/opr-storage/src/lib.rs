//! Transactional persistence of offers, corpora, timelines, acceptances,
//! rejections, and producer metadata (spec.md §4.6).

pub mod entities;
mod error;
pub mod mem;
pub mod pg;

use async_trait::async_trait;
use opr_chain::ReshareChain;
use opr_interval::Interval;
use opr_patch::OfferKey;

pub use entities::*;
pub use error::StorageError;

/// A scoped unit of work. All writes become visible together on
/// [`Transaction::commit`]; none do if the transaction is dropped without
/// committing or [`Transaction::abort`] is called explicitly.
///
/// Isolation target is SERIALIZABLE (spec.md §5); [`PgStorage`](pg::PgStorage)
/// runs every transaction at that level.
#[async_trait]
pub trait Transaction: Send {
    // -- key-value, namespaced by host --

    async fn store_value(&mut self, host: &str, key: &str, value: Vec<u8>)
        -> Result<(), StorageError>;

    /// Deletes every key under `key_prefix`, returning the count deleted.
    async fn clear_all_values(&mut self, host: &str, key_prefix: &str) -> Result<u64, StorageError>;

    async fn get_values(&mut self, host: &str, key_prefix: &str)
        -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    // -- offers and corpora --

    async fn insert_or_update_offer_in_corpus(
        &mut self,
        host: &str,
        producer_id: &str,
        snapshot: OfferSnapshot,
        reshare_chain: Option<opr_chain::ReshareChain>,
    ) -> Result<CorpusWriteResult, StorageError>;

    async fn delete_offer_in_corpus(
        &mut self,
        host: &str,
        producer_id: &str,
        key: &OfferKey,
    ) -> Result<CorpusWriteResult, StorageError>;

    async fn get_offer_from_corpus(
        &mut self,
        host: &str,
        producer_id: &str,
        key: &OfferKey,
    ) -> Result<Option<OfferSnapshot>, StorageError>;

    /// Reads an offer snapshot. When `update_timestamp_utc` is given, reads
    /// exactly that version; otherwise reads the latest known version.
    async fn get_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        update_timestamp_utc: Option<i64>,
    ) -> Result<Option<OfferSnapshot>, StorageError>;

    /// Every producer id whose latest corpus currently carries this offer.
    async fn get_offer_sources(&mut self, host: &str, key: &OfferKey)
        -> Result<Vec<String>, StorageError>;

    async fn get_corpus_offers(
        &mut self,
        host: &str,
        producer_id: &str,
        skip: usize,
    ) -> Result<Vec<OfferSnapshot>, StorageError>;

    async fn known_offering_orgs(&mut self, host: &str) -> Result<Vec<KnownOfferingOrg>, StorageError>;

    /// Every reshare chain currently attached to this offer across all
    /// latest corpora that carry it — the raw material for timeline
    /// recomputation's `localAcceptChain`/`bestReshareRoot` search (spec.md
    /// §4.7.2).
    async fn get_offer_chains_from_corpora(
        &mut self,
        host: &str,
        key: &OfferKey,
    ) -> Result<Vec<Option<ReshareChain>>, StorageError>;

    // -- timelines --

    async fn get_timeline_for_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        interval: Option<Interval>,
        target_org: Option<&str>,
    ) -> Result<Vec<TimelineEntry>, StorageError>;

    /// Bulk-inserts entries. Callers must have truncated any overlapping
    /// live entries first; this does not itself enforce non-overlap beyond
    /// the optional internal check in [`Self::check_invariants`].
    async fn add_timeline_entries(
        &mut self,
        host: &str,
        entries: Vec<TimelineEntry>,
    ) -> Result<(), StorageError>;

    /// Deletes entries strictly after `t_star` and clips entries straddling
    /// it to end at `t_star`.
    async fn truncate_future_timeline_for_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        t_star: i64,
    ) -> Result<(), StorageError>;

    // -- views --

    async fn get_offers_at_time(
        &mut self,
        host: &str,
        viewing_org: &str,
        t: i64,
        skip: usize,
        page_size: usize,
    ) -> Result<Vec<VisibleOffer>, StorageError>;

    async fn get_offer_at_time(
        &mut self,
        host: &str,
        viewing_org: &str,
        key: &OfferKey,
        t: i64,
    ) -> Result<Option<VisibleOffer>, StorageError>;

    async fn get_changed_offers(
        &mut self,
        host: &str,
        viewing_org: &str,
        old_t: i64,
        new_t: i64,
    ) -> Result<Vec<ChangedOffer>, StorageError>;

    // -- acceptance, rejection, history --

    async fn write_accept(&mut self, host: &str, acceptance: Acceptance) -> Result<(), StorageError>;

    async fn get_history(
        &mut self,
        host: &str,
        viewing_org: &str,
        since_utc: Option<i64>,
        skip: usize,
        max_results: usize,
    ) -> Result<Vec<HistoryRecord>, StorageError>;

    // -- producer metadata --

    async fn write_offer_producer_metadata(
        &mut self,
        host: &str,
        meta: ProducerMetadata,
    ) -> Result<(), StorageError>;

    /// Reads a producer's metadata, creating `{nextRunTimestampUTC = now,
    /// lastUpdateTimeUTC = None}` under this transaction if absent (spec.md
    /// §4.7 PRODUCER-METADATA). Returns `None` only when the row was just
    /// created by this call.
    async fn get_or_init_offer_producer_metadata(
        &mut self,
        host: &str,
        producer_id: &str,
        now_utc: i64,
    ) -> Result<Option<ProducerMetadata>, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
    async fn abort(self: Box<Self>) -> Result<(), StorageError>;
}

/// Opens transactions. A single handle is shared across tasks and must be
/// safe for concurrent use (spec.md §5).
#[async_trait]
pub trait Storage: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;
}

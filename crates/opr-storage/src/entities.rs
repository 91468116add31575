//! The row-shaped entities persisted by [`crate::Storage`], per spec.md §3.

use opr_chain::ReshareChain;
use opr_interval::HasInterval;
use opr_patch::Offer;

/// `(postingOrgUrl, offerId, lastUpdateUTC)` — identifies one immutable
/// version of an offer.
pub type SnapshotKey = (String, String, i64);

/// An immutable version of an offer, as materialized into the corpus.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferSnapshot {
    pub posting_org_url: String,
    pub offer_id: String,
    pub last_update_utc: i64,
    pub offer: Offer,
    pub expiration_utc: i64,
}

impl OfferSnapshot {
    pub fn key(&self) -> SnapshotKey {
        (
            self.posting_org_url.clone(),
            self.offer_id.clone(),
            self.last_update_utc,
        )
    }
}

/// One `(snapshot, reshareChain?)` tuple held by a [`FeedCorpus`].
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusOffer {
    pub snapshot_key: SnapshotKey,
    pub reshare_chain: Option<ReshareChain>,
}

/// The most recent offer set observed from a single producer.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedCorpus {
    pub producer_id: String,
    pub recorded_at_utc: i64,
    pub is_latest: bool,
    pub offers: Vec<CorpusOffer>,
}

/// A record of an offer's visibility to an organization over an interval.
/// Rejections are represented as a non-expiring entry with
/// `is_rejection = true`, per spec.md §3's "behavior is identical" note.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub posting_org_url: String,
    pub offer_id: String,
    pub snapshot_update_utc: i64,
    pub target_organization_url: String,
    pub start_time_utc: i64,
    pub end_time_utc: i64,
    pub is_reservation: bool,
    pub is_rejection: bool,
    pub reshare_chain: Option<ReshareChain>,
}

impl TimelineEntry {
    pub fn offer_key(&self) -> (String, String) {
        (self.posting_org_url.clone(), self.offer_id.clone())
    }

    pub fn is_listing(&self) -> bool {
        !self.is_reservation && !self.is_rejection
    }
}

impl HasInterval for TimelineEntry {
    fn start_time_utc(&self) -> i64 {
        self.start_time_utc
    }
    fn end_time_utc(&self) -> i64 {
        self.end_time_utc
    }
    fn set_start_time_utc(&mut self, t: i64) {
        self.start_time_utc = t;
    }
    fn set_end_time_utc(&mut self, t: i64) {
        self.end_time_utc = t;
    }
}

/// A terminal acceptance record.
#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub posting_org_url: String,
    pub offer_id: String,
    pub snapshot_update_utc: i64,
    pub accepted_by: String,
    pub accepted_at_utc: i64,
    pub decoded_reshare_chain: Option<ReshareChain>,
}

impl Acceptance {
    /// Every org that may see this acceptance via HISTORY: the host, the
    /// acceptor, and every `sharingOrgUrl` in the chain (spec.md §8 property 7).
    pub fn viewers(&self, host_org_url: &str) -> Vec<String> {
        let mut viewers = vec![host_org_url.to_string(), self.accepted_by.clone()];
        if let Some(chain) = &self.decoded_reshare_chain {
            for link in chain {
                if let Ok(claims) = opr_chain::decode_claims_unchecked(link) {
                    viewers.push(claims.sharing_org_url);
                }
            }
        }
        viewers.sort();
        viewers.dedup();
        viewers
    }
}

/// Per-producer scheduling state. The first read of a row for a producer
/// under SERIALIZABLE isolation acts as an advisory lock (spec.md §4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerMetadata {
    pub organization_url: String,
    pub next_run_timestamp_utc: i64,
    pub last_update_time_utc: Option<i64>,
}

/// An organization observed as an offer poster.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownOfferingOrg {
    pub org_url: String,
    pub last_seen_at_utc: i64,
}

/// The result of a corpus mutation: whether the global offer set changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusWriteResult {
    Add,
    Update,
    /// The offer already existed via some other corpus; the global set is
    /// unchanged.
    None,
}

/// An offer as resolved through [`crate::Storage::get_offers_at_time`]:
/// the single timeline entry governing visibility, paired with its offer.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleOffer {
    pub offer: Offer,
    pub snapshot_update_utc: i64,
    pub reshare_chain: Option<ReshareChain>,
    pub timeline_entry: TimelineEntry,
}

/// One offer whose visible version differs between two instants.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedOffer {
    pub old_version: Option<VisibleOffer>,
    pub new_version: Option<VisibleOffer>,
}

/// A single acceptance record as surfaced by HISTORY, with its offer attached.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub offer: Offer,
    pub acceptance: Acceptance,
}

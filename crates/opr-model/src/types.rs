//! Wire-level payload and event shapes named in spec.md §6: the request
//! bodies the (out-of-scope) HTTP layer deserializes into before calling
//! [`crate::OfferModel`], and the [`OfferChange`] event it publishes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use opr_chain::ReshareChain;
use opr_patch::{Offer, OfferKey, OfferPatch};
use serde::{Deserialize, Serialize};

/// A producer's result: either a full offer set or a patch sequence against
/// the producer's previous corpus (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferSetUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offers: Option<Vec<Offer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Vec<OfferPatch>>,
    #[serde(rename = "sourceOrgUrl")]
    pub source_org_url: String,
    #[serde(rename = "updateCurrentAsOfTimestampUTC")]
    pub update_current_as_of_timestamp_utc: i64,
    #[serde(rename = "earliestNextRequestUTC", skip_serializing_if = "Option::is_none")]
    pub earliest_next_request_utc: Option<i64>,
}

/// The `LIST` request shape: either a full snapshot or a diff since a prior
/// instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "UPPERCASE")]
pub enum ListOffersPayload {
    Snapshot,
    Diff {
        #[serde(rename = "diffStartTimestampUTC")]
        diff_start_timestamp_utc: i64,
    },
}

/// The `LIST` response: a flat offer list for `SNAPSHOT`, or a patch
/// sequence for `DIFF`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "UPPERCASE")]
pub enum ListResult {
    Snapshot { offers: Vec<Offer> },
    Diff { patches: Vec<OfferPatch> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptOfferPayload {
    pub offer_id: String,
    #[serde(rename = "ifNotNewerThanTimestampUTC", skip_serializing_if = "Option::is_none")]
    pub if_not_newer_than_timestamp_utc: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded_reshare_chain: Option<ReshareChain>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveOfferPayload {
    pub offer_id: String,
    pub requested_reservation_secs: i64,
}

/// The RESERVE response: when the reservation the caller was granted
/// expires, per spec.md §8 scenario C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveResult {
    #[serde(rename = "reservationExpirationUTC")]
    pub reservation_expiration_utc: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectOfferPayload {
    pub offer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offered_by_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    #[serde(rename = "historySinceUTC", skip_serializing_if = "Option::is_none")]
    pub history_since_utc: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results_per_page: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HistoryResult {
    pub records: Vec<opr_storage::HistoryRecord>,
    pub next_page_token: Option<String>,
}

/// The kind of change an [`OfferChange`] event describes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Add,
    Update,
    Delete,
    Accept,
    RemoteAccept,
    RemoteReject,
    RemoteReserve,
}

/// A single change to the offer corpus, fanned out on [`crate::OfferModel`]'s
/// change bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferChange {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    #[serde(rename = "timestampUTC")]
    pub timestamp_utc: i64,
    #[serde(rename = "oldValue", skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Offer>,
    #[serde(rename = "newValue", skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Offer>,
}

/// An opaque pagination cursor for `LIST`/`HISTORY`, encoded as base64 over
/// `(lastPostingOrg, lastOfferId, snapshotTimeUTC)` (spec.md §9 Open Q1 — no
/// normative encoding exists, so this is a documented implementation choice;
/// see DESIGN.md).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub last_posting_org: String,
    pub last_offer_id: String,
    pub snapshot_time_utc: i64,
}

impl PageToken {
    pub fn from_key(key: &OfferKey, snapshot_time_utc: i64) -> Self {
        Self {
            last_posting_org: key.0.clone(),
            last_offer_id: key.1.clone(),
            snapshot_time_utc,
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("page token serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, crate::ModelError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| crate::ModelError::InternalErrorBadUpdateSet(format!("bad page token: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| crate::ModelError::InternalErrorBadUpdateSet(format!("bad page token: {e}")))
    }
}

/// An opaque pagination cursor for HISTORY. Unlike [`PageToken`], a history
/// query has no natural key to resume from beyond "how many records were
/// already returned", so the cursor is a plain skip count (spec.md §9 Open
/// Q1 — no normative encoding exists; this is a documented implementation
/// choice, see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPageToken {
    pub skip: usize,
}

impl HistoryPageToken {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("history page token serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, crate::ModelError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| crate::ModelError::InternalErrorBadUpdateSet(format!("bad history page token: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| crate::ModelError::InternalErrorBadUpdateSet(format!("bad history page token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_page_token_round_trips() {
        let token = HistoryPageToken { skip: 40 };
        let decoded = HistoryPageToken::decode(&token.encode()).unwrap();
        assert_eq!(token, decoded);
    }

    #[test]
    fn page_token_round_trips() {
        let token = PageToken {
            last_posting_org: "https://a".into(),
            last_offer_id: "pear".into(),
            snapshot_time_utc: 12345,
        };
        let decoded = PageToken::decode(&token.encode()).unwrap();
        assert_eq!(token, decoded);
    }
}

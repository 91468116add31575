//! The offer set and the patches that transform one offer set into another.
//!
//! Offers are immutable once identified by `(postingOrgUrl, offerId,
//! offerUpdateUTC)` (spec.md §3). `OfferPatch` is a tagged sum type (per
//! spec.md §9's "tagged variants replace discriminated JSON strings") rather
//! than the wire-level `"clear" | {target, patch}` shape — callers that
//! speak the wire format serialize/deserialize through this type directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An offer as carried through the federation protocol. Fields beyond the
/// ones the offer model reasons about (description, item listings, images,
/// ...) are preserved opaquely in `extra` and round-tripped through patches
/// and storage untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    #[serde(rename = "offeredBy")]
    pub offered_by: String,
    #[serde(rename = "offerCreationUTC")]
    pub offer_creation_utc: i64,
    #[serde(rename = "offerUpdateUTC", skip_serializing_if = "Option::is_none")]
    pub offer_update_utc: Option<i64>,
    #[serde(rename = "offerExpirationUTC")]
    pub offer_expiration_utc: i64,
    #[serde(rename = "maxReservationTimeSecs", skip_serializing_if = "Option::is_none")]
    pub max_reservation_time_secs: Option<i64>,
    #[serde(rename = "reshareChain", skip_serializing_if = "Option::is_none")]
    pub reshare_chain: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Offer {
    /// `offerUpdateUTC`, defaulting to `offerCreationUTC` per spec.md §3.
    pub fn effective_update_utc(&self) -> i64 {
        self.offer_update_utc.unwrap_or(self.offer_creation_utc)
    }
}

/// `(postingOrgUrl, offerId)` — the stable identity of an offer.
pub type OfferKey = (String, String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredOfferId {
    pub posting_org_url: String,
    pub offer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedStructuredOfferId {
    #[serde(rename = "postingOrgUrl")]
    pub posting_org_url: String,
    #[serde(rename = "offerId")]
    pub offer_id: String,
    #[serde(rename = "offerUpdateUTC")]
    pub offer_update_utc: i64,
}

/// A single targeted change to an offer set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum OfferPatch {
    /// Empties the working set entirely.
    Clear,
    Remove {
        target: StructuredOfferId,
    },
    Add {
        target: StructuredOfferId,
        offer: Offer,
    },
    Update {
        target: VersionedStructuredOfferId,
        patch: json_patch::Patch,
    },
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch rejected: {0}")]
    PatchRejected(String),
}

/// Builds the keyed offer set from a flat sequence, keyed by
/// `(offeredBy, id)` per spec.md §3 (`offeredBy` is the posting org).
pub fn to_offer_set(offers: impl IntoIterator<Item = Offer>) -> BTreeMap<OfferKey, Offer> {
    offers
        .into_iter()
        .map(|o| ((o.offered_by.clone(), o.id.clone()), o))
        .collect()
}

/// The minimal patch sequence that transforms `old` into `new`.
///
/// Iteration is over `BTreeMap`, i.e. lexicographic `(postingOrgUrl,
/// offerId)` order, so the output is deterministic (spec.md §4.4).
pub fn diff_as_offer_patches(
    old: &BTreeMap<OfferKey, Offer>,
    new: &BTreeMap<OfferKey, Offer>,
) -> Vec<OfferPatch> {
    let mut patches = Vec::new();

    for (key, old_offer) in old {
        if !new.contains_key(key) {
            patches.push(OfferPatch::Remove {
                target: StructuredOfferId {
                    posting_org_url: key.0.clone(),
                    offer_id: key.1.clone(),
                },
            });
        }
        let _ = old_offer;
    }

    for (key, new_offer) in new {
        match old.get(key) {
            None => patches.push(OfferPatch::Add {
                target: StructuredOfferId {
                    posting_org_url: key.0.clone(),
                    offer_id: key.1.clone(),
                },
                offer: new_offer.clone(),
            }),
            Some(old_offer) => {
                if old_offer.effective_update_utc() == new_offer.effective_update_utc()
                    && old_offer == new_offer
                {
                    continue;
                }
                let old_value = serde_json::to_value(old_offer).expect("offer serializes");
                let new_value = serde_json::to_value(new_offer).expect("offer serializes");
                let patch = json_patch::diff(&old_value, &new_value);
                patches.push(OfferPatch::Update {
                    target: VersionedStructuredOfferId {
                        posting_org_url: key.0.clone(),
                        offer_id: key.1.clone(),
                        offer_update_utc: new_offer.effective_update_utc(),
                    },
                    patch,
                });
            }
        }
    }

    patches
}

/// Applies `patches` to `old`, returning the resulting offer set. A `Clear`
/// patch empties the working set; applying a patch whose target does not
/// exist (for `Remove`/`Update`) or whose JSON Patch ops fail to apply
/// fails the whole call with `PatchRejected`.
pub fn apply_offer_patches_as_map(
    old: &BTreeMap<OfferKey, Offer>,
    patches: &[OfferPatch],
) -> Result<BTreeMap<OfferKey, Offer>, PatchError> {
    let mut working = old.clone();

    for p in patches {
        match p {
            OfferPatch::Clear => working.clear(),
            OfferPatch::Remove { target } => {
                let key = (target.posting_org_url.clone(), target.offer_id.clone());
                working.remove(&key).ok_or_else(|| {
                    PatchError::PatchRejected(format!("remove: no such offer {key:?}"))
                })?;
            }
            OfferPatch::Add { target, offer } => {
                let key = (target.posting_org_url.clone(), target.offer_id.clone());
                working.insert(key, offer.clone());
            }
            OfferPatch::Update { target, patch } => {
                let key = (target.posting_org_url.clone(), target.offer_id.clone());
                let existing = working.get(&key).ok_or_else(|| {
                    PatchError::PatchRejected(format!("update: no such offer {key:?}"))
                })?;
                let mut value = serde_json::to_value(existing)
                    .map_err(|e| PatchError::PatchRejected(e.to_string()))?;
                json_patch::patch(&mut value, &patch.0)
                    .map_err(|e| PatchError::PatchRejected(e.to_string()))?;
                let updated: Offer = serde_json::from_value(value)
                    .map_err(|e| PatchError::PatchRejected(e.to_string()))?;
                working.insert(key, updated);
            }
        }
    }

    Ok(working)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: &str, offered_by: &str, update: i64) -> Offer {
        Offer {
            id: id.to_string(),
            offered_by: offered_by.to_string(),
            offer_creation_utc: 0,
            offer_update_utc: Some(update),
            offer_expiration_utc: 10_000,
            max_reservation_time_secs: None,
            reshare_chain: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn add_and_remove_round_trip() {
        let old = to_offer_set(vec![offer("p1", "https://a", 0)]);
        let new = to_offer_set(vec![offer("p2", "https://a", 0)]);

        let patches = diff_as_offer_patches(&old, &new);
        assert_eq!(patches.len(), 2, "one remove, one add");

        let applied = apply_offer_patches_as_map(&old, &patches).unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn update_round_trip() {
        let old = to_offer_set(vec![offer("p1", "https://a", 0)]);
        let mut updated = offer("p1", "https://a", 5);
        updated.offer_expiration_utc = 99_999;
        let new = to_offer_set(vec![updated]);

        let patches = diff_as_offer_patches(&old, &new);
        assert_eq!(patches.len(), 1);
        assert!(matches!(patches[0], OfferPatch::Update { .. }));

        let applied = apply_offer_patches_as_map(&old, &patches).unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn identical_sets_produce_no_patches() {
        let set = to_offer_set(vec![offer("p1", "https://a", 0)]);
        assert!(diff_as_offer_patches(&set, &set).is_empty());
    }

    #[test]
    fn clear_empties_working_set() {
        let old = to_offer_set(vec![offer("p1", "https://a", 0)]);
        let applied = apply_offer_patches_as_map(&old, &[OfferPatch::Clear]).unwrap();
        assert!(applied.is_empty());
    }

    #[test]
    fn remove_of_unknown_offer_is_rejected() {
        let old: BTreeMap<OfferKey, Offer> = BTreeMap::new();
        let patch = OfferPatch::Remove {
            target: StructuredOfferId {
                posting_org_url: "https://a".into(),
                offer_id: "p1".into(),
            },
        };
        let err = apply_offer_patches_as_map(&old, &[patch]).unwrap_err();
        assert!(matches!(err, PatchError::PatchRejected(_)));
    }

    #[test]
    fn diff_round_trip_property_on_larger_sets() {
        let a = to_offer_set(vec![
            offer("p1", "https://a", 0),
            offer("p2", "https://a", 0),
            offer("p3", "https://b", 1),
        ]);
        let mut b_p2 = offer("p2", "https://a", 7);
        b_p2.offer_expiration_utc = 55_555;
        let b = to_offer_set(vec![
            offer("p1", "https://a", 0), // unchanged
            b_p2,                        // updated
            offer("p4", "https://c", 0), // added; p3 dropped
        ]);

        let patches = diff_as_offer_patches(&a, &b);
        let applied = apply_offer_patches_as_map(&a, &patches).unwrap();
        assert_eq!(applied, b);
    }
}

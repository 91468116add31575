//! Deciding to whom, and for how long, a snapshot is advertised.

use std::collections::HashSet;

use opr_chain::Scope;
use opr_patch::Offer;

/// One proposed listing: an organization, an interval, and the scopes the
/// org would be granted if this listing is realized.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub org_url: String,
    pub start_time_utc: i64,
    pub end_time_utc: i64,
    pub scopes: Vec<Scope>,
}

/// A pure function deciding the listing set for one offer. Implementations
/// must not perform I/O or depend on anything but their arguments.
pub trait ListingPolicy: Send + Sync {
    fn get_listings(
        &self,
        offer: &Offer,
        first_listing_time_utc: i64,
        now_utc: i64,
        rejections: &HashSet<String>,
        shared_by: &HashSet<String>,
    ) -> Vec<Listing>;
}

/// The default policy: one listing per allowed org (wildcard `*`
/// permitted) from `first_listing_time_utc` to the offer's expiration,
/// excluding orgs that have rejected the offer or already appear in the
/// reshare chain.
pub struct UniversalAcceptPolicy {
    /// Org URLs this policy is willing to list to (`*` included explicitly
    /// if the wildcard is desired). An empty set means "no restriction" —
    /// not useful standalone, so callers normally pass at least one entry.
    pub allowed_orgs: Vec<String>,
}

impl UniversalAcceptPolicy {
    pub fn new(allowed_orgs: Vec<String>) -> Self {
        Self { allowed_orgs }
    }

    pub fn wildcard() -> Self {
        Self {
            allowed_orgs: vec!["*".to_string()],
        }
    }
}

impl ListingPolicy for UniversalAcceptPolicy {
    fn get_listings(
        &self,
        offer: &Offer,
        first_listing_time_utc: i64,
        _now_utc: i64,
        rejections: &HashSet<String>,
        shared_by: &HashSet<String>,
    ) -> Vec<Listing> {
        self.allowed_orgs
            .iter()
            .filter(|org| !rejections.contains(org.as_str()) && !shared_by.contains(org.as_str()))
            .map(|org| Listing {
                org_url: org.clone(),
                start_time_utc: first_listing_time_utc,
                end_time_utc: offer.offer_expiration_utc,
                scopes: vec![Scope::Accept],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> Offer {
        Offer {
            id: "pear".into(),
            offered_by: "https://a".into(),
            offer_creation_utc: 0,
            offer_update_utc: None,
            offer_expiration_utc: 10_000,
            max_reservation_time_secs: None,
            reshare_chain: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn lists_allowed_orgs_excluding_rejections_and_shared() {
        let policy = UniversalAcceptPolicy::new(vec![
            "https://b".into(),
            "https://c".into(),
            "https://d".into(),
        ]);
        let rejections: HashSet<String> = ["https://c".to_string()].into();
        let shared_by: HashSet<String> = ["https://d".to_string()].into();

        let listings = policy.get_listings(&offer(), 1, 1, &rejections, &shared_by);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].org_url, "https://b");
        assert_eq!(listings[0].start_time_utc, 1);
        assert_eq!(listings[0].end_time_utc, 10_000);
    }

    #[test]
    fn wildcard_policy_lists_star() {
        let policy = UniversalAcceptPolicy::wildcard();
        let listings = policy.get_listings(&offer(), 0, 0, &HashSet::new(), &HashSet::new());
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].org_url, "*");
    }
}

//! The orchestrator itself: binds a [`Storage`], a [`Signer`]/[`Verifier`]
//! pair, a [`ListingPolicy`], a [`Clock`], and a [`SchemaValidator`] into the
//! UPDATE/LIST/ACCEPT/RESERVE/REJECT/HISTORY state machine of spec.md §4.7.
//!
//! One [`OfferModel`] serves exactly one `hostOrgUrl`; a multi-tenant
//! process (out of scope here, spec.md §1) holds one instance per host.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use opr_chain::{decode_claims_unchecked, ChainError, ReshareChain, Scope, Signer, Verifier, VerifyOptions};
use opr_clock::Clock;
use opr_interval::{Bounds, Interval};
use opr_listing::ListingPolicy;
use opr_patch::{diff_as_offer_patches, to_offer_set, Offer, OfferKey, OfferPatch};
use opr_storage::{Acceptance, OfferSnapshot, ProducerMetadata, Storage, Transaction, VisibleOffer};

use crate::schema::SchemaValidator;
use crate::types::{
    AcceptOfferPayload, ChangeType, HistoryPayload, HistoryResult, ListOffersPayload, ListResult,
    OfferChange, OfferSetUpdate, RejectOfferPayload, ReserveOfferPayload, ReserveResult,
};
use crate::ModelError;

/// The page size used when an operation must scan every currently-visible
/// offer for a viewer (`LIST SNAPSHOT`, and the by-id lookups behind
/// ACCEPT/RESERVE/REJECT, spec.md §9 Open Q3). Offer corpora are not large
/// enough in practice to need a streaming cursor here; see DESIGN.md.
const SCAN_PAGE_SIZE: usize = 500;

const DEFAULT_HISTORY_PAGE_SIZE: usize = 100;

pub struct OfferModel {
    host_org_url: String,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    listing_policy: Arc<dyn ListingPolicy>,
    schema_validator: Arc<dyn SchemaValidator>,
    bus: opr_bus::ChangeBus<OfferChange>,
    check_invariants: bool,
}

impl OfferModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host_org_url: impl Into<String>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
        listing_policy: Arc<dyn ListingPolicy>,
        schema_validator: Arc<dyn SchemaValidator>,
    ) -> Self {
        Self {
            host_org_url: host_org_url.into(),
            storage,
            clock,
            signer,
            verifier,
            listing_policy,
            schema_validator,
            bus: opr_bus::ChangeBus::new(),
            check_invariants: true,
        }
    }

    /// Toggles the internal consistency checks of spec.md §4.7 step 8. On by
    /// default; tests that intentionally exercise a pre-broken storage
    /// backend can turn them off.
    pub fn with_internal_checks(mut self, enabled: bool) -> Self {
        self.check_invariants = enabled;
        self
    }

    pub fn host_org_url(&self) -> &str {
        &self.host_org_url
    }

    /// The change bus offers, acceptances, and rejections are fanned out on.
    pub fn bus(&self) -> &opr_bus::ChangeBus<OfferChange> {
        &self.bus
    }

    // ---------------------------------------------------------------- UPDATE

    #[tracing::instrument(skip(self, update))]
    pub async fn update(&self, producer_id: &str, update: OfferSetUpdate) -> Result<(), ModelError> {
        let now = self.clock.now_utc_ms();
        let mut tx = self.storage.begin().await?;
        match self.run_update(tx.as_mut(), producer_id, update, now).await {
            Ok(events) => {
                tx.commit().await?;
                for event in &events {
                    self.bus.fire(event).await;
                }
                Ok(())
            }
            Err(err) => {
                let _ = tx.abort().await;
                Err(err)
            }
        }
    }

    async fn run_update(
        &self,
        tx: &mut dyn Transaction,
        producer_id: &str,
        update: OfferSetUpdate,
        now: i64,
    ) -> Result<Vec<OfferChange>, ModelError> {
        let old_map = self.materialize_corpus(tx, producer_id).await?;

        let new_map = match (update.offers, update.delta) {
            (Some(offers), None) => to_offer_set(offers),
            (None, Some(delta)) => opr_patch::apply_offer_patches_as_map(&old_map, &delta)?,
            _ => {
                return Err(ModelError::InternalErrorBadUpdateSet(
                    "update must carry exactly one of offers/delta".into(),
                ))
            }
        };

        let filtered = self.filter_bad_offers(new_map, &update.source_org_url);

        let mut touched: BTreeSet<OfferKey> = old_map.keys().cloned().collect();
        touched.extend(filtered.keys().cloned());

        let mut events = Vec::new();
        for key in touched {
            let old_offer = old_map.get(&key).cloned();

            match filtered.get(&key) {
                Some((offer, chain)) => {
                    let snapshot = OfferSnapshot {
                        posting_org_url: key.0.clone(),
                        offer_id: key.1.clone(),
                        last_update_utc: offer.effective_update_utc(),
                        expiration_utc: offer.offer_expiration_utc,
                        offer: offer.clone(),
                    };
                    tx.insert_or_update_offer_in_corpus(&self.host_org_url, producer_id, snapshot, chain.clone())
                        .await?;
                }
                None => {
                    tx.delete_offer_in_corpus(&self.host_org_url, producer_id, &key).await?;
                }
            }

            let current = tx.get_offer(&self.host_org_url, &key, None).await?;

            match (&old_offer, &current) {
                (Some(old), None) => {
                    tx.truncate_future_timeline_for_offer(&self.host_org_url, &key, now).await?;
                    events.push(OfferChange {
                        change_type: ChangeType::Delete,
                        timestamp_utc: now,
                        old_value: Some(old.clone()),
                        new_value: None,
                    });
                }
                (old_opt, Some(snapshot)) => {
                    let changed = match old_opt {
                        None => true,
                        Some(old) => old.effective_update_utc() != snapshot.last_update_utc,
                    };
                    if changed {
                        self.recompute_timeline_for_offer(tx, &key, snapshot, now).await?;
                        self.check_invariants_for_offer(tx, &key).await?;
                        events.push(OfferChange {
                            change_type: if old_opt.is_none() {
                                ChangeType::Add
                            } else {
                                ChangeType::Update
                            },
                            timestamp_utc: now,
                            old_value: old_opt.clone(),
                            new_value: Some(snapshot.offer.clone()),
                        });
                    }
                }
                (None, None) => {}
            }
        }

        Ok(events)
    }

    async fn materialize_corpus(
        &self,
        tx: &mut dyn Transaction,
        producer_id: &str,
    ) -> Result<BTreeMap<OfferKey, Offer>, ModelError> {
        let snapshots = tx.get_corpus_offers(&self.host_org_url, producer_id, 0).await?;
        Ok(snapshots
            .into_iter()
            .map(|s| ((s.posting_org_url.clone(), s.offer_id.clone()), s.offer))
            .collect())
    }

    /// Drops offers that fail schema validation, or whose `offeredBy` isn't
    /// the producer's source org without a reshare chain proving delegation,
    /// or whose chain fails to verify (spec.md §4.7 step 3). Bad offers are
    /// local recovery: logged and dropped, never fatal to the update as a
    /// whole (spec.md §7).
    fn filter_bad_offers(
        &self,
        offers: BTreeMap<OfferKey, Offer>,
        source_org_url: &str,
    ) -> BTreeMap<OfferKey, (Offer, Option<ReshareChain>)> {
        let mut out = BTreeMap::new();
        for (key, offer) in offers {
            match self.validate_incoming_offer(&offer, source_org_url) {
                Ok(chain) => {
                    out.insert(key, (offer, chain));
                }
                Err(err) => {
                    tracing::warn!(posting_org = %key.0, offer_id = %key.1, error = %err, "dropping invalid offer");
                }
            }
        }
        out
    }

    fn validate_incoming_offer(
        &self,
        offer: &Offer,
        source_org_url: &str,
    ) -> Result<Option<ReshareChain>, ModelError> {
        self.schema_validator
            .validate(offer)
            .map_err(ModelError::SchemaInvalid)?;

        match &offer.reshare_chain {
            Some(chain) if !chain.is_empty() => {
                self.verifier.verify_chain(
                    chain,
                    &VerifyOptions {
                        initial_issuer: &offer.offered_by,
                        initial_entitlement: &offer.id,
                        final_subject: &self.host_org_url,
                        required_final_scopes: &[],
                    },
                )?;
                Ok(Some(chain.clone()))
            }
            _ => {
                if offer.offered_by != source_org_url {
                    return Err(ModelError::InvalidChain(ChainError::InvalidChain(format!(
                        "offer {} posted by {} but sourced from {} with no reshare chain",
                        offer.id, offer.offered_by, source_org_url
                    ))));
                }
                Ok(None)
            }
        }
    }

    /// Recomputes the full timeline for one offer from scratch: who it's
    /// listed to, for how long, and with what reshare chain, carrying
    /// forward any live reservation and every standing rejection
    /// (spec.md §4.7.2).
    async fn recompute_timeline_for_offer(
        &self,
        tx: &mut dyn Transaction,
        key: &OfferKey,
        snapshot: &OfferSnapshot,
        now: i64,
    ) -> Result<(), ModelError> {
        let offer = &snapshot.offer;
        let locally_originated = offer.offered_by == self.host_org_url;

        let existing = tx
            .get_timeline_for_offer(&self.host_org_url, key, None, None)
            .await?;

        // Clip each rejection to its still-live portion `[now, end)` before
        // it gets re-added below; otherwise `truncate_future_timeline_for_offer`
        // would trim the stored row to `[start, now)` while this recompute
        // re-inserts the original full-bounds copy, leaving two overlapping
        // rows for the same rejection behind on every subsequent recompute.
        let rejection_entries: Vec<_> = existing
            .iter()
            .filter(|e| e.is_rejection)
            .filter(|e| e.end_time_utc > now)
            .cloned()
            .map(|mut e| {
                e.start_time_utc = e.start_time_utc.max(now);
                e
            })
            .collect();
        let rejections: HashSet<String> = rejection_entries
            .iter()
            .map(|e| e.target_organization_url.clone())
            .collect();

        let live_reservation = existing
            .iter()
            .find(|e| e.is_reservation && e.start_time_utc <= now && now < e.end_time_utc)
            .cloned();

        let first_listing_time = existing
            .iter()
            .filter(|e| !e.is_rejection)
            .map(|e| e.start_time_utc)
            .min()
            .unwrap_or(now);

        let corpus_chains = tx
            .get_offer_chains_from_corpora(&self.host_org_url, key)
            .await?;

        let local_accept_chain = self.find_local_accept_chain(offer, locally_originated, &corpus_chains);
        let best_reshare_root = self.find_best_reshare_root(offer, locally_originated, &corpus_chains);

        let mut shared_by: HashSet<String> = HashSet::new();
        shared_by.insert(offer.offered_by.clone());
        shared_by.insert(self.host_org_url.clone());
        if let Some(root) = &best_reshare_root {
            for link in root {
                if let Ok(claims) = decode_claims_unchecked(link) {
                    shared_by.insert(claims.sharing_org_url);
                    shared_by.insert(claims.recipient_org_url);
                }
            }
        }

        let mut listings = self
            .listing_policy
            .get_listings(offer, first_listing_time, now, &rejections, &shared_by);

        // Trim every listing to start no earlier than `now`.
        listings.retain_mut(|listing| {
            match Interval::new(listing.start_time_utc, listing.end_time_utc)
                .and_then(|iv| iv.trim(Bounds { start_at: Some(now), end_at: None }))
            {
                Some(trimmed) => {
                    listing.start_time_utc = trimmed.start;
                    listing.end_time_utc = trimmed.end;
                    true
                }
                None => false,
            }
        });

        // A live reservation only carries forward if its holder still has a
        // listing starting at `now`.
        let reservation_entry = live_reservation.as_ref().and_then(|resv| {
            listings
                .iter()
                .find(|l| l.org_url == resv.target_organization_url || l.org_url == "*")
                .map(|_| opr_storage::TimelineEntry {
                    posting_org_url: key.0.clone(),
                    offer_id: key.1.clone(),
                    snapshot_update_utc: snapshot.last_update_utc,
                    target_organization_url: resv.target_organization_url.clone(),
                    start_time_utc: resv.start_time_utc.max(now),
                    end_time_utc: resv.end_time_utc,
                    is_reservation: true,
                    is_rejection: false,
                    reshare_chain: resv.reshare_chain.clone(),
                })
        });

        let mut new_entries = Vec::new();
        for listing in &listings {
            // Every listing carries a chain the viewer can present upstream
            // as its own ACCEPT/RESHARE credential — extending `bestReshareRoot`
            // (empty when this host is the root) with one new link, even for
            // a locally originated offer (spec.md §8 scenario A).
            let root = best_reshare_root.clone().unwrap_or_default();
            let chain = Some(self.signer.extend_chain(
                &root,
                &offer.offered_by,
                std::slice::from_ref(&offer.id),
                &listing.org_url,
                &listing.scopes,
            )?);

            let mut pieces = vec![Interval::new(listing.start_time_utc, listing.end_time_utc)
                .expect("listings were trimmed to non-empty above")];
            // A live reservation makes the offer unavailable to every org for
            // its duration, not just the holder: other orgs' listings begin
            // after it ends (spec.md §4.7 RESERVE).
            if let Some(resv) = &reservation_entry {
                let resv_iv = Interval::new(resv.start_time_utc, resv.end_time_utc)
                    .expect("reservation interval is non-empty");
                pieces = pieces.into_iter().flat_map(|p| p.subtract(&resv_iv)).collect();
            }

            for piece in pieces {
                new_entries.push(opr_storage::TimelineEntry {
                    posting_org_url: key.0.clone(),
                    offer_id: key.1.clone(),
                    snapshot_update_utc: snapshot.last_update_utc,
                    target_organization_url: listing.org_url.clone(),
                    start_time_utc: piece.start,
                    end_time_utc: piece.end,
                    is_reservation: false,
                    is_rejection: false,
                    reshare_chain: chain.clone(),
                });
            }
        }
        if let Some(resv) = reservation_entry {
            new_entries.push(resv);
        }
        new_entries.extend(rejection_entries);

        // The local listing (this host's own right to accept) runs from
        // `now` to expiration, same as any other listing; for a locally
        // originated offer the host already has the offer directly and
        // needs no timeline entry naming itself.
        if let Some(chain) = &local_accept_chain {
            if !locally_originated {
                new_entries.push(opr_storage::TimelineEntry {
                    posting_org_url: key.0.clone(),
                    offer_id: key.1.clone(),
                    snapshot_update_utc: snapshot.last_update_utc,
                    target_organization_url: self.host_org_url.clone(),
                    start_time_utc: now,
                    end_time_utc: offer.offer_expiration_utc,
                    is_reservation: false,
                    is_rejection: false,
                    reshare_chain: if chain.is_empty() { None } else { Some(chain.clone()) },
                });
            }
        }

        tx.truncate_future_timeline_for_offer(&self.host_org_url, key, now).await?;
        if !new_entries.is_empty() {
            tx.add_timeline_entries(&self.host_org_url, new_entries).await?;
        }

        Ok(())
    }

    /// The shortest chain (by link count) granting this host ACCEPT rights
    /// on `offer`, or `Some(vec![])` when no signed chain is needed (the
    /// offer is locally originated, or a producer shared it directly with no
    /// chain attached at all).
    fn find_local_accept_chain(
        &self,
        offer: &Offer,
        locally_originated: bool,
        corpus_chains: &[Option<ReshareChain>],
    ) -> Option<ReshareChain> {
        if locally_originated {
            return Some(Vec::new());
        }
        let mut candidates: Vec<ReshareChain> = Vec::new();
        for chain_opt in corpus_chains {
            match chain_opt {
                None => candidates.push(Vec::new()),
                Some(chain) => {
                    if self
                        .verifier
                        .verify_chain(
                            chain,
                            &VerifyOptions {
                                initial_issuer: &offer.offered_by,
                                initial_entitlement: &offer.id,
                                final_subject: &self.host_org_url,
                                required_final_scopes: &[Scope::Accept],
                            },
                        )
                        .is_ok()
                    {
                        candidates.push(chain.clone());
                    }
                }
            }
        }
        candidates.into_iter().min_by_key(|c| c.len())
    }

    /// The shortest verified chain ending in RESHARE scope, rooted at this
    /// offer's poster, that this host can extend when producing further
    /// listings. `Some(vec![])` when the offer is locally originated (the
    /// host is the root, nothing to verify).
    fn find_best_reshare_root(
        &self,
        offer: &Offer,
        locally_originated: bool,
        corpus_chains: &[Option<ReshareChain>],
    ) -> Option<ReshareChain> {
        if locally_originated {
            return Some(Vec::new());
        }
        corpus_chains
            .iter()
            .filter_map(|c| c.as_ref())
            .filter(|chain| {
                self.verifier
                    .verify_chain(
                        chain,
                        &VerifyOptions {
                            initial_issuer: &offer.offered_by,
                            initial_entitlement: &offer.id,
                            final_subject: &self.host_org_url,
                            required_final_scopes: &[Scope::Reshare],
                        },
                    )
                    .is_ok()
            })
            .min_by_key(|c| c.len())
            .cloned()
    }

    async fn check_invariants_for_offer(&self, tx: &mut dyn Transaction, key: &OfferKey) -> Result<(), ModelError> {
        if !self.check_invariants {
            return Ok(());
        }
        let entries = tx.get_timeline_for_offer(&self.host_org_url, key, None, None).await?;

        let mut by_target: BTreeMap<&str, Vec<&opr_storage::TimelineEntry>> = BTreeMap::new();
        for e in entries.iter().filter(|e| !e.is_rejection) {
            by_target.entry(e.target_organization_url.as_str()).or_default().push(e);
        }
        for group in by_target.values() {
            let mut sorted = group.clone();
            sorted.sort_by_key(|e| e.start_time_utc);
            for pair in sorted.windows(2) {
                if pair[0].end_time_utc > pair[1].start_time_utc {
                    return Err(ModelError::InternalCheckFailedTimelineOverlap);
                }
            }
        }

        let mut reservations: Vec<&opr_storage::TimelineEntry> =
            entries.iter().filter(|e| e.is_reservation).collect();
        reservations.sort_by_key(|e| e.start_time_utc);
        for pair in reservations.windows(2) {
            if pair[0].end_time_utc > pair[1].start_time_utc {
                return Err(ModelError::InternalCheckFailedMultipleReservations);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------ LIST

    #[tracing::instrument(skip(self))]
    pub async fn list(&self, viewing_org: &str, payload: ListOffersPayload) -> Result<ListResult, ModelError> {
        let now = self.clock.now_utc_ms();
        let mut tx = self.storage.begin().await?;
        let result = self.run_list(tx.as_mut(), viewing_org, payload, now).await;
        match result {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(err) => {
                let _ = tx.abort().await;
                Err(err)
            }
        }
    }

    async fn run_list(
        &self,
        tx: &mut dyn Transaction,
        viewing_org: &str,
        payload: ListOffersPayload,
        now: i64,
    ) -> Result<ListResult, ModelError> {
        match payload {
            ListOffersPayload::Snapshot => {
                let offers = self.collect_visible_offers(tx, viewing_org, now).await?;
                Ok(ListResult::Snapshot { offers })
            }
            ListOffersPayload::Diff { diff_start_timestamp_utc } => {
                let changed = tx
                    .get_changed_offers(&self.host_org_url, viewing_org, diff_start_timestamp_utc, now)
                    .await?;

                let mut old_map = BTreeMap::new();
                let mut new_map = BTreeMap::new();
                for change in &changed {
                    if let Some(v) = &change.old_version {
                        let offer = with_viewer_chain(v);
                        old_map.insert((offer.offered_by.clone(), offer.id.clone()), offer);
                    }
                    if let Some(v) = &change.new_version {
                        let offer = with_viewer_chain(v);
                        new_map.insert((offer.offered_by.clone(), offer.id.clone()), offer);
                    }
                }
                let mut patches = diff_as_offer_patches(&old_map, &new_map);

                let snapshot_at_start = tx
                    .get_offers_at_time(&self.host_org_url, viewing_org, diff_start_timestamp_utc, 0, 1)
                    .await?;
                if snapshot_at_start.is_empty() {
                    patches.insert(0, OfferPatch::Clear);
                }

                Ok(ListResult::Diff { patches })
            }
        }
    }

    async fn collect_visible_offers(
        &self,
        tx: &mut dyn Transaction,
        viewing_org: &str,
        t: i64,
    ) -> Result<Vec<Offer>, ModelError> {
        let mut out = Vec::new();
        let mut skip = 0;
        loop {
            let page = tx
                .get_offers_at_time(&self.host_org_url, viewing_org, t, skip, SCAN_PAGE_SIZE)
                .await?;
            let page_len = page.len();
            out.extend(page.iter().map(with_viewer_chain));
            if page_len < SCAN_PAGE_SIZE {
                break;
            }
            skip += SCAN_PAGE_SIZE;
        }
        Ok(out)
    }

    async fn find_visible(
        &self,
        tx: &mut dyn Transaction,
        viewing_org: &str,
        offer_id: &str,
        posting_org_hint: Option<&str>,
        t: i64,
    ) -> Result<Option<VisibleOffer>, ModelError> {
        let mut skip = 0;
        loop {
            let page = tx
                .get_offers_at_time(&self.host_org_url, viewing_org, t, skip, SCAN_PAGE_SIZE)
                .await?;
            let page_len = page.len();
            if let Some(found) = page.into_iter().find(|v| {
                v.offer.id == offer_id
                    && posting_org_hint.map_or(true, |p| v.timeline_entry.posting_org_url == p)
            }) {
                return Ok(Some(found));
            }
            if page_len < SCAN_PAGE_SIZE {
                return Ok(None);
            }
            skip += SCAN_PAGE_SIZE;
        }
    }

    // ---------------------------------------------------------------- ACCEPT

    #[tracing::instrument(skip(self, payload))]
    pub async fn accept(&self, accepting_org: &str, payload: AcceptOfferPayload) -> Result<(), ModelError> {
        let now = self.clock.now_utc_ms();
        let mut tx = self.storage.begin().await?;
        match self.run_accept(tx.as_mut(), accepting_org, payload, now).await {
            Ok(event) => {
                tx.commit().await?;
                self.bus.fire(&event).await;
                Ok(())
            }
            Err(err) => {
                let _ = tx.abort().await;
                Err(err)
            }
        }
    }

    async fn run_accept(
        &self,
        tx: &mut dyn Transaction,
        accepting_org: &str,
        payload: AcceptOfferPayload,
        now: i64,
    ) -> Result<OfferChange, ModelError> {
        let visible = self
            .find_visible(tx, accepting_org, &payload.offer_id, None, now)
            .await?
            .ok_or(ModelError::NoAvailableOffer)?;

        if let Some(not_newer_than) = payload.if_not_newer_than_timestamp_utc {
            if visible.snapshot_update_utc > not_newer_than {
                return Err(ModelError::OfferHasChanged {
                    current: Box::new(visible.offer),
                });
            }
        }

        let key = (
            visible.timeline_entry.posting_org_url.clone(),
            visible.timeline_entry.offer_id.clone(),
        );

        // The visible entry's own chain (computed and stored at recompute
        // time) is this host's ground truth for who is in the delegation
        // path; a caller-supplied chain is only consulted when the host
        // never recorded one itself.
        let decoded_reshare_chain = visible.reshare_chain.clone().or(payload.decoded_reshare_chain);

        tx.write_accept(
            &self.host_org_url,
            Acceptance {
                posting_org_url: key.0.clone(),
                offer_id: key.1.clone(),
                snapshot_update_utc: visible.snapshot_update_utc,
                accepted_by: accepting_org.to_string(),
                accepted_at_utc: now,
                decoded_reshare_chain,
            },
        )
        .await?;

        tx.truncate_future_timeline_for_offer(&self.host_org_url, &key, now).await?;

        Ok(OfferChange {
            change_type: ChangeType::Accept,
            timestamp_utc: now,
            old_value: None,
            new_value: Some(visible.offer),
        })
    }

    // --------------------------------------------------------------- RESERVE

    #[tracing::instrument(skip(self, payload))]
    pub async fn reserve(&self, org_url: &str, payload: ReserveOfferPayload) -> Result<ReserveResult, ModelError> {
        let now = self.clock.now_utc_ms();
        let mut tx = self.storage.begin().await?;
        match self.run_reserve(tx.as_mut(), org_url, payload, now).await {
            Ok((result, event)) => {
                tx.commit().await?;
                self.bus.fire(&event).await;
                Ok(result)
            }
            Err(err) => {
                let _ = tx.abort().await;
                Err(err)
            }
        }
    }

    async fn run_reserve(
        &self,
        tx: &mut dyn Transaction,
        org_url: &str,
        payload: ReserveOfferPayload,
        now: i64,
    ) -> Result<(ReserveResult, OfferChange), ModelError> {
        let visible = self
            .find_visible(tx, org_url, &payload.offer_id, None, now)
            .await?
            .ok_or(ModelError::NoAvailableOffer)?;

        let key = (
            visible.timeline_entry.posting_org_url.clone(),
            visible.timeline_entry.offer_id.clone(),
        );

        let remaining_ms = visible.timeline_entry.end_time_utc - now;
        let max_allowed_ms = visible
            .offer
            .max_reservation_time_secs
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let requested_ms = payload.requested_reservation_secs.saturating_mul(1000);
        let length_ms = remaining_ms.min(max_allowed_ms).min(requested_ms);

        if length_ms <= 0 {
            return Err(ModelError::NoAvailableOffer);
        }

        let reservation_expiration_utc = now + length_ms;
        let reservation = opr_storage::TimelineEntry {
            posting_org_url: key.0.clone(),
            offer_id: key.1.clone(),
            snapshot_update_utc: visible.snapshot_update_utc,
            target_organization_url: org_url.to_string(),
            start_time_utc: now,
            end_time_utc: reservation_expiration_utc,
            is_reservation: true,
            is_rejection: false,
            reshare_chain: visible.reshare_chain.clone(),
        };

        tx.truncate_future_timeline_for_offer(&self.host_org_url, &key, now).await?;
        tx.add_timeline_entries(&self.host_org_url, vec![reservation]).await?;

        let snapshot = tx
            .get_offer(&self.host_org_url, &key, None)
            .await?
            .ok_or_else(|| ModelError::InternalErrorBadUpdateSet("offer disappeared during reserve".into()))?;
        self.recompute_timeline_for_offer(tx, &key, &snapshot, now).await?;
        self.check_invariants_for_offer(tx, &key).await?;

        Ok((
            ReserveResult {
                reservation_expiration_utc,
            },
            OfferChange {
                change_type: ChangeType::RemoteReserve,
                timestamp_utc: now,
                old_value: None,
                new_value: Some(snapshot.offer),
            },
        ))
    }

    // ---------------------------------------------------------------- REJECT

    #[tracing::instrument(skip(self, payload))]
    pub async fn reject(&self, rejecting_org: &str, payload: RejectOfferPayload) -> Result<(), ModelError> {
        let now = self.clock.now_utc_ms();
        let mut tx = self.storage.begin().await?;
        match self.run_reject(tx.as_mut(), rejecting_org, payload, now).await {
            Ok(event) => {
                tx.commit().await?;
                self.bus.fire(&event).await;
                Ok(())
            }
            Err(err) => {
                let _ = tx.abort().await;
                Err(err)
            }
        }
    }

    async fn run_reject(
        &self,
        tx: &mut dyn Transaction,
        rejecting_org: &str,
        payload: RejectOfferPayload,
        now: i64,
    ) -> Result<OfferChange, ModelError> {
        let offered_by = payload.offered_by_url.as_deref().unwrap_or(&self.host_org_url);

        let visible = self
            .find_visible(tx, rejecting_org, &payload.offer_id, Some(offered_by), now)
            .await?
            .ok_or(ModelError::NoAvailableOffer)?;

        let key = (
            visible.timeline_entry.posting_org_url.clone(),
            visible.timeline_entry.offer_id.clone(),
        );

        let rejection = opr_storage::TimelineEntry {
            posting_org_url: key.0.clone(),
            offer_id: key.1.clone(),
            snapshot_update_utc: visible.snapshot_update_utc,
            target_organization_url: rejecting_org.to_string(),
            start_time_utc: now,
            end_time_utc: visible.offer.offer_expiration_utc,
            is_reservation: false,
            is_rejection: true,
            reshare_chain: None,
        };

        tx.truncate_future_timeline_for_offer(&self.host_org_url, &key, now).await?;
        tx.add_timeline_entries(&self.host_org_url, vec![rejection]).await?;

        let snapshot = tx
            .get_offer(&self.host_org_url, &key, None)
            .await?
            .ok_or_else(|| ModelError::InternalErrorBadUpdateSet("offer disappeared during reject".into()))?;
        self.recompute_timeline_for_offer(tx, &key, &snapshot, now).await?;
        self.check_invariants_for_offer(tx, &key).await?;

        Ok(OfferChange {
            change_type: ChangeType::RemoteReject,
            timestamp_utc: now,
            old_value: None,
            new_value: Some(snapshot.offer),
        })
    }

    // --------------------------------------------------------------- HISTORY

    #[tracing::instrument(skip(self, payload))]
    pub async fn history(&self, viewing_org: &str, payload: HistoryPayload) -> Result<HistoryResult, ModelError> {
        let mut tx = self.storage.begin().await?;
        let result = self.run_history(tx.as_mut(), viewing_org, payload).await;
        match result {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(err) => {
                let _ = tx.abort().await;
                Err(err)
            }
        }
    }

    async fn run_history(
        &self,
        tx: &mut dyn Transaction,
        viewing_org: &str,
        payload: HistoryPayload,
    ) -> Result<HistoryResult, ModelError> {
        let skip = match &payload.page_token {
            Some(token) => crate::types::HistoryPageToken::decode(token)?.skip,
            None => 0,
        };
        let max_results = payload.max_results_per_page.unwrap_or(DEFAULT_HISTORY_PAGE_SIZE);

        let records = tx
            .get_history(&self.host_org_url, viewing_org, payload.history_since_utc, skip, max_results)
            .await?;

        let next_page_token = if records.len() == max_results {
            Some(crate::types::HistoryPageToken { skip: skip + max_results }.encode())
        } else {
            None
        };

        Ok(HistoryResult { records, next_page_token })
    }

    // ------------------------------------------------------- PRODUCER-METADATA

    #[tracing::instrument(skip(self))]
    pub async fn get_or_init_producer_metadata(
        &self,
        producer_id: &str,
    ) -> Result<Option<ProducerMetadata>, ModelError> {
        let now = self.clock.now_utc_ms();
        let mut tx = self.storage.begin().await?;
        match tx
            .get_or_init_offer_producer_metadata(&self.host_org_url, producer_id, now)
            .await
        {
            Ok(meta) => {
                tx.commit().await?;
                Ok(meta)
            }
            Err(err) => {
                let _ = tx.abort().await;
                Err(err.into())
            }
        }
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn write_producer_metadata(&self, meta: ProducerMetadata) -> Result<(), ModelError> {
        let mut tx = self.storage.begin().await?;
        match tx.write_offer_producer_metadata(&self.host_org_url, meta).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.abort().await;
                Err(err.into())
            }
        }
    }
}

/// `LIST` attaches the per-viewer listing's reshare chain onto the
/// returned offer, so the viewer can use it as its own ACCEPT/RESHARE
/// credential (spec.md §8 scenario A). The underlying offer's own
/// `reshareChain` (set by whoever produced it into the corpus) is never
/// what a downstream viewer should present upstream.
fn with_viewer_chain(visible: &VisibleOffer) -> Offer {
    let mut offer = visible.offer.clone();
    offer.reshare_chain = visible.reshare_chain.clone();
    offer
}

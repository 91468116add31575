//! An in-memory [`Storage`] used as the reference implementation under
//! test, and as a lightweight harness for exercising [`opr_model`] without a
//! live Postgres instance.
//!
//! A single [`tokio::sync::Mutex`] guards the whole store. A transaction
//! clones the guarded state at `begin`, mutates its private copy, and
//! writes the copy back only on `commit` — `abort` (or a drop without
//! committing) simply discards it. Because the mutex is held for the
//! transaction's lifetime, this trivially satisfies SERIALIZABLE isolation;
//! it is not intended to scale the way [`crate::pg::PgStorage`] does.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use opr_chain::ReshareChain;
use opr_interval::Interval;
use opr_patch::OfferKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::entities::*;
use crate::{StorageError, Storage, Transaction};

#[derive(Debug, Clone, Default)]
struct HostDb {
    kv: HashMap<String, Vec<u8>>,
    snapshots: HashMap<(String, String, i64), OfferSnapshot>,
    corpora: HashMap<String, FeedCorpus>,
    global_versions: HashMap<(String, String), i64>,
    timelines: Vec<TimelineEntry>,
    acceptances: Vec<Acceptance>,
    producer_meta: HashMap<String, ProducerMetadata>,
    known_orgs: HashMap<String, KnownOfferingOrg>,
}

#[derive(Clone, Default)]
pub struct MemStorage {
    db: Arc<Mutex<HashMap<String, HostDb>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let live = self.db.clone().lock_owned().await;
        let working = live.clone();
        Ok(Box::new(MemTransaction { live, working }))
    }
}

struct MemTransaction {
    live: OwnedMutexGuard<HashMap<String, HostDb>>,
    working: HashMap<String, HostDb>,
}

impl MemTransaction {
    fn host(&mut self, host: &str) -> &mut HostDb {
        self.working.entry(host.to_string()).or_default()
    }
}

fn offer_key_of(e: &TimelineEntry) -> OfferKey {
    e.offer_key()
}

#[async_trait]
impl Transaction for MemTransaction {
    async fn store_value(
        &mut self,
        host: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.host(host).kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn clear_all_values(&mut self, host: &str, key_prefix: &str) -> Result<u64, StorageError> {
        let db = self.host(host);
        let to_remove: Vec<String> = db
            .kv
            .keys()
            .filter(|k| k.starts_with(key_prefix))
            .cloned()
            .collect();
        for k in &to_remove {
            db.kv.remove(k);
        }
        Ok(to_remove.len() as u64)
    }

    async fn get_values(
        &mut self,
        host: &str,
        key_prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let db = self.host(host);
        let mut out: Vec<_> = db
            .kv
            .iter()
            .filter(|(k, _)| k.starts_with(key_prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn insert_or_update_offer_in_corpus(
        &mut self,
        host: &str,
        producer_id: &str,
        snapshot: OfferSnapshot,
        reshare_chain: Option<ReshareChain>,
    ) -> Result<CorpusWriteResult, StorageError> {
        let offer_key: OfferKey = (snapshot.posting_org_url.clone(), snapshot.offer_id.clone());
        let ts = snapshot.last_update_utc;
        let offered_by = snapshot.offer.offered_by.clone();

        let db = self.host(host);
        db.snapshots.entry(snapshot.key()).or_insert_with(|| snapshot.clone());

        let corpus = db.corpora.entry(producer_id.to_string()).or_insert_with(|| FeedCorpus {
            producer_id: producer_id.to_string(),
            recorded_at_utc: ts,
            is_latest: true,
            offers: Vec::new(),
        });
        corpus.recorded_at_utc = ts;
        match corpus
            .offers
            .iter_mut()
            .find(|co| (co.snapshot_key.0.as_str(), co.snapshot_key.1.as_str()) == (offer_key.0.as_str(), offer_key.1.as_str()))
        {
            Some(co) => {
                co.snapshot_key = snapshot.key();
                co.reshare_chain = reshare_chain;
            }
            None => corpus.offers.push(CorpusOffer {
                snapshot_key: snapshot.key(),
                reshare_chain,
            }),
        }

        let prior = db.global_versions.get(&offer_key).copied();
        let result = match prior {
            None => CorpusWriteResult::Add,
            Some(v) if ts > v => CorpusWriteResult::Update,
            _ => CorpusWriteResult::None,
        };
        if prior.map_or(true, |v| ts > v) {
            db.global_versions.insert(offer_key, ts);
        }
        db.known_orgs
            .entry(offered_by.clone())
            .and_modify(|k| k.last_seen_at_utc = k.last_seen_at_utc.max(ts))
            .or_insert(KnownOfferingOrg {
                org_url: offered_by,
                last_seen_at_utc: ts,
            });

        Ok(result)
    }

    async fn delete_offer_in_corpus(
        &mut self,
        host: &str,
        producer_id: &str,
        key: &OfferKey,
    ) -> Result<CorpusWriteResult, StorageError> {
        let db = self.host(host);
        if let Some(corpus) = db.corpora.get_mut(producer_id) {
            corpus
                .offers
                .retain(|co| (co.snapshot_key.0.as_str(), co.snapshot_key.1.as_str()) != (key.0.as_str(), key.1.as_str()));
        }

        // Recompute the global version from whatever other corpus still
        // carries this offer (its most recently recorded one wins).
        let mut best: Option<(String, i64)> = None;
        for corpus in db.corpora.values() {
            if !corpus.is_latest {
                continue;
            }
            for co in &corpus.offers {
                if (co.snapshot_key.0.as_str(), co.snapshot_key.1.as_str()) == (key.0.as_str(), key.1.as_str()) {
                    let ts = co.snapshot_key.2;
                    if best.as_ref().map_or(true, |(_, b)| ts > *b) {
                        best = Some((corpus.producer_id.clone(), ts));
                    }
                }
            }
        }

        let prior = db.global_versions.get(key).copied();
        let result = match (&best, prior) {
            (Some((_, ts)), Some(p)) if *ts == p => CorpusWriteResult::None,
            (Some((_, ts)), _) => {
                db.global_versions.insert(key.clone(), *ts);
                CorpusWriteResult::Update
            }
            (None, _) => {
                db.global_versions.remove(key);
                CorpusWriteResult::Update
            }
        };
        Ok(result)
    }

    async fn get_offer_from_corpus(
        &mut self,
        host: &str,
        producer_id: &str,
        key: &OfferKey,
    ) -> Result<Option<OfferSnapshot>, StorageError> {
        let db = self.host(host);
        let Some(corpus) = db.corpora.get(producer_id) else {
            return Ok(None);
        };
        let Some(co) = corpus
            .offers
            .iter()
            .find(|co| (co.snapshot_key.0.as_str(), co.snapshot_key.1.as_str()) == (key.0.as_str(), key.1.as_str()))
        else {
            return Ok(None);
        };
        Ok(db.snapshots.get(&co.snapshot_key).cloned())
    }

    async fn get_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        update_timestamp_utc: Option<i64>,
    ) -> Result<Option<OfferSnapshot>, StorageError> {
        let db = self.host(host);
        let ts = match update_timestamp_utc {
            Some(ts) => ts,
            None => match db.global_versions.get(key) {
                Some(ts) => *ts,
                None => return Ok(None),
            },
        };
        Ok(db.snapshots.get(&(key.0.clone(), key.1.clone(), ts)).cloned())
    }

    async fn get_offer_sources(
        &mut self,
        host: &str,
        key: &OfferKey,
    ) -> Result<Vec<String>, StorageError> {
        let db = self.host(host);
        let mut out: Vec<String> = db
            .corpora
            .values()
            .filter(|c| c.is_latest)
            .filter(|c| {
                c.offers
                    .iter()
                    .any(|co| (co.snapshot_key.0.as_str(), co.snapshot_key.1.as_str()) == (key.0.as_str(), key.1.as_str()))
            })
            .map(|c| c.producer_id.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    async fn get_offer_chains_from_corpora(
        &mut self,
        host: &str,
        key: &OfferKey,
    ) -> Result<Vec<Option<ReshareChain>>, StorageError> {
        let db = self.host(host);
        Ok(db
            .corpora
            .values()
            .filter(|c| c.is_latest)
            .flat_map(|c| c.offers.iter())
            .filter(|co| (co.snapshot_key.0.as_str(), co.snapshot_key.1.as_str()) == (key.0.as_str(), key.1.as_str()))
            .map(|co| co.reshare_chain.clone())
            .collect())
    }

    async fn get_corpus_offers(
        &mut self,
        host: &str,
        producer_id: &str,
        skip: usize,
    ) -> Result<Vec<OfferSnapshot>, StorageError> {
        let db = self.host(host);
        let Some(corpus) = db.corpora.get(producer_id) else {
            return Ok(Vec::new());
        };
        let mut offers: Vec<OfferSnapshot> = corpus
            .offers
            .iter()
            .filter_map(|co| db.snapshots.get(&co.snapshot_key).cloned())
            .collect();
        offers.sort_by(|a, b| (a.posting_org_url.as_str(), a.offer_id.as_str()).cmp(&(b.posting_org_url.as_str(), b.offer_id.as_str())));
        Ok(offers.into_iter().skip(skip).collect())
    }

    async fn known_offering_orgs(&mut self, host: &str) -> Result<Vec<KnownOfferingOrg>, StorageError> {
        let db = self.host(host);
        let mut out: Vec<_> = db.known_orgs.values().cloned().collect();
        out.sort_by(|a, b| a.org_url.cmp(&b.org_url));
        Ok(out)
    }

    async fn get_timeline_for_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        interval: Option<Interval>,
        target_org: Option<&str>,
    ) -> Result<Vec<TimelineEntry>, StorageError> {
        let db = self.host(host);
        let mut out: Vec<TimelineEntry> = db
            .timelines
            .iter()
            .filter(|e| offer_key_of(e) == *key)
            .filter(|e| target_org.map_or(true, |t| e.target_organization_url == t))
            .filter(|e| {
                interval.map_or(true, |iv| {
                    Interval::new(e.start_time_utc, e.end_time_utc)
                        .and_then(|e_iv| e_iv.intersect(&iv))
                        .is_some()
                })
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (
                a.start_time_utc,
                a.posting_org_url.as_str(),
                a.offer_id.as_str(),
                a.target_organization_url.as_str(),
            )
                .cmp(&(
                    b.start_time_utc,
                    b.posting_org_url.as_str(),
                    b.offer_id.as_str(),
                    b.target_organization_url.as_str(),
                ))
        });
        Ok(out)
    }

    async fn add_timeline_entries(
        &mut self,
        host: &str,
        entries: Vec<TimelineEntry>,
    ) -> Result<(), StorageError> {
        self.host(host).timelines.extend(entries);
        Ok(())
    }

    async fn truncate_future_timeline_for_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        t_star: i64,
    ) -> Result<(), StorageError> {
        let db = self.host(host);
        db.timelines
            .retain(|e| offer_key_of(e) != *key || e.start_time_utc < t_star);
        for e in db
            .timelines
            .iter_mut()
            .filter(|e| offer_key_of(e) == *key && e.end_time_utc > t_star)
        {
            e.end_time_utc = t_star;
        }
        Ok(())
    }

    async fn get_offers_at_time(
        &mut self,
        host: &str,
        viewing_org: &str,
        t: i64,
        skip: usize,
        page_size: usize,
    ) -> Result<Vec<VisibleOffer>, StorageError> {
        let visible = visible_offers_at(self.host(host), viewing_org, t);
        Ok(visible.into_iter().skip(skip).take(page_size).collect())
    }

    async fn get_offer_at_time(
        &mut self,
        host: &str,
        viewing_org: &str,
        key: &OfferKey,
        t: i64,
    ) -> Result<Option<VisibleOffer>, StorageError> {
        Ok(visible_offers_at(self.host(host), viewing_org, t)
            .into_iter()
            .find(|v| (&v.timeline_entry.posting_org_url, &v.timeline_entry.offer_id) == (&key.0, &key.1)))
    }

    async fn get_changed_offers(
        &mut self,
        host: &str,
        viewing_org: &str,
        old_t: i64,
        new_t: i64,
    ) -> Result<Vec<ChangedOffer>, StorageError> {
        let db = self.host(host);
        let old = visible_offers_at(db, viewing_org, old_t);
        let new = visible_offers_at(db, viewing_org, new_t);

        let mut keys: Vec<OfferKey> = old
            .iter()
            .map(|v| (v.timeline_entry.posting_org_url.clone(), v.timeline_entry.offer_id.clone()))
            .chain(new.iter().map(|v| (v.timeline_entry.posting_org_url.clone(), v.timeline_entry.offer_id.clone())))
            .collect();
        keys.sort();
        keys.dedup();

        let mut out = Vec::new();
        for key in keys {
            let o = old
                .iter()
                .find(|v| (&v.timeline_entry.posting_org_url, &v.timeline_entry.offer_id) == (&key.0, &key.1))
                .cloned();
            let n = new
                .iter()
                .find(|v| (&v.timeline_entry.posting_org_url, &v.timeline_entry.offer_id) == (&key.0, &key.1))
                .cloned();
            let differs = match (&o, &n) {
                (Some(o), Some(n)) => o.snapshot_update_utc != n.snapshot_update_utc,
                (None, None) => false,
                _ => true,
            };
            if differs {
                out.push(ChangedOffer {
                    old_version: o,
                    new_version: n,
                });
            }
        }
        Ok(out)
    }

    async fn write_accept(&mut self, host: &str, acceptance: Acceptance) -> Result<(), StorageError> {
        self.host(host).acceptances.push(acceptance);
        Ok(())
    }

    async fn get_history(
        &mut self,
        host: &str,
        viewing_org: &str,
        since_utc: Option<i64>,
        skip: usize,
        max_results: usize,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let db = self.host(host);
        let mut records: Vec<Acceptance> = db
            .acceptances
            .iter()
            .filter(|a| a.viewers(host).iter().any(|v| v == viewing_org))
            .filter(|a| since_utc.map_or(true, |s| a.accepted_at_utc >= s))
            .cloned()
            .collect();
        records.sort_by_key(|a| a.accepted_at_utc);

        let mut out = Vec::new();
        for acceptance in records.into_iter().skip(skip).take(max_results) {
            let key = (acceptance.posting_org_url.clone(), acceptance.offer_id.clone());
            if let Some(snapshot) = db.snapshots.get(&(key.0, key.1, acceptance.snapshot_update_utc)) {
                out.push(HistoryRecord {
                    offer: snapshot.offer.clone(),
                    acceptance,
                });
            }
        }
        Ok(out)
    }

    async fn write_offer_producer_metadata(
        &mut self,
        host: &str,
        meta: ProducerMetadata,
    ) -> Result<(), StorageError> {
        self.host(host)
            .producer_meta
            .insert(meta.organization_url.clone(), meta);
        Ok(())
    }

    async fn get_or_init_offer_producer_metadata(
        &mut self,
        host: &str,
        producer_id: &str,
        now_utc: i64,
    ) -> Result<Option<ProducerMetadata>, StorageError> {
        let db = self.host(host);
        if let Some(meta) = db.producer_meta.get(producer_id) {
            return Ok(Some(meta.clone()));
        }
        db.producer_meta.insert(
            producer_id.to_string(),
            ProducerMetadata {
                organization_url: producer_id.to_string(),
                next_run_timestamp_utc: now_utc,
                last_update_time_utc: None,
            },
        );
        Ok(None)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        *self.live = std::mem::take(&mut self.working);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

/// The visible offer set for `viewing_org` at instant `t`: one entry per
/// offer, picking the explicit-target listing/reservation over a wildcard
/// match (spec.md §9 Open Q3), ignoring rejections.
fn visible_offers_at(db: &HostDb, viewing_org: &str, t: i64) -> Vec<VisibleOffer> {
    let active = |entry: &&TimelineEntry| entry.start_time_utc <= t && t < entry.end_time_utc;
    let matches_viewer =
        |entry: &TimelineEntry| entry.target_organization_url == viewing_org || entry.target_organization_url == "*";

    let rejected: std::collections::HashSet<OfferKey> = db
        .timelines
        .iter()
        .filter(|e| e.is_rejection)
        .filter(active)
        .filter(|e| matches_viewer(e))
        .map(|e| e.offer_key())
        .collect();

    let mut by_offer: HashMap<OfferKey, &TimelineEntry> = HashMap::new();

    for entry in db.timelines.iter().filter(|e| !e.is_rejection).filter(active) {
        if !matches_viewer(entry) {
            continue;
        }
        let key = entry.offer_key();
        if rejected.contains(&key) {
            continue;
        }
        match by_offer.get(&key) {
            None => {
                by_offer.insert(key, entry);
            }
            Some(existing) if existing.target_organization_url == "*" && entry.target_organization_url != "*" => {
                by_offer.insert(key, entry);
            }
            _ => {}
        }
    }

    let mut out: Vec<VisibleOffer> = by_offer
        .into_values()
        .filter_map(|entry| {
            db.snapshots
                .get(&(entry.posting_org_url.clone(), entry.offer_id.clone(), entry.snapshot_update_utc))
                .map(|snapshot| VisibleOffer {
                    offer: snapshot.offer.clone(),
                    snapshot_update_utc: entry.snapshot_update_utc,
                    reshare_chain: entry.reshare_chain.clone(),
                    timeline_entry: entry.clone(),
                })
        })
        .collect();
    out.sort_by(|a, b| {
        (&a.timeline_entry.posting_org_url, &a.timeline_entry.offer_id)
            .cmp(&(&b.timeline_entry.posting_org_url, &b.timeline_entry.offer_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use opr_patch::Offer;

    const HOST: &str = "https://host.example";

    fn offer(posting_org: &str, id: &str, updated: i64) -> Offer {
        Offer {
            id: id.to_string(),
            offered_by: posting_org.to_string(),
            offer_creation_utc: updated,
            offer_update_utc: Some(updated),
            offer_expiration_utc: updated + 1_000_000,
            max_reservation_time_secs: None,
            reshare_chain: None,
            extra: Default::default(),
        }
    }

    fn snapshot(posting_org: &str, id: &str, updated: i64) -> OfferSnapshot {
        let o = offer(posting_org, id, updated);
        OfferSnapshot {
            posting_org_url: posting_org.to_string(),
            offer_id: id.to_string(),
            last_update_utc: updated,
            expiration_utc: o.offer_expiration_utc,
            offer: o,
        }
    }

    fn listing(posting_org: &str, id: &str, updated: i64, target: &str, start: i64, end: i64) -> TimelineEntry {
        TimelineEntry {
            posting_org_url: posting_org.to_string(),
            offer_id: id.to_string(),
            snapshot_update_utc: updated,
            target_organization_url: target.to_string(),
            start_time_utc: start,
            end_time_utc: end,
            is_reservation: false,
            is_rejection: false,
            reshare_chain: None,
        }
    }

    #[tokio::test]
    async fn kv_round_trip_and_prefix_clear() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();
        tx.store_value(HOST, "a/1", b"one".to_vec()).await.unwrap();
        tx.store_value(HOST, "a/2", b"two".to_vec()).await.unwrap();
        tx.store_value(HOST, "b/1", b"three".to_vec()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        let values = tx.get_values(HOST, "a/").await.unwrap();
        assert_eq!(
            values,
            vec![("a/1".to_string(), b"one".to_vec()), ("a/2".to_string(), b"two".to_vec())]
        );
        let cleared = tx.clear_all_values(HOST, "a/").await.unwrap();
        assert_eq!(cleared, 2);
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        assert!(tx.get_values(HOST, "a/").await.unwrap().is_empty());
        assert_eq!(tx.get_values(HOST, "b/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_no_trace() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();
        tx.store_value(HOST, "k", b"v".to_vec()).await.unwrap();
        tx.abort().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        assert!(tx.get_values(HOST, "k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_or_update_offer_reports_add_update_none() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();

        let result = tx
            .insert_or_update_offer_in_corpus(HOST, "producer-a", snapshot("org-a", "offer-1", 100), None)
            .await
            .unwrap();
        assert_eq!(result, CorpusWriteResult::Add);

        let result = tx
            .insert_or_update_offer_in_corpus(HOST, "producer-a", snapshot("org-a", "offer-1", 100), None)
            .await
            .unwrap();
        assert_eq!(result, CorpusWriteResult::None);

        let result = tx
            .insert_or_update_offer_in_corpus(HOST, "producer-a", snapshot("org-a", "offer-1", 200), None)
            .await
            .unwrap();
        assert_eq!(result, CorpusWriteResult::Update);

        let fetched = tx
            .get_offer(HOST, &("org-a".to_string(), "offer-1".to_string()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.last_update_utc, 200);

        let orgs = tx.known_offering_orgs(HOST).await.unwrap();
        assert_eq!(orgs.len(), 1);
        assert_eq!(orgs[0].org_url, "org-a");
        assert_eq!(orgs[0].last_seen_at_utc, 200);
    }

    #[tokio::test]
    async fn delete_offer_falls_back_to_other_corpus() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();
        let key = ("org-a".to_string(), "offer-1".to_string());

        tx.insert_or_update_offer_in_corpus(HOST, "producer-a", snapshot("org-a", "offer-1", 100), None)
            .await
            .unwrap();
        tx.insert_or_update_offer_in_corpus(HOST, "producer-b", snapshot("org-a", "offer-1", 50), None)
            .await
            .unwrap();

        let result = tx.delete_offer_in_corpus(HOST, "producer-a", &key).await.unwrap();
        assert_eq!(result, CorpusWriteResult::Update);
        let fetched = tx.get_offer(HOST, &key, None).await.unwrap().unwrap();
        assert_eq!(fetched.last_update_utc, 50);

        let result = tx.delete_offer_in_corpus(HOST, "producer-b", &key).await.unwrap();
        assert_eq!(result, CorpusWriteResult::Update);
        assert!(tx.get_offer(HOST, &key, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn timeline_truncate_clips_and_drops() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();
        let key = ("org-a".to_string(), "offer-1".to_string());

        tx.add_timeline_entries(
            HOST,
            vec![
                listing("org-a", "offer-1", 100, "*", 0, 500),
                listing("org-a", "offer-1", 100, "*", 600, 900),
            ],
        )
        .await
        .unwrap();

        tx.truncate_future_timeline_for_offer(HOST, &key, 400).await.unwrap();
        let remaining = tx.get_timeline_for_offer(HOST, &key, None, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].end_time_utc, 400);
    }

    #[tokio::test]
    async fn explicit_target_wins_over_wildcard() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();

        tx.insert_or_update_offer_in_corpus(HOST, "producer-a", snapshot("org-a", "offer-1", 100), None)
            .await
            .unwrap();
        tx.add_timeline_entries(
            HOST,
            vec![
                listing("org-a", "offer-1", 100, "*", 0, 1000),
                listing("org-a", "offer-1", 100, "org-b", 0, 1000),
            ],
        )
        .await
        .unwrap();

        let visible = tx.get_offers_at_time(HOST, "org-b", 50, 0, 10).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].timeline_entry.target_organization_url, "org-b");

        let visible = tx.get_offers_at_time(HOST, "org-c", 50, 0, 10).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].timeline_entry.target_organization_url, "*");
    }

    #[tokio::test]
    async fn rejection_hides_offer() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();

        tx.insert_or_update_offer_in_corpus(HOST, "producer-a", snapshot("org-a", "offer-1", 100), None)
            .await
            .unwrap();
        tx.add_timeline_entries(
            HOST,
            vec![
                listing("org-a", "offer-1", 100, "org-b", 0, 1000),
                TimelineEntry {
                    is_rejection: true,
                    ..listing("org-a", "offer-1", 100, "org-b", 0, 1000)
                },
            ],
        )
        .await
        .unwrap();

        let visible = tx.get_offers_at_time(HOST, "org-b", 50, 0, 10).await.unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn changed_offers_reports_add_and_disappear() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();

        tx.insert_or_update_offer_in_corpus(HOST, "producer-a", snapshot("org-a", "offer-1", 100), None)
            .await
            .unwrap();
        tx.add_timeline_entries(HOST, vec![listing("org-a", "offer-1", 100, "org-b", 200, 400)])
            .await
            .unwrap();

        let changed = tx.get_changed_offers(HOST, "org-b", 100, 300).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert!(changed[0].old_version.is_none());
        assert!(changed[0].new_version.is_some());

        let changed = tx.get_changed_offers(HOST, "org-b", 300, 500).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert!(changed[0].old_version.is_some());
        assert!(changed[0].new_version.is_none());
    }

    #[tokio::test]
    async fn history_respects_viewers() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();

        tx.insert_or_update_offer_in_corpus(HOST, "producer-a", snapshot("org-a", "offer-1", 100), None)
            .await
            .unwrap();
        tx.write_accept(
            HOST,
            Acceptance {
                posting_org_url: "org-a".to_string(),
                offer_id: "offer-1".to_string(),
                snapshot_update_utc: 100,
                accepted_by: "org-b".to_string(),
                accepted_at_utc: 150,
                decoded_reshare_chain: None,
            },
        )
        .await
        .unwrap();

        let history = tx.get_history(HOST, "org-b", None, 0, 10).await.unwrap();
        assert_eq!(history.len(), 1);

        let history = tx.get_history(HOST, "org-c", None, 0, 10).await.unwrap();
        assert!(history.is_empty());

        let history = tx.get_history(HOST, HOST, None, 0, 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn producer_metadata_inits_once() {
        let storage = MemStorage::new();
        let mut tx = storage.begin().await.unwrap();

        let first = tx
            .get_or_init_offer_producer_metadata(HOST, "producer-a", 1000)
            .await
            .unwrap();
        assert!(first.is_none());

        let second = tx
            .get_or_init_offer_producer_metadata(HOST, "producer-a", 2000)
            .await
            .unwrap();
        assert_eq!(second.unwrap().next_run_timestamp_utc, 1000);
    }
}

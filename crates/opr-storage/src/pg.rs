//! A Postgres-backed [`Storage`], run at `SERIALIZABLE` isolation per
//! spec.md §4.6/§5. Queries are built and bound at runtime (not via
//! `sqlx::query!`/`query_as!`) since this workspace has no reachable
//! Postgres instance to generate `sqlx`'s offline query cache against — see
//! DESIGN.md.

use async_trait::async_trait;
use opr_chain::ReshareChain;
use opr_interval::Interval;
use opr_patch::{Offer, OfferKey};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row};

use crate::entities::*;
use crate::{Storage, StorageError, Transaction};

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded migrations. Typically called once at startup by
    /// the (out-of-scope) configuration layer.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Invariant(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    #[tracing::instrument(skip(self))]
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn offer_to_json(offer: &Offer) -> Result<serde_json::Value, StorageError> {
    serde_json::to_value(offer).map_err(|e| StorageError::Invariant(e.to_string()))
}

fn json_to_offer(v: serde_json::Value) -> Result<Offer, StorageError> {
    serde_json::from_value(v).map_err(|e| StorageError::Invariant(e.to_string()))
}

fn chain_to_json(chain: &Option<ReshareChain>) -> serde_json::Value {
    serde_json::to_value(chain).unwrap_or(serde_json::Value::Null)
}

fn json_to_chain(v: Option<serde_json::Value>) -> Option<ReshareChain> {
    v.and_then(|v| serde_json::from_value(v).ok())
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn store_value(
        &mut self,
        host: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "insert into kv_store (host_org_url, key, value) values ($1, $2, $3)
             on conflict (host_org_url, key) do update set value = excluded.value",
        )
        .bind(host)
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn clear_all_values(&mut self, host: &str, key_prefix: &str) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "delete from kv_store where host_org_url = $1 and key like $2 || '%'",
        )
        .bind(host)
        .bind(key_prefix)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_values(
        &mut self,
        host: &str,
        key_prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let rows = sqlx::query(
            "select key, value from kv_store where host_org_url = $1 and key like $2 || '%' order by key",
        )
        .bind(host)
        .bind(key_prefix)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }

    async fn insert_or_update_offer_in_corpus(
        &mut self,
        host: &str,
        producer_id: &str,
        snapshot: OfferSnapshot,
        reshare_chain: Option<ReshareChain>,
    ) -> Result<CorpusWriteResult, StorageError> {
        let offer_json = offer_to_json(&snapshot.offer)?;
        sqlx::query(
            "insert into offer_snapshot
                (host_org_url, posting_org_url, offer_id, last_update_utc, expiration_utc, offer_json)
             values ($1, $2, $3, $4, $5, $6)
             on conflict (host_org_url, posting_org_url, offer_id, last_update_utc) do nothing",
        )
        .bind(host)
        .bind(&snapshot.posting_org_url)
        .bind(&snapshot.offer_id)
        .bind(snapshot.last_update_utc)
        .bind(snapshot.expiration_utc)
        .bind(&offer_json)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            "update corpus set is_latest = false
             where host_org_url = $1 and producer_id = $2 and recorded_at_utc <> $3",
        )
        .bind(host)
        .bind(producer_id)
        .bind(snapshot.last_update_utc)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            "insert into corpus (host_org_url, producer_id, recorded_at_utc, is_latest)
             values ($1, $2, $3, true)
             on conflict (host_org_url, producer_id, recorded_at_utc) do update set is_latest = true",
        )
        .bind(host)
        .bind(producer_id)
        .bind(snapshot.last_update_utc)
        .execute(&mut *self.tx)
        .await?;

        let chain_json = chain_to_json(&reshare_chain);
        sqlx::query(
            "insert into corpus_offer
                (host_org_url, producer_id, recorded_at_utc, posting_org_url, offer_id, last_update_utc, reshare_chain)
             values ($1, $2, $3, $4, $5, $6, $7)
             on conflict (host_org_url, producer_id, recorded_at_utc, posting_org_url, offer_id)
             do update set last_update_utc = excluded.last_update_utc, reshare_chain = excluded.reshare_chain",
        )
        .bind(host)
        .bind(producer_id)
        .bind(snapshot.last_update_utc)
        .bind(&snapshot.posting_org_url)
        .bind(&snapshot.offer_id)
        .bind(snapshot.last_update_utc)
        .bind(&chain_json)
        .execute(&mut *self.tx)
        .await?;

        let prior: Option<i64> = sqlx::query(
            "select last_update_utc from global_offer_version
             where host_org_url = $1 and posting_org_url = $2 and offer_id = $3",
        )
        .bind(host)
        .bind(&snapshot.posting_org_url)
        .bind(&snapshot.offer_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(|r| r.get::<i64, _>("last_update_utc"));

        let result = match prior {
            None => CorpusWriteResult::Add,
            Some(v) if snapshot.last_update_utc > v => CorpusWriteResult::Update,
            _ => CorpusWriteResult::None,
        };

        sqlx::query(
            "insert into global_offer_version (host_org_url, posting_org_url, offer_id, last_update_utc)
             values ($1, $2, $3, $4)
             on conflict (host_org_url, posting_org_url, offer_id)
             do update set last_update_utc = greatest(global_offer_version.last_update_utc, excluded.last_update_utc)",
        )
        .bind(host)
        .bind(&snapshot.posting_org_url)
        .bind(&snapshot.offer_id)
        .bind(snapshot.last_update_utc)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            "insert into known_offering_org (host_org_url, org_url, last_seen_at_utc)
             values ($1, $2, $3)
             on conflict (host_org_url, org_url)
             do update set last_seen_at_utc = greatest(known_offering_org.last_seen_at_utc, excluded.last_seen_at_utc)",
        )
        .bind(host)
        .bind(&snapshot.offer.offered_by)
        .bind(snapshot.last_update_utc)
        .execute(&mut *self.tx)
        .await?;

        Ok(result)
    }

    async fn delete_offer_in_corpus(
        &mut self,
        host: &str,
        producer_id: &str,
        key: &OfferKey,
    ) -> Result<CorpusWriteResult, StorageError> {
        sqlx::query(
            "delete from corpus_offer
             where host_org_url = $1 and producer_id = $2 and posting_org_url = $3 and offer_id = $4",
        )
        .bind(host)
        .bind(producer_id)
        .bind(&key.0)
        .bind(&key.1)
        .execute(&mut *self.tx)
        .await?;

        let remaining: Option<i64> = sqlx::query(
            "select co.last_update_utc from corpus_offer co
             join corpus c on c.host_org_url = co.host_org_url
                 and c.producer_id = co.producer_id
                 and c.recorded_at_utc = co.recorded_at_utc
             where co.host_org_url = $1 and co.posting_org_url = $2 and co.offer_id = $3
                 and c.is_latest
             order by co.last_update_utc desc
             limit 1",
        )
        .bind(host)
        .bind(&key.0)
        .bind(&key.1)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(|r| r.get::<i64, _>("last_update_utc"));

        let prior: Option<i64> = sqlx::query(
            "select last_update_utc from global_offer_version
             where host_org_url = $1 and posting_org_url = $2 and offer_id = $3",
        )
        .bind(host)
        .bind(&key.0)
        .bind(&key.1)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(|r| r.get::<i64, _>("last_update_utc"));

        let result = match (remaining, prior) {
            (Some(ts), Some(p)) if ts == p => CorpusWriteResult::None,
            (Some(ts), _) => {
                sqlx::query(
                    "update global_offer_version set last_update_utc = $4
                     where host_org_url = $1 and posting_org_url = $2 and offer_id = $3",
                )
                .bind(host)
                .bind(&key.0)
                .bind(&key.1)
                .bind(ts)
                .execute(&mut *self.tx)
                .await?;
                CorpusWriteResult::Update
            }
            (None, _) => {
                sqlx::query(
                    "delete from global_offer_version
                     where host_org_url = $1 and posting_org_url = $2 and offer_id = $3",
                )
                .bind(host)
                .bind(&key.0)
                .bind(&key.1)
                .execute(&mut *self.tx)
                .await?;
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
        let row = sqlx::query(
            "select s.posting_org_url, s.offer_id, s.last_update_utc, s.expiration_utc, s.offer_json
             from corpus_offer co
             join corpus c on c.host_org_url = co.host_org_url
                 and c.producer_id = co.producer_id and c.recorded_at_utc = co.recorded_at_utc
             join offer_snapshot s on s.host_org_url = co.host_org_url
                 and s.posting_org_url = co.posting_org_url and s.offer_id = co.offer_id
                 and s.last_update_utc = co.last_update_utc
             where co.host_org_url = $1 and co.producer_id = $2
                 and co.posting_org_url = $3 and co.offer_id = $4 and c.is_latest",
        )
        .bind(host)
        .bind(producer_id)
        .bind(&key.0)
        .bind(&key.1)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(row_to_snapshot).transpose()
    }

    async fn get_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        update_timestamp_utc: Option<i64>,
    ) -> Result<Option<OfferSnapshot>, StorageError> {
        let row = match update_timestamp_utc {
            Some(ts) => {
                sqlx::query(
                    "select posting_org_url, offer_id, last_update_utc, expiration_utc, offer_json
                     from offer_snapshot
                     where host_org_url = $1 and posting_org_url = $2 and offer_id = $3 and last_update_utc = $4",
                )
                .bind(host)
                .bind(&key.0)
                .bind(&key.1)
                .bind(ts)
                .fetch_optional(&mut *self.tx)
                .await?
            }
            None => {
                sqlx::query(
                    "select s.posting_org_url, s.offer_id, s.last_update_utc, s.expiration_utc, s.offer_json
                     from global_offer_version v
                     join offer_snapshot s on s.host_org_url = v.host_org_url
                         and s.posting_org_url = v.posting_org_url and s.offer_id = v.offer_id
                         and s.last_update_utc = v.last_update_utc
                     where v.host_org_url = $1 and v.posting_org_url = $2 and v.offer_id = $3",
                )
                .bind(host)
                .bind(&key.0)
                .bind(&key.1)
                .fetch_optional(&mut *self.tx)
                .await?
            }
        };
        row.map(row_to_snapshot).transpose()
    }

    async fn get_offer_sources(
        &mut self,
        host: &str,
        key: &OfferKey,
    ) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "select distinct co.producer_id from corpus_offer co
             join corpus c on c.host_org_url = co.host_org_url
                 and c.producer_id = co.producer_id and c.recorded_at_utc = co.recorded_at_utc
             where co.host_org_url = $1 and co.posting_org_url = $2 and co.offer_id = $3 and c.is_latest
             order by co.producer_id",
        )
        .bind(host)
        .bind(&key.0)
        .bind(&key.1)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("producer_id")).collect())
    }

    async fn get_offer_chains_from_corpora(
        &mut self,
        host: &str,
        key: &OfferKey,
    ) -> Result<Vec<Option<ReshareChain>>, StorageError> {
        let rows = sqlx::query(
            "select co.reshare_chain from corpus_offer co
             join corpus c on c.host_org_url = co.host_org_url
                 and c.producer_id = co.producer_id and c.recorded_at_utc = co.recorded_at_utc
             where co.host_org_url = $1 and co.posting_org_url = $2 and co.offer_id = $3 and c.is_latest",
        )
        .bind(host)
        .bind(&key.0)
        .bind(&key.1)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| json_to_chain(r.get::<Option<serde_json::Value>, _>("reshare_chain")))
            .collect())
    }

    async fn get_corpus_offers(
        &mut self,
        host: &str,
        producer_id: &str,
        skip: usize,
    ) -> Result<Vec<OfferSnapshot>, StorageError> {
        let rows = sqlx::query(
            "select s.posting_org_url, s.offer_id, s.last_update_utc, s.expiration_utc, s.offer_json
             from corpus_offer co
             join corpus c on c.host_org_url = co.host_org_url
                 and c.producer_id = co.producer_id and c.recorded_at_utc = co.recorded_at_utc
             join offer_snapshot s on s.host_org_url = co.host_org_url
                 and s.posting_org_url = co.posting_org_url and s.offer_id = co.offer_id
                 and s.last_update_utc = co.last_update_utc
             where co.host_org_url = $1 and co.producer_id = $2 and c.is_latest
             order by s.posting_org_url, s.offer_id
             offset $3",
        )
        .bind(host)
        .bind(producer_id)
        .bind(skip as i64)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(row_to_snapshot).collect()
    }

    async fn known_offering_orgs(&mut self, host: &str) -> Result<Vec<KnownOfferingOrg>, StorageError> {
        let rows = sqlx::query(
            "select org_url, last_seen_at_utc from known_offering_org
             where host_org_url = $1 order by org_url",
        )
        .bind(host)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| KnownOfferingOrg {
                org_url: r.get("org_url"),
                last_seen_at_utc: r.get("last_seen_at_utc"),
            })
            .collect())
    }

    async fn get_timeline_for_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        interval: Option<Interval>,
        target_org: Option<&str>,
    ) -> Result<Vec<TimelineEntry>, StorageError> {
        let rows = sqlx::query(
            "select posting_org_url, offer_id, snapshot_update_utc, target_organization_url,
                    start_time_utc, end_time_utc, is_reservation, is_rejection, reshare_chain
             from timeline_entry
             where host_org_url = $1 and posting_org_url = $2 and offer_id = $3
                 and ($4::text is null or target_organization_url = $4)
                 and ($5::bigint is null or start_time_utc < $5)
                 and ($6::bigint is null or end_time_utc > $6)
             order by start_time_utc, posting_org_url, offer_id, target_organization_url",
        )
        .bind(host)
        .bind(&key.0)
        .bind(&key.1)
        .bind(target_org)
        .bind(interval.map(|iv| iv.end))
        .bind(interval.map(|iv| iv.start))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(row_to_timeline_entry).collect())
    }

    async fn add_timeline_entries(
        &mut self,
        host: &str,
        entries: Vec<TimelineEntry>,
    ) -> Result<(), StorageError> {
        for e in entries {
            sqlx::query(
                "insert into timeline_entry
                    (host_org_url, posting_org_url, offer_id, snapshot_update_utc,
                     target_organization_url, start_time_utc, end_time_utc,
                     is_reservation, is_rejection, reshare_chain)
                 values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(host)
            .bind(&e.posting_org_url)
            .bind(&e.offer_id)
            .bind(e.snapshot_update_utc)
            .bind(&e.target_organization_url)
            .bind(e.start_time_utc)
            .bind(e.end_time_utc)
            .bind(e.is_reservation)
            .bind(e.is_rejection)
            .bind(chain_to_json(&e.reshare_chain))
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn truncate_future_timeline_for_offer(
        &mut self,
        host: &str,
        key: &OfferKey,
        t_star: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "delete from timeline_entry
             where host_org_url = $1 and posting_org_url = $2 and offer_id = $3 and start_time_utc >= $4",
        )
        .bind(host)
        .bind(&key.0)
        .bind(&key.1)
        .bind(t_star)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            "update timeline_entry set end_time_utc = $4
             where host_org_url = $1 and posting_org_url = $2 and offer_id = $3 and end_time_utc > $4",
        )
        .bind(host)
        .bind(&key.0)
        .bind(&key.1)
        .bind(t_star)
        .execute(&mut *self.tx)
        .await?;
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
        let rows = sqlx::query(
            // explicit-beats-wildcard: order candidates so an exact
            // target match sorts before '*', then pick the first per offer.
            "select distinct on (te.posting_org_url, te.offer_id)
                    te.posting_org_url, te.offer_id, te.snapshot_update_utc, te.target_organization_url,
                    te.start_time_utc, te.end_time_utc, te.is_reservation, te.is_rejection, te.reshare_chain,
                    s.offer_json
             from timeline_entry te
             join offer_snapshot s on s.host_org_url = te.host_org_url
                 and s.posting_org_url = te.posting_org_url and s.offer_id = te.offer_id
                 and s.last_update_utc = te.snapshot_update_utc
             where te.host_org_url = $1
                 and not te.is_rejection
                 and te.start_time_utc <= $2 and $2 < te.end_time_utc
                 and (te.target_organization_url = $3 or te.target_organization_url = '*')
                 and not exists (
                     select 1 from timeline_entry r
                     where r.host_org_url = te.host_org_url
                         and r.posting_org_url = te.posting_org_url and r.offer_id = te.offer_id
                         and r.is_rejection
                         and r.start_time_utc <= $2 and $2 < r.end_time_utc
                         and (r.target_organization_url = $3 or r.target_organization_url = '*')
                 )
             order by te.posting_org_url, te.offer_id,
                      (te.target_organization_url <> '*') desc
             offset $4 limit $5",
        )
        .bind(host)
        .bind(t)
        .bind(viewing_org)
        .bind(skip as i64)
        .bind(page_size as i64)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(row_to_visible_offer).collect()
    }

    async fn get_offer_at_time(
        &mut self,
        host: &str,
        viewing_org: &str,
        key: &OfferKey,
        t: i64,
    ) -> Result<Option<VisibleOffer>, StorageError> {
        let row = sqlx::query(
            "select te.posting_org_url, te.offer_id, te.snapshot_update_utc, te.target_organization_url,
                    te.start_time_utc, te.end_time_utc, te.is_reservation, te.is_rejection, te.reshare_chain,
                    s.offer_json
             from timeline_entry te
             join offer_snapshot s on s.host_org_url = te.host_org_url
                 and s.posting_org_url = te.posting_org_url and s.offer_id = te.offer_id
                 and s.last_update_utc = te.snapshot_update_utc
             where te.host_org_url = $1 and te.posting_org_url = $2 and te.offer_id = $3
                 and not te.is_rejection
                 and te.start_time_utc <= $4 and $4 < te.end_time_utc
                 and (te.target_organization_url = $5 or te.target_organization_url = '*')
                 and not exists (
                     select 1 from timeline_entry r
                     where r.host_org_url = te.host_org_url
                         and r.posting_org_url = te.posting_org_url and r.offer_id = te.offer_id
                         and r.is_rejection
                         and r.start_time_utc <= $4 and $4 < r.end_time_utc
                         and (r.target_organization_url = $5 or r.target_organization_url = '*')
                 )
             order by (te.target_organization_url <> '*') desc
             limit 1",
        )
        .bind(host)
        .bind(&key.0)
        .bind(&key.1)
        .bind(t)
        .bind(viewing_org)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(row_to_visible_offer).transpose()
    }

    async fn get_changed_offers(
        &mut self,
        host: &str,
        viewing_org: &str,
        old_t: i64,
        new_t: i64,
    ) -> Result<Vec<ChangedOffer>, StorageError> {
        let old = self.get_offers_at_time(host, viewing_org, old_t, 0, usize::MAX).await?;
        let new = self.get_offers_at_time(host, viewing_org, new_t, 0, usize::MAX).await?;

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
                out.push(ChangedOffer { old_version: o, new_version: n });
            }
        }
        Ok(out)
    }

    async fn write_accept(&mut self, host: &str, acceptance: Acceptance) -> Result<(), StorageError> {
        sqlx::query(
            "insert into acceptance
                (host_org_url, posting_org_url, offer_id, snapshot_update_utc, accepted_by, accepted_at_utc, decoded_reshare_chain)
             values ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(host)
        .bind(&acceptance.posting_org_url)
        .bind(&acceptance.offer_id)
        .bind(acceptance.snapshot_update_utc)
        .bind(&acceptance.accepted_by)
        .bind(acceptance.accepted_at_utc)
        .bind(chain_to_json(&acceptance.decoded_reshare_chain))
        .execute(&mut *self.tx)
        .await?;
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
        // Visibility (acceptor OR host OR a decoded_reshare_chain
        // sharingOrgUrl, spec.md §8 property 7's third clause) can only be
        // decided after decoding the chain, so it is not expressed in this
        // `where` clause; every row for the host is fetched and `skip`/
        // `max_results` are applied in Rust after filtering, matching
        // `MemStorage::get_history`.
        let rows = sqlx::query(
            "select a.posting_org_url, a.offer_id, a.snapshot_update_utc, a.accepted_by, a.accepted_at_utc,
                    a.decoded_reshare_chain, s.offer_json
             from acceptance a
             join offer_snapshot s on s.host_org_url = a.host_org_url
                 and s.posting_org_url = a.posting_org_url and s.offer_id = a.offer_id
                 and s.last_update_utc = a.snapshot_update_utc
             where a.host_org_url = $1
                 and ($2::bigint is null or a.accepted_at_utc >= $2)
             order by a.accepted_at_utc",
        )
        .bind(host)
        .bind(since_utc)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut visible = Vec::new();
        for row in rows {
            let decoded_reshare_chain: Option<serde_json::Value> = row.get("decoded_reshare_chain");
            let chain = json_to_chain(decoded_reshare_chain);
            let accepted_by: String = row.get("accepted_by");
            let is_visible = accepted_by == viewing_org
                || host == viewing_org
                || chain.as_ref().is_some_and(|c| {
                    c.iter().any(|link| {
                        opr_chain::decode_claims_unchecked(link)
                            .map(|claims| claims.sharing_org_url == viewing_org)
                            .unwrap_or(false)
                    })
                });
            if !is_visible {
                continue;
            }
            let acceptance = Acceptance {
                posting_org_url: row.get("posting_org_url"),
                offer_id: row.get("offer_id"),
                snapshot_update_utc: row.get("snapshot_update_utc"),
                accepted_by,
                accepted_at_utc: row.get("accepted_at_utc"),
                decoded_reshare_chain: chain,
            };
            let offer = json_to_offer(row.get("offer_json"))?;
            visible.push(HistoryRecord { offer, acceptance });
        }
        Ok(visible.into_iter().skip(skip).take(max_results).collect())
    }

    async fn write_offer_producer_metadata(
        &mut self,
        host: &str,
        meta: ProducerMetadata,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "insert into producer_metadata (host_org_url, organization_url, next_run_timestamp_utc, last_update_time_utc)
             values ($1, $2, $3, $4)
             on conflict (host_org_url, organization_url)
             do update set next_run_timestamp_utc = excluded.next_run_timestamp_utc,
                           last_update_time_utc = excluded.last_update_time_utc",
        )
        .bind(host)
        .bind(&meta.organization_url)
        .bind(meta.next_run_timestamp_utc)
        .bind(meta.last_update_time_utc)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_or_init_offer_producer_metadata(
        &mut self,
        host: &str,
        producer_id: &str,
        now_utc: i64,
    ) -> Result<Option<ProducerMetadata>, StorageError> {
        if let Some(row) = sqlx::query(
            "select organization_url, next_run_timestamp_utc, last_update_time_utc
             from producer_metadata where host_org_url = $1 and organization_url = $2",
        )
        .bind(host)
        .bind(producer_id)
        .fetch_optional(&mut *self.tx)
        .await?
        {
            return Ok(Some(ProducerMetadata {
                organization_url: row.get("organization_url"),
                next_run_timestamp_utc: row.get("next_run_timestamp_utc"),
                last_update_time_utc: row.get("last_update_time_utc"),
            }));
        }

        sqlx::query(
            "insert into producer_metadata (host_org_url, organization_url, next_run_timestamp_utc, last_update_time_utc)
             values ($1, $2, $3, null)",
        )
        .bind(host)
        .bind(producer_id)
        .bind(now_utc)
        .execute(&mut *self.tx)
        .await?;
        Ok(None)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn row_to_snapshot(row: sqlx::postgres::PgRow) -> Result<OfferSnapshot, StorageError> {
    let offer_json: serde_json::Value = row.get("offer_json");
    Ok(OfferSnapshot {
        posting_org_url: row.get("posting_org_url"),
        offer_id: row.get("offer_id"),
        last_update_utc: row.get("last_update_utc"),
        expiration_utc: row.get("expiration_utc"),
        offer: json_to_offer(offer_json)?,
    })
}

fn row_to_timeline_entry(row: sqlx::postgres::PgRow) -> TimelineEntry {
    let reshare_chain: Option<serde_json::Value> = row.get("reshare_chain");
    TimelineEntry {
        posting_org_url: row.get("posting_org_url"),
        offer_id: row.get("offer_id"),
        snapshot_update_utc: row.get("snapshot_update_utc"),
        target_organization_url: row.get("target_organization_url"),
        start_time_utc: row.get("start_time_utc"),
        end_time_utc: row.get("end_time_utc"),
        is_reservation: row.get("is_reservation"),
        is_rejection: row.get("is_rejection"),
        reshare_chain: json_to_chain(reshare_chain),
    }
}

fn row_to_visible_offer(row: sqlx::postgres::PgRow) -> Result<VisibleOffer, StorageError> {
    let offer_json: serde_json::Value = row.get("offer_json");
    let offer = json_to_offer(offer_json)?;
    let timeline_entry = row_to_timeline_entry_subset(&row);
    Ok(VisibleOffer {
        offer,
        snapshot_update_utc: timeline_entry.snapshot_update_utc,
        reshare_chain: timeline_entry.reshare_chain.clone(),
        timeline_entry,
    })
}

fn row_to_timeline_entry_subset(row: &sqlx::postgres::PgRow) -> TimelineEntry {
    let reshare_chain: Option<serde_json::Value> = row.get("reshare_chain");
    TimelineEntry {
        posting_org_url: row.get("posting_org_url"),
        offer_id: row.get("offer_id"),
        snapshot_update_utc: row.get("snapshot_update_utc"),
        target_organization_url: row.get("target_organization_url"),
        start_time_utc: row.get("start_time_utc"),
        end_time_utc: row.get("end_time_utc"),
        is_reservation: row.get("is_reservation"),
        is_rejection: row.get("is_rejection"),
        reshare_chain: json_to_chain(reshare_chain),
    }
}

/// Integration tests requiring a live Postgres instance. Run with
/// `DATABASE_URL=postgres://... cargo test -p opr-storage -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn connect_and_migrate() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
        let storage = PgStorage::connect(&url).await.unwrap();
        storage.migrate().await.unwrap();
    }
}

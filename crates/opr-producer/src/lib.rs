//! Polls registered offer producers on a backoff schedule and merges their
//! results into an [`opr_model::OfferModel`] (spec.md §4.8).
//!
//! A producer is anything that, handed a `ListOffersPayload` describing
//! what it last reported, returns a fresh [`opr_model::OfferSetUpdate`] —
//! typically a client fetching another organization's feed, but the trait
//! makes no assumption about transport.

mod backoff;

pub use backoff::{BackoffPolicy, ExponentialBackoffPolicy, FixedBackoff};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opr_clock::Clock;
use opr_model::{ListOffersPayload, OfferModel, OfferSetUpdate};
use opr_storage::ProducerMetadata;
use tokio::sync::Mutex;

/// One source of offers. Implementations perform whatever I/O is needed
/// (an HTTP LIST call to a peer, a local catalog scan, ...) and report the
/// result the way a producer would per spec.md §4.7's `UPDATE` shape.
#[async_trait]
pub trait OfferProducer: Send + Sync {
    async fn produce(&self, request: ListOffersPayload) -> anyhow::Result<OfferSetUpdate>;
}

/// Polls every registered producer once per [`ProducerLoop::tick_all`] call,
/// applying spec.md §4.8's per-producer lock/backoff/invoke sequence.
///
/// Holds one in-memory failure-attempt counter per producer id, used only to
/// grow the backoff; `nextRunTimestampUTC`/`lastUpdateTimeUTC` (the durable
/// scheduling state) live in [`ProducerMetadata`].
pub struct ProducerLoop {
    model: Arc<OfferModel>,
    clock: Arc<dyn Clock>,
    backoff: Arc<dyn BackoffPolicy>,
    producers: HashMap<String, Arc<dyn OfferProducer>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ProducerLoop {
    pub fn new(model: Arc<OfferModel>, clock: Arc<dyn Clock>, backoff: Arc<dyn BackoffPolicy>) -> Self {
        Self {
            model,
            clock,
            backoff,
            producers: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, producer_id: impl Into<String>, producer: Arc<dyn OfferProducer>) {
        self.producers.insert(producer_id.into(), producer);
    }

    /// Runs [`Self::tick_all`] every `interval`, forever. Intended to be
    /// spawned as a background task; a `tick_all` error for one producer
    /// never stops the loop.
    pub async fn run(&self, interval: Duration) -> ! {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.tick_all().await;
        }
    }

    /// One round over every registered producer, in registration order.
    #[tracing::instrument(skip(self))]
    pub async fn tick_all(&self) {
        for producer_id in self.producers.keys() {
            self.tick_one(producer_id).await;
        }
    }

    #[tracing::instrument(skip(self))]
    async fn tick_one(&self, producer_id: &str) {
        let now = self.clock.now_utc_ms();

        // Step 1: the advisory lock. A concurrent poller racing us to create
        // this row loses the storage-level conflict and surfaces as an
        // error here; that's "already running" for this round, not a bug.
        let meta = match self.model.get_or_init_producer_metadata(producer_id).await {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(producer_id, error = %err, "producer metadata locked or unreadable, skipping round");
                return;
            }
        };

        if let Some(meta) = &meta {
            if meta.next_run_timestamp_utc > now {
                return;
            }
        }

        let last_update_time_utc = meta.as_ref().and_then(|m| m.last_update_time_utc);
        let payload = match last_update_time_utc {
            Some(t) => ListOffersPayload::Diff { diff_start_timestamp_utc: t },
            None => ListOffersPayload::Snapshot,
        };

        let Some(producer) = self.producers.get(producer_id) else {
            return;
        };

        match self.invoke(producer_id, producer.as_ref(), payload).await {
            Ok(earliest_next_request_utc) => {
                self.attempts.lock().await.remove(producer_id);
                let meta = ProducerMetadata {
                    organization_url: producer_id.to_string(),
                    last_update_time_utc: Some(now),
                    next_run_timestamp_utc: earliest_next_request_utc.unwrap_or(now),
                };
                if let Err(err) = self.model.write_producer_metadata(meta).await {
                    tracing::error!(producer_id, error = %err, "failed to write producer metadata after success");
                }
            }
            Err(err) => {
                tracing::warn!(producer_id, error = %err, "producer round failed");
                let attempt = {
                    let mut attempts = self.attempts.lock().await;
                    let attempt = attempts.entry(producer_id.to_string()).or_insert(0);
                    *attempt += 1;
                    *attempt
                };
                let meta = ProducerMetadata {
                    organization_url: producer_id.to_string(),
                    last_update_time_utc,
                    next_run_timestamp_utc: now + self.backoff.backoff_ms(producer_id, attempt),
                };
                if let Err(err) = self.model.write_producer_metadata(meta).await {
                    tracing::error!(producer_id, error = %err, "failed to write producer metadata after failure");
                }
            }
        }
    }

    async fn invoke(
        &self,
        producer_id: &str,
        producer: &dyn OfferProducer,
        payload: ListOffersPayload,
    ) -> anyhow::Result<Option<i64>> {
        let update = producer.produce(payload).await?;
        let earliest_next_request_utc = update.earliest_next_request_utc;
        self.model.update(producer_id, update).await?;
        Ok(earliest_next_request_utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opr_chain::HmacChain;
    use opr_clock::FakeClock;
    use opr_listing::UniversalAcceptPolicy;
    use opr_model::schema::JsonSchemaValidator;
    use opr_patch::Offer;
    use opr_storage::mem::MemStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn offer(id: &str, offered_by: &str, now: i64) -> Offer {
        Offer {
            id: id.into(),
            offered_by: offered_by.into(),
            offer_creation_utc: now,
            offer_update_utc: None,
            offer_expiration_utc: now + 1_000_000,
            max_reservation_time_secs: None,
            reshare_chain: None,
            extra: Default::default(),
        }
    }

    fn model(clock: Arc<FakeClock>) -> Arc<OfferModel> {
        Arc::new(OfferModel::new(
            "https://host",
            Arc::new(MemStorage::new()),
            clock,
            Arc::new(HmacChain::new(b"secret")),
            Arc::new(HmacChain::new(b"secret")),
            Arc::new(UniversalAcceptPolicy::wildcard()),
            Arc::new(JsonSchemaValidator::new()),
        ))
    }

    struct FlakyProducer {
        calls: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl OfferProducer for FlakyProducer {
        async fn produce(&self, _request: ListOffersPayload) -> anyhow::Result<OfferSetUpdate> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                anyhow::bail!("simulated transport failure");
            }
            Ok(OfferSetUpdate {
                offers: Some(vec![offer("pear", "https://producer", 0)]),
                delta: None,
                source_org_url: "https://producer".into(),
                update_current_as_of_timestamp_utc: 0,
                earliest_next_request_utc: None,
            })
        }
    }

    #[tokio::test]
    async fn successful_round_advances_and_applies_update() {
        let clock = Arc::new(FakeClock::new(0));
        let m = model(clock.clone());
        let mut producer_loop = ProducerLoop::new(m.clone(), clock, Arc::new(FixedBackoff::default()));
        producer_loop.register(
            "producer-a",
            Arc::new(FlakyProducer { calls: AtomicU32::new(0), fail_first_n: 0 }),
        );

        producer_loop.tick_all().await;

        let snapshot = m
            .list("https://producer", ListOffersPayload::Snapshot)
            .await
            .unwrap();
        match snapshot {
            opr_model::ListResult::Snapshot { offers } => assert_eq!(offers.len(), 1),
            _ => panic!("expected snapshot"),
        }
    }

    #[tokio::test]
    async fn failed_round_backs_off_without_applying_update() {
        let clock = Arc::new(FakeClock::new(0));
        let m = model(clock.clone());
        let mut producer_loop = ProducerLoop::new(
            m.clone(),
            clock.clone(),
            Arc::new(FixedBackoff { ms: 10_000 }),
        );
        producer_loop.register(
            "producer-a",
            Arc::new(FlakyProducer { calls: AtomicU32::new(0), fail_first_n: 1 }),
        );

        producer_loop.tick_all().await;
        let meta = m
            .get_or_init_producer_metadata("producer-a")
            .await
            .unwrap()
            .expect("metadata was written on the failing round");
        assert_eq!(meta.next_run_timestamp_utc, 10_000);
        assert!(meta.last_update_time_utc.is_none());

        clock.set_time(10_000);
        producer_loop.tick_all().await;
        let meta = m
            .get_or_init_producer_metadata("producer-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.last_update_time_utc, Some(10_000));
    }

    #[tokio::test]
    async fn not_yet_due_producer_is_skipped() {
        let clock = Arc::new(FakeClock::new(0));
        let m = model(clock.clone());
        let mut producer_loop = ProducerLoop::new(m.clone(), clock, Arc::new(FixedBackoff::default()));
        let producer = Arc::new(FlakyProducer { calls: AtomicU32::new(0), fail_first_n: 1 });
        producer_loop.register("producer-a", producer.clone());

        producer_loop.tick_all().await;
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);

        // Backed off 10s into the future; a second immediate round (clock
        // unchanged) must not invoke the producer again.
        producer_loop.tick_all().await;
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
    }
}

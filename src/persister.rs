//! Dumps every subscribed item into the store so a restarted
//! orchestrator can resurrect from it.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::orchestrator::Signal;
use crate::statistics::STATS_TOPIC;
use crate::store::{self, Persist};
use crate::transport::{Message, Subscriber, REPORT_TOPIC};

/// What a persister listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistKind {
    /// Raw request digests.
    Http,
    /// Computed aggregates.
    Stats,
}

impl PersistKind {
    pub fn topic(self) -> &'static str {
        match self {
            Self::Http => REPORT_TOPIC,
            Self::Stats => STATS_TOPIC,
        }
    }
}

pub struct Persister {
    kind: PersistKind,
    ttl_secs: u64,
    randmax: u32,
    rng: StdRng,
}

impl Persister {
    /// `randmax` bounds the random suffix of raw-digest keys; too few bits
    /// and digests of one second may collide.
    pub fn new(kind: PersistKind, ttl_secs: u64, randmax: u32) -> Self {
        Self {
            kind,
            ttl_secs,
            randmax: randmax.max(1),
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded variant for reproducible keys.
    pub fn with_seed(kind: PersistKind, ttl_secs: u64, randmax: u32, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(kind, ttl_secs, randmax)
        }
    }

    /// Store key for one message.
    pub fn item_key(&mut self, message: &Message) -> Result<String> {
        match self.kind {
            PersistKind::Http => {
                let digest = Digest::decode(message.tenant.as_str(), message.payload.as_str())?;
                let suffix = self.rng.gen_range(0..self.randmax);
                Ok(store::report_key(&message.tenant, digest.start_sec(), suffix))
            }
            PersistKind::Stats => {
                let (bucket_key, stat_key, _): (i64, String, Value) =
                    serde_json::from_str(&message.payload)
                        .map_err(|e| Error::decode("computation", e))?;
                Ok(store::stats_key(&stat_key, &message.tenant, bucket_key))
            }
        }
    }

    /// Persists items until the subscription ends or `inspect` returns
    /// [`Signal::Kill`]. `inspect` sees each key and payload first and may
    /// return [`Signal::Skip`] to leave that item out.
    ///
    /// Returns how many items were stored. Store errors end the loop.
    pub async fn run<S, F>(
        &mut self,
        subscriber: &mut Subscriber,
        store: &mut S,
        mut inspect: F,
    ) -> Result<u64>
    where
        S: Persist,
        F: FnMut(&str, &str) -> Signal,
    {
        let mut persisted = 0;
        while let Some(message) = subscriber.recv().await {
            let key = match self.item_key(&message) {
                Ok(key) => key,
                Err(e) => {
                    warn!("not persisting item: {e}");
                    continue;
                }
            };
            match inspect(&key, &message.payload) {
                Signal::Kill => break,
                Signal::Skip => continue,
                Signal::Continue => {}
            }
            store.set_with_expiry(&key, &message.payload, self.ttl_secs).await?;
            persisted += 1;
        }
        info!("{:?} persister stopped after {persisted} items", self.kind);
        Ok(persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::MemoryStore;

    #[test]
    fn http_keys_carry_tenant_and_start() {
        let mut persister = Persister::with_seed(PersistKind::Http, 30, 65_535, 7);
        let message = Message::new("report", "app1", r#"{"t0.sec":1000,"t1.sec":1001}"#);
        let key = persister.item_key(&message).unwrap();
        assert!(key.starts_with("livetraffic.report.app1.1000."), "{key}");
        let suffix: u32 = key.rsplit('.').next().unwrap().parse().unwrap();
        assert!(suffix < 65_535);
    }

    #[test]
    fn stats_keys_come_from_payload() {
        let mut persister = Persister::new(PersistKind::Stats, 30, 65_535);
        let message = Message::new("stats", "app1", r#"[1000,"requests",3]"#);
        assert_eq!(
            persister.item_key(&message).unwrap(),
            "livetraffic.stats.requests.app1.1000"
        );
        assert!(persister.item_key(&Message::new("stats", "", "[1000]")).is_err());
    }

    #[tokio::test]
    async fn run_honours_skip_and_kill() {
        let (tx, mut subscriber) = Subscriber::channel();
        let items = [
            (1, "requests"),
            (2, "rate"),
            (3, "garbage"),
            (4, "requests"),
            (5, "requests"),
        ];
        for (bucket, stat) in items {
            let payload = if stat == "garbage" {
                "nope".to_owned()
            } else {
                format!(r#"[{bucket},"{stat}",1]"#)
            };
            tx.send(Message::new("stats", "app1", payload)).await.unwrap();
        }

        let mut store = MemoryStore::default();
        let mut persister = Persister::new(PersistKind::Stats, 30, 65_535);
        let stored = persister
            .run(&mut subscriber, &mut store, |key, _| {
                if key.contains(".rate.") {
                    Signal::Skip
                } else if key.ends_with(".5") {
                    Signal::Kill
                } else {
                    Signal::Continue
                }
            })
            .await
            .unwrap();

        assert_eq!(stored, 2);
        let keys: Vec<_> = store.0.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                "livetraffic.stats.requests.app1.1",
                "livetraffic.stats.requests.app1.4",
            ]
        );
    }
}

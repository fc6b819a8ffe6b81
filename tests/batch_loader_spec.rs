//! End-to-end exercise of `BatchLoader` against a fallible in-memory source.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use batch_loader::{BatchLoader, Loader};
use futures_util::future::join_all;
use pretty_assertions::assert_eq;

/// An in-memory catalog keyed by uppercased serial number. Lookups arrive
/// with whatever casing the caller used; unknown serials resolve to a
/// placeholder record rather than failing the batch.
struct CatalogSource {
    records: HashMap<String, String>,
    fetches: AtomicUsize,
    offline: AtomicBool,
}

impl CatalogSource {
    fn new(records: &[(&str, &str)]) -> Self {
        Self {
            records: records
                .iter()
                .map(|(serial, name)| (serial.to_uppercase(), name.to_string()))
                .collect(),
            fetches: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Loader<String> for CatalogSource {
    type Key = String;
    type Value = String;
    type Error = Arc<anyhow::Error>;

    async fn fetch_batch(
        &self,
        identifiers: &[String],
    ) -> Result<HashMap<String, String>, Self::Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Arc::new(anyhow!("catalog unreachable")));
        }
        Ok(identifiers
            .iter()
            .filter_map(|serial| {
                let key = serial.to_uppercase();
                let name = self.records.get(&key)?.clone();
                Some((key, name))
            })
            .collect())
    }

    fn key(&self, identifier: &String) -> String {
        identifier.to_uppercase()
    }

    fn default_value(&self, identifier: &String) -> String {
        format!("unknown({identifier})")
    }
}

fn catalog_loader(source: CatalogSource) -> BatchLoader<String, CatalogSource> {
    BatchLoader::new(source, tokio::spawn)
        .max_batch_size(NonZeroUsize::new(4).unwrap())
        .delay(Duration::from_millis(10))
}

#[tokio::test]
async fn resolves_mixed_case_hits_and_placeholder_misses_in_one_fetch() {
    let loader = catalog_loader(CatalogSource::new(&[
        ("pmp-100", "feed pump"),
        ("vlv-007", "inlet valve"),
    ]));

    let results = join_all(
        ["PMP-100", "pmp-100", "vlv-007", "tank-9"]
            .iter()
            .map(|serial| loader.load(serial.to_string())),
    )
    .await;

    let values: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(
        values,
        vec![
            "feed pump".to_string(),
            "feed pump".to_string(),
            "inlet valve".to_string(),
            "unknown(tank-9)".to_string()
        ]
    );
    assert_eq!(loader.loader().fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn outage_fails_one_batch_and_recovery_serves_the_next() {
    let loader = catalog_loader(CatalogSource::new(&[("pmp-100", "feed pump")]));
    loader.loader().offline.store(true, Ordering::SeqCst);

    let failed = join_all(
        ["pmp-100", "vlv-007"]
            .iter()
            .map(|serial| loader.load(serial.to_string())),
    )
    .await;
    assert_eq!(failed.len(), 2);
    for result in failed {
        let error = result.unwrap_err();
        assert_eq!(error.to_string(), "catalog unreachable");
    }

    loader.loader().offline.store(false, Ordering::SeqCst);
    let recovered = loader.load("pmp-100".to_string()).await.unwrap();
    assert_eq!(recovered, "feed pump");
    assert_eq!(loader.loader().fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn load_many_round_trips_a_full_catalog_page() {
    let loader = catalog_loader(CatalogSource::new(&[
        ("a-1", "one"),
        ("a-2", "two"),
        ("a-3", "three"),
        ("a-4", "four"),
    ]));

    let values = loader
        .load_many(["a-1", "a-2", "a-3", "a-4"].map(String::from))
        .await
        .unwrap();

    assert_eq!(
        values,
        vec![
            "one".to_string(),
            "two".to_string(),
            "three".to_string(),
            "four".to_string()
        ]
    );
    // Exactly one full batch: size-triggered, no idle wait.
    assert_eq!(loader.loader().fetches.load(Ordering::SeqCst), 1);
}

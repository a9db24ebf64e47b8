use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use coalescer::PromiseRegistry;
use coalescer::Retriever;

use rand::Rng;

/// A slow lookup which sometimes panics, on even numbers. When it panics, every caller waiting on
/// the key is released with an error and the key is forgotten.
struct FlakyLookup {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Retriever for FlakyLookup {
    type Value = String;

    async fn retrieve(&self, key: &str) -> Self::Value {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let num = rand::rng().random_range(1000..2000);
        tokio::time::sleep(Duration::from_millis(num)).await;
        if num % 2 == 0 {
            panic!("BAD NUMBER");
        }
        format!("{key} took {num}ms")
    }
}

/// Five rounds of 100 concurrent lookups for one key each. Each round prints how many callers
/// got a value, how far apart their answers arrived, and how many times the lookup ran (always
/// once).
#[tokio::main]
async fn main() {
    let registry = PromiseRegistry::new();
    let lookup = Arc::new(FlakyLookup {
        calls: AtomicUsize::new(0),
    });

    for round in 0..5 {
        let key = format!("round-{round}");
        let mut hdls = vec![];
        let start = Instant::now();
        for _i in 0..100 {
            let registry = registry.clone();
            let lookup = lookup.clone();
            let key = key.clone();
            hdls.push(async move {
                let deadline = tokio::time::sleep(Duration::from_secs(3));
                let is_ok = registry.get_or_retrieve(&key, lookup, deadline).await.is_ok();
                (Instant::now(), is_ok)
            });
        }
        let mut result: Vec<(Instant, bool)> =
            futures::future::join_all(hdls).await.into_iter().collect();
        result.sort();
        println!("{key}: {:?}", registry.peek(&key));
        println!(
            "range: {:?}",
            result.last().unwrap().0 - result.first().unwrap().0
        );
        println!(
            "passed: {:?}",
            result
                .iter()
                .fold(0, |acc, x| if x.1 { acc + 1 } else { acc })
        );
        println!("lookups so far: {}", lookup.calls.load(Ordering::SeqCst));
        println!("elapsed: {:?}\n", Instant::now() - start);
    }
    println!(
        "requests: {}, coalesced: {}",
        registry.request_count(),
        registry.coalesced_count()
    );
}

// Duplicate suppression filter behaviour at realistic volumes

use meshwire_core::dedup::{BloomFilter, DEFAULT_ROTATION_INTERVAL};
use proptest::prelude::*;
use std::time::Duration;
use uuid::Uuid;

fn ids(n: usize) -> Vec<Uuid> {
    (0..n).map(|_| Uuid::new_v4()).collect()
}

#[test]
fn test_no_false_negatives_at_capacity() {
    let mut filter = BloomFilter::new();
    let seen = ids(5_000);
    for id in &seen {
        filter.add(id.as_bytes());
    }
    assert_eq!(filter.len(), 5_000);
    assert!(seen.iter().all(|id| filter.might_contain(id.as_bytes())));
}

#[test]
fn test_false_positive_rate_stays_low() {
    let mut filter = BloomFilter::with_params(2_000, 0.01, DEFAULT_ROTATION_INTERVAL);
    for id in ids(1_500) {
        filter.add(id.as_bytes());
    }

    let lookups = 10_000;
    let false_positives = ids(lookups)
        .iter()
        .filter(|id| filter.might_contain(id.as_bytes()))
        .count();
    let rate = false_positives as f64 / lookups as f64;
    println!("false positive rate at 1500 ids: {rate:.4}");
    assert!(rate < 0.05, "false positive rate {rate} too high");
}

#[test]
fn test_check_and_add_reports_duplicates() {
    let mut filter = BloomFilter::new();
    let id = Uuid::new_v4();

    assert!(!filter.check_and_add(id.as_bytes()));
    assert!(filter.check_and_add(id.as_bytes()));
    assert!(filter.check_and_add(id.as_bytes()));
    assert_eq!(filter.len(), 1);
}

#[test]
fn test_clear_forgets_everything() {
    let mut filter = BloomFilter::new();
    let batch = ids(100);
    for id in &batch {
        filter.add(id.as_bytes());
    }
    assert!(filter.fill_ratio() > 0.0);

    filter.clear();
    assert!(filter.is_empty());
    assert_eq!(filter.fill_ratio(), 0.0);
    assert!(batch.iter().all(|id| !filter.might_contain(id.as_bytes())));
}

#[test]
fn test_rotation_when_full() {
    let mut filter = BloomFilter::with_params(100, 0.01, DEFAULT_ROTATION_INTERVAL);
    let first = ids(100);
    for id in &first {
        filter.add(id.as_bytes());
    }
    assert_eq!(filter.rotations(), 0);

    let next = Uuid::new_v4();
    filter.add(next.as_bytes());
    assert_eq!(filter.rotations(), 1);
    assert_eq!(filter.len(), 1);
    assert!(filter.might_contain(next.as_bytes()));
}

#[tokio::test(start_paused = true)]
async fn test_rotation_on_interval() {
    let mut filter = BloomFilter::with_params(1_000, 0.01, Duration::from_secs(60));
    let old = Uuid::new_v4();
    filter.add(old.as_bytes());

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(filter.check_and_add(old.as_bytes()));
    assert_eq!(filter.rotations(), 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    // Due for rotation: the old id is forgotten and recorded afresh
    assert!(!filter.check_and_add(old.as_bytes()));
    assert_eq!(filter.rotations(), 1);
    assert_eq!(filter.len(), 1);
}

proptest! {
    #[test]
    fn prop_added_ids_are_always_found(
        batch in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 1..500)
    ) {
        let mut filter = BloomFilter::with_params(1_000, 0.01, DEFAULT_ROTATION_INTERVAL);
        for id in &batch {
            filter.add(id);
        }
        for id in &batch {
            prop_assert!(filter.might_contain(id));
        }
    }
}

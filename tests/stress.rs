//! Stress tests for pathological cases
//!
//! These tests verify we don't have accidentally quadratic behavior.

use relay_sdk::subjects::{Subject, SubjectPattern};
use relay_sdk::{Event, EventBus, EventKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Test that firing an event costs roughly linear time in the listener count
#[test]
fn test_fire_not_quadratic() {
    let listener_counts = [100, 1_000, 10_000];
    let mut times = vec![];

    for &count in &listener_counts {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..count {
            let counter = calls.clone();
            bus.on(&[EventKind::Connected, EventKind::Disconnected], move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        let iterations = 100;
        let start = Instant::now();

        for _ in 0..iterations {
            bus.fire(&Event::Connected);
        }

        let elapsed = start.elapsed();
        let per_listener_ns = elapsed.as_nanos() / (iterations as u128 * count as u128);
        times.push((count, elapsed.as_nanos().max(1)));

        assert_eq!(calls.load(Ordering::Relaxed), iterations * count);
        println!(
            "Listeners: {:>6}, Fires: {}, Time: {:?}, Per listener: {}ns",
            count, iterations, elapsed, per_listener_ns
        );
    }

    let (small_count, small_time) = times[0];
    let (large_count, large_time) = times[times.len() - 1];

    let count_ratio = large_count as f64 / small_count as f64;
    let time_ratio = large_time as f64 / small_time as f64;

    println!(
        "\nListener count ratio: {:.0}x, Time ratio: {:.1}x",
        count_ratio, time_ratio
    );

    // If quadratic, time_ratio would be ~count_ratio²
    assert!(
        time_ratio < count_ratio * 10.0,
        "Event dispatch appears to be quadratic! Time grew {:.1}x for {:.0}x more listeners",
        time_ratio,
        count_ratio
    );
}

/// Test that removing listeners one by one doesn't degrade
#[test]
fn test_unregister_many_listeners() {
    let bus = EventBus::new();
    let ids: Vec<_> = (0..2_000)
        .map(|_| bus.on(&EventKind::ALL, |_| {}))
        .collect();

    let start = Instant::now();
    for id in ids {
        bus.off(id);
    }
    let elapsed = start.elapsed();

    println!("Unregistered 2000 listeners across all kinds in {:?}", elapsed);

    for kind in EventKind::ALL {
        assert_eq!(bus.listener_count(kind), 0);
    }
    assert!(elapsed.as_secs() < 10, "Unregistering took {:?}", elapsed);
}

/// Test that one-shot listeners are all consumed by a single fire
#[test]
fn test_many_once_listeners_single_fire() {
    let bus = EventBus::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..5_000 {
        let counter = calls.clone();
        bus.once(&[EventKind::Error, EventKind::LameDuck], move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    let start = Instant::now();
    bus.fire(&Event::Error("boom".into()));
    let elapsed = start.elapsed();

    println!("Fired to 5000 once-listeners in {:?}", elapsed);

    assert_eq!(calls.load(Ordering::Relaxed), 5_000);
    assert_eq!(bus.listener_count(EventKind::Error), 0);
    assert_eq!(bus.listener_count(EventKind::LameDuck), 0);

    bus.fire(&Event::LameDuck);
    assert_eq!(calls.load(Ordering::Relaxed), 5_000);
}

/// Test wildcard matching performance with deep subjects
#[test]
fn test_wildcard_matching_performance() {
    let patterns = [
        SubjectPattern::parse(">").unwrap(),
        SubjectPattern::parse("a.>").unwrap(),
        SubjectPattern::parse("a.*.c.>").unwrap(),
        SubjectPattern::parse("a.*.*.*.*.*.*.*.*.*").unwrap(),
    ];

    let deep = (0..10)
        .map(|i| if i == 0 { "a".to_string() } else { format!("t{}", i) })
        .collect::<Vec<_>>()
        .join(".");
    let subject = Subject::parse(&deep).unwrap();

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        for pattern in &patterns {
            let _ = pattern.matches(&subject);
        }
    }

    let elapsed = start.elapsed();
    let per_match_ns = elapsed.as_nanos() / (iterations as u128 * patterns.len() as u128);

    println!(
        "Matches: {}, Time: {:?}, Per match: {}ns",
        iterations * patterns.len(),
        elapsed,
        per_match_ns
    );

    assert!(patterns[0].matches(&subject));
    assert!(patterns[1].matches(&subject));
    assert!(!patterns[2].matches(&subject));
    assert!(patterns[3].matches(&subject));
}

use pagewatch::config::HostThresholds;
use pagewatch::host::{cpu_used_percent, violations, HostSnapshot};

fn limits() -> HostThresholds {
    HostThresholds {
        mem_used_max_percent: 90.0,
        swap_used_max_percent: 80.0,
        disk_used_max_percent: 90.0,
        load_per_cpu_max: 3.0,
        cpu_used_max_percent: 95.0,
    }
}

fn healthy_snapshot() -> HostSnapshot {
    HostSnapshot {
        mem_used_percent: Some(40.0),
        swap_used_percent: Some(5.0),
        disk_used_percent: Some(55.0),
        load_1m: Some(1.2),
        cpu_count: 4,
        cpu_used_percent: Some(30.0),
    }
}

#[test]
fn test_healthy_snapshot_has_no_violations() {
    assert!(violations(&healthy_snapshot(), &limits()).is_empty());
}

#[test]
fn test_each_threshold_breach_is_reported() {
    let mut snap = healthy_snapshot();
    snap.mem_used_percent = Some(95.0);
    snap.swap_used_percent = Some(85.0);
    snap.disk_used_percent = Some(97.0);
    snap.load_1m = Some(20.0);
    snap.cpu_used_percent = Some(99.0);

    let found = violations(&snap, &limits());
    assert_eq!(found.len(), 5);
    assert!(found.iter().any(|v| v.starts_with("memory")));
    assert!(found.iter().any(|v| v.starts_with("swap")));
    assert!(found.iter().any(|v| v.starts_with("disk")));
    assert!(found.iter().any(|v| v.starts_with("load")));
    assert!(found.iter().any(|v| v.starts_with("cpu")));
}

#[test]
fn test_missing_readings_are_not_judged() {
    // A snapshot with nothing readable (non-Linux host) never fails.
    let snap = HostSnapshot {
        cpu_count: 4,
        ..Default::default()
    };
    assert!(violations(&snap, &limits()).is_empty());
}

#[test]
fn test_load_is_judged_per_cpu() {
    let mut snap = healthy_snapshot();
    // 8.0 over 4 cpus is 2.0/cpu, under the 3.0 limit.
    snap.load_1m = Some(8.0);
    assert!(violations(&snap, &limits()).is_empty());

    // The same absolute load on a single cpu is a breach.
    snap.cpu_count = 1;
    let found = violations(&snap, &limits());
    assert_eq!(found.len(), 1);
    assert!(found[0].starts_with("load"));
}

#[test]
fn test_values_at_limit_do_not_violate() {
    let mut snap = healthy_snapshot();
    snap.mem_used_percent = Some(90.0);
    snap.disk_used_percent = Some(90.0);
    snap.cpu_used_percent = Some(95.0);
    assert!(violations(&snap, &limits()).is_empty());
}

#[test]
fn test_cpu_used_percent_between_samples() {
    // 1000 jiffies elapsed, 250 of them idle: 75% used.
    let used = cpu_used_percent((10_000, 4_000), (11_000, 4_250)).unwrap();
    assert!((used - 75.0).abs() < 0.001);

    // No elapsed time or counter wrap yields no reading.
    assert!(cpu_used_percent((10_000, 4_000), (10_000, 4_000)).is_none());
    assert!(cpu_used_percent((10_000, 4_000), (9_000, 3_000)).is_none());
}

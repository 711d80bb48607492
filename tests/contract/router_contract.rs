//! Contract tests for the source router.
//!
//! Every operation in the default table must satisfy the same routing rules,
//! whatever its candidate list looks like.

use tickgate_core::{RouterTable, SourceRouter, SourceStatus};

fn router() -> SourceRouter {
    SourceRouter::new(RouterTable::default())
}

fn assert_failed_subset_of_candidates(router: &SourceRouter, operation: &str) {
    let candidates = router.candidates(operation);
    for failed in router.failed_sources(operation) {
        assert!(
            candidates.contains(&failed),
            "{operation}: failed source {failed} is not a candidate"
        );
    }
}

#[test]
fn contract_default_table_routes_expected_operations() {
    let router = router();

    let mut operations = router.operations();
    operations.sort();
    assert_eq!(operations, ["hist", "info", "intraday", "minute", "spot"]);
    assert_eq!(router.candidates("hist"), ["em", "tx", "sina"]);
    assert_eq!(router.candidates("info"), ["em", "xq"]);
}

#[test]
fn contract_failover_walks_candidates_in_priority_order() {
    let router = router();

    for operation in router.operations() {
        let candidates = router.candidates(&operation);
        for (index, source) in candidates.iter().enumerate() {
            assert_eq!(
                router.get_source(&operation, None).as_ref(),
                Some(source),
                "{operation}: expected candidate #{index}"
            );
            assert!(router.mark_failed(&operation, source));
            assert_failed_subset_of_candidates(&router, &operation);
        }
        assert_eq!(router.get_source(&operation, None), None);
    }
}

#[test]
fn contract_reset_restores_primary_source_everywhere() {
    let router = router();
    for operation in router.operations() {
        for source in router.candidates(&operation) {
            router.mark_failed(&operation, &source);
        }
    }

    router.reset();

    for operation in router.operations() {
        assert_eq!(
            router.get_source(&operation, None),
            router.candidates(&operation).first().cloned()
        );
        assert!(router.failed_sources(&operation).is_empty());
    }
}

#[test]
fn contract_marking_is_idempotent() {
    let router = router();

    assert!(router.mark_failed("spot", "em"));
    assert!(!router.mark_failed("spot", "em"));
    assert_eq!(router.failed_sources("spot"), ["em"]);

    router.mark_success("spot", "em");
    router.mark_success("spot", "em");
    assert!(router.failed_sources("spot").is_empty());
}

#[test]
fn contract_unknown_sources_and_operations_are_ignored() {
    let router = router();

    assert!(!router.mark_failed("spot", "tx"));
    assert!(!router.mark_failed("news", "em"));
    router.mark_success("news", "em");

    assert_failed_subset_of_candidates(&router, "spot");
    assert!(router.failed_sources("news").is_empty());
    assert_eq!(router.get_source("news", Some("em")), None);
}

#[test]
fn contract_preferred_source_wins_only_while_viable() {
    let router = router();

    assert_eq!(router.get_source("hist", Some("sina")).as_deref(), Some("sina"));
    assert_eq!(router.get_source("hist", Some("xq")).as_deref(), Some("em"));
    assert_eq!(router.get_source("hist", Some("")).as_deref(), Some("em"));

    router.mark_failed("hist", "sina");
    assert_eq!(router.get_source("hist", Some("sina")).as_deref(), Some("em"));
}

#[test]
fn contract_failures_are_scoped_per_operation() {
    let router = router();

    router.mark_failed("spot", "em");

    assert_eq!(router.get_source("spot", None).as_deref(), Some("sina"));
    assert_eq!(router.get_source("hist", None).as_deref(), Some("em"));
}

#[test]
fn contract_next_source_skips_excluded_sources() {
    let router = router();
    let tried = vec!["em".to_owned()];

    assert_eq!(router.next_source("hist", None, &tried).as_deref(), Some("tx"));
    assert_eq!(
        router.next_source("hist", Some("em"), &tried).as_deref(),
        Some("tx")
    );
    assert!(router.failed_sources("hist").is_empty());
}

#[test]
fn contract_replacing_sources_prunes_stale_failures() {
    let router = router();
    router.mark_failed("hist", "tx");
    router.mark_failed("hist", "sina");

    router.set_sources(RouterTable::new().with_operation("hist", ["sina", "em", "sina"]));

    assert_eq!(router.candidates("hist"), ["sina", "em"]);
    assert_eq!(router.failed_sources("hist"), ["sina"]);
    assert!(!router.is_routed("spot"));
    assert_failed_subset_of_candidates(&router, "hist");
}

#[test]
fn contract_snapshot_reports_priority_and_status() {
    let router = router();
    router.mark_failed("minute", "em");

    let snapshot = router.snapshot("minute");

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].source, "em");
    assert_eq!(snapshot[0].priority, 0);
    assert_eq!(snapshot[0].status, SourceStatus::Failed);
    assert_eq!(snapshot[0].status_label(), "failed");
    assert!(snapshot[1].available());
    assert_eq!(snapshot[1].status_label(), "available");
    assert_eq!(router.available_sources("minute"), ["sina"]);
}

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Candidate sources per operation, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouterTable {
    operations: BTreeMap<String, Vec<String>>,
}

impl Default for RouterTable {
    fn default() -> Self {
        Self::new()
            .with_operation("info", ["em", "xq"])
            .with_operation("spot", ["em", "sina"])
            .with_operation("hist", ["em", "tx", "sina"])
            .with_operation("minute", ["em", "sina"])
            .with_operation("intraday", ["em", "sina"])
    }
}

impl RouterTable {
    /// Empty table; every operation is unrouted.
    pub fn new() -> Self {
        Self {
            operations: BTreeMap::new(),
        }
    }

    /// Sets the candidate list for `operation`, dropping duplicate and empty names.
    pub fn with_operation<I, S>(mut self, operation: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources = sources.into_iter().map(Into::into).collect::<Vec<_>>();
        self.operations.insert(operation.into(), dedupe_chain(&sources));
        self
    }

    pub fn candidates(&self, operation: &str) -> &[String] {
        self.operations
            .get(operation)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, operation: &str) -> bool {
        !self.candidates(operation).is_empty()
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    fn normalized(self) -> Self {
        Self {
            operations: self
                .operations
                .into_iter()
                .map(|(operation, sources)| (operation, dedupe_chain(&sources)))
                .collect(),
        }
    }
}

/// Routing status of a single candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Available,
    Failed,
}

/// Candidate snapshot used for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub operation: String,
    pub source: String,
    /// Position in the candidate list, 0 = highest priority.
    pub priority: usize,
    pub status: SourceStatus,
}

impl SourceSnapshot {
    pub fn available(&self) -> bool {
        self.status == SourceStatus::Available
    }

    pub fn status_label(&self) -> &'static str {
        match self.status {
            SourceStatus::Available => "available",
            SourceStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Default)]
struct RouterState {
    table: RouterTable,
    failed: HashMap<String, HashSet<String>>,
}

impl RouterState {
    fn is_failed(&self, operation: &str, source: &str) -> bool {
        self.failed
            .get(operation)
            .is_some_and(|failed| failed.contains(source))
    }
}

/// Per-operation source selection with soft failure memory.
///
/// A failed mark stays until [`SourceRouter::mark_success`] or
/// [`SourceRouter::reset`] clears it; nothing decays on a timer. The failed
/// set of an operation is always a subset of its candidates.
#[derive(Debug, Default)]
pub struct SourceRouter {
    state: Mutex<RouterState>,
}

impl SourceRouter {
    pub fn new(table: RouterTable) -> Self {
        Self {
            state: Mutex::new(RouterState {
                table: table.normalized(),
                failed: HashMap::new(),
            }),
        }
    }

    /// Returns a usable source for `operation`, or `None` when every candidate
    /// is marked failed (or the operation has none).
    ///
    /// `preferred` wins whenever it is still a surviving candidate; otherwise
    /// the highest-priority survivor is returned.
    pub fn get_source(&self, operation: &str, preferred: Option<&str>) -> Option<String> {
        self.next_source(operation, preferred, &[])
    }

    /// Like [`SourceRouter::get_source`], additionally skipping `exclude`.
    pub fn next_source(
        &self,
        operation: &str,
        preferred: Option<&str>,
        exclude: &[String],
    ) -> Option<String> {
        let state = self.lock();
        let viable = |source: &str| {
            !state.is_failed(operation, source) && !exclude.iter().any(|s| s == source)
        };
        let candidates = state.table.candidates(operation);

        if let Some(preferred) = preferred.filter(|preferred| !preferred.is_empty()) {
            if candidates.iter().any(|s| s == preferred) && viable(preferred) {
                return Some(preferred.to_owned());
            }
        }

        candidates
            .iter()
            .find(|source| viable(source.as_str()))
            .cloned()
    }

    /// Marks `source` failed for `operation`. Idempotent. Sources that are
    /// not candidates for the operation are ignored; returns whether the
    /// failed set changed.
    pub fn mark_failed(&self, operation: &str, source: &str) -> bool {
        let mut state = self.lock();
        if !state.table.candidates(operation).iter().any(|s| s == source) {
            debug!(operation, source, "ignoring failure mark for unknown source");
            return false;
        }

        let inserted = state
            .failed
            .entry(operation.to_owned())
            .or_default()
            .insert(source.to_owned());
        if inserted {
            warn!(operation, source, "source marked failed");
        }
        inserted
    }

    /// Clears a failure mark. No-op when the source was not marked.
    pub fn mark_success(&self, operation: &str, source: &str) {
        let mut state = self.lock();
        let Some(failed) = state.failed.get_mut(operation) else {
            return;
        };
        if failed.remove(source) {
            info!(operation, source, "source recovered");
        }
        if failed.is_empty() {
            state.failed.remove(operation);
        }
    }

    /// Forgets every failure for every operation.
    pub fn reset(&self) {
        self.lock().failed.clear();
        info!("source failure memory reset");
    }

    /// Replaces the whole candidate table. Failure marks for sources that are
    /// no longer candidates are dropped.
    pub fn set_sources(&self, table: RouterTable) {
        let mut state = self.lock();
        let table = table.normalized();
        state.failed.retain(|operation, sources| {
            let candidates = table.candidates(operation);
            sources.retain(|source| candidates.contains(source));
            !sources.is_empty()
        });
        state.table = table;
    }

    pub fn table(&self) -> RouterTable {
        self.lock().table.clone()
    }

    /// True when `operation` has at least one configured candidate.
    pub fn is_routed(&self, operation: &str) -> bool {
        self.lock().table.contains(operation)
    }

    pub fn candidates(&self, operation: &str) -> Vec<String> {
        self.lock().table.candidates(operation).to_vec()
    }

    /// Failed sources for `operation`, in priority order.
    pub fn failed_sources(&self, operation: &str) -> Vec<String> {
        let state = self.lock();
        state
            .table
            .candidates(operation)
            .iter()
            .filter(|source| state.is_failed(operation, source))
            .cloned()
            .collect()
    }

    pub fn available_sources(&self, operation: &str) -> Vec<String> {
        let state = self.lock();
        state
            .table
            .candidates(operation)
            .iter()
            .filter(|source| !state.is_failed(operation, source))
            .cloned()
            .collect()
    }

    pub fn operations(&self) -> Vec<String> {
        self.lock().table.operations().map(str::to_owned).collect()
    }

    pub fn snapshot(&self, operation: &str) -> Vec<SourceSnapshot> {
        let state = self.lock();
        state
            .table
            .candidates(operation)
            .iter()
            .enumerate()
            .map(|(priority, source)| SourceSnapshot {
                operation: operation.to_owned(),
                source: source.clone(),
                priority,
                status: if state.is_failed(operation, source) {
                    SourceStatus::Failed
                } else {
                    SourceStatus::Available
                },
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn dedupe_chain(chain: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut output = Vec::with_capacity(chain.len());

    for source in chain {
        if !source.is_empty() && seen.insert(source.as_str()) {
            output.push(source.clone());
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot_router() -> SourceRouter {
        SourceRouter::new(RouterTable::new().with_operation("spot", ["em", "sina"]))
    }

    #[test]
    fn returns_first_candidate_without_preference() {
        let router = spot_router();

        assert_eq!(router.get_source("spot", None).as_deref(), Some("em"));
        assert_eq!(router.get_source("spot", Some("")).as_deref(), Some("em"));
    }

    #[test]
    fn honors_viable_preference() {
        let router = spot_router();

        assert_eq!(router.get_source("spot", Some("sina")).as_deref(), Some("sina"));
    }

    #[test]
    fn unknown_preference_falls_back_to_priority_order() {
        let router = spot_router();

        assert_eq!(router.get_source("spot", Some("tx")).as_deref(), Some("em"));
    }

    #[test]
    fn failed_preference_is_skipped_until_reset() {
        let router = spot_router();

        router.mark_failed("spot", "em");
        assert_eq!(router.get_source("spot", Some("em")).as_deref(), Some("sina"));

        router.reset();
        assert_eq!(router.get_source("spot", Some("em")).as_deref(), Some("em"));
    }

    #[test]
    fn all_failed_yields_none() {
        let router = spot_router();

        router.mark_failed("spot", "em");
        router.mark_failed("spot", "sina");

        assert_eq!(router.get_source("spot", None), None);
        assert_eq!(router.get_source("unknown", Some("em")), None);
    }

    #[test]
    fn failure_marks_are_idempotent_and_scoped_per_operation() {
        let router = SourceRouter::default();

        assert!(router.mark_failed("minute", "em"));
        assert!(!router.mark_failed("minute", "em"));

        assert_eq!(router.failed_sources("minute"), vec![String::from("em")]);
        assert!(router.failed_sources("intraday").is_empty());
        assert_eq!(router.get_source("intraday", None).as_deref(), Some("em"));
    }

    #[test]
    fn marking_non_candidate_keeps_failed_set_subset() {
        let router = spot_router();

        assert!(!router.mark_failed("spot", "tx"));
        assert!(!router.mark_failed("hist", "em"));

        assert!(router.failed_sources("spot").is_empty());
    }

    #[test]
    fn mark_success_restores_source() {
        let router = spot_router();

        router.mark_failed("spot", "em");
        router.mark_success("spot", "em");
        router.mark_success("spot", "em");
        router.mark_success("hist", "tx");

        assert_eq!(router.get_source("spot", None).as_deref(), Some("em"));
        assert!(router.failed_sources("spot").is_empty());
    }

    #[test]
    fn next_source_skips_excluded_candidates() {
        let router = SourceRouter::default();
        let tried = vec![String::from("em")];

        assert_eq!(
            router.next_source("hist", Some("em"), &tried).as_deref(),
            Some("tx")
        );
        assert_eq!(
            router
                .next_source("hist", None, &[String::from("em"), String::from("tx")])
                .as_deref(),
            Some("sina")
        );
    }

    #[test]
    fn set_sources_prunes_stale_failures() {
        let router = SourceRouter::default();
        router.mark_failed("hist", "tx");
        router.mark_failed("spot", "sina");

        router.set_sources(
            RouterTable::new()
                .with_operation("hist", ["em", "sina"])
                .with_operation("spot", ["sina", "em"]),
        );

        assert!(router.failed_sources("hist").is_empty());
        assert_eq!(router.failed_sources("spot"), vec![String::from("sina")]);
        assert_eq!(router.get_source("spot", None).as_deref(), Some("em"));
        assert!(!router.is_routed("info"));
    }

    #[test]
    fn table_dedupes_candidates() {
        let table = RouterTable::new().with_operation("spot", ["em", "em", "", "sina"]);

        assert_eq!(
            table.candidates("spot"),
            &[String::from("em"), String::from("sina")]
        );
    }

    #[test]
    fn snapshot_reports_priority_and_status() {
        let router = spot_router();
        router.mark_failed("spot", "em");

        let snapshot = router.snapshot("spot");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].source, "em");
        assert_eq!(snapshot[0].priority, 0);
        assert_eq!(snapshot[0].status_label(), "failed");
        assert!(snapshot[1].available());
        assert_eq!(router.available_sources("spot"), vec![String::from("sina")]);
    }

    #[test]
    fn default_table_covers_known_operations() {
        let router = SourceRouter::new(RouterTable::default());

        assert_eq!(
            router.operations(),
            vec!["hist", "info", "intraday", "minute", "spot"]
        );
        assert_eq!(router.candidates("hist"), vec!["em", "tx", "sina"]);
    }
}

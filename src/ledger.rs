//! The shared test ledger: batch dispensing, outcome recording and retries.
//!
//! Every execution target in the fleet pulls work from one [`Ledger`]. The
//! ledger owns every [`TestCase`] and is the only state mutated from more
//! than one task; all access goes through a single mutex so that no test
//! that has never been attempted is handed to two targets.
//!
//! # Dispensing
//!
//! ```text
//!  cursor ──► [t4 t1 t7 t2 t9 ...]     (shuffled once, never-attempted tests)
//!                 │
//!   next_batch(n) ├─ up to n from the cursor while any remain
//!                 └─ otherwise exactly 1 from the retry stack (LIFO)
//!
//!  record_outcome(t, state) ──► state != Pass && attempts <= rerun_limit
//!                                   └──► push t onto the retry stack
//! ```
//!
//! The run is complete when the cursor is exhausted, the retry stack is
//! empty and no dispensed batch is still in flight.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};

/// Message recorded for tests whose batch produced no usable result.
pub const NOT_EXECUTED_MESSAGE: &str = "was not executed";

/// Where a test currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    /// Never attempted, or every attempt so far produced no result.
    Unexecuted,
    /// Last attempt passed.
    Pass,
    /// Last attempt failed.
    Failed,
}

/// One test and its most recent outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// `Module/Class/testMethod()` style identifier.
    pub id: String,

    /// State after the latest recorded attempt.
    pub state: TestState,

    /// Number of recorded attempts.
    pub attempts: u32,

    /// Duration of the latest attempt.
    pub duration: Duration,

    /// Failure message of the latest attempt; empty on pass.
    pub message: String,

    /// Identifier assigned by an external test plan, if any.
    pub numeric_id: Option<i64>,
}

impl TestCase {
    /// Creates an unexecuted test case.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: TestState::Unexecuted,
            attempts: 0,
            duration: Duration::ZERO,
            message: String::new(),
            numeric_id: None,
        }
    }

    /// Attaches an external numeric identifier.
    pub fn with_numeric_id(mut self, numeric_id: i64) -> Self {
        self.numeric_id = Some(numeric_id);
        self
    }
}

/// Normalizes a test identifier for matching.
///
/// The runner accepts `Module/Class/testX` while result bundles report
/// `Module/Class/testX()`; both map to the same key.
///
/// ```
/// use xcfleet::ledger::normalize_test_id;
///
/// assert_eq!(normalize_test_id("App/LoginTests/testValid()"), "App/LoginTests/testValid");
/// assert_eq!(normalize_test_id("App/LoginTests/testValid"), "App/LoginTests/testValid");
/// ```
pub fn normalize_test_id(id: &str) -> &str {
    id.trim().strip_suffix("()").unwrap_or(id.trim())
}

/// Result of recording one outcome.
#[derive(Debug, Clone)]
pub struct Recorded {
    /// The test after the update.
    pub test: TestCase,

    /// Whether the test was pushed onto the retry stack.
    pub requeued: bool,
}

/// Aggregate counts over the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    /// Number of tests in the ledger.
    pub total: usize,
    /// Tests whose last attempt passed.
    pub passed: usize,
    /// Tests whose last attempt failed.
    pub failed: usize,
    /// Tests without any result.
    pub unexecuted: usize,
    /// Extra attempts made across all tests.
    pub reran: usize,
}

#[derive(Debug)]
struct LedgerState {
    tests: Vec<TestCase>,
    index: HashMap<String, usize>,
    cursor: usize,
    retry: Vec<usize>,
    in_flight: HashSet<usize>,
}

/// The shared scheduling state of a run.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use xcfleet::ledger::{Ledger, TestCase, TestState};
///
/// let ledger = Ledger::new(vec![TestCase::new("App/A/testOne()")], 1);
///
/// let batch = ledger.next_batch(5);
/// assert_eq!(batch, vec!["App/A/testOne()".to_string()]);
///
/// let recorded = ledger
///     .record_outcome("App/A/testOne", TestState::Failed, Duration::from_secs(2), "boom")
///     .unwrap();
/// assert!(recorded.requeued);
/// assert_eq!(ledger.next_batch(5), batch);
/// ```
#[derive(Debug)]
pub struct Ledger {
    rerun_limit: u32,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// Creates a ledger over `tests`, shuffling the dispatch order.
    ///
    /// Shuffling spreads systemically slow or fragile tests across hosts.
    /// Duplicate identifiers (after normalization) are dropped.
    pub fn new(mut tests: Vec<TestCase>, rerun_limit: u32) -> Self {
        tests.shuffle(&mut thread_rng());
        Self::in_order(tests, rerun_limit)
    }

    /// Creates a ledger that dispenses `tests` in the given order.
    pub fn in_order(tests: Vec<TestCase>, rerun_limit: u32) -> Self {
        let mut index = HashMap::with_capacity(tests.len());
        let mut unique = Vec::with_capacity(tests.len());
        for test in tests {
            let key = normalize_test_id(&test.id).to_string();
            if index.contains_key(&key) {
                continue;
            }
            index.insert(key, unique.len());
            unique.push(test);
        }

        Self {
            rerun_limit,
            state: Mutex::new(LedgerState {
                tests: unique,
                index,
                cursor: 0,
                retry: Vec::new(),
                in_flight: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A panic while holding the lock leaves the state consistent: every
        // mutation below is a sequence of infallible field updates.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The configured rerun limit.
    pub fn rerun_limit(&self) -> u32 {
        self.rerun_limit
    }

    /// Number of tests in the ledger.
    pub fn len(&self) -> usize {
        self.lock().tests.len()
    }

    /// Returns `true` if the ledger holds no tests.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispenses the next batch of test identifiers.
    ///
    /// Takes up to `max_size` never-attempted tests; once those are
    /// exhausted, takes exactly one test from the retry stack, most
    /// recently failed first. An empty batch means there is no more work
    /// and the caller must stop.
    pub fn next_batch(&self, max_size: usize) -> Vec<String> {
        let mut state = self.lock();
        let state = &mut *state;

        let picked: Vec<usize> = if state.cursor < state.tests.len() {
            let end = state
                .cursor
                .saturating_add(max_size.max(1))
                .min(state.tests.len());
            let picked = (state.cursor..end).collect();
            state.cursor = end;
            picked
        } else {
            state.retry.pop().into_iter().collect()
        };

        picked
            .into_iter()
            .map(|idx| {
                state.in_flight.insert(idx);
                state.tests[idx].id.clone()
            })
            .collect()
    }

    /// Records the outcome of one attempt.
    ///
    /// Unknown identifiers are ignored and return `None`. A test that did
    /// not pass is re-queued while its attempt count is at most the rerun
    /// limit.
    pub fn record_outcome(
        &self,
        test_id: &str,
        state: TestState,
        duration: Duration,
        message: impl Into<String>,
    ) -> Option<Recorded> {
        let mut guard = self.lock();
        let ledger = &mut *guard;

        let idx = *ledger.index.get(normalize_test_id(test_id))?;
        ledger.in_flight.remove(&idx);

        let test = &mut ledger.tests[idx];
        test.attempts += 1;
        test.state = state;
        test.duration = duration;
        test.message = message.into();

        let requeued = state != TestState::Pass
            && test.attempts <= self.rerun_limit
            && !ledger.retry.contains(&idx);
        if requeued {
            ledger.retry.push(idx);
        }

        Some(Recorded {
            test: ledger.tests[idx].clone(),
            requeued,
        })
    }

    /// Returns dispensed tests to the ledger without recording an attempt.
    ///
    /// The tests keep their current state and are not dispensed again.
    pub fn release(&self, test_ids: &[String]) {
        let mut state = self.lock();
        for id in test_ids {
            if let Some(&idx) = state.index.get(normalize_test_id(id)) {
                state.in_flight.remove(&idx);
            }
        }
    }

    /// Returns `true` once no work remains anywhere.
    pub fn is_complete(&self) -> bool {
        let state = self.lock();
        state.cursor >= state.tests.len() && state.retry.is_empty() && state.in_flight.is_empty()
    }

    /// Number of tests waiting on the retry stack.
    pub fn pending_retries(&self) -> usize {
        self.lock().retry.len()
    }

    /// Number of tests currently dispensed and not yet recorded.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Looks up a test by identifier (either call-marker form).
    pub fn get(&self, test_id: &str) -> Option<TestCase> {
        let state = self.lock();
        state
            .index
            .get(normalize_test_id(test_id))
            .map(|&idx| state.tests[idx].clone())
    }

    /// Copies every test, in dispatch order.
    pub fn snapshot(&self) -> Vec<TestCase> {
        self.lock().tests.clone()
    }

    /// Counts tests by state.
    pub fn summary(&self) -> LedgerSummary {
        let state = self.lock();
        state
            .tests
            .iter()
            .fold(
                LedgerSummary {
                    total: state.tests.len(),
                    ..Default::default()
                },
                |mut summary, test| {
                    match test.state {
                        TestState::Pass => summary.passed += 1,
                        TestState::Failed => summary.failed += 1,
                        TestState::Unexecuted => summary.unexecuted += 1,
                    }
                    summary.reran += test.attempts.saturating_sub(1) as usize;
                    summary
                },
            )
    }
}

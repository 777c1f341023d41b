//! JSONL trails for tests that drive real processes or the build pipeline.
//!
//! With logging enabled, each guarded test appends its steps to
//! `target/test-logs/<test>.jsonl` and every `bfh*` tracing event lands in
//! `target/test-logs/all_tests.jsonl`.
//!
//! - `BFH_TEST_LOGGING=1|0` forces the trail on or off (default: on under CI)
//! - `BFH_TEST_LOG_LEVEL` filters the mirrored events (default: `info`)

use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Panicked,
}

/// One line of a trail file.
#[derive(Debug, Clone, Serialize)]
pub struct TrailEntry {
    pub test: String,
    pub step: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

static SUBSCRIBER: Once = Once::new();

/// Route `bfh*` events to the test writer and the shared JSONL file.
pub fn init_test_subscriber() {
    SUBSCRIBER.call_once(|| {
        let level = std::env::var("BFH_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!("bfh={level},bfh_common={level}"))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let shared = trail_file("all_tests").map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
        });

        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(shared)
                .with(tracing_subscriber::fmt::layer().with_test_writer().compact()),
        );
    });
}

fn trail_dir() -> PathBuf {
    if let Ok(target) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target).join("test-logs");
    }
    let mut dir = std::env::current_dir().unwrap_or_default();
    loop {
        if dir.join("target").is_dir() {
            return dir.join("target").join("test-logs");
        }
        if !dir.pop() {
            return PathBuf::from("target/test-logs");
        }
    }
}

fn trail_file(test: &str) -> Option<File> {
    let dir = trail_dir();
    std::fs::create_dir_all(&dir).ok()?;
    let stem: String = test
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    File::create(dir.join(format!("{stem}.jsonl"))).ok()
}

/// Step recorder for one test.
pub struct TestTrail {
    test: String,
    started: Instant,
    entries: Mutex<Vec<TrailEntry>>,
    file: Option<Mutex<File>>,
}

impl TestTrail {
    pub fn new(test: &str) -> Self {
        let trail = Self {
            test: test.to_string(),
            started: Instant::now(),
            entries: Mutex::new(Vec::new()),
            file: trail_file(test).map(Mutex::new),
        };
        trail.step("start");
        trail
    }

    pub fn step(&self, step: &str) {
        self.push(step, None);
    }

    pub fn note(&self, step: &str, detail: serde_json::Value) {
        self.push(step, Some(detail));
    }

    fn push(&self, step: &str, detail: Option<serde_json::Value>) {
        let entry = TrailEntry {
            test: self.test.clone(),
            step: step.to_string(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            detail,
        };
        tracing::info!(test = %entry.test, step = %entry.step, elapsed_ms = entry.elapsed_ms, "test step");

        if let (Some(file), Ok(line)) = (&self.file, serde_json::to_string(&entry))
            && let Ok(mut file) = file.lock()
        {
            let _ = writeln!(file, "{line}");
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<TrailEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn finish(&self, outcome: TestOutcome) {
        self.note("finish", serde_json::json!({ "outcome": outcome }));
    }
}

/// Writes the test's outcome when dropped. Inert unless test logging is on.
pub struct TestGuard {
    trail: Option<TestTrail>,
}

impl TestGuard {
    pub fn new(test: &str) -> Self {
        let enabled = match std::env::var("BFH_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var_os("CI").is_some(),
        };
        let trail = enabled.then(|| {
            init_test_subscriber();
            TestTrail::new(test)
        });
        Self { trail }
    }

    pub fn step(&self, step: &str) {
        if let Some(trail) = &self.trail {
            trail.step(step);
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if let Some(trail) = self.trail.take() {
            trail.finish(if std::thread::panicking() {
                TestOutcome::Panicked
            } else {
                TestOutcome::Passed
            });
        }
    }
}

/// A [`TestGuard`] named after the enclosing function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn here() {}
        fn name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let path = name_of(here);
        let path = path.strip_suffix("::here").unwrap_or(path);
        $crate::testing::TestGuard::new(path.rsplit("::").next().unwrap_or(path))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trail_records_steps_in_order() {
        let trail = TestTrail::new("test_trail_records_steps_in_order");
        trail.step("spawn");
        trail.note("terminate", serde_json::json!({ "pid": 42 }));
        trail.finish(TestOutcome::Passed);

        let steps: Vec<String> = trail.entries().into_iter().map(|e| e.step).collect();
        assert_eq!(steps, ["start", "spawn", "terminate", "finish"]);
        let last = trail.entries().pop().unwrap();
        assert_eq!(last.detail, Some(serde_json::json!({ "outcome": "passed" })));
    }

    #[test]
    fn test_entry_without_detail_omits_field() {
        let entry = TrailEntry {
            test: "t".to_string(),
            step: "start".to_string(),
            elapsed_ms: 0,
            detail: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_inert_guard_ignores_steps() {
        let guard = TestGuard { trail: None };
        guard.step("ignored");
    }

    #[test]
    fn test_guard_macro_names_the_test() {
        let _guard = crate::test_guard!();
    }
}

//! Shared fixtures for pipeline tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ModelArg, WorkerConfig};
use crate::pipeline::worker::{RawOutput, RedactionWorker, WorkerError};

/// Smallest byte string that passes JPEG magic-byte detection.
pub const TINY_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0xFF, 0xD9,
];

/// Worker config that runs `script` through `/bin/sh -c`.
/// Inside the script, `$@` holds the worker arguments.
pub fn sh_worker_config(script: &str) -> WorkerConfig {
    WorkerConfig {
        program: "/bin/sh".into(),
        leading_args: vec!["-c".into(), script.into(), "fake-worker".into()],
        input_flag: "--input".into(),
        models: vec![
            ModelArg::new("--face-model", "/models/face.pt"),
            ModelArg::new("--plate-model", "/models/plate.pt"),
        ],
        timeout: Duration::from_secs(10),
        max_concurrent: 2,
        stderr_excerpt_chars: 2000,
    }
}

/// In-process worker returning canned results.
///
/// Records every input path it saw, whether the file existed at call time,
/// and the peak number of overlapping calls.
pub struct ScriptedWorker {
    result: Result<String, (Option<i32>, String)>,
    delay: Duration,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<(std::path::PathBuf, bool)>>,
}

impl ScriptedWorker {
    pub fn succeeding(stdout: &str) -> Self {
        Self::with_result(Ok(stdout.to_string()))
    }

    pub fn failing(exit_code: i32, stderr: &str) -> Self {
        Self::with_result(Err((Some(exit_code), stderr.to_string())))
    }

    fn with_result(result: Result<String, (Option<i32>, String)>) -> Self {
        Self {
            result,
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl RedactionWorker for ScriptedWorker {
    async fn invoke(&self, input: &Path) -> Result<RawOutput, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((input.to_path_buf(), input.exists()));

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match &self.result {
            Ok(stdout) => Ok(RawOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
                exit_code: Some(0),
            }),
            Err((exit_code, stderr)) => Err(WorkerError::Failed {
                exit_code: *exit_code,
                stderr_excerpt: stderr.clone(),
            }),
        }
    }
}

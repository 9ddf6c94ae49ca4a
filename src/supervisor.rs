//! Job supervisor: owns one job from dequeue to terminal state.
//!
//! The supervisor transitions the job to RUNNING, spawns the external worker
//! script with piped stdout/stderr, streams every line to the log bus while
//! keeping a bounded tail for the persisted snippet, enforces the wall-clock
//! timeout, performs the soft/hard termination protocol on timeout or
//! revocation, and commits the terminal row exactly once before the broker
//! delivery is acknowledged. Re-entry is idempotent: a job that is no longer
//! PENDING short-circuits.

use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::JobTask;
use crate::config::Config;
use crate::database::{JobDatabase, JobStatus};
use crate::error::Result;
use crate::logbus::{JobLogPublisher, LogBus, LogStream};

/// Synthetic exit codes used when the operating system does not provide one.
pub const EXIT_TIMEOUT: i64 = -99;
pub const EXIT_SOFT_TERMINATED: i64 = -15;
pub const EXIT_HARD_KILLED: i64 = -9;
const EXIT_SPAWN_FAILED: i64 = -1;

#[derive(Debug, Clone)]
pub struct JobRunReport {
    pub job_id: String,
    pub status: JobStatus,
    pub exit_code: Option<i64>,
    pub message: String,
}

/// How the supervised process run ended, before outcome mapping.
#[derive(Debug)]
enum RunEnd {
    Exited(i64),
    TimedOut,
    Cancelled,
    ReaderFailed,
    WaitError(String),
}

pub struct Supervisor {
    config: Config,
    database: JobDatabase,
    logbus: Arc<LogBus>,
}

impl Supervisor {
    pub fn new(config: Config, database: JobDatabase, logbus: Arc<LogBus>) -> Self {
        Self {
            config,
            database,
            logbus,
        }
    }

    /// Execute one broker delivery end to end. `Ok` means the delivery may
    /// be acknowledged (the terminal state is committed, or the job needed
    /// no work); `Err` means the terminal commit did not happen and the
    /// task must be redelivered.
    pub async fn run_job(&self, task: &JobTask, cancel: CancellationToken) -> Result<JobRunReport> {
        let job_id = task.payload.job_id.clone();

        // Step 1: load and short-circuit duplicates.
        let Some(job) = self.database.get_job(&job_id).await? else {
            warn!("Broker delivered unknown job {}; acknowledging", job_id);
            return Ok(JobRunReport {
                job_id,
                status: JobStatus::Failed,
                exit_code: None,
                message: "unknown job".to_string(),
            });
        };

        match job.status {
            JobStatus::Pending => {}
            JobStatus::Cancelling => {
                // Cancelled while still queued: no process was ever spawned.
                info!("Job {} cancelled before start; finalizing as CANCELLED", job_id);
                return self
                    .finalize(&job_id, JobStatus::Cancelled, EXIT_SOFT_TERMINATED, "Job cancelled", "")
                    .await;
            }
            other => {
                info!(
                    "Duplicate delivery for job {} (status {}); acknowledging without work",
                    job_id, other
                );
                return Ok(JobRunReport {
                    job_id,
                    status: other,
                    exit_code: job.exit_code,
                    message: job.result_message.unwrap_or_default(),
                });
            }
        }

        // Step 2: acquire the running context.
        let started_at = Utc::now();
        if !self
            .database
            .update_job_start_details(&job_id, &task.task_id, started_at)
            .await?
        {
            // The row moved between the read and the guard; re-check.
            let status = self
                .database
                .get_job(&job_id)
                .await?
                .map(|j| j.status)
                .unwrap_or(JobStatus::Failed);
            if status == JobStatus::Cancelling {
                return self
                    .finalize(&job_id, JobStatus::Cancelled, EXIT_SOFT_TERMINATED, "Job cancelled", "")
                    .await;
            }
            info!("Job {} raced to status {}; acknowledging", job_id, status);
            return Ok(JobRunReport {
                job_id,
                status,
                exit_code: None,
                message: String::new(),
            });
        }

        let publisher = match self.logbus.connect(&job_id) {
            Ok(publisher) => Some(Arc::new(publisher)),
            Err(e) => {
                // The job must not fail because streaming is unavailable.
                warn!("Log bus unavailable for job {}: {}; publishes skipped", job_id, e);
                None
            }
        };
        if let Some(publisher) = &publisher {
            let _ = publisher.publish_status(JobStatus::Running, None);
        }

        info!("🚀 Job {}: RUNNING (folder: {})", short_id(&job_id), task.payload.folder);

        // Steps 3-6: spawn, stream, wait, map.
        let (status, exit_code, message, snippet) = self
            .execute_and_supervise(task, publisher.clone(), cancel)
            .await;

        // Step 7-8: finalize (commit then publish) and acknowledge.
        let report = self
            .finalize_with_publisher(&job_id, status, exit_code, &message, &snippet, publisher.as_deref())
            .await?;

        match report.status {
            JobStatus::Succeeded => {
                info!("✅ Job {}: SUCCEEDED (exit 0)", short_id(&job_id));
            }
            status => {
                info!("❌ Job {}: {} (exit {})", short_id(&job_id), status, exit_code);
            }
        }
        Ok(report)
    }

    /// Spawn the worker script and supervise it to completion. Classifies
    /// every failure mode internally; the returned tuple is
    /// (status, exit_code, result message, snippet).
    async fn execute_and_supervise(
        &self,
        task: &JobTask,
        publisher: Option<Arc<JobLogPublisher>>,
        cancel: CancellationToken,
    ) -> (JobStatus, i64, String, String) {
        let job_id = &task.payload.job_id;
        let snippet = Arc::new(Mutex::new(SnippetBuffer::new(
            self.config.jobs.log_snippet_max_len,
        )));

        let (program, mut args) = match self.resolve_worker_script() {
            Ok(resolved) => resolved,
            Err(message) => {
                error!("Job {}: {}", job_id, message);
                push_snippet(&snippet, &message);
                return (
                    JobStatus::Failed,
                    EXIT_SPAWN_FAILED,
                    "script missing".to_string(),
                    snippet_contents(&snippet),
                );
            }
        };
        args.extend([
            "--folder".to_string(),
            task.payload.folder.clone(),
            "--language".to_string(),
            task.payload.language.clone(),
            "--log-level".to_string(),
            task.payload.level.clone(),
        ]);

        debug!("Job {}: spawning {:?} {:?}", job_id, program, args);
        let mut child = match Command::new(&program)
            .args(&args)
            .env("SUBWARDEN_JOB_ID", job_id)
            .env("SUBWARDEN_FOLDER", &task.payload.folder)
            .env("SUBWARDEN_LANGUAGE", &task.payload.language)
            .env("SUBWARDEN_LOG_LEVEL", &task.payload.level)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to spawn worker script: {}", e);
                error!("Job {}: {}", job_id, message);
                push_snippet(&snippet, &message);
                return (
                    JobStatus::Failed,
                    EXIT_SPAWN_FAILED,
                    message,
                    snippet_contents(&snippet),
                );
            }
        };

        let pid = child.id();
        let fatal = CancellationToken::new();
        let last_stdout = Arc::new(Mutex::new(None));
        let last_stderr = Arc::new(Mutex::new(None));

        let stdout_task = child.stdout.take().map(|out| {
            spawn_reader(
                out,
                LogStream::Stdout,
                publisher.clone(),
                snippet.clone(),
                last_stdout.clone(),
                fatal.clone(),
            )
        });
        let stderr_task = child.stderr.take().map(|err| {
            spawn_reader(
                err,
                LogStream::Stderr,
                publisher.clone(),
                snippet.clone(),
                last_stderr.clone(),
                fatal.clone(),
            )
        });

        // The readers and the waiter all live under the single job timeout;
        // cancellation of the outer context escalates to process
        // termination rather than waiting for the child on its own.
        let t_job = Duration::from_secs(self.config.jobs.timeout_sec);
        let end = tokio::select! {
            _ = cancel.cancelled() => RunEnd::Cancelled,
            _ = fatal.cancelled() => RunEnd::ReaderFailed,
            res = tokio::time::timeout(t_job, child.wait()) => match res {
                Ok(Ok(status)) => RunEnd::Exited(exit_code_of(&status)),
                Ok(Err(e)) => RunEnd::WaitError(e.to_string()),
                Err(_) => RunEnd::TimedOut,
            },
        };

        // Step 5: termination protocol for every non-exit ending.
        let mut hard_killed = false;
        if !matches!(end, RunEnd::Exited(_)) {
            let grace = Duration::from_secs(self.config.jobs.terminate_grace_period_s);
            if let Some(pid) = pid {
                debug!("Job {}: sending soft termination to pid {}", job_id, pid);
                soft_terminate(pid);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(_)) => {
                    debug!("Job {}: process exited within grace period", job_id);
                }
                _ => {
                    warn!("Job {}: grace period expired, sending hard kill", job_id);
                    if let Err(e) = child.kill().await {
                        warn!("Job {}: hard kill failed: {}", job_id, e);
                    }
                    hard_killed = true;
                }
            }
        }

        // Drain whatever is left in the pipes, best effort.
        let drain = async {
            if let Some(task) = stdout_task {
                if task.await.is_err() {
                    warn!("Job {}: stdout reader task failed during drain", job_id);
                }
            }
            if let Some(task) = stderr_task {
                if task.await.is_err() {
                    warn!("Job {}: stderr reader task failed during drain", job_id);
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;

        let last_stdout = last_stdout.lock().map(|l| l.clone()).unwrap_or_default();
        let last_stderr = last_stderr.lock().map(|l| l.clone()).unwrap_or_default();
        let snippet = snippet_contents(&snippet);

        // Step 6: outcome mapping.
        match end {
            RunEnd::Exited(0) => (
                JobStatus::Succeeded,
                0,
                last_stdout.unwrap_or_default(),
                snippet,
            ),
            RunEnd::Exited(code) => (
                JobStatus::Failed,
                code,
                last_stderr.or(last_stdout).unwrap_or_default(),
                snippet,
            ),
            RunEnd::TimedOut => (JobStatus::Failed, EXIT_TIMEOUT, "timeout".to_string(), snippet),
            RunEnd::Cancelled => (
                JobStatus::Cancelled,
                if hard_killed { EXIT_HARD_KILLED } else { EXIT_SOFT_TERMINATED },
                "Job cancelled".to_string(),
                snippet,
            ),
            RunEnd::ReaderFailed => (
                JobStatus::Failed,
                if hard_killed { EXIT_HARD_KILLED } else { EXIT_SOFT_TERMINATED },
                "log reader failed".to_string(),
                snippet,
            ),
            RunEnd::WaitError(e) => (
                JobStatus::Failed,
                EXIT_SPAWN_FAILED,
                format!("Failed to wait on worker process: {}", e),
                snippet,
            ),
        }
    }

    /// Terminal FAILED write for a delivery whose retry budget is exhausted.
    /// Called by the worker pool so the job does not stay RUNNING forever.
    pub async fn fail_undeliverable(&self, job_id: &str, reason: &str) -> Result<JobRunReport> {
        self.finalize(job_id, JobStatus::Failed, EXIT_SPAWN_FAILED, reason, "")
            .await
    }

    /// Finalize without an existing publisher (jobs cancelled before any
    /// process was spawned still emit the terminal envelope).
    async fn finalize(
        &self,
        job_id: &str,
        status: JobStatus,
        exit_code: i64,
        message: &str,
        snippet: &str,
    ) -> Result<JobRunReport> {
        let publisher = self.logbus.connect(job_id).ok();
        self.finalize_with_publisher(job_id, status, exit_code, message, snippet, publisher.as_ref())
            .await
    }

    /// Commit the terminal row, then publish the terminal status envelope.
    /// Commit-then-publish on every path: if the commit fails the delivery
    /// is redelivered and no terminal envelope was emitted; if the row was
    /// already terminal (raced), nothing is overwritten or published.
    async fn finalize_with_publisher(
        &self,
        job_id: &str,
        status: JobStatus,
        exit_code: i64,
        message: &str,
        snippet: &str,
        publisher: Option<&JobLogPublisher>,
    ) -> Result<JobRunReport> {
        let result_message = truncate_single_line(message, self.config.jobs.result_message_max_len);
        let log_snippet = truncate_tail(snippet, self.config.jobs.log_snippet_max_len);

        let updated = self
            .database
            .update_job_completion_details(
                job_id,
                status,
                exit_code,
                Utc::now(),
                &result_message,
                &log_snippet,
                None,
            )
            .await?;

        if updated {
            if let Some(publisher) = publisher {
                let _ = publisher.publish_status(status, Some(exit_code));
            }
        } else {
            // Another writer won; the row is terminal and must stay as-is.
            warn!(
                "Job {} already terminal; skipping completion write for status {}",
                job_id, status
            );
        }

        Ok(JobRunReport {
            job_id: job_id.to_string(),
            status,
            exit_code: Some(exit_code),
            message: result_message,
        })
    }

    /// Resolve the worker script. An empty configured path means "this
    /// binary, `process` subcommand".
    fn resolve_worker_script(&self) -> std::result::Result<(PathBuf, Vec<String>), String> {
        let configured = self.config.jobs.worker_script_path.trim();
        if configured.is_empty() {
            let exe = std::env::current_exe()
                .map_err(|e| format!("script missing: cannot resolve own executable: {}", e))?;
            return Ok((exe, vec!["process".to_string()]));
        }
        let path = PathBuf::from(configured);
        if !path.exists() {
            return Err(format!("script missing: {}", path.display()));
        }
        Ok((path, Vec::new()))
    }
}

fn short_id(job_id: &str) -> &str {
    &job_id[..8.min(job_id.len())]
}

fn spawn_reader<R>(
    reader: R,
    stream: LogStream,
    publisher: Option<Arc<JobLogPublisher>>,
    snippet: Arc<Mutex<SnippetBuffer>>,
    last_line: Arc<Mutex<Option<String>>>,
    fatal: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(publisher) = &publisher {
                        let _ = publisher.publish_log(stream, &line);
                    }
                    if let Ok(mut buffer) = snippet.lock() {
                        buffer.push(&line);
                    }
                    if !line.trim().is_empty() {
                        if let Ok(mut last) = last_line.lock() {
                            *last = Some(line);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // A broken pipe reader is fatal for the job.
                    warn!("Pipe reader ({:?}) failed: {}", stream, e);
                    fatal.cancel();
                    break;
                }
            }
        }
    })
}

fn exit_code_of(status: &std::process::ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -(signal as i64);
        }
    }
    EXIT_SPAWN_FAILED
}

/// Soft termination signal (SIGTERM on unix). Shimmed directly to avoid a
/// platform crate for a single syscall.
#[cfg(unix)]
fn soft_terminate(pid: u32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    unsafe {
        kill(pid as i32, 15);
    }
}

#[cfg(not(unix))]
fn soft_terminate(_pid: u32) {}

/// Bounded line buffer keeping the final bytes of the combined output for
/// the persisted snippet.
struct SnippetBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
}

impl SnippetBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes: max_bytes.max(1),
        }
    }

    fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.max_bytes && self.lines.len() > 1 {
            if let Some(evicted) = self.lines.pop_front() {
                self.bytes -= evicted.len() + 1;
            }
        }
    }

    fn contents(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn push_snippet(snippet: &Arc<Mutex<SnippetBuffer>>, line: &str) {
    if let Ok(mut buffer) = snippet.lock() {
        buffer.push(line);
    }
}

fn snippet_contents(snippet: &Arc<Mutex<SnippetBuffer>>) -> String {
    snippet.lock().map(|b| b.contents()).unwrap_or_default()
}

/// Tail-truncate to at most `max_len` bytes, aligned to a char boundary.
pub fn truncate_tail(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut start = text.len() - max_len;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Single-line variant for result messages.
pub fn truncate_single_line(text: &str, max_len: usize) -> String {
    let single = text.replace(['\n', '\r'], " ");
    truncate_tail(single.trim(), max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobPayload, JobTask};
    use crate::database::test_support::{temp_database, test_new_job, test_user};
    use crate::database::{Job, JobDatabase};
    use crate::logbus::{Envelope, EnvelopeBody};

    struct Harness {
        supervisor: Supervisor,
        database: JobDatabase,
        logbus: Arc<LogBus>,
        job: Job,
        task: JobTask,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    async fn harness(script_body: &str, mutate: impl FnOnce(&mut Config)) -> Harness {
        let (database, db_dir) = temp_database().await;
        let user = test_user("user", false);
        database.insert_user(&user).await.unwrap();
        let job = database
            .insert_job(&test_new_job(&user, "/media/movies/X"))
            .await
            .unwrap();

        let script_dir = tempfile::tempdir().unwrap();
        let script_path = script_dir.path().join("worker.sh");
        std::fs::write(&script_path, format!("#!/bin/sh\n{}\n", script_body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut config = Config::load().unwrap();
        config.jobs.worker_script_path = script_path.display().to_string();
        config.jobs.timeout_sec = 30;
        config.jobs.terminate_grace_period_s = 1;
        mutate(&mut config);

        let logbus = Arc::new(LogBus::new(config.jobs.log_history_max_items));
        let supervisor = Supervisor::new(config, database.clone(), logbus.clone());
        let task = JobTask {
            payload: JobPayload {
                job_id: job.id.clone(),
                folder: job.folder.clone(),
                language: job.language.clone(),
                level: job.log_level.clone(),
            },
            task_id: uuid::Uuid::new_v4().to_string(),
            attempt: 1,
        };

        Harness {
            supervisor,
            database,
            logbus,
            job,
            task,
            _dirs: (db_dir, script_dir),
        }
    }

    fn statuses(history: &[String]) -> Vec<(JobStatus, Option<i64>)> {
        history
            .iter()
            .filter_map(|raw| serde_json::from_str::<Envelope>(raw).ok())
            .filter_map(|env| match env.body {
                EnvelopeBody::Status {
                    status, exit_code, ..
                } => Some((status, exit_code)),
                _ => None,
            })
            .collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn happy_path_succeeds_with_last_stdout_line() {
        let h = harness("echo done\necho warn 1>&2\nexit 0", |_| {}).await;
        let report = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.message, "done");

        let job = h.database.get_job(&h.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.result_message.as_deref(), Some("done"));
        let snippet = job.log_snippet.unwrap();
        assert!(snippet.contains("done"));
        assert!(snippet.contains("warn"));
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());

        let (history, _) = h.logbus.subscribe(&h.job.id);
        let status_envelopes = statuses(&history);
        assert_eq!(status_envelopes.first().unwrap().0, JobStatus::Running);
        assert_eq!(
            status_envelopes.last().unwrap(),
            &(JobStatus::Succeeded, Some(0))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_failure_takes_last_stderr_line() {
        let h = harness(
            "echo some output\necho CRITICAL ERROR IN SCRIPT 1>&2\nexit 3",
            |_| {},
        )
        .await;
        let report = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.message, "CRITICAL ERROR IN SCRIPT");

        let (history, _) = h.logbus.subscribe(&h.job.id);
        let last = statuses(&history).last().cloned().unwrap();
        assert_eq!(last, (JobStatus::Failed, Some(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_produces_synthetic_exit_code() {
        let h = harness("sleep 60", |cfg| {
            cfg.jobs.timeout_sec = 1;
            cfg.jobs.terminate_grace_period_s = 1;
        })
        .await;
        let report = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.exit_code, Some(EXIT_TIMEOUT));
        assert_eq!(report.message, "timeout");

        let job = h.database.get_job(&h.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(EXIT_TIMEOUT));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_timeout_fails_immediately() {
        let h = harness("sleep 60", |cfg| {
            cfg.jobs.timeout_sec = 0;
            cfg.jobs.terminate_grace_period_s = 0;
        })
        .await;
        let report = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.exit_code, Some(EXIT_TIMEOUT));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_cancel_produces_cancelled_with_soft_exit() {
        let h = harness("sleep 60", |cfg| {
            cfg.jobs.terminate_grace_period_s = 5;
        })
        .await;
        let cancel = CancellationToken::new();

        let database = h.database.clone();
        let job_id = h.job.id.clone();
        let cancel_side = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            database.mark_job_cancelling(&job_id).await.unwrap();
            cancel_side.cancel();
        });

        let report = h.supervisor.run_job(&h.task, cancel).await.unwrap();
        assert_eq!(report.status, JobStatus::Cancelled);
        assert_eq!(report.exit_code, Some(EXIT_SOFT_TERMINATED));

        let job = h.database.get_job(&h.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.exit_code, Some(EXIT_SOFT_TERMINATED));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_while_queued_finalizes_without_spawning() {
        let h = harness("echo should not run", |_| {}).await;
        h.database.mark_job_cancelling(&h.job.id).await.unwrap();

        let report = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, JobStatus::Cancelled);
        assert_eq!(report.exit_code, Some(EXIT_SOFT_TERMINATED));

        let (history, _) = h.logbus.subscribe(&h.job.id);
        let last = statuses(&history).last().cloned().unwrap();
        assert_eq!(last, (JobStatus::Cancelled, Some(EXIT_SOFT_TERMINATED)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn redelivery_of_terminal_job_is_a_noop() {
        let h = harness("echo done", |_| {}).await;
        let first = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Succeeded);
        let completed_at = h
            .database
            .get_job(&h.job.id)
            .await
            .unwrap()
            .unwrap()
            .completed_at;

        let second = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.status, JobStatus::Succeeded);
        let job = h.database.get_job(&h.job.id).await.unwrap().unwrap();
        assert_eq!(job.completed_at, completed_at, "terminal row must not move");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_script_fails_the_job() {
        let h = harness("echo unused", |cfg| {
            cfg.jobs.worker_script_path = "/nonexistent/worker.sh".to_string();
        })
        .await;
        let report = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.message, "script missing");

        let job = h.database.get_job(&h.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_at.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_output_yields_empty_message_not_null() {
        let h = harness("exit 0", |_| {}).await;
        let report = h
            .supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(report.message, "");

        let job = h.database.get_job(&h.job.id).await.unwrap().unwrap();
        assert_eq!(job.result_message.as_deref(), Some(""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn snippet_never_exceeds_configured_cap() {
        let h = harness("i=0; while [ $i -lt 200 ]; do echo line $i; i=$((i+1)); done", |cfg| {
            cfg.jobs.log_snippet_max_len = 120;
        })
        .await;
        h.supervisor
            .run_job(&h.task, CancellationToken::new())
            .await
            .unwrap();

        let job = h.database.get_job(&h.job.id).await.unwrap().unwrap();
        let snippet = job.log_snippet.unwrap();
        assert!(snippet.len() <= 120);
        // Tail truncation keeps the most recent output.
        assert!(snippet.contains("line 199"));
    }

    #[test]
    fn truncate_tail_is_byte_bounded_and_char_aligned() {
        assert_eq!(truncate_tail("abcdef", 10), "abcdef");
        assert_eq!(truncate_tail("abcdef", 3), "def");
        let snipped = truncate_tail("țățâș", 4);
        assert!(snipped.len() <= 4);
        assert!(snipped.chars().count() >= 1);
    }

    #[test]
    fn truncate_single_line_flattens_newlines() {
        assert_eq!(truncate_single_line("a\nb\r\nc", 100), "a b  c");
    }
}

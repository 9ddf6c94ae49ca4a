//! Worker pool: a fixed number of supervisor slots competing on the broker
//! queue. Each slot owns one job at a time; slots share nothing but the
//! broker and the job store.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::Broker;
use crate::supervisor::Supervisor;

pub fn spawn_workers(
    count: usize,
    broker: Arc<Broker>,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|slot| {
            let broker = broker.clone();
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_worker_slot(slot, broker, supervisor, shutdown).await;
            })
        })
        .collect()
}

async fn run_worker_slot(
    slot: usize,
    broker: Arc<Broker>,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) {
    info!("Worker slot {} started", slot);
    loop {
        let task = tokio::select! {
            _ = shutdown.cancelled() => break,
            task = broker.next_task() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let cancel = broker.cancellation_for(&task.task_id);
        match supervisor.run_job(&task, cancel).await {
            Ok(report) => {
                // Ack-late: the terminal commit already happened.
                broker.ack(&task.task_id);
                info!(
                    "Worker slot {} finished job {} with status {}",
                    slot, report.job_id, report.status
                );
            }
            Err(e) => {
                error!(
                    "Worker slot {} failed job {} before commit: {}",
                    slot, task.payload.job_id, e
                );
                let job_id = task.payload.job_id.clone();
                if !broker.redeliver(task) {
                    // Delivery budget exhausted; make the failure terminal so
                    // the job does not linger in RUNNING forever.
                    if let Err(e) = supervisor
                        .fail_undeliverable(&job_id, "Job failed after exhausting redeliveries")
                        .await
                    {
                        error!("Could not finalize undeliverable job {}: {}", job_id, e);
                    }
                }
            }
        }
    }
    info!("Worker slot {} stopped", slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::JobPayload;
    use crate::config::Config;
    use crate::database::test_support::{temp_database, test_new_job, test_user};
    use crate::database::JobStatus;
    use crate::logbus::LogBus;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn pool_drains_the_queue_with_competing_consumers() {
        let (database, _db_dir) = temp_database().await;
        let user = test_user("user", false);
        database.insert_user(&user).await.unwrap();

        let script_dir = tempfile::tempdir().unwrap();
        let script_path = script_dir.path().join("worker.sh");
        std::fs::write(&script_path, "#!/bin/sh\necho finished\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut config = Config::load().unwrap();
        config.jobs.worker_script_path = script_path.display().to_string();
        config.jobs.timeout_sec = 30;

        let logbus = Arc::new(LogBus::new(100));
        let supervisor = Arc::new(Supervisor::new(config, database.clone(), logbus));
        let broker = Arc::new(Broker::new(2));
        let shutdown = CancellationToken::new();

        let mut job_ids = Vec::new();
        for _ in 0..4 {
            let job = database
                .insert_job(&test_new_job(&user, "/media/movies/X"))
                .await
                .unwrap();
            broker
                .enqueue(JobPayload {
                    job_id: job.id.clone(),
                    folder: job.folder.clone(),
                    language: job.language.clone(),
                    level: job.log_level.clone(),
                })
                .unwrap();
            job_ids.push(job.id);
        }

        let handles = spawn_workers(2, broker.clone(), supervisor, shutdown.clone());

        // Wait for every job to reach a terminal state.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let mut done = 0;
            for job_id in &job_ids {
                let job = database.get_job(job_id).await.unwrap().unwrap();
                if job.status.is_terminal() {
                    done += 1;
                }
            }
            if done == job_ids.len() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "jobs did not finish in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for job_id in &job_ids {
            let job = database.get_job(job_id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Succeeded);
            assert_eq!(job.result_message.as_deref(), Some("finished"));
        }

        shutdown.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

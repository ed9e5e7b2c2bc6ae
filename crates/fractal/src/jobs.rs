//! The internal-job runner and the periodic jobs it drives.
//!
//! Server-side housekeeping runs through a generic job table: the service
//! tick, the manager heartbeat reaper, and the stale-record sweep are
//! repeating jobs that reschedule themselves after each run. Jobs report
//! progress through the store, which doubles as the cancellation channel.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use models::{Result, ServerError};

use crate::config::FractalConfig;
use crate::services::iterate_service;
use crate::store::{InternalJobRow, InternalJobStatus, NewInternalJob, Store};

pub const JOB_ITERATE_SERVICES: &str = "iterate_services";
pub const JOB_CHECK_HEARTBEATS: &str = "check_manager_heartbeats";
pub const JOB_SWEEP_STALE: &str = "sweep_stale_records";

/// Polls the internal job table and runs due jobs.
pub struct JobRunner {
    store: Arc<dyn Store>,
    config: FractalConfig,
    runner_uuid: String,
}

impl JobRunner {
    pub fn new(store: Arc<dyn Store>, config: FractalConfig) -> Self {
        Self {
            store,
            config,
            runner_uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Schedule the built-in periodic jobs. `unique_name` makes this
    /// idempotent across restarts and multiple runners.
    pub async fn bootstrap(&self) -> Result<()> {
        let now = Utc::now();
        let jobs = [
            NewInternalJob {
                name: JOB_ITERATE_SERVICES.to_string(),
                scheduled_for: now,
                unique_name: Some(JOB_ITERATE_SERVICES.to_string()),
                serial_group: Some("services".to_string()),
                repeat_delay_seconds: Some(
                    self.config.service_iteration_interval.as_secs() as i64
                ),
                kwargs: json!({}),
            },
            NewInternalJob {
                name: JOB_CHECK_HEARTBEATS.to_string(),
                scheduled_for: now,
                unique_name: Some(JOB_CHECK_HEARTBEATS.to_string()),
                serial_group: Some("managers".to_string()),
                repeat_delay_seconds: Some(
                    (self.config.heartbeat_timeout.as_secs() / 2).max(1) as i64,
                ),
                kwargs: json!({}),
            },
            NewInternalJob {
                name: JOB_SWEEP_STALE.to_string(),
                scheduled_for: now,
                unique_name: Some(JOB_SWEEP_STALE.to_string()),
                serial_group: Some("managers".to_string()),
                repeat_delay_seconds: Some(self.config.heartbeat_timeout.as_secs().max(1) as i64),
                kwargs: json!({}),
            },
        ];

        for job in jobs {
            let id = self.store.add_internal_job(job).await?;
            tracing::debug!(%id, "bootstrapped periodic job");
        }
        Ok(())
    }

    /// Poll and run jobs until `shutdown` resolves.
    pub async fn serve(&self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            let claimed = match self
                .store
                .claim_internal_jobs(&self.runner_uuid, 4)
                .await
            {
                Ok(jobs) => jobs,
                Err(err) => {
                    tracing::error!(?err, "failed to claim internal jobs (will retry)");
                    Vec::new()
                }
            };

            for job in claimed {
                let job_id = job.id;
                let name = job.name.clone();
                if let Err(err) = self.run_job(job).await {
                    tracing::warn!(%job_id, %name, ?err, "internal job failed");
                    let _ = self
                        .store
                        .finish_internal_job(
                            job_id,
                            InternalJobStatus::Error,
                            Some(json!({ "error": err.to_string() })),
                        )
                        .await;
                }
            }

            // Jitter the poll so multiple runners spread their dequeues.
            let jitter = 0.9 + rand::random::<f64>() * 0.2;
            let sleep = self.config.internal_job_poll_interval.mul_f64(jitter);
            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                () = &mut shutdown => {
                    tracing::info!("job runner signaled to stop");
                    return;
                }
            }
        }
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, name = %job.name))]
    async fn run_job(&self, job: InternalJobRow) -> Result<()> {
        let result = match job.name.as_str() {
            JOB_ITERATE_SERVICES => self.service_tick(job.id).await?,
            JOB_CHECK_HEARTBEATS => self.check_heartbeats().await?,
            JOB_SWEEP_STALE => self.sweep_stale().await?,
            other => {
                return Err(ServerError::Internal(format!(
                    "unknown internal job '{other}'"
                )))
            }
        };

        self.store
            .finish_internal_job(job.id, InternalJobStatus::Complete, Some(result))
            .await
    }

    /// Iterate due services, most urgent first.
    async fn service_tick(&self, job_id: models::Id) -> Result<Value> {
        let ids = self
            .store
            .service_queue(self.config.service_max_active)
            .await?;
        let total = ids.len();

        let mut iterated = 0usize;
        for (i, record_id) in ids.into_iter().enumerate() {
            match iterate_service(self.store.as_ref(), record_id).await {
                Ok(outcome) => {
                    tracing::debug!(%record_id, ?outcome, "service iterated");
                    iterated += 1;
                }
                Err(err) => {
                    tracing::warn!(%record_id, ?err, "service iteration failed");
                }
            }

            let progress = (((i + 1) * 100) / total.max(1)) as i32;
            if self
                .store
                .update_internal_job_progress(job_id, progress)
                .await?
            {
                tracing::info!("service tick cancelled mid-run");
                break;
            }
        }

        Ok(json!({ "n_services": total, "n_iterated": iterated }))
    }

    /// Deactivate managers whose heartbeat went stale; their claimed tasks
    /// return to the queue.
    async fn check_heartbeats(&self) -> Result<Value> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.heartbeat_timeout)
                .map_err(|e| ServerError::Internal(e.to_string()))?;
        let deactivated = self.store.deactivate_managers_before(cutoff).await?;
        if !deactivated.is_empty() {
            tracing::info!(?deactivated, "deactivated stale managers");
        }
        Ok(json!({ "n_deactivated": deactivated.len() }))
    }

    async fn sweep_stale(&self) -> Result<Value> {
        let n = self.store.sweep_stale_running().await?;
        if n > 0 {
            tracing::info!(n, "reset stale running records");
        }
        Ok(json!({ "n_reset": n }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::mem::MemStore;
    use chrono::Duration;

    fn job(name: &str) -> NewInternalJob {
        NewInternalJob {
            name: name.to_string(),
            scheduled_for: Utc::now(),
            unique_name: None,
            serial_group: None,
            repeat_delay_seconds: None,
            kwargs: json!({}),
        }
    }

    #[tokio::test]
    async fn unique_name_is_idempotent() {
        let store = MemStore::new();
        let mut j = job("a");
        j.unique_name = Some("only-one".to_string());
        let id1 = store.add_internal_job(j.clone()).await.unwrap();
        let id2 = store.add_internal_job(j).await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn serial_groups_run_one_at_a_time() {
        let store = MemStore::new();
        let mut a = job("a");
        a.serial_group = Some("g".to_string());
        let mut b = job("b");
        b.serial_group = Some("g".to_string());

        let id_a = store.add_internal_job(a).await.unwrap();
        let id_b = store.add_internal_job(b).await.unwrap();

        let claimed = store.claim_internal_jobs("r1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id_a);

        // The group stays busy until the first job finishes.
        assert!(store.claim_internal_jobs("r1", 10).await.unwrap().is_empty());

        store
            .finish_internal_job(id_a, InternalJobStatus::Complete, None)
            .await
            .unwrap();
        let claimed = store.claim_internal_jobs("r1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id_b);
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimed() {
        let store = MemStore::new();
        let mut j = job("later");
        j.scheduled_for = Utc::now() + Duration::hours(1);
        store.add_internal_job(j).await.unwrap();
        assert!(store.claim_internal_jobs("r1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeating_jobs_reschedule_on_finish() {
        let store = MemStore::new();
        let mut j = job("tick");
        j.repeat_delay_seconds = Some(30);
        let id = store.add_internal_job(j).await.unwrap();

        let claimed = store.claim_internal_jobs("r1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        store
            .finish_internal_job(id, InternalJobStatus::Complete, Some(json!({"ok": true})))
            .await
            .unwrap();

        let row = store.get_internal_job(id).await.unwrap();
        assert_eq!(row.status, InternalJobStatus::Waiting);
        assert!(row.scheduled_for > Utc::now() + Duration::seconds(20));
    }

    #[tokio::test]
    async fn cancellation_surfaces_through_progress() {
        let store = MemStore::new();
        let id = store.add_internal_job(job("long")).await.unwrap();
        let claimed = store.claim_internal_jobs("r1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        assert!(!store.update_internal_job_progress(id, 10).await.unwrap());
        store.cancel_internal_job(id).await.unwrap();
        assert!(store.update_internal_job_progress(id, 20).await.unwrap());
    }

    #[tokio::test]
    async fn bootstrap_registers_periodic_jobs() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let runner = JobRunner::new(store.clone(), FractalConfig::default());
        runner.bootstrap().await.unwrap();
        // Idempotent on restart.
        runner.bootstrap().await.unwrap();

        let claimed = store.claim_internal_jobs("r1", 10).await.unwrap();
        let names: Vec<&str> = claimed.iter().map(|j| j.name.as_str()).collect();
        // The two manager jobs share a serial group, so only one of them can
        // be claimed alongside the service tick.
        assert_eq!(claimed.len(), 2);
        assert!(names.contains(&JOB_ITERATE_SERVICES));
    }
}

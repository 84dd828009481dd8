use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{CrawlResult, Job, JobStatus};
use crate::storage::DocStore;

/// Error string written into jobs found running after a restart.
pub const RECOVERY_ERROR: &str = "Job interrupted by server restart";

pub const DEFAULT_LIST_LIMIT: usize = 10;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Job id already exists: {0}")]
    Conflict(String),
}

/// Authoritative in-memory job state with a durable mirror in the document
/// store. Store failures are logged and never fail the in-memory operation.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Job>>,
    store: Option<DocStore>,
}

impl JobRegistry {
    pub fn new(store: Option<DocStore>) -> Arc<Self> {
        Arc::new(JobRegistry {
            jobs: RwLock::new(HashMap::new()),
            store,
        })
    }

    /// Insert a new job. A collision on the id is a conflict.
    pub async fn create(&self, job: Job) -> Result<(), RegistryError> {
        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job.id) {
                return Err(RegistryError::Conflict(job.id.clone()));
            }
            jobs.insert(job.id.clone(), job.clone());
        }
        self.mirror(&job).await;
        Ok(())
    }

    /// Apply a mutation to a non-terminal job: bump `updated_at` under the
    /// write lock, then mirror the copy outside the lock region.
    async fn apply<F: FnOnce(&mut Job)>(&self, id: &str, mutate: F) -> Option<Job> {
        let updated = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id)?;
            // Terminal states never change.
            if job.status.is_terminal() {
                return None;
            }
            mutate(job);
            job.updated_at = Utc::now();
            job.clone()
        };
        self.mirror(&updated).await;
        Some(updated)
    }

    pub async fn update_progress(&self, id: &str, message: &str) {
        self.apply(id, |job| {
            job.progress = message.to_string();
        })
        .await;
    }

    /// Transition a job to completed with its result.
    pub async fn complete(&self, id: &str, result: CrawlResult) -> Option<Job> {
        self.apply(id, |job| {
            job.status = JobStatus::Completed;
            job.progress = format!("Completed with {} URLs", result.total_urls);
            job.result = Some(result);
            job.error = None;
        })
        .await
    }

    /// Transition a job to failed with a diagnostic.
    pub async fn fail(&self, id: &str, error: &str) -> Option<Job> {
        self.apply(id, |job| {
            job.status = JobStatus::Failed;
            job.progress = "Failed".to_string();
            job.error = Some(error.to_string());
            job.result = None;
        })
        .await
    }

    /// Memory first, store fallback on miss.
    pub async fn get(&self, id: &str) -> Option<Job> {
        {
            let jobs = self.jobs.read().await;
            if let Some(job) = jobs.get(id) {
                return Some(job.clone());
            }
        }
        match &self.store {
            Some(store) => match store.get_job(id).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Store lookup failed");
                    None
                }
            },
            None => None,
        }
    }

    /// Jobs sorted by `created_at` descending. Served from the store when
    /// available, else from memory.
    pub async fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<Job> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if let Some(store) = &self.store {
            match store.list_jobs(status, limit).await {
                Ok(jobs) => return jobs,
                Err(e) => {
                    tracing::warn!(error = %e, "Store list failed, serving from memory");
                }
            }
        }

        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|job| status.map(|s| job.status == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        out
    }

    /// Number of jobs currently running in memory.
    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .count()
    }

    /// Startup scan: every stored job still marked running is failed with the
    /// recovery diagnostic and loaded into memory. These jobs never resume.
    pub async fn recover(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let running = match store.running_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "Recovery scan failed");
                return 0;
            }
        };

        let mut recovered = 0usize;
        for mut job in running {
            job.status = JobStatus::Failed;
            job.error = Some(RECOVERY_ERROR.to_string());
            job.progress = "Failed".to_string();
            job.updated_at = Utc::now();

            if let Err(e) = store.put_job(&job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Recovery rewrite failed");
            }
            self.jobs.write().await.insert(job.id.clone(), job);
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "Marked interrupted jobs as failed");
        }
        recovered
    }

    async fn mirror(&self, job: &Job) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_job(job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Store mirror failed, continuing in memory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlRequest, CrawlSettings};

    fn make_job(id: &str) -> Job {
        Job::new(id.to_string(), CrawlRequest::default())
    }

    fn make_result(total: usize) -> CrawlResult {
        CrawlResult {
            id: crate::models::generate_id(),
            target_url: "https://example.com/".to_string(),
            duration: "1.00s".to_string(),
            total_urls: total,
            urls_per_second: "1.00".to_string(),
            settings: CrawlSettings {
                depth: 1,
                workers: 10,
                max_urls: 1000,
                sitemap_enabled: true,
                html_enabled: true,
                headless_enabled: false,
            },
            urls: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = JobRegistry::new(None);
        registry.create(make_job("job-a")).await.unwrap();

        let job = registry.get("job-a").await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.created_at <= job.updated_at);
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let registry = JobRegistry::new(None);
        registry.create(make_job("job-a")).await.unwrap();
        let err = registry.create(make_job("job-a")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_complete_sets_result_and_clears_error() {
        let registry = JobRegistry::new(None);
        registry.create(make_job("job-a")).await.unwrap();

        let job = registry.complete("job-a", make_result(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result.is_some());
        assert!(job.error.is_none());
        assert!(job.updated_at >= job.created_at);
    }

    #[tokio::test]
    async fn test_fail_sets_error_and_clears_result() {
        let registry = JobRegistry::new(None);
        registry.create(make_job("job-a")).await.unwrap();

        let job = registry.fail("job-a", "seed unreachable").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("seed unreachable"));
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_never_changes() {
        let registry = JobRegistry::new(None);
        registry.create(make_job("job-a")).await.unwrap();
        registry.complete("job-a", make_result(1)).await.unwrap();

        // Further transitions are refused.
        assert!(registry.fail("job-a", "late failure").await.is_none());
        let job = registry.get("job-a").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        registry.update_progress("job-a", "should not apply").await;
        let job = registry.get("job-a").await.unwrap();
        assert_ne!(job.progress, "should not apply");
    }

    #[tokio::test]
    async fn test_active_count_tracks_running_only() {
        let registry = JobRegistry::new(None);
        registry.create(make_job("job-a")).await.unwrap();
        registry.create(make_job("job-b")).await.unwrap();
        assert_eq!(registry.active_count().await, 2);

        registry.fail("job-a", "x").await;
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_sorted_desc_with_limit_and_filter() {
        let registry = JobRegistry::new(None);
        for i in 0..5i64 {
            let mut job = make_job(&format!("job-{i}"));
            job.created_at = Utc::now() - chrono::Duration::seconds(100 - i);
            job.updated_at = job.created_at;
            registry.create(job).await.unwrap();
        }
        registry.fail("job-4", "x").await;

        let all = registry.list(None, Some(3)).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "job-4");

        let running = registry.list(Some(JobStatus::Running), None).await;
        assert_eq!(running.len(), 4);
        assert!(running.iter().all(|j| j.status == JobStatus::Running));
    }
}

//! Analysis job service
//!
//! Accepts analysis requests, runs each one on its own task through the
//! dispatcher and persists the finalized run. A job that ends without a stored
//! run (the task panicked or the store rejected the run) is remembered as
//! failed, so polling never reports it as running forever.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::db::{DbError, RunStore};
use crate::model::{PipelineRun, PipelineVariant};
use crate::service::pipeline::PipelineDispatcher;

/// Where a job currently is, from the caller's point of view
#[derive(Debug)]
pub enum JobStatus {
    Running,
    Finished(Box<PipelineRun>),
    /// The job ended but no run could be stored
    Failed(String),
}

#[derive(Clone)]
pub struct AnalysisService {
    dispatcher: Arc<PipelineDispatcher>,
    store: Arc<dyn RunStore>,
    jobs: Arc<JobTable>,
}

/// In-flight ids and the reasons of jobs that ended without a stored run
#[derive(Default)]
struct JobTable {
    in_flight: Mutex<HashSet<String>>,
    failed: Mutex<HashMap<String, String>>,
}

impl JobTable {
    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn failed(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.failed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the job from the in-flight set when the task ends, including by panic
struct InFlightGuard {
    jobs: Arc<JobTable>,
    job_id: String,
    settled: bool,
}

impl InFlightGuard {
    fn new(jobs: Arc<JobTable>, job_id: String) -> Self {
        jobs.in_flight().insert(job_id.clone());
        Self {
            jobs,
            job_id,
            settled: false,
        }
    }

    fn fail(&mut self, reason: String) {
        self.jobs.failed().insert(self.job_id.clone(), reason);
        self.settled = true;
    }

    fn finish(&mut self) {
        self.settled = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.settled {
            tracing::error!(job_id = %self.job_id, "Analysis task ended without a result");
            self.jobs
                .failed()
                .insert(self.job_id.clone(), "analysis task aborted".to_string());
        }
        // Failure is recorded before the id leaves the in-flight set
        self.jobs.in_flight().remove(&self.job_id);
    }
}

impl AnalysisService {
    pub fn new(dispatcher: Arc<PipelineDispatcher>, store: Arc<dyn RunStore>) -> Self {
        Self {
            dispatcher,
            store,
            jobs: Arc::new(JobTable::default()),
        }
    }

    pub fn store(&self) -> &dyn RunStore {
        self.store.as_ref()
    }

    /// Start a job in the background and return its id
    pub fn submit(&self, input_text: String, variant: Option<PipelineVariant>) -> String {
        let job_id = Uuid::new_v4().to_string();
        let mut guard = InFlightGuard::new(self.jobs.clone(), job_id.clone());

        let service = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            let run = service.dispatcher.dispatch(id.clone(), &input_text, variant).await;
            match service.store.save(&run).await {
                Ok(()) => guard.finish(),
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Failed to persist pipeline run");
                    guard.fail(format!("run could not be stored: {}", e));
                }
            }
        });

        job_id
    }

    /// Run a job to completion on the current task and persist it
    pub async fn run(&self, input_text: &str, variant: Option<PipelineVariant>) -> Result<PipelineRun, DbError> {
        let job_id = Uuid::new_v4().to_string();
        let run = self.dispatcher.dispatch(job_id, input_text, variant).await;
        self.store.save(&run).await?;
        Ok(run)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, DbError> {
        match self.store.load(job_id).await {
            Ok(run) => Ok(JobStatus::Finished(Box::new(run))),
            Err(DbError::NotFound(_)) => {
                if self.jobs.in_flight().contains(job_id) {
                    return Ok(JobStatus::Running);
                }
                if let Some(reason) = self.jobs.failed().get(job_id) {
                    return Ok(JobStatus::Failed(reason.clone()));
                }
                // The job may have been stored after the first lookup
                self.store
                    .load(job_id)
                    .await
                    .map(|run| JobStatus::Finished(Box::new(run)))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::db::MemoryRunStore;
    use crate::model::{AnalysisConfig, RetrieverConfig, RunStatus};
    use crate::service::provenance::ProvenanceValidator;
    use crate::service::research::{ResearchDeps, ResearchOrchestrator};
    use crate::service::llm::{CompletionProvider, CompletionRequest, LlmError};
    use crate::service::testing::{FakeFetcher, FakeSearch, ScriptedProvider};

    struct RejectingStore;

    #[async_trait::async_trait]
    impl RunStore for RejectingStore {
        async fn save(&self, _run: &PipelineRun) -> Result<(), DbError> {
            Err(DbError::Serialization("disk full".to_string()))
        }

        async fn load(&self, job_id: &str) -> Result<PipelineRun, DbError> {
            Err(DbError::NotFound(job_id.to_string()))
        }
    }

    fn service() -> AnalysisService {
        service_with(Arc::new(ScriptedProvider::new()), Arc::new(MemoryRunStore::new()))
    }

    fn service_with(llm: Arc<dyn CompletionProvider>, store: Arc<dyn RunStore>) -> AnalysisService {
        let mut config = AnalysisConfig::default();
        config.research.retry_backoff_ms = 1;
        let orchestrator = ResearchOrchestrator::new(ResearchDeps {
            search: Arc::new(FakeSearch::new(&[])),
            grounded_search: None,
            fetcher: Arc::new(FakeFetcher::new()),
            llm,
            validator: ProvenanceValidator::new(&config.provenance),
            policy: RetrieverConfig::default(),
            config: Arc::new(config),
        });
        AnalysisService::new(Arc::new(PipelineDispatcher::new(orchestrator)), store)
    }

    async fn wait_until_settled(service: &AnalysisService, job_id: &str) -> JobStatus {
        for _ in 0..200 {
            match service.status(job_id).await.unwrap() {
                JobStatus::Running => tokio::time::sleep(Duration::from_millis(10)).await,
                status => return status,
            }
        }
        panic!("job {} did not settle", job_id);
    }

    #[tokio::test]
    async fn test_submitted_job_is_persisted_when_finished() {
        let service = service();
        let job_id = service.submit("The election was annulled.".to_string(), None);

        let JobStatus::Finished(run) = wait_until_settled(&service, &job_id).await else {
            panic!("expected a finished run");
        };
        assert_eq!(run.job_id, job_id);
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_by_status() {
        let service = service_with(Arc::new(ScriptedProvider::new()), Arc::new(RejectingStore));
        let job_id = service.submit("The election was annulled.".to_string(), None);

        let JobStatus::Failed(reason) = wait_until_settled(&service, &job_id).await else {
            panic!("expected a failed job");
        };
        assert!(reason.contains("disk full"), "{}", reason);
        assert!(!service.jobs.in_flight().contains(&job_id));
    }

    #[tokio::test]
    async fn test_panicking_job_leaves_in_flight_set() {
        let llm = ScriptedProvider::new().respond(
            "ExtractedUnderstanding",
            |_: &CompletionRequest| -> Result<serde_json::Value, LlmError> { panic!("model backend crashed") },
        );
        let service = service_with(Arc::new(llm), Arc::new(MemoryRunStore::new()));
        let job_id = service.submit("The election was annulled.".to_string(), None);

        let JobStatus::Failed(reason) = wait_until_settled(&service, &job_id).await else {
            panic!("expected a failed job");
        };
        assert_eq!(reason, "analysis task aborted");
        assert!(!service.jobs.in_flight().contains(&job_id));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let result = service().status("missing").await;
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }
}

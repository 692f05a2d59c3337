//! REST API endpoints for analysis jobs

use actix_web::{HttpResponse, get, post, web};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};

use crate::api::error::{ApiError, ErrorResponse};
use crate::model::{PipelineRun, PipelineVariant};
use crate::service::jobs::{AnalysisService, JobStatus};

/// Longest accepted input, in characters
const MAX_INPUT_CHARS: usize = 4_000;

/// Request to analyse a question or statement
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    /// Question or statement to verify
    pub input: String,
    /// Strategy to run; the configured default when omitted
    #[serde(default)]
    pub pipeline_variant: Option<PipelineVariant>,
    /// Block until the run is finished instead of returning 202
    #[serde(default)]
    pub wait: bool,
}

/// Returned while a job is still running
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisAccepted {
    pub job_id: String,
    pub status: String,
}

impl AnalysisRequest {
    fn validate(&self) -> Result<&str, ApiError> {
        let input = self.input.trim();
        if input.is_empty() {
            return Err(ApiError::BadRequest("input must not be empty".to_string()));
        }
        let len = input.chars().count();
        if len > MAX_INPUT_CHARS {
            return Err(ApiError::BadRequest(format!(
                "input has {} characters, the limit is {}",
                len, MAX_INPUT_CHARS
            )));
        }
        Ok(input)
    }
}

/// Submit an analysis
#[utoipa::path(
    post,
    path = "/v1/analyses",
    request_body = AnalysisRequest,
    responses(
        (status = 200, description = "Analysis finished (wait = true)", body = PipelineRun),
        (status = 202, description = "Analysis started", body = AnalysisAccepted),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "analyses"
)]
#[post("/v1/analyses")]
pub async fn submit_analysis(
    service: web::Data<AnalysisService>,
    request: web::Json<AnalysisRequest>,
) -> Result<HttpResponse, ApiError> {
    let input = request.validate()?;

    if request.wait {
        let run = service.run(input, request.pipeline_variant).await?;
        return Ok(HttpResponse::Ok().json(run));
    }

    let job_id = service.submit(input.to_string(), request.pipeline_variant);
    tracing::info!(job_id = %job_id, "Analysis accepted");

    Ok(HttpResponse::Accepted().json(AnalysisAccepted {
        job_id,
        status: "running".to_string(),
    }))
}

/// Get an analysis by job id
#[utoipa::path(
    get,
    path = "/v1/analyses/{id}",
    params(
        ("id" = String, Path, description = "Job id returned on submission")
    ),
    responses(
        (status = 200, description = "Finished run", body = PipelineRun),
        (status = 202, description = "Still running", body = AnalysisAccepted),
        (status = 404, description = "Unknown job id", body = ErrorResponse),
        (status = 500, description = "Job failed or internal server error", body = ErrorResponse)
    ),
    tag = "analyses"
)]
#[get("/v1/analyses/{id}")]
pub async fn get_analysis(
    service: web::Data<AnalysisService>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let job_id = path.into_inner();

    match service.status(&job_id).await? {
        JobStatus::Finished(run) => Ok(HttpResponse::Ok().json(run)),
        JobStatus::Running => Ok(HttpResponse::Accepted().json(AnalysisAccepted {
            job_id,
            status: "running".to_string(),
        })),
        JobStatus::Failed(reason) => Err(ApiError::JobFailed { job_id, reason }),
    }
}

/// Configure analysis routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(submit_analysis).service(get_analysis);
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "FactHarbor Verdict Engine",
        description = "Evidence-backed claim verification"
    ),
    paths(
        submit_analysis,
        get_analysis,
        crate::api::health::liveness,
        crate::api::health::readiness
    ),
    components(schemas(
        AnalysisRequest,
        AnalysisAccepted,
        ErrorResponse,
        PipelineRun,
        crate::api::health::HealthStatus,
        crate::api::health::ReadinessStatus,
        crate::api::health::DependencyHealth
    )),
    tags(
        (name = "analyses", description = "Claim verification jobs"),
        (name = "health", description = "Liveness and readiness probes")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, http::StatusCode, test};
    use std::sync::Arc;

    use crate::db::{MemoryRunStore, RunStore};
    use crate::model::{AnalysisConfig, RetrieverConfig, RunStatus};
    use crate::service::pipeline::PipelineDispatcher;
    use crate::service::provenance::ProvenanceValidator;
    use crate::service::research::{ResearchDeps, ResearchOrchestrator};
    use crate::service::testing::{FakeFetcher, FakeSearch, ScriptedProvider};

    fn service() -> AnalysisService {
        let mut config = AnalysisConfig::default();
        config.research.retry_backoff_ms = 1;
        let orchestrator = ResearchOrchestrator::new(ResearchDeps {
            search: Arc::new(FakeSearch::new(&[])),
            grounded_search: None,
            fetcher: Arc::new(FakeFetcher::new()),
            llm: Arc::new(ScriptedProvider::new()),
            validator: ProvenanceValidator::new(&config.provenance),
            policy: RetrieverConfig::default(),
            config: Arc::new(config),
        });
        AnalysisService::new(
            Arc::new(PipelineDispatcher::new(orchestrator)),
            Arc::new(MemoryRunStore::new()) as Arc<dyn RunStore>,
        )
    }

    #[actix_web::test]
    async fn test_empty_input_is_rejected() {
        let app = test::init_service(App::new().app_data(web::Data::new(service())).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/v1/analyses")
            .set_json(serde_json::json!({"input": "   "}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_unknown_job_is_404() {
        let app = test::init_service(App::new().app_data(web::Data::new(service())).configure(configure)).await;

        let req = test::TestRequest::get().uri("/v1/analyses/nope").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_waiting_submission_returns_persisted_run() {
        let service = service();
        let app = test::init_service(App::new().app_data(web::Data::new(service.clone())).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/v1/analyses")
            .set_json(serde_json::json!({"input": "Was the election annulled?", "wait": true}))
            .to_request();
        let run: PipelineRun = test::call_and_read_body_json(&app, req).await;

        // No scripted model output: the run fails closed
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.canonical_input, "The election was annulled.");

        let stored = service.store().load(&run.job_id).await.unwrap();
        assert_eq!(stored.job_id, run.job_id);
    }
}

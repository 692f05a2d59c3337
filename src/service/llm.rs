//! LLM completion collaborator
//!
//! Strategies only see [`CompletionProvider`]; the rig-backed OpenAI client is
//! one implementation. Structured calls go through [`complete_structured`],
//! which derives the JSON schema, enforces the token budget and retries output
//! that does not deserialize as well as failed requests.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::extractor::ExtractionError;
use rig::providers::openai;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::model::{AnalysisConfig, BudgetExceedReason};
use crate::service::budget::SharedBudget;

/// Default model used for every stage
pub const DEFAULT_MODEL: &str = openai::GPT_4O_MINI;

/// Upper bound on response length reserved against the token budget
pub const MAX_RESPONSE_TOKENS: u64 = 4_096;

/// One structured completion call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub preamble: String,
    pub prompt: String,
    /// Name of the expected output type
    pub schema_name: String,
    pub schema: Value,
    pub max_tokens: u64,
    /// Typed extractor for the expected output type
    pub extraction: Arc<dyn TypedExtraction>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Value,
    pub tokens_used: u64,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LlmError {
    #[error("Failed to create LLM client: {0}")]
    Client(String),

    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM output does not match schema {schema}: {message}")]
    Schema { schema: String, message: String },

    #[error("LLM call denied by budget: {0}")]
    Budget(BudgetExceedReason),
}

/// `complete(prompt, schema)` collaborator
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// rig extraction of one concrete output type, erased so providers stay object-safe
#[async_trait]
pub trait TypedExtraction: Send + Sync + fmt::Debug {
    async fn extract(
        &self,
        client: &openai::Client,
        model: &str,
        preamble: &str,
        prompt: &str,
    ) -> Result<Value, LlmError>;
}

struct Extraction<T>(PhantomData<fn() -> T>);

impl<T: JsonSchema> fmt::Debug for Extraction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extraction<{}>", T::schema_name())
    }
}

#[async_trait]
impl<T> TypedExtraction for Extraction<T>
where
    T: JsonSchema + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn extract(
        &self,
        client: &openai::Client,
        model: &str,
        preamble: &str,
        prompt: &str,
    ) -> Result<Value, LlmError> {
        let schema = T::schema_name().to_string();
        let extractor = client
            .extractor::<T>(model)
            .preamble(preamble)
            .additional_params(serde_json::json!({
                "temperature": 0.0,
                "seed": 42
            }))
            .build();

        let extracted = extractor.extract(prompt.to_string()).await.map_err(|e| match e {
            ExtractionError::NoData | ExtractionError::DeserializationError(_) => LlmError::Schema {
                schema: schema.clone(),
                message: e.to_string(),
            },
            other => LlmError::Request(other.to_string()),
        })?;

        serde_json::to_value(extracted).map_err(|e| LlmError::Schema {
            schema,
            message: e.to_string(),
        })
    }
}

/// Retry limits of structured calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts for output that fails schema validation
    pub schema_retries: u32,
    /// Extra attempts for failed requests, with exponential backoff
    pub request_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            schema_retries: config.pipeline.schema_retries,
            request_retries: config.research.fetch_retries,
            backoff_ms: config.research.retry_backoff_ms,
        }
    }
}

/// Parsed output together with the provider's JSON value, kept for audit
#[derive(Debug, Clone)]
pub struct Structured<T> {
    pub value: T,
    pub raw: Value,
}

/// Rough token estimate (4 characters per token)
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Run a schema-validated completion under the job's token budget.
pub async fn complete_structured<T>(
    provider: &dyn CompletionProvider,
    budget: &SharedBudget,
    preamble: &str,
    prompt: &str,
    retry: RetryPolicy,
) -> Result<T, LlmError>
where
    T: JsonSchema + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    complete_structured_raw(provider, budget, preamble, prompt, retry)
        .await
        .map(|structured| structured.value)
}

/// Like [`complete_structured`], also returning the provider's raw value.
///
/// Output that fails schema validation is retried up to `schema_retries`
/// times and failed requests up to `request_retries` times; every attempt is
/// charged to the budget.
pub async fn complete_structured_raw<T>(
    provider: &dyn CompletionProvider,
    budget: &SharedBudget,
    preamble: &str,
    prompt: &str,
    retry: RetryPolicy,
) -> Result<Structured<T>, LlmError>
where
    T: JsonSchema + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    let schema_name = T::schema_name().to_string();
    let schema = serde_json::to_value(schemars::schema_for!(T)).map_err(|e| LlmError::Schema {
        schema: schema_name.clone(),
        message: e.to_string(),
    })?;

    let request = CompletionRequest {
        preamble: preamble.to_string(),
        prompt: prompt.to_string(),
        schema_name: schema_name.clone(),
        schema,
        max_tokens: MAX_RESPONSE_TOKENS,
        extraction: Arc::new(Extraction::<T>(PhantomData)),
    };
    let input_tokens = estimate_tokens(preamble) + estimate_tokens(prompt);
    let reserved = input_tokens + MAX_RESPONSE_TOKENS;

    let mut schema_failures = 0;
    let mut request_failures = 0;
    loop {
        let check = budget.try_reserve_tokens(reserved);
        if !check.allowed {
            let reason = check
                .reason
                .unwrap_or(BudgetExceedReason::TotalTokens {
                    limit: budget.budget().max_total_tokens,
                });
            return Err(LlmError::Budget(reason));
        }

        let content = match provider.complete(&request).await {
            Ok(response) => {
                budget.adjust_tokens(reserved, response.tokens_used);
                Ok(response.content)
            }
            Err(e) => {
                budget.adjust_tokens(reserved, input_tokens);
                Err(e)
            }
        };

        let error = match content {
            Ok(raw) => match serde_json::from_value::<T>(raw.clone()) {
                Ok(value) => return Ok(Structured { value, raw }),
                Err(e) => LlmError::Schema {
                    schema: schema_name.clone(),
                    message: e.to_string(),
                },
            },
            Err(e) => e,
        };

        match error {
            LlmError::Schema { .. } if schema_failures < retry.schema_retries => {
                schema_failures += 1;
                tracing::warn!(
                    schema = %schema_name,
                    attempt = schema_failures,
                    max_retries = retry.schema_retries,
                    error = %error,
                    "LLM output failed schema validation"
                );
            }
            LlmError::Request(_) if request_failures < retry.request_retries => {
                let delay = Duration::from_millis(retry.backoff_ms.saturating_mul(1 << request_failures));
                request_failures += 1;
                tracing::warn!(
                    schema = %schema_name,
                    attempt = request_failures,
                    max_retries = retry.request_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "LLM request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            _ => return Err(error),
        }
    }
}

/// Shared OpenAI client wrapper
#[derive(Clone)]
pub struct LlmClient {
    client: openai::Client,
}

impl LlmClient {
    pub fn new(api_key: &str) -> Result<Self, LlmError> {
        let client = openai::Client::new(api_key).map_err(|e| LlmError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn openai_client(&self) -> &openai::Client {
        &self.client
    }
}

/// rig-backed OpenAI completion provider using the typed extractor
pub struct RigCompletionProvider {
    client: LlmClient,
    model: String,
}

impl RigCompletionProvider {
    pub fn new(client: LlmClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl CompletionProvider for RigCompletionProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let started = std::time::Instant::now();
        let content = request
            .extraction
            .extract(self.client.openai_client(), &self.model, &request.preamble, &request.prompt)
            .await?;

        let tokens_used = estimate_tokens(&request.preamble)
            + estimate_tokens(&request.prompt)
            + estimate_tokens(&content.to_string());
        tracing::debug!(
            model = %self.model,
            schema = %request.schema_name,
            tokens_used = tokens_used,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "LLM extraction finished"
        );

        Ok(CompletionResponse { content, tokens_used })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResearchBudget;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Answer {
        value: u32,
    }

    struct QueuedProvider {
        replies: Mutex<Vec<Result<Value, LlmError>>>,
        calls: Mutex<u32>,
    }

    impl QueuedProvider {
        fn new(replies: Vec<Result<Value, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CompletionProvider for QueuedProvider {
        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let mut replies = self.replies.lock().unwrap();
            let content = if replies.is_empty() {
                Ok(Value::Null)
            } else {
                replies.remove(0)
            };
            content.map(|content| CompletionResponse {
                content,
                tokens_used: 100,
            })
        }
    }

    fn retry(schema_retries: u32, request_retries: u32) -> RetryPolicy {
        RetryPolicy {
            schema_retries,
            request_retries,
            backoff_ms: 1,
        }
    }

    fn schema_error() -> LlmError {
        LlmError::Schema {
            schema: "Answer".to_string(),
            message: "no JSON object in reply".to_string(),
        }
    }

    #[tokio::test]
    async fn test_schema_failure_is_retried() {
        let provider = QueuedProvider::new(vec![
            Ok(serde_json::json!({"wrong": true})),
            Ok(serde_json::json!({"value": 7})),
        ]);
        let budget = SharedBudget::new(ResearchBudget::default());

        let answer: Answer = complete_structured(&provider, &budget, "p", "q", retry(2, 0)).await.unwrap();
        assert_eq!(answer.value, 7);

        let stats = budget.stats();
        assert_eq!(stats.llm_calls, 2);
        assert_eq!(stats.tokens_used, 200);
    }

    #[tokio::test]
    async fn test_provider_schema_error_is_retried() {
        let provider = QueuedProvider::new(vec![Err(schema_error()), Ok(serde_json::json!({"value": 7}))]);
        let budget = SharedBudget::new(ResearchBudget::default());

        let answer: Answer = complete_structured(&provider, &budget, "p", "q", retry(2, 0)).await.unwrap();

        assert_eq!(answer.value, 7);
        assert_eq!(provider.calls(), 2);
        assert_eq!(budget.stats().llm_calls, 2);
    }

    #[tokio::test]
    async fn test_failed_request_is_retried_with_backoff() {
        let provider = QueuedProvider::new(vec![
            Err(LlmError::Request("connection reset".to_string())),
            Err(LlmError::Request("connection reset".to_string())),
            Ok(serde_json::json!({"value": 3})),
        ]);
        let budget = SharedBudget::new(ResearchBudget::default());

        let answer: Answer = complete_structured(&provider, &budget, "p", "q", retry(0, 2)).await.unwrap();

        assert_eq!(answer.value, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_request_retries_are_capped() {
        let provider = QueuedProvider::new(
            (0..5).map(|_| Err(LlmError::Request("down".to_string()))).collect(),
        );
        let budget = SharedBudget::new(ResearchBudget::default());

        let result: Result<Answer, _> = complete_structured(&provider, &budget, "p", "q", retry(2, 1)).await;

        assert!(matches!(result, Err(LlmError::Request(_))));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_capped() {
        let provider = QueuedProvider::new((0..5).map(|_| Ok(serde_json::json!({"wrong": true}))).collect());
        let budget = SharedBudget::new(ResearchBudget::default());

        let result: Result<Answer, _> = complete_structured(&provider, &budget, "p", "q", retry(1, 0)).await;
        assert!(matches!(result, Err(LlmError::Schema { .. })));
        assert_eq!(budget.stats().llm_calls, 2);
    }

    #[tokio::test]
    async fn test_raw_output_is_the_provider_value() {
        let provider = QueuedProvider::new(vec![Ok(serde_json::json!({"value": 4, "note": "extra"}))]);
        let budget = SharedBudget::new(ResearchBudget::default());

        let structured: Structured<Answer> = complete_structured_raw(&provider, &budget, "p", "q", retry(0, 0))
            .await
            .unwrap();

        assert_eq!(structured.value.value, 4);
        assert_eq!(structured.raw["note"], "extra");
    }

    #[tokio::test]
    async fn test_token_budget_denies_call() {
        let provider = QueuedProvider::new(vec![Ok(serde_json::json!({"value": 1}))]);
        let budget = SharedBudget::new(ResearchBudget {
            max_tokens_per_call: 10,
            ..Default::default()
        });

        let result: Result<Answer, _> = complete_structured(&provider, &budget, "p", "q", retry(0, 0)).await;
        assert!(matches!(
            result,
            Err(LlmError::Budget(BudgetExceedReason::TokensPerCall { .. }))
        ));
        assert!(budget.stats().budget_exceeded);
        assert_eq!(provider.calls(), 0);
    }
}

//! Assistants-style REST provider (threads, messages, runs).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{
    Annotation, AssistantProvider, JobHandle, JobId, JobRequest, JobStatus, MessageRole,
    ProviderError, ProviderMessage, ProviderResult, ThreadId, TokenUsage, UpstreamJobState,
};

#[derive(Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub assistant_id: String,
    pub request_timeout: Duration,
    /// Value for the `OpenAI-Beta` header, when the upstream requires one.
    pub beta_header: Option<String>,
}

impl HttpProviderConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        assistant_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: SecretString::from(api_key.into()),
            assistant_id: assistant_id.into(),
            request_timeout: Duration::from_secs(30),
            beta_header: Some("assistants=v2".to_string()),
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GATE_PROVIDER_API_KEY").ok()?;
        let assistant_id = std::env::var("GATE_PROVIDER_ASSISTANT_ID").ok()?;
        let base_url = std::env::var("GATE_PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Some(Self::new(base_url, api_key, assistant_id))
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn beta_header(mut self, value: Option<String>) -> Self {
        self.beta_header = value;
        self
    }
}

impl fmt::Debug for HttpProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[redacted]")
            .field("assistant_id", &self.assistant_id)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug)]
pub struct HttpAssistantProvider {
    http: reqwest::Client,
    base: Url,
    config: HttpProviderConfig,
}

impl HttpAssistantProvider {
    pub fn new(config: HttpProviderConfig) -> ProviderResult<Self> {
        let trimmed = config.base_url.trim_end_matches('/');
        let base = Url::parse(&format!("{}/", trimmed)).map_err(|e| ProviderError::Rejected {
            status: 0,
            message: format!("invalid base url '{}': {}", config.base_url, e),
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Rejected {
                status: 0,
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { http, base, config })
    }

    fn endpoint(&self, path: &str) -> ProviderResult<Url> {
        self.base.join(path).map_err(|e| ProviderError::Rejected {
            status: 0,
            message: format!("invalid endpoint '{}': {}", path, e),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req
            .bearer_auth(self.config.api_key.expose_secret())
            .header("Content-Type", "application/json");
        match &self.config.beta_header {
            Some(beta) => req.header("OpenAI-Beta", beta),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        resource: &str,
    ) -> ProviderResult<T> {
        let response = self.authorize(req).send().await.map_err(map_transport_error)?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, resource, text));
        }

        response.json::<T>().await.map_err(|e| ProviderError::Decode {
            message: e.to_string(),
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_decode() {
        ProviderError::Decode {
            message: e.to_string(),
        }
    } else {
        ProviderError::Transient {
            message: e.to_string(),
        }
    }
}

fn classify_status(status: u16, resource: &str, body: String) -> ProviderError {
    match status {
        404 => ProviderError::NotFound {
            resource: resource.to_string(),
        },
        408 | 409 | 429 | 500..=599 => ProviderError::Transient {
            message: format!("HTTP {}: {}", status, body),
        },
        _ => ProviderError::Rejected {
            status,
            message: body,
        },
    }
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct RunObject {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    usage: Option<RunUsage>,
}

#[derive(Deserialize)]
struct RunError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

#[derive(Deserialize)]
struct IncompleteDetails {
    reason: String,
}

#[derive(Deserialize)]
struct RunUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl RunObject {
    fn into_status(self) -> JobStatus {
        let usage = self.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });
        let state = match self.status.as_str() {
            "queued" => UpstreamJobState::Queued,
            "in_progress" | "requires_action" | "cancelling" => UpstreamJobState::InProgress,
            "completed" => UpstreamJobState::Completed,
            _ => UpstreamJobState::Failed,
        };

        let failure_reason = (state == UpstreamJobState::Failed).then(|| {
            match (self.last_error, self.incomplete_details) {
                (Some(RunError { code: Some(code), message }), _) => format!("{}: {}", code, message),
                (Some(RunError { code: None, message }), _) => message,
                (None, Some(details)) => details.reason,
                (None, None) => format!("run {} ended with status {}", self.id, self.status),
            }
        });

        JobStatus {
            state,
            failure_reason,
            usage,
        }
    }
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
}

#[derive(Deserialize)]
struct MessageObject {
    id: String,
    role: MessageRole,
    created_at: i64,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct TextContent {
    value: String,
    #[serde(default)]
    annotations: Vec<AnnotationObject>,
}

#[derive(Deserialize)]
struct AnnotationObject {
    text: String,
    #[serde(default)]
    file_citation: Option<FileCitation>,
}

#[derive(Deserialize)]
struct FileCitation {
    file_id: String,
    #[serde(default)]
    quote: Option<String>,
}

impl MessageObject {
    fn into_message(self) -> ProviderMessage {
        let mut text = String::new();
        let mut annotations = Vec::new();

        for part in self.content {
            if let ContentPart::Text { text: content } = part {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&content.value);
                annotations.extend(content.annotations.into_iter().map(|a| Annotation {
                    marker: a.text,
                    source: a.file_citation.as_ref().map(|c| c.file_id.clone()),
                    quote: a.file_citation.and_then(|c| c.quote),
                }));
            }
        }

        ProviderMessage {
            id: self.id,
            role: self.role,
            text,
            annotations,
            created_at: DateTime::<Utc>::from_timestamp(self.created_at, 0).unwrap_or_default(),
        }
    }
}

#[async_trait::async_trait]
impl AssistantProvider for HttpAssistantProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_conversation(&self) -> ProviderResult<ThreadId> {
        let url = self.endpoint("threads")?;
        let created: Created = self
            .send(self.http.post(url).json(&json!({})), "threads")
            .await?;
        tracing::debug!(thread_id = %created.id, "Created upstream thread");
        Ok(ThreadId(created.id))
    }

    async fn append_message(&self, thread: &ThreadId, text: &str) -> ProviderResult<()> {
        let url = self.endpoint(&format!("threads/{}/messages", thread))?;
        let body = json!({ "role": "user", "content": text });
        let _: Created = self
            .send(self.http.post(url).json(&body), thread.as_str())
            .await?;
        Ok(())
    }

    async fn submit_job(&self, thread: &ThreadId, request: &JobRequest) -> ProviderResult<JobHandle> {
        let url = self.endpoint(&format!("threads/{}/runs", thread))?;
        let body = json!({
            "assistant_id": self.config.assistant_id,
            "model": request.model,
            "max_completion_tokens": request.max_output_tokens,
        });
        let run: RunObject = self
            .send(self.http.post(url).json(&body), thread.as_str())
            .await?;
        Ok(JobHandle {
            thread_id: thread.clone(),
            job_id: JobId(run.id),
        })
    }

    async fn get_job_status(&self, job: &JobHandle) -> ProviderResult<JobStatus> {
        let url = self.endpoint(&format!("threads/{}/runs/{}", job.thread_id, job.job_id))?;
        let run: RunObject = self.send(self.http.get(url), job.job_id.as_str()).await?;
        Ok(run.into_status())
    }

    async fn list_messages(&self, thread: &ThreadId, limit: u32) -> ProviderResult<Vec<ProviderMessage>> {
        let mut url = self.endpoint(&format!("threads/{}/messages", thread))?;
        url.query_pairs_mut()
            .append_pair("order", "desc")
            .append_pair("limit", &limit.to_string());

        let list: MessageList = self.send(self.http.get(url), thread.as_str()).await?;
        Ok(list.data.into_iter().map(MessageObject::into_message).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(404, "t", String::new()).is_not_found());
        assert!(classify_status(429, "t", String::new()).is_transient());
        assert!(classify_status(503, "t", String::new()).is_transient());
        assert!(matches!(
            classify_status(400, "t", "bad".into()),
            ProviderError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn test_run_status_mapping() {
        let run: RunObject = serde_json::from_value(json!({
            "id": "run_1",
            "status": "failed",
            "last_error": {"code": "rate_limit_exceeded", "message": "quota"}
        }))
        .unwrap();
        let status = run.into_status();
        assert_eq!(status.state, UpstreamJobState::Failed);
        assert_eq!(status.failure_reason.as_deref(), Some("rate_limit_exceeded: quota"));

        let run: RunObject =
            serde_json::from_value(json!({"id": "run_2", "status": "expired"})).unwrap();
        assert_eq!(
            run.into_status().failure_reason.as_deref(),
            Some("run run_2 ended with status expired")
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = HttpProviderConfig::new("http://localhost", "sk-secret", "asst_1");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let provider =
            HttpAssistantProvider::new(HttpProviderConfig::new("http://localhost:9/v1", "k", "a"))
                .unwrap();
        assert_eq!(
            provider.endpoint("threads/t1/runs").unwrap().as_str(),
            "http://localhost:9/v1/threads/t1/runs"
        );
    }
}

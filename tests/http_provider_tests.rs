//! HTTP Provider Tests
//!
//! `HttpAssistantProvider` against a mock Assistants-style server, plus one
//! full gateway round trip over HTTP.
//!
//! Run: cargo nextest run --test http_provider_tests

use std::sync::Arc;

use assistant_gate::budget::UserTier;
use assistant_gate::gateway::Gateway;
use assistant_gate::provider::{
    AssistantProvider, HttpAssistantProvider, HttpProviderConfig, JobHandle, JobId, JobRequest,
    MessageRole, ProviderError, ThreadId, UpstreamJobState,
};
use assistant_gate::store::MemoryStore;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> HttpAssistantProvider {
    HttpAssistantProvider::new(HttpProviderConfig::new(
        format!("{}/v1", server.uri()),
        "sk-test",
        "asst_1",
    ))
    .unwrap()
}

fn job() -> JobHandle {
    JobHandle {
        thread_id: ThreadId::new("thread_abc"),
        job_id: JobId::new("run_1"),
    }
}

// =============================================================================
// Endpoints
// =============================================================================

mod endpoint_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_conversation_sends_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/threads"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("OpenAI-Beta", "assistants=v2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "thread_abc"})))
            .expect(1)
            .mount(&server)
            .await;

        let thread = provider(&server).create_conversation().await.unwrap();
        assert_eq!(thread, ThreadId::new("thread_abc"));
    }

    #[tokio::test]
    async fn test_submit_job_carries_plan() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/threads/thread_abc/runs"))
            .and(body_partial_json(json!({
                "assistant_id": "asst_1",
                "model": "claude-haiku-4-5",
                "max_completion_tokens": 300
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "run_1", "status": "queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let handle = provider(&server)
            .submit_job(
                &ThreadId::new("thread_abc"),
                &JobRequest {
                    model: "claude-haiku-4-5".into(),
                    max_output_tokens: 300,
                },
            )
            .await
            .unwrap();
        assert_eq!(handle.job_id, JobId::new("run_1"));
    }

    #[tokio::test]
    async fn test_job_status_reads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/thread_abc/runs/run_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "run_1",
                "status": "completed",
                "usage": {"prompt_tokens": 812, "completion_tokens": 240, "total_tokens": 1052}
            })))
            .mount(&server)
            .await;

        let status = provider(&server).get_job_status(&job()).await.unwrap();
        assert_eq!(status.state, UpstreamJobState::Completed);
        let usage = status.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (812, 240));
    }

    #[tokio::test]
    async fn test_list_messages_newest_first_with_annotations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/thread_abc/messages"))
            .and(query_param("order", "desc"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {
                        "id": "msg_2",
                        "role": "assistant",
                        "created_at": 1_792_411_200,
                        "content": [{
                            "type": "text",
                            "text": {
                                "value": "Refunds take 5 days【4:0†policy.pdf】.",
                                "annotations": [{
                                    "type": "file_citation",
                                    "text": "【4:0†policy.pdf】",
                                    "file_citation": {"file_id": "file_9", "quote": "five business days"}
                                }]
                            }
                        }]
                    },
                    {
                        "id": "msg_1",
                        "role": "user",
                        "created_at": 1_792_411_190,
                        "content": [{"type": "text", "text": {"value": "How long do refunds take?"}}]
                    }
                ]
            })))
            .mount(&server)
            .await;

        let messages = provider(&server)
            .list_messages(&ThreadId::new("thread_abc"), 10)
            .await
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(messages[0].annotations.len(), 1);
        assert_eq!(messages[0].annotations[0].source.as_deref(), Some("file_9"));
        assert_eq!(messages[1].text, "How long do refunds take?");
    }
}

// =============================================================================
// Error Classification
// =============================================================================

mod error_tests {
    use super::*;

    async fn status_error(code: u16) -> ProviderError {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/thread_abc/runs/run_1"))
            .respond_with(ResponseTemplate::new(code).set_body_string("nope"))
            .mount(&server)
            .await;
        provider(&server).get_job_status(&job()).await.unwrap_err()
    }

    #[tokio::test]
    async fn test_missing_thread_is_not_found() {
        assert!(status_error(404).await.is_not_found());
    }

    #[tokio::test]
    async fn test_throttling_and_server_errors_are_transient() {
        assert!(status_error(429).await.is_transient());
        assert!(status_error(503).await.is_transient());
    }

    #[tokio::test]
    async fn test_client_errors_are_rejected() {
        let err = status_error(400).await;
        assert!(matches!(err, ProviderError::Rejected { status: 400, ref message } if message == "nope"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = provider(&server).create_conversation().await.unwrap_err();
        assert!(matches!(err, ProviderError::Decode { .. }));
    }
}

// =============================================================================
// Gateway over HTTP
// =============================================================================

mod gateway_http_tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "thread_abc"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/threads/thread_abc/messages"))
            .and(body_partial_json(json!({"role": "user", "content": "Hi there"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg_1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/threads/thread_abc/runs"))
            .and(body_partial_json(json!({"model": "claude-sonnet-4-5", "max_completion_tokens": 1500})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "run_1", "status": "queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/thread_abc/runs/run_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "run_1",
                "status": "completed",
                "usage": {"prompt_tokens": 100, "completion_tokens": 50}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/thread_abc/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "msg_2",
                    "role": "assistant",
                    "created_at": 1_792_411_200,
                    "content": [{"type": "text", "text": {"value": "Hello!", "annotations": []}}]
                }]
            })))
            .mount(&server)
            .await;

        let gateway = Gateway::builder()
            .store(Arc::new(MemoryStore::new()))
            .provider(Arc::new(provider(&server)))
            .build()
            .unwrap();

        let reply = gateway
            .submit_message("alice", "Hi there", UserTier::Free)
            .await
            .unwrap();

        assert_eq!(reply.artifact, "Hello!");
        assert_eq!(reply.thread_id, ThreadId::new("thread_abc"));
        assert_eq!(reply.tokens_used.total(), 150);
    }
}

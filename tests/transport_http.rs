//! HTTP behaviour of the index client and embedding providers against a
//! local mock server.

use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use index_harness::config::EmbeddingConfig;
use index_harness::embedding::{AzureOpenAIProvider, EmbeddingProvider, OpenAIProvider};
use index_harness::error::IndexError;
use index_harness::index_ops::{IndexClient, SearchService};
use index_harness::models::Document;
use index_harness::schema::default_schema;
use index_harness::transport::{RetryPolicy, TransportClient, TransportConfig};

fn client(server: &MockServer) -> IndexClient {
    let mut config = TransportConfig::new(server.uri());
    config.api_version = "2024-07-01".to_string();
    config.api_key = Some("admin-key".to_string().into());
    config.timeout = Duration::from_secs(5);
    config.retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
    IndexClient::new(TransportClient::new(config).unwrap())
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

#[tokio::test]
async fn get_index_sends_key_and_version() {
    let server = MockServer::start().await;
    let schema = default_schema("code", 4);
    Mock::given(method("GET"))
        .and(path("/indexes/code"))
        .and(query_param("api-version", "2024-07-01"))
        .and(header("api-key", "admin-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::to_value(&schema).unwrap()))
        .expect(1)
        .mount(&server)
        .await;

    let live = client(&server).get_index("code").await.unwrap().unwrap();
    assert_eq!(live.name, "code");
    assert_eq!(live.fields.len(), schema.fields.len());
    assert!(live.has_vector_search());
}

#[tokio::test]
async fn missing_index_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes/code"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "ResourceNotFound", "message": "No index with the name 'code'" }
        })))
        .mount(&server)
        .await;

    assert!(client(&server).get_index("code").await.unwrap().is_none());
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn transient_status_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/code/docs/index"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes/code/docs/index"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "key": "a", "status": true, "errorMessage": null, "statusCode": 201 },
                { "key": "b", "status": false, "errorMessage": "field too long", "statusCode": 400 }
            ]
        })))
        .mount(&server)
        .await;

    let docs = vec![Document::new("a", "alpha"), Document::new("b", "beta")];
    let results = client(&server).upload_documents("code", &docs).await.unwrap();

    assert_eq!(request_count(&server).await, 3);
    assert!(results[0].status);
    assert!(!results[1].status);
    assert_eq!(results[1].error_message.as_deref(), Some("field too long"));

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["value"][0]["@search.action"], json!("mergeOrUpload"));
    assert_eq!(body["value"][1]["id"], json!("b"));
    assert!(body["value"][0]["content_hash"].is_string());
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes/code/stats"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = client(&server).index_statistics("code").await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err, IndexError::Transient { status: Some(429), .. }));
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/indexes/code"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": "InvalidRequestParameter", "message": "field 'x' is invalid" }
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .create_or_update_index(&default_schema("code", 4))
        .await
        .unwrap_err();
    match err {
        IndexError::Permanent {
            ref operation,
            status,
            ref message,
        } => {
            assert_eq!(status, 400);
            assert!(operation.contains("create_or_update_index(code)"), "{}", operation);
            assert!(message.contains("field 'x' is invalid"), "{}", message);
        }
        other => panic!("expected permanent error, got {:?}", other),
    }
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn no_content_and_plain_text_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/indexes/code"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/indexes/code/docs/$count"))
        .respond_with(ResponseTemplate::new(200).set_body_string("\u{feff}42"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexers/nightly/run"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let c = client(&server);
    assert!(c.delete_index("code").await.unwrap());
    assert_eq!(c.count_documents("code").await.unwrap(), 42);
    c.run_indexer("nightly").await.unwrap();
}

#[tokio::test]
async fn indexer_status_decodes_last_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexers/nightly/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "nightly",
            "status": "running",
            "lastResult": {
                "status": "transientFailure",
                "errorMessage": "blob store throttled",
                "itemCount": 120,
                "failedItemCount": 3
            },
            "executionHistory": []
        })))
        .mount(&server)
        .await;

    let status = client(&server).indexer_status("nightly").await.unwrap();
    let last = status.last_result.unwrap();
    assert_eq!(last.status, "transientFailure");
    assert_eq!(last.item_count, 120);
    assert_eq!(last.failed_item_count, 3);
}

fn openai_config(server: &MockServer) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: "openai".to_string(),
        model: Some("text-embedding-3-small".to_string()),
        dims: Some(3),
        url: Some(format!("{}/v1", server.uri())),
        api_key: Some("sk-test".to_string()),
        max_attempts: 2,
        initial_backoff_ms: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn openai_vectors_follow_input_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("Authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0, 0.0] },
                { "index": 0, "embedding": [1.0, 0.0, 0.0] }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAIProvider::new(&openai_config(&server)).unwrap();
    let vectors = provider
        .embed_batch(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], json!("text-embedding-3-small"));
    assert_eq!(body["input"], json!(["first", "second"]));
}

#[tokio::test]
async fn wrong_dimensions_make_provider_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "index": 0, "embedding": [1.0, 0.0] }]
        })))
        .mount(&server)
        .await;

    let provider = OpenAIProvider::new(&openai_config(&server)).unwrap();
    let err = provider.embed_batch(&["x".to_string()]).await.unwrap_err();
    assert!(matches!(err, IndexError::ProviderUnavailable { ref message, .. } if message.contains("dimensions")));
}

#[tokio::test]
async fn provider_outage_surfaces_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let provider = OpenAIProvider::new(&openai_config(&server)).unwrap();
    let err = provider.embed_batch(&["x".to_string()]).await.unwrap_err();
    assert!(matches!(err, IndexError::ProviderUnavailable { ref provider, .. } if provider == "openai"));
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn azure_uses_deployment_path_and_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/embed-small/embeddings"))
        .and(query_param("api-version", "2024-02-01"))
        .and(header("api-key", "azure-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "index": 0, "embedding": [0.5, 0.5] }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = EmbeddingConfig {
        provider: "azure".to_string(),
        deployment: Some("embed-small".to_string()),
        dims: Some(2),
        url: Some(server.uri()),
        api_key: Some("azure-key".to_string()),
        initial_backoff_ms: 1,
        ..Default::default()
    };
    let provider = AzureOpenAIProvider::new(&config).unwrap();
    assert_eq!(provider.model_name(), "embed-small");
    let vectors = provider.embed_batch(&["hello".to_string()]).await.unwrap();
    assert_eq!(vectors, vec![vec![0.5, 0.5]]);
}

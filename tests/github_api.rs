//! GitHub read-side behavior against a mock server: paging, error
//! mapping, and the size gate that fires before any KG traffic.

mod common;

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{sample_request, SAMPLE_PATCH};
use loupe::config::{Config, GithubConfig};
use loupe::github::GithubClient;
use loupe::observe::{BreakerRegistry, MetricsCollector, NodeTracker};
use loupe::pipeline::assemble_context;

fn client_for(server: &MockServer) -> GithubClient {
    let config = GithubConfig {
        base_url: server.uri(),
        token: Some("test-token".to_string()),
        ..Default::default()
    };
    GithubClient::new(&config, Duration::from_secs(5)).unwrap()
}

fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.github.base_url = server.uri();
    config.github.token = None;
    config.timeouts.clone_secs = 2;
    config
}

fn file_entry(name: &str) -> serde_json::Value {
    serde_json::json!({
        "filename": name,
        "status": "modified",
        "additions": 3,
        "deletions": 1,
        "changes": 4,
        "patch": SAMPLE_PATCH
    })
}

fn pr_metadata(head_sha: &str) -> serde_json::Value {
    serde_json::json!({
        "number": 123,
        "title": "Update test",
        "state": "open",
        "head": {"sha": head_sha},
        "base": {"sha": "b".repeat(40)},
        "changed_files": 1
    })
}

#[tokio::test]
async fn file_list_pages_through_100_per_page() {
    let server = MockServer::start().await;

    let first_page: Vec<serde_json::Value> =
        (0..100).map(|i| file_entry(&format!("src/file_{i}.py"))).collect();
    let second_page = vec![file_entry("src/last.py")];

    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/123/files"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&first_page))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/123/files"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&second_page))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let files = client.list_pull_request_files("octo/widgets", 123).await.unwrap();
    assert_eq!(files.len(), 101);
    assert_eq!(files[100].filename, "src/last.py");
}

#[tokio::test]
async fn status_codes_map_to_typed_errors() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "message": "Not Found"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/401"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/403"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert_eq!(
        client.get_pull_request("octo/widgets", 404).await.unwrap_err().code(),
        "github_pr_not_found"
    );
    assert_eq!(
        client.get_pull_request("octo/widgets", 401).await.unwrap_err().code(),
        "github_authentication"
    );
    assert_eq!(
        client.get_pull_request("octo/widgets", 403).await.unwrap_err().code(),
        "github_permission"
    );
}

#[tokio::test]
async fn too_many_files_fails_before_any_kg_call() {
    let server = MockServer::start().await;
    let request = sample_request();

    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pr_metadata(&request.head_sha)))
        .mount(&server)
        .await;
    let files: Vec<serde_json::Value> =
        (0..60).map(|i| file_entry(&format!("src/f{i}.py"))).collect();
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/123/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&files))
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.limits.max_changed_files = 50;

    let metrics = MetricsCollector::new();
    let nodes = NodeTracker::new(8);
    let breakers = BreakerRegistry::new(&config.breaker);
    let github = GithubClient::new(&config.github, Duration::from_secs(5)).unwrap();

    let err = assemble_context(
        &config,
        &github,
        None,
        &metrics,
        &nodes,
        &breakers,
        &request,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), "pr_too_large");
    assert!(!err.recoverable());
}

#[tokio::test]
async fn assemble_context_degrades_without_kg_and_clone() {
    let server = MockServer::start().await;
    let request = sample_request();

    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pr_metadata(&request.head_sha)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/123/files"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(vec![file_entry("src/test.py")]),
        )
        .mount(&server)
        .await;

    let config = config_for(&server);
    let metrics = MetricsCollector::new();
    let nodes = NodeTracker::new(8);
    let breakers = BreakerRegistry::new(&config.breaker);
    let github = GithubClient::new(&config.github, Duration::from_secs(5)).unwrap();

    let assembly = assemble_context(
        &config,
        &github,
        None,
        &metrics,
        &nodes,
        &breakers,
        &request,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(assembly.total_files_changed, 1);
    assert_eq!(assembly.parseable_files, 1);
    assert!(assembly.mappings.is_valid_anchor("src/test.py", "hunk_1"));
    assert!(assembly.warnings.contains(&"kg_unconfigured".to_string()));
    // The clone of a nonexistent repo fails and degrades with a warning
    assert!(assembly
        .warnings
        .iter()
        .any(|w| w.starts_with("clone_failed")));
}

#[tokio::test]
async fn binary_entry_keeps_pipeline_parseable() {
    let server = MockServer::start().await;
    let request = sample_request();

    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pr_metadata(&request.head_sha)))
        .mount(&server)
        .await;
    let files = vec![
        file_entry("src/test.py"),
        serde_json::json!({
            "filename": "logo.png",
            "status": "modified",
            "additions": 0,
            "deletions": 0,
            "changes": 0
        }),
    ];
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls/123/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&files))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let metrics = MetricsCollector::new();
    let nodes = NodeTracker::new(8);
    let breakers = BreakerRegistry::new(&config.breaker);
    let github = GithubClient::new(&config.github, Duration::from_secs(5)).unwrap();

    let assembly = assemble_context(
        &config,
        &github,
        None,
        &metrics,
        &nodes,
        &breakers,
        &request,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(assembly.total_files_changed, 2);
    assert_eq!(assembly.parseable_files, 1);
    let binary = assembly.patches.iter().find(|p| p.file_path == "logo.png").unwrap();
    assert!(binary.is_binary);
    assert!(binary.hunks.is_empty());
}

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use slack_export::output::LocalFileSink;
use slack_export::settings::RateLimits;
use slack_export::slack::SlackClient;
use slack_export::{
    ChannelExport, ChannelExportRequest, ExportPipeline, ProgressObserver, ProgressUpdate,
    SessionEvent, Settings, Stage,
};
use tokio::sync::Mutex;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OLDEST_MS: i64 = 1_700_000_000_000;

#[derive(Default)]
struct Recorder {
    updates: Mutex<Vec<ProgressUpdate>>,
}

#[async_trait]
impl ProgressObserver for Recorder {
    async fn progress(&self, update: ProgressUpdate) {
        self.updates.lock().await.push(update);
    }

    async fn session(&self, _event: SessionEvent) {}
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.export.file_name_format = "{channel}.md".to_string();
    settings.export.include_timestamps = false;
    settings.rate_limits = RateLimits::none();
    settings
}

async fn mount_json(server: &MockServer, api: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(api))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_channel(server: &MockServer) {
    let file_url = format!("{}/files/diagram.png", server.uri());
    Mock::given(method("GET"))
        .and(path("/conversations.history"))
        .and(query_param("oldest", "1700000000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "has_more": false,
            "messages": [
                {"ts": "1700000300.000000", "user": "U1", "text": "see <@U2>",
                 "files": [{"id": "F1", "name": "diagram.png", "mimetype": "image/png",
                            "url_private": file_url}]},
                {"ts": "1700000200.000000", "user": "U2", "subtype": "channel_join",
                 "text": "<@U2> has joined the channel"},
                {"ts": "1700000100.000000", "user": "U1", "text": "release &amp; notes",
                 "thread_ts": "1700000100.000000", "reply_count": 1},
                {"ts": "1699999000.000000", "user": "U1", "text": "too old"}
            ]
        })))
        .mount(server)
        .await;

    mount_json(
        server,
        "/conversations.replies",
        json!({
            "ok": true,
            "messages": [
                {"ts": "1700000100.000000", "user": "U1", "text": "release &amp; notes",
                 "thread_ts": "1700000100.000000"},
                {"ts": "1700000150.000000", "user": "U2", "text": "shipped\n```\nv1.2\n```",
                 "thread_ts": "1700000100.000000"}
            ]
        }),
    )
    .await;

    mount_json(
        server,
        "/users.list",
        json!({"ok": true, "members": [{"id": "U1", "name": "alice", "real_name": "Alice"}]}),
    )
    .await;
    mount_json(
        server,
        "/users.info",
        json!({"ok": true, "user": {"id": "U2", "name": "bob", "profile": {"display_name": "Bob"}}}),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/files/diagram.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(vec![0x89, b'P', b'N', b'G']),
        )
        .expect(1)
        .mount(server)
        .await;
}

fn pipeline(server: &MockServer, root: &std::path::Path, observer: Arc<Recorder>) -> ExportPipeline {
    let client = SlackClient::with_api_url("xoxb-test", server.uri()).unwrap();
    ExportPipeline::new(client, Arc::new(LocalFileSink::new(root)), observer, &settings())
}

fn request() -> ChannelExportRequest {
    ChannelExportRequest {
        channel_id: "C0123456789".to_string(),
        channel_name: "general".to_string(),
        oldest_timestamp_ms: OLDEST_MS,
    }
}

#[tokio::test]
async fn test_exports_channel_end_to_end() {
    let server = MockServer::start().await;
    mount_channel(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(Recorder::default());

    let response = pipeline(&server, dir.path(), observer.clone())
        .export_channel(request())
        .await;

    assert!(response.success, "{:?}", response.error);
    assert!(response.markdown_saved);
    assert_eq!(response.message_count, 2);
    assert_eq!(response.attachment_count, 1);

    let md = &response.markdown;
    assert!(md.starts_with("# general\n"));
    assert!(md.contains("**Alice**:\n\nrelease & notes"));
    assert!(md.contains("**Thread Replies:**\n\n- **Bob**: shipped"));
    assert!(md.contains("see @Bob"));
    assert!(md.contains("![diagram.png](attachments/general/"));
    assert!(!md.contains("/files/diagram.png"));
    assert!(!md.contains("joined"));
    assert!(!md.contains("too old"));
    assert!(md.find("release").unwrap() < md.find("see @Bob").unwrap());

    let saved = std::fs::read_to_string(dir.path().join("general.md")).unwrap();
    assert_eq!(&saved, md);
    let html = std::fs::read_to_string(dir.path().join("general.html")).unwrap();
    assert!(html.contains("<title>general</title>"));

    let attachments: Vec<_> = std::fs::read_dir(dir.path().join("attachments/general"))
        .unwrap()
        .collect();
    assert_eq!(attachments.len(), 1);

    let stages: Vec<Stage> = observer.updates.lock().await.iter().map(|u| u.stage).collect();
    let mut expected = Stage::PIPELINE.iter().peekable();
    for stage in &stages {
        if expected.peek() == Some(&stage) {
            expected.next();
        }
    }
    assert!(expected.peek().is_none(), "stages out of order: {:?}", stages);
    assert_eq!(stages.last(), Some(&Stage::Done));
}

#[tokio::test]
async fn test_thread_replies_fetched_once() {
    let server = MockServer::start().await;
    mount_channel(&server).await;
    let dir = tempfile::tempdir().unwrap();

    pipeline(&server, dir.path(), Arc::new(Recorder::default()))
        .export_channel(request())
        .await;

    let replies = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/conversations.replies")
        .count();
    assert_eq!(replies, 1);
}

#[tokio::test]
async fn test_empty_channel_still_saves_document() {
    let server = MockServer::start().await;
    mount_json(&server, "/conversations.history", json!({"ok": true, "messages": []})).await;
    let dir = tempfile::tempdir().unwrap();

    let response = pipeline(&server, dir.path(), Arc::new(Recorder::default()))
        .export_channel(request())
        .await;

    assert!(response.success);
    assert_eq!(response.message_count, 0);
    let saved = std::fs::read_to_string(dir.path().join("general.md")).unwrap();
    assert!(saved.contains("_No messages found in this time range._"));
}

#[tokio::test]
async fn test_history_failure_becomes_error_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversations.history"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(Recorder::default());

    let response = pipeline(&server, dir.path(), observer.clone())
        .export_channel(request())
        .await;

    assert!(!response.success);
    assert!(response.markdown_saved);
    assert!(response.error.as_deref().unwrap().starts_with("fetch failed"));
    assert!(response.markdown.contains("_Export failed:"));
    let saved = std::fs::read_to_string(dir.path().join("general.md")).unwrap();
    assert_eq!(saved, response.markdown);
    assert!(dir.path().join("general.html").exists());

    let updates = observer.updates.lock().await;
    assert_eq!(updates.last().map(|u| u.stage), Some(Stage::Error));
}

#[tokio::test]
async fn test_auth_failure_short_circuits() {
    let server = MockServer::start().await;
    mount_json(
        &server,
        "/conversations.history",
        json!({"ok": false, "error": "invalid_auth"}),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();

    let response = pipeline(&server, dir.path(), Arc::new(Recorder::default()))
        .export_channel(request())
        .await;

    assert!(!response.success);
    assert!(response.error.as_deref().unwrap().starts_with("authentication error"));
    let history_calls = server.received_requests().await.unwrap().len();
    assert_eq!(history_calls, 1);
}

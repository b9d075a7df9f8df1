// crates/server/tests/rpc_test.rs
//! Line-level RPC tests: real store, real git, one request line in, one
//! response line out.

use hindsight_core::parse_transcript;
use hindsight_db::Store;
use hindsight_git::RepoResolver;
use hindsight_server::{rpc, AppState};
use serde_json::{json, Value};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

async fn test_state() -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("conversations.db"))
        .await
        .unwrap();
    let state = AppState::new(
        store,
        Arc::new(RepoResolver::new()),
        dir.path().join("transcripts"),
    );
    (dir, state)
}

async fn seed_conversation(dir: &tempfile::TempDir, state: &AppState) {
    let path = dir.path().join("4a77fa00.jsonl");
    let content = concat!(
        r#"{"type":"user","sessionId":"4a77fa00-8","cwd":"/home/me/ketchup","timestamp":"2026-07-01T09:00:00Z","message":{"content":"tell me about ketchup"}}"#,
        "\n",
        r#"{"type":"assistant","timestamp":"2026-07-01T09:00:02Z","message":{"content":"Ketchup is a tomato condiment for the project."}}"#,
        "\n",
    );
    let mut file = tokio::fs::File::create(&path).await.unwrap();
    file.write_all(content.as_bytes()).await.unwrap();
    file.flush().await.unwrap();

    let parsed = parse_transcript(&path).await.unwrap();
    state
        .store
        .index_transcript(parsed.conversation, parsed.messages)
        .await
        .unwrap();
}

async fn call(state: &AppState, request: Value) -> Value {
    let line = request.to_string();
    let response = rpc::handle_line(state, &line).await;
    serde_json::from_str(&response).unwrap()
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git available in test environment");
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::create_dir_all(dir.join("ketchup")).unwrap();
    std::fs::write(dir.join("ketchup/recipe.md"), "tomato\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "ketchup: add recipe"]);
}

#[tokio::test]
async fn search_conversations_returns_spec_shape() {
    let (dir, state) = test_state().await;
    seed_conversation(&dir, &state).await;

    let response = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "search_conversations",
            "params": {"query": "project ketchup", "limit": 5}
        }),
    )
    .await;

    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 7);
    let result = &response["result"];
    assert_eq!(result["query"], "project ketchup");
    assert!(result["total_found"].as_i64().unwrap() >= 1);
    let first = &result["results"][0];
    assert_eq!(first["sessionId"], "4a77fa00-8");
    assert!(first["preview"].as_str().unwrap().contains("ketchup"));
    assert_eq!(result["showing"], result["results"].as_array().unwrap().len());
}

#[tokio::test]
async fn get_conversation_context_paginates() {
    let (dir, state) = test_state().await;
    seed_conversation(&dir, &state).await;

    let response = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": "ctx-1",
            "method": "get_conversation_context",
            "params": {"sessionId": "4a77fa00-8", "page": 1, "pageSize": 1}
        }),
    )
    .await;

    assert_eq!(response["id"], "ctx-1");
    let result = &response["result"];
    assert_eq!(result["sessionId"], "4a77fa00-8");
    assert_eq!(result["totalMessages"], 2);
    assert_eq!(result["totalPages"], 2);
    let messages = result["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["index"], 0);
    assert_eq!(messages[0]["role"], "user");
}

#[tokio::test]
async fn list_recent_returns_array() {
    let (dir, state) = test_state().await;
    seed_conversation(&dir, &state).await;

    let response = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "list_recent_conversations",
            "params": {"limit": 10}
        }),
    )
    .await;

    let result = response["result"].as_array().unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["sessionId"], "4a77fa00-8");
    assert!(result[0]["lastUpdated"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn health_check_reports_counts() {
    let (dir, state) = test_state().await;
    seed_conversation(&dir, &state).await;

    let response = call(
        &state,
        json!({"jsonrpc": "2.0", "id": 2, "method": "health_check"}),
    )
    .await;

    let result = &response["result"];
    assert_eq!(result["integrity"], "ok");
    assert_eq!(result["conversations"], 1);
    assert_eq!(result["messages"], 2);
    assert!(result["dbSizeMB"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn performance_metrics_reflect_prior_calls() {
    let (dir, state) = test_state().await;
    seed_conversation(&dir, &state).await;

    call(
        &state,
        json!({"jsonrpc": "2.0", "id": 3, "method": "health_check"}),
    )
    .await;
    let response = call(
        &state,
        json!({"jsonrpc": "2.0", "id": 4, "method": "performance_metrics", "params": {}}),
    )
    .await;

    let methods = response["result"]["methods"].as_array().unwrap();
    assert!(methods
        .iter()
        .any(|m| m["method"] == "health_check" && m["count"].as_u64().unwrap() >= 1));
}

#[tokio::test]
async fn parse_error_gets_code_32700() {
    let (_dir, state) = test_state().await;
    let response: Value =
        serde_json::from_str(&rpc::handle_line(&state, "{not json at all").await).unwrap();
    assert_eq!(response["error"]["code"], -32700);
    assert_eq!(response["id"], Value::Null);
}

#[tokio::test]
async fn invalid_params_get_code_32602() {
    let (_dir, state) = test_state().await;
    let response = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "search_conversations",
            "params": {"limit": 5}
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
    assert_eq!(response["id"], 9);
}

#[tokio::test]
async fn unknown_method_is_an_invalid_params_fault() {
    let (_dir, state) = test_state().await;
    let response = call(
        &state,
        json!({"jsonrpc": "2.0", "id": 10, "method": "launch_rockets"}),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn git_faults_carry_no_paths() {
    let (_dir, state) = test_state().await;
    let missing = tempfile::tempdir().unwrap();
    let response = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 11,
            "method": "get_git_context",
            "params": {"projectPath": missing.path().to_string_lossy()}
        }),
    )
    .await;

    assert_eq!(response["error"]["code"], -32001);
    let message = response["error"]["message"].as_str().unwrap();
    assert!(
        !message.contains(missing.path().to_string_lossy().as_ref()),
        "error message must not leak the path: {message}"
    );
}

#[tokio::test]
async fn get_git_context_filters_monorepo_subdirectory() {
    let (_dir, state) = test_state().await;
    let repo = tempfile::tempdir().unwrap();
    init_repo(repo.path());
    // A root-level commit the subdirectory query must not see.
    std::fs::write(repo.path().join("unrelated.txt"), "x\n").unwrap();
    git(repo.path(), &["add", "."]);
    git(repo.path(), &["commit", "-m", "root: unrelated"]);

    let sub = repo.path().join("ketchup");
    let response = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 12,
            "method": "get_git_context",
            "params": {"projectPath": sub.to_string_lossy(), "limit": 5}
        }),
    )
    .await;

    let result = &response["result"];
    assert_eq!(result["is_monorepo_subdirectory"], true);
    assert_eq!(result["subdirectoryPath"], "ketchup");
    let commits = result["commits"].as_array().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0]["message"], "ketchup: add recipe");
}

#[tokio::test]
async fn restore_point_lifecycle_over_rpc() {
    let (_dir, state) = test_state().await;
    let repo = tempfile::tempdir().unwrap();
    init_repo(repo.path());
    let repo_path = repo.path().to_string_lossy().to_string();

    let created = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 20,
            "method": "create_restore_point",
            "params": {"projectPath": repo_path, "label": "before-refactor"}
        }),
    )
    .await;
    let id = created["result"]["id"].as_i64().unwrap();
    let hash = created["result"]["hash"].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 40);

    // Fresh point previews as an empty change plan.
    let preview = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 21,
            "method": "preview_restore",
            "params": {"projectPath": repo_path, "restorePointId": id}
        }),
    )
    .await;
    assert_eq!(
        preview["result"]["filesChanged"].as_array().unwrap().len(),
        0
    );

    // Drift, then restore.
    std::fs::write(repo.path().join("ketchup/recipe.md"), "mustard\n").unwrap();
    git(repo.path(), &["add", "."]);
    git(repo.path(), &["commit", "-m", "drift"]);

    let restored = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 22,
            "method": "restore_project_state",
            "params": {"projectPath": repo_path, "restorePointId": id}
        }),
    )
    .await;
    assert_eq!(restored["result"]["restored"]["hash"], hash.as_str());
    assert!(restored["result"]["safety"]["label"]
        .as_str()
        .unwrap()
        .starts_with("safety-"));

    // HEAD really is at the bookmarked hash.
    let head = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo.path())
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&head.stdout).trim(), hash);

    let listed = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 23,
            "method": "list_restore_points",
            "params": {"projectPath": repo_path}
        }),
    )
    .await;
    assert_eq!(listed["result"].as_array().unwrap().len(), 2);

    let missing = call(
        &state,
        json!({
            "jsonrpc": "2.0",
            "id": 24,
            "method": "preview_restore",
            "params": {"projectPath": repo_path, "restorePointId": 9999}
        }),
    )
    .await;
    assert_eq!(missing["error"]["code"], -32602);
}

#[tokio::test]
async fn serve_round_trips_over_byte_streams() {
    let (dir, state) = test_state().await;
    seed_conversation(&dir, &state).await;

    let input = concat!(
        r#"{"jsonrpc":"2.0","id":1,"method":"health_check"}"#,
        "\n",
        r#"{"jsonrpc":"2.0","id":2,"method":"list_recent_conversations","params":{}}"#,
        "\n",
    );
    let reader = tokio::io::BufReader::new(input.as_bytes());
    let (writer, mut sink_rx) = {
        // Collect writer output through a duplex pipe.
        let (a, b) = tokio::io::duplex(64 * 1024);
        (a, b)
    };

    rpc::serve(state, reader, writer).await.unwrap();

    use tokio::io::AsyncReadExt;
    let mut output = String::new();
    sink_rx.read_to_string(&mut output).await.unwrap();

    let lines: Vec<&str> = output.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 2);
    let mut ids: Vec<i64> = lines
        .iter()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_i64().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2]);
}

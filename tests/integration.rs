use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn bookmemo_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_bookmemo"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[data]
dir = "{}/data"

[server]
bind = "127.0.0.1:0"

[catalog]
endpoint = "http://127.0.0.1:9/volumes"
max_results = 7
timeout_secs = 1
"#,
        root.display()
    );

    let config_path = config_dir.join("bookmemo.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn data_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("data")
}

fn run_bookmemo(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = bookmemo_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("PORT")
        .env_remove("DATA_DIR")
        .env_remove("SIMULATED_LATENCY_MS")
        .env_remove("SIMULATED_FAILURE_RATE")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run bookmemo binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn seed_search_cache(config_path: &Path) {
    let cache = serde_json::json!({
        "guest": {
            "dune": {
                "results": [{
                    "id": "vol-dune",
                    "title": "Dune",
                    "authors": ["Frank Herbert"],
                    "description": "",
                    "thumbnail": null,
                    "infoLink": null,
                    "publishedDate": "1965",
                    "source": "google-books"
                }],
                "cachedAt": "2024-05-01T10:00:00.000Z"
            }
        },
        "user:u1": {
            "dune": { "results": [], "cachedAt": "2024-05-01T10:00:00.000Z" }
        }
    });
    fs::write(
        data_dir(config_path).join("searchCache.json"),
        serde_json::to_string_pretty(&cache).unwrap(),
    )
    .unwrap();
}

fn read_json(path: PathBuf) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_init_creates_documents() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_bookmemo(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("4 documents created"));

    let data = data_dir(&config_path);
    for file in ["library.json", "auth.json", "publicMemos.json", "searchCache.json"] {
        assert!(data.join(file).exists(), "{} missing", file);
    }
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_bookmemo(&config_path, &["init"]);
    assert!(success1, "First init failed");

    seed_search_cache(&config_path);

    let (stdout, _, success2) = run_bookmemo(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
    assert!(stdout.contains("0 documents created"));

    // Existing documents are left alone.
    let cache = read_json(data_dir(&config_path).join("searchCache.json"));
    assert!(cache["guest"]["dune"].is_object());
}

#[test]
fn test_missing_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (stdout, stderr, success) = run_bookmemo(&missing, &["search", "   "]);
    assert!(success, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    fs::write(&config_path, "[catalog]\nmax_results = 0\n").unwrap();

    let (_, stderr, success) = run_bookmemo(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("max_results"));
}

#[test]
fn test_search_served_from_cache() {
    let (_tmp, config_path) = setup_test_env();
    run_bookmemo(&config_path, &["init"]);
    seed_search_cache(&config_path);

    let (stdout, stderr, success) = run_bookmemo(&config_path, &["search", "  DUNE "]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("1 results (cached 2024-05-01T10:00:00.000Z)"));
    assert!(stdout.contains("Dune by Frank Herbert"));
    assert!(stdout.contains("id: vol-dune"));
}

#[test]
fn test_search_reports_unreachable_catalog() {
    let (_tmp, config_path) = setup_test_env();
    run_bookmemo(&config_path, &["init"]);

    let (_, stderr, success) = run_bookmemo(&config_path, &["search", "dune", "--skip-cache"]);
    assert!(!success);
    assert!(stderr.contains("Unable to fetch books right now."));
}

#[test]
fn test_cache_clear_for_user() {
    let (_tmp, config_path) = setup_test_env();
    run_bookmemo(&config_path, &["init"]);
    seed_search_cache(&config_path);

    let (stdout, stderr, success) =
        run_bookmemo(&config_path, &["cache", "clear", "--user", "u1"]);
    assert!(success, "cache clear failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Search cache cleared."));

    let cache = read_json(data_dir(&config_path).join("searchCache.json"));
    assert!(cache["guest"]["dune"].is_object());
    assert!(cache["user:u1"].get("dune").is_none());
}

#[test]
fn test_cache_clear_query_everywhere() {
    let (_tmp, config_path) = setup_test_env();
    run_bookmemo(&config_path, &["init"]);
    seed_search_cache(&config_path);

    let (_, _, success) = run_bookmemo(&config_path, &["cache", "clear", "--query", " Dune "]);
    assert!(success);

    let cache = read_json(data_dir(&config_path).join("searchCache.json"));
    assert!(cache["guest"].get("dune").is_none());
    assert!(cache["user:u1"].get("dune").is_none());
}

#[test]
fn test_users_never_prints_passwords() {
    let (_tmp, config_path) = setup_test_env();
    run_bookmemo(&config_path, &["init"]);

    let (stdout, _, _) = run_bookmemo(&config_path, &["users"]);
    assert!(stdout.contains("No users."));

    let auth = serde_json::json!({
        "users": [{
            "id": "user-1",
            "name": "Alice",
            "email": "alice@example.com",
            "password": "hunter2"
        }],
        "sessions": {}
    });
    fs::write(data_dir(&config_path).join("auth.json"), auth.to_string()).unwrap();

    let (stdout, stderr, success) = run_bookmemo(&config_path, &["users"]);
    assert!(success, "users failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("user-1  Alice <alice@example.com>"));
    assert!(!stdout.contains("hunter2"));
}

#[test]
fn test_memos_for_book() {
    let (_tmp, config_path) = setup_test_env();
    run_bookmemo(&config_path, &["init"]);

    let (stdout, _, success) = run_bookmemo(&config_path, &["memos", "vol-dune"]);
    assert!(success);
    assert!(stdout.contains("No public memos for vol-dune."));

    let store = serde_json::json!({
        "vol-dune": [{
            "id": "m1",
            "body": "The spice must flow.",
            "createdAt": "2024-05-01T10:00:00.000Z",
            "author": { "id": "user-1", "name": "Alice" },
            "sharedAt": "2024-05-02T10:00:00.000Z"
        }]
    });
    fs::write(
        data_dir(&config_path).join("publicMemos.json"),
        store.to_string(),
    )
    .unwrap();

    let (stdout, stderr, success) = run_bookmemo(&config_path, &["memos", "vol-dune"]);
    assert!(success, "memos failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("1 public memos for vol-dune"));
    assert!(stdout.contains("Alice (shared 2024-05-02T10:00:00.000Z)"));
    assert!(stdout.contains("The spice must flow."));
}

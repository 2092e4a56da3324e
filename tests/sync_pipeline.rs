use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracemirror::config::Config;
use tracemirror::orchestrator::{backfill, FileReport, SyncPipeline};
use tracemirror::store::{MirrorStore, StoreExecutor};

struct Fixture {
    dir: TempDir,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.database.path = dir.path().join("mirror.db").display().to_string();
        config.watch.root = dir.path().join("logs").display().to_string();
        config.engine.state_dir = dir.path().join("state").display().to_string();
        fs::create_dir_all(dir.path().join("logs/proj")).unwrap();
        Self { dir, config }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    fn write_log(&self, name: &str, lines: &[&str]) -> PathBuf {
        let path = self.root().join("proj").join(name);
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&path, content).unwrap();
        path
    }

    fn pipeline(&self) -> SyncPipeline {
        let executor = StoreExecutor::open(&self.config.database_path(), &self.config.database).unwrap();
        SyncPipeline::new(&self.root(), Arc::new(executor))
    }

    fn store(&self) -> MirrorStore {
        MirrorStore::open_read_only(&self.config.database_path()).unwrap()
    }
}

fn user(id: &str, ts: &str, text: &str) -> String {
    format!(
        r#"{{"type":"user","uuid":"{}","timestamp":"{}","message":{{"role":"user","content":"{}"}}}}"#,
        id, ts, text
    )
}

fn message_ids(store: &MirrorStore, session: &str) -> Vec<String> {
    store
        .get_messages(session)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect()
}

#[test]
fn test_two_messages_and_a_bad_line() {
    let fx = Fixture::new();
    let m1 = user("m1", "2024-01-01T10:00:00Z", "hello");
    let m2 = r#"{"type":"assistant","uuid":"m2","timestamp":"2024-01-01T10:00:05Z","message":{"role":"assistant","model":"model-x","content":[{"type":"text","text":"hi there"}]}}"#;
    let path = fx.write_log("s1.jsonl", &[&m1, "{not json", m2]);

    let pipeline = fx.pipeline();
    pipeline.sync_file(&path).unwrap();

    let store = fx.store();
    let messages = store.get_messages("proj/s1").unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "m1");
    assert_eq!(messages[0].user_text.as_deref(), Some("hello"));
    assert_eq!(messages[1].agent_text.as_deref(), Some("hi there"));
    assert_eq!(messages[1].model.as_deref(), Some("model-x"));

    let errors = store.parse_errors(&path).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line_number, 2);

    // Appending a line re-reads the whole file; m1 stays a single row
    let m3 = user("m3", "2024-01-01T10:01:00Z", "again");
    fx.write_log("s1.jsonl", &[&m1, "{not json", m2, &m3]);
    pipeline.sync_file(&path).unwrap();

    assert_eq!(message_ids(&store, "proj/s1"), vec!["m1", "m2", "m3"]);
    let session = store.get_session("proj/s1").unwrap().unwrap();
    assert_eq!(session.project.as_deref(), Some("proj"));
    assert_eq!(session.created_at, "2024-01-01T10:00:00.000Z");
    assert_eq!(session.last_activity, "2024-01-01T10:01:00.000Z");
}

#[test]
fn test_bad_lines_do_not_block_good_ones() {
    let fx = Fixture::new();
    let mut lines: Vec<String> = (0..5)
        .map(|i| user(&format!("m{}", i), &format!("2024-01-01T10:00:0{}Z", i), "ok"))
        .collect();
    lines.insert(1, "[1, 2, 3]".to_string());
    lines.insert(3, "\u{0}garbage".to_string());
    lines.insert(5, "{\"type\":".to_string());
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let path = fx.write_log("s2.jsonl", &refs);

    fx.pipeline().sync_file(&path).unwrap();

    let store = fx.store();
    assert_eq!(store.get_messages("proj/s2").unwrap().len(), 5);
    assert_eq!(store.parse_errors(&path).unwrap().len(), 3);
}

#[test]
fn test_messages_ordered_by_time_then_id() {
    let fx = Fixture::new();
    let path = fx.write_log(
        "s3.jsonl",
        &[
            &user("b", "2024-01-01T10:00:02Z", "second"),
            &user("z", "2024-01-01T10:00:01Z", "first"),
            // no timestamp: carries forward 10:00:01, then the tie goes to the smaller id
            r#"{"type":"user","uuid":"c","message":{"content":"follow-up"}}"#,
        ],
    );

    fx.pipeline().sync_file(&path).unwrap();

    let store = fx.store();
    let messages = store.get_messages("proj/s3").unwrap();
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "z", "b"]);
    assert_eq!(messages[0].timestamp, messages[1].timestamp);
    assert_eq!(messages[0].line_number, 3);
}

#[test]
fn test_tool_invocation_and_result_are_linked() {
    let fx = Fixture::new();
    let call = r#"{"type":"assistant","uuid":"a1","timestamp":"2024-01-01T10:00:00Z","message":{"content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file":"x.rs"}}]}}"#;
    let output = r#"{"type":"user","uuid":"u1","timestamp":"2024-01-01T10:00:01Z","toolUseResult":{},"message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"fn main() {}"}]}}"#;
    let path = fx.write_log("s4.jsonl", &[call, output]);

    fx.pipeline().sync_file(&path).unwrap();

    let store = fx.store();
    let calls = store.get_tool_calls("a1").unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tool_name, "Read");
    assert_eq!(calls[0].output.as_deref(), Some("fn main() {}"));
    assert_eq!(calls[0].error_output, None);

    let kinds: Vec<String> = store
        .get_messages("proj/s4")
        .unwrap()
        .into_iter()
        .map(|m| m.kind)
        .collect();
    assert_eq!(kinds, vec!["assistant", "tool_result"]);
}

#[test]
fn test_orphan_result_aborts_whole_file() {
    let fx = Fixture::new();
    let orphan = r#"{"type":"user","uuid":"u1","timestamp":"2024-01-01T10:00:01Z","message":{"content":[{"type":"tool_result","tool_use_id":"ghost","content":"?"}]}}"#;
    let path = fx.write_log("s5.jsonl", &[&user("m1", "2024-01-01T10:00:00Z", "hi"), orphan]);

    let pipeline = fx.pipeline();
    assert!(pipeline.sync_file(&path).is_err());

    let store = fx.store();
    let stats = store.stats().unwrap();
    assert_eq!(stats.sessions, 0);
    assert_eq!(stats.messages, 0);
    assert_eq!(stats.files, 0);

    // Not recorded as synced, so the next attempt runs again
    assert!(pipeline.sync_file(&path).is_err());
}

#[test]
fn test_result_may_reference_invocation_from_stored_file() {
    let fx = Fixture::new();
    let call = r#"{"type":"assistant","uuid":"a1","timestamp":"2024-01-01T10:00:00Z","message":{"content":[{"type":"tool_use","id":"t9","name":"Bash","input":{}}]}}"#;
    let output = r#"{"type":"user","uuid":"u9","timestamp":"2024-01-01T10:00:02Z","message":{"content":[{"type":"tool_result","tool_use_id":"t9","is_error":true,"content":"exit 1"}]}}"#;
    let first = fx.write_log("s6.jsonl", &[call]);
    let second = fx.write_log("s7.jsonl", &[output]);

    let pipeline = fx.pipeline();
    pipeline.sync_file(&first).unwrap();
    pipeline.sync_file(&second).unwrap();

    let calls = fx.store().get_tool_calls("a1").unwrap();
    assert_eq!(calls[0].output, None);
    assert_eq!(calls[0].error_output.as_deref(), Some("exit 1"));
}

#[test]
fn test_backfill_is_idempotent() {
    let fx = Fixture::new();
    fx.write_log("s1.jsonl", &[&user("m1", "2024-01-01T10:00:00Z", "a")]);
    fx.write_log("s2.jsonl", &[&user("m2", "2024-01-01T11:00:00Z", "b"), "oops"]);
    fs::write(fx.root().join("proj/notes.txt"), "ignored").unwrap();
    fs::write(fx.root().join("proj/.hidden.jsonl"), user("h", "2024-01-01T00:00:00Z", "x")).unwrap();

    let first = backfill(&fx.config).unwrap();
    assert_eq!(first.files, 2);
    assert_eq!(first.synced, 2);
    assert_eq!(first.messages, 2);
    assert_eq!(first.line_errors, 1);
    let stats_after_first = fx.store().stats().unwrap();

    let second = backfill(&fx.config).unwrap();
    assert_eq!(second.synced, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(fx.store().stats().unwrap(), stats_after_first);
}

#[test]
fn test_duplicate_ids_across_files_stored_once() {
    let fx = Fixture::new();
    let shared = user("dup", "2024-01-01T10:00:00Z", "same");
    let a = fx.write_log("sa.jsonl", &[&shared]);
    let b = fx.write_log("sb.jsonl", &[&shared, &user("own", "2024-01-01T10:00:01Z", "x")]);

    let pipeline = fx.pipeline();
    pipeline.sync_file(&a).unwrap();
    match pipeline.sync_file(&b).unwrap() {
        FileReport::Synced { outcome, .. } => assert_eq!(outcome.messages, 1),
        other => panic!("unexpected report: {:?}", other),
    }

    let store = fx.store();
    assert_eq!(store.stats().unwrap().messages, 2);
    assert_eq!(message_ids(&store, "proj/sa"), vec!["dup"]);
    assert_eq!(message_ids(&store, "proj/sb"), vec!["own"]);
}

#[test]
fn test_backfill_requires_root() {
    let fx = Fixture::new();
    let mut config = fx.config.clone();
    config.watch.root = Path::new(&fx.config.watch.root).join("nope").display().to_string();
    assert!(backfill(&config).is_err());
}

#[test]
fn test_repeated_record_inserted_once() {
    let fx = Fixture::new();
    let m1 = r#"{"id":"m1","type":"user","timestamp":"2024-03-01T08:00:00Z","message":{"content":"question"}}"#;
    let m2 = r#"{"id":"m2","type":"assistant","timestamp":"2024-03-01T08:00:03Z","message":{"content":[{"type":"text","text":"answer"}]}}"#;
    let path = fx.write_log("s8.jsonl", &["{bad json", m1, m1, m2]);

    match fx.pipeline().sync_file(&path).unwrap() {
        FileReport::Synced {
            records,
            line_errors,
            outcome,
        } => {
            assert_eq!(records, 3);
            assert_eq!(line_errors, 1);
            assert_eq!(outcome.messages, 2);
        }
        other => panic!("unexpected report: {:?}", other),
    }

    let store = fx.store();
    assert_eq!(message_ids(&store, "proj/s8"), vec!["m1", "m2"]);
    let errors = store.parse_errors(&path).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line_number, 1);
}

#[test]
fn test_same_file_name_in_two_projects_stays_separate() {
    let fx = Fixture::new();
    let alpha = fx.root().join("alpha");
    let beta = fx.root().join("beta");
    fs::create_dir_all(&alpha).unwrap();
    fs::create_dir_all(&beta).unwrap();
    let a = alpha.join("chat.jsonl");
    let b = beta.join("chat.jsonl");
    fs::write(&a, format!("{}\n", user("a1", "2024-01-01T10:00:00Z", "from alpha"))).unwrap();
    fs::write(&b, format!("{}\n", user("b1", "2024-02-01T10:00:00Z", "from beta"))).unwrap();

    let pipeline = fx.pipeline();
    pipeline.sync_file(&a).unwrap();
    pipeline.sync_file(&b).unwrap();

    let store = fx.store();
    assert_eq!(store.stats().unwrap().sessions, 2);
    assert_eq!(message_ids(&store, "alpha/chat"), vec!["a1"]);
    assert_eq!(message_ids(&store, "beta/chat"), vec!["b1"]);

    let session = store.get_session("beta/chat").unwrap().unwrap();
    assert_eq!(session.project.as_deref(), Some("beta"));
    assert_eq!(session.source_path, b.display().to_string());
    assert_eq!(session.created_at, "2024-02-01T10:00:00.000Z");

    // The bare file name still finds a session
    assert!(store.get_session("chat").unwrap().is_some());

    let ledger = store.sync_file(&a).unwrap().unwrap();
    assert_eq!(ledger.session_id.as_deref(), Some("alpha/chat"));
    assert_eq!(ledger.record_count, 1);
}

use jugaad_core::config::ClientConfig;
use jugaad_core::mock::MockTransport;
use jugaad_core::session::{ChatSession, MessageRole, NewMessage};
use jugaad_core::state::{SendOptions, SessionStore};
use jugaad_core::store::{SessionStorage, STORAGE_BLOB};
use jugaad_core::transport::ApiClient;
use std::sync::Arc;
use tempfile::TempDir;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn disk_store(dir: &TempDir) -> SessionStore {
    SessionStore::new(
        SessionStorage::in_directory(dir.path()),
        ApiClient::mock(Arc::new(MockTransport::default())),
    )
}

#[test]
fn sessions_survive_a_restart_but_selection_does_not() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let first = disk_store(&temp_dir);
    runtime
        .block_on(first.send_message("Where do I pay property tax?", SendOptions::default()))
        .expect("send message");
    first.mark_disconnected("Connection lost");
    let original = first.current_session().expect("session");

    let second = disk_store(&temp_dir);
    let state = second.snapshot();
    assert!(state.current_session.is_none());
    assert!(state.error.is_none());
    assert!(state.is_connected);
    assert!(!state.is_loading);
    assert_eq!(state.sessions, vec![original]);
}

#[test]
fn every_mutation_rewrites_the_blob() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = disk_store(&temp_dir);
    let blob = temp_dir.path().join(STORAGE_BLOB);

    let id = store.create_session();
    let raw = std::fs::read_to_string(&blob).expect("blob written");
    assert!(raw.contains(&id.to_string()));

    store.add_message(NewMessage::user("first"));
    let raw = std::fs::read_to_string(&blob).expect("blob");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(value["sessions"][0]["messages"][0]["content"], "first");
    assert!(value.get("current_session").is_none());

    store.delete_session(id);
    let raw = std::fs::read_to_string(&blob).expect("blob");
    assert!(!raw.contains(&id.to_string()));
}

#[test]
fn interrupted_replies_are_finalized_on_load() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut session = ChatSession::new();
    session.messages.push(NewMessage::user("hello").into_message());
    session
        .messages
        .push(NewMessage::assistant_placeholder().into_message());
    SessionStorage::in_directory(temp_dir.path())
        .save(&[session.clone(), session])
        .expect("seed");

    let store = disk_store(&temp_dir);
    let sessions = store.snapshot().sessions;
    assert_eq!(sessions.len(), 1, "duplicate ids are dropped");
    let reply = &sessions[0].messages[1];
    assert_eq!(reply.role, MessageRole::Assistant);
    assert!(!reply.is_loading);
    assert_eq!(reply.error.as_deref(), Some("Response was interrupted"));
}

#[test]
fn corrupt_storage_starts_empty() {
    let temp_dir = TempDir::new().expect("temp dir");
    std::fs::write(temp_dir.path().join(STORAGE_BLOB), "[[[").expect("write");
    let store = disk_store(&temp_dir);
    assert!(store.snapshot().sessions.is_empty());
    store.create_session();
    assert_eq!(disk_store(&temp_dir).session_summaries().len(), 1);
}

#[test]
fn app_wiring_uses_configured_storage() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let config = ClientConfig {
        storage_path: Some(temp_dir.path().to_path_buf()),
        ..ClientConfig::mock().expect("config")
    };
    let orchestrator = jugaad::build_orchestrator(&config).expect("orchestrator");
    runtime
        .block_on(orchestrator.send(
            "ping",
            SendOptions::default(),
            jugaad_core::orchestrator::SendMode::Streaming,
        ))
        .expect("send");
    assert!(temp_dir.path().join(STORAGE_BLOB).exists());
    assert_eq!(disk_store(&temp_dir).session_summaries()[0].message_count, 2);
}

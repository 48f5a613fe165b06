use jugaad::{build_orchestrator, parse_command, ChatApp, CliSettings, Command, Flow};
use jugaad_core::config::{ClientConfig, MonitorSettings, RetryPolicy};
use jugaad_core::mock::{MockStream, MockTransport};
use jugaad_core::monitor::ConnectionMonitor;
use jugaad_core::orchestrator::SendOrchestrator;
use jugaad_core::sse::StreamEvent;
use jugaad_core::state::SessionStore;
use jugaad_core::transport::ApiClient;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn mock_app(stream: bool) -> ChatApp<Vec<u8>> {
    let config = ClientConfig::mock().expect("config");
    let orchestrator = build_orchestrator(&config).expect("orchestrator");
    let settings = CliSettings {
        stream,
        ..CliSettings::default()
    };
    ChatApp::new(orchestrator, settings, None, Vec::new())
}

fn scripted_app(mock: Arc<MockTransport>) -> ChatApp<Vec<u8>> {
    let store = SessionStore::in_memory(ApiClient::mock(mock));
    let monitor = Arc::new(ConnectionMonitor::new(
        store.clone(),
        MonitorSettings::default(),
    ));
    let orchestrator = Arc::new(SendOrchestrator::new(
        store,
        monitor,
        RetryPolicy::default(),
    ));
    ChatApp::new(orchestrator, CliSettings::default(), None, Vec::new())
}

fn output(app: &ChatApp<Vec<u8>>) -> String {
    String::from_utf8_lossy(app.output()).into_owned()
}

fn run(app: &mut ChatApp<Vec<u8>>, runtime: &tokio::runtime::Runtime, line: &str) -> Flow {
    let command = parse_command(line).expect("command");
    runtime.block_on(app.execute(command)).expect("execute")
}

#[test]
fn blocking_and_streaming_replies_are_printed() {
    let runtime = test_runtime();
    for stream in [false, true] {
        let mut app = mock_app(stream);
        run(&mut app, &runtime, "hello");
        let printed = output(&app);
        assert!(
            printed.contains("Jugaad: [Mock] You asked: 'hello'."),
            "stream={stream}: {printed}"
        );
        assert!(printed.contains("confidence 90%"));
        let session = app.store().current_session().expect("session");
        assert_eq!(session.messages.len(), 2);
    }
}

#[test]
fn export_and_import_through_commands() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("chat.json");
    let mut app = mock_app(false);

    run(&mut app, &runtime, "/export somewhere.json");
    assert!(output(&app).contains("No chat is open."));

    run(&mut app, &runtime, "How do I link Aadhaar with PAN?");
    run(&mut app, &runtime, &format!("/export {}", path.display()));
    assert!(path.exists());

    run(&mut app, &runtime, &format!("/import {}", path.display()));
    let summaries = app.store().session_summaries();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].title, summaries[1].title);
    assert_ne!(summaries[0].id, summaries[1].id);

    run(&mut app, &runtime, "/import /definitely/not/here.json");
    assert!(output(&app).contains("cannot read"));
}

#[test]
fn session_commands_accept_id_prefixes() {
    let runtime = test_runtime();
    let mut app = mock_app(false);
    run(&mut app, &runtime, "first question");
    let first = app.store().current_session().expect("session").id;
    run(&mut app, &runtime, "/new");
    assert_ne!(app.store().current_session().map(|s| s.id), Some(first));

    let prefix: String = first.to_string().chars().take(8).collect();
    run(&mut app, &runtime, &format!("/load {prefix}"));
    assert_eq!(app.store().current_session().map(|s| s.id), Some(first));
    assert!(output(&app).contains("# first question"));

    run(&mut app, &runtime, "/load 00000000-0000-0000-0000-000000000000");
    assert!(output(&app).contains("! Not found: session"));

    run(&mut app, &runtime, &format!("/delete {prefix}"));
    assert!(app.store().current_session().is_none());
    assert_eq!(app.store().session_summaries().len(), 1);

    run(&mut app, &runtime, "/clear-all");
    assert!(app.store().session_summaries().is_empty());
}

#[test]
fn status_stream_toggle_and_quit() {
    let runtime = test_runtime();
    let mut app = mock_app(true);
    run(&mut app, &runtime, "/status");
    assert!(output(&app).contains("connection: online"));

    run(&mut app, &runtime, "/stream off");
    assert!(!app.settings().stream);

    run(&mut app, &runtime, "/rate 5");
    assert!(output(&app).contains("no assistant response to rate"));

    assert_eq!(run(&mut app, &runtime, "/quit"), Flow::Quit);
    assert_eq!(parse_command("/import"), Some(Command::Invalid("usage: /import <argument>".into())));
    assert_eq!(
        parse_command("/export a b.json"),
        Some(Command::Export(PathBuf::from("a b.json")))
    );
}

#[test]
fn ctrl_c_at_the_prompt_leaves_the_chat() {
    let runtime = test_runtime();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut app = mock_app(true).with_interrupts(rx);
    let (_writer, reader) = tokio::io::duplex(64);

    tx.send(()).expect("interrupt");
    runtime
        .block_on(app.run_with_input(BufReader::new(reader)))
        .expect("run");
    assert!(output(&app).starts_with("Jugaad chat."));
}

#[test]
fn ctrl_c_still_quits_after_a_streamed_reply() {
    let runtime = test_runtime();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut app = mock_app(true).with_interrupts(rx);
    let (mut writer, reader) = tokio::io::duplex(64);
    runtime
        .block_on(writer.write_all(b"hi\n"))
        .expect("write input");

    let store = app.store().clone();
    runtime.spawn(async move {
        let mut revisions = store.subscribe();
        while !store
            .current_session()
            .is_some_and(|s| s.messages.len() == 2 && !s.messages[1].is_loading)
        {
            if revisions.changed().await.is_err() {
                return;
            }
        }
        let _ = tx.send(());
    });

    runtime
        .block_on(app.run_with_input(BufReader::new(reader)))
        .expect("run");
    let printed = output(&app);
    assert!(printed.contains("[Mock] You asked: 'hi'."), "{printed}");
    let reply = &app.store().current_session().expect("session").messages[1];
    assert!(reply.error.is_none());
}

#[test]
fn ctrl_c_abandons_a_streaming_reply() {
    let runtime = test_runtime();
    let mock = Arc::new(MockTransport::default());
    let (events, script) = mpsc::unbounded_channel();
    mock.push_stream(MockStream::Channel(script));
    events
        .send(StreamEvent::Chunk("Partial".into()))
        .expect("chunk");
    let (tx, rx) = mpsc::unbounded_channel();
    let mut app = scripted_app(mock).with_interrupts(rx);

    tx.send(()).expect("interrupt");
    assert_eq!(run(&mut app, &runtime, "hi"), Flow::Continue);

    let state = app.store().snapshot();
    assert!(!state.is_loading);
    let reply = &state.current_session.expect("session").messages[1];
    assert!(!reply.is_loading);
    assert!(
        reply.content == "Partial" || reply.error.as_deref() == Some("Response cancelled"),
        "{reply:?}"
    );
    drop(events);
}

//! Session wiring: the op loop, approvals over the handle, and teardown.

mod support;

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use deepseek_agent::core::{ApprovalMode, Event, TurnOutcomeStatus};
use deepseek_agent::models::Message;
use deepseek_agent::session::{Session, SessionHandle, SessionOptions, spawn_session};

use support::{RecordingTool, ScriptedBackend, fast_retry, text_reply, tool_reply};

fn options(approval_mode: ApprovalMode) -> (SessionOptions, tempfile::TempDir) {
    let workspace = tempfile::tempdir().unwrap();
    let options = SessionOptions {
        workspace: workspace.path().to_path_buf(),
        retry: fast_retry(),
        approval_mode,
        system_prompt: None,
        ..SessionOptions::default()
    };
    (options, workspace)
}

/// Collect events until the turn completes, approving each request for the session.
async fn run_until_complete(handle: &SessionHandle) -> (TurnOutcomeStatus, Vec<Event>) {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), handle.recv_event())
            .await
            .expect("session stalled")
            .expect("session closed early");
        if let Event::ApprovalRequired { id, .. } = &event {
            handle.approve_for_session(id.clone()).await.unwrap();
        }
        if let Event::TurnComplete { status, .. } = &event {
            let status = *status;
            seen.push(event);
            return (status, seen);
        }
        seen.push(event);
    }
}

#[tokio::test]
async fn turns_run_through_the_handle() {
    let backend = ScriptedBackend::new("m1", vec![text_reply("hello"), text_reply("again")]);
    let (options, _workspace) = options(ApprovalMode::Auto);
    let handle = spawn_session(backend.clone(), options).await;

    handle.send("hi").await.unwrap();
    let (status, _) = run_until_complete(&handle).await;
    assert_eq!(status, TurnOutcomeStatus::Completed);

    handle.send("once more").await.unwrap();
    let (status, _) = run_until_complete(&handle).await;
    assert_eq!(status, TurnOutcomeStatus::Completed);

    // Second request sees the whole conversation so far.
    assert_eq!(
        backend.requests()[1],
        vec![
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("once more"),
        ]
    );

    handle.shutdown().await.unwrap();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while handle.recv_event().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "event channel should close after teardown");
}

#[tokio::test]
async fn session_approval_covers_repeat_calls() {
    let backend = ScriptedBackend::new(
        "m1",
        vec![
            tool_reply(&[("c1", "lookup", json!({"n": 1}))]),
            tool_reply(&[("c2", "lookup", json!({"n": 1}))]),
            text_reply("done"),
        ],
    );
    let lookup = RecordingTool::new("lookup");
    let (mut options, _workspace) = options(ApprovalMode::Ask);
    options.tools.push(lookup.clone());
    let handle = spawn_session(backend, options).await;

    handle.send("go").await.unwrap();
    let (status, events) = run_until_complete(&handle).await;

    assert_eq!(status, TurnOutcomeStatus::Completed);
    assert_eq!(lookup.invocations(), 2);
    let prompts = events
        .iter()
        .filter(|event| matches!(event, Event::ApprovalRequired { .. }))
        .count();
    assert_eq!(prompts, 1);
}

#[tokio::test]
async fn denial_over_the_handle_ends_the_turn() {
    let backend = ScriptedBackend::new(
        "m1",
        vec![tool_reply(&[("c1", "lookup", json!({}))])],
    );
    let lookup = RecordingTool::new("lookup");
    let (mut options, _workspace) = options(ApprovalMode::Ask);
    options.tools.push(lookup.clone());
    let handle = spawn_session(backend, options).await;

    handle.send("go").await.unwrap();
    let status = loop {
        match handle.recv_event().await.unwrap() {
            Event::ApprovalRequired { id, .. } => handle.deny(id).await.unwrap(),
            Event::TurnComplete { status, .. } => break status,
            _ => {}
        }
    };

    assert_eq!(status, TurnOutcomeStatus::Failed);
    assert_eq!(lookup.invocations(), 0);
}

#[tokio::test]
async fn teardown_forgets_session_approvals() {
    let backend = ScriptedBackend::new(
        "m1",
        vec![
            tool_reply(&[("c1", "lookup", json!({"n": 1}))]),
            text_reply("done"),
        ],
    );
    let (mut options, _workspace) = options(ApprovalMode::Ask);
    options.tools.push(RecordingTool::new("lookup"));
    let (mut session, handle) = Session::new(backend, options).await;

    let responder = tokio::spawn(async move {
        while let Some(event) = handle.recv_event().await {
            if let Event::ApprovalRequired { id, .. } = event {
                let _ = handle.approve_for_session(id).await;
            }
        }
    });

    let outcome = session.run_turn("go").await;
    assert_eq!(outcome.status, TurnOutcomeStatus::Completed);

    let call = session.transcript()[1].tool_calls()[0].clone();
    let fingerprint = session.gate().policy().fingerprint(&call);
    assert!(session.gate().is_session_approved(&fingerprint).await);

    session.teardown().await;
    assert!(!session.gate().is_session_approved(&fingerprint).await);

    responder.abort();
}

#[tokio::test]
async fn model_switch_over_the_handle_applies_to_later_turns() {
    let backend = ScriptedBackend::new("m1", vec![text_reply("one"), text_reply("two")]);
    let (options, _workspace) = options(ApprovalMode::Auto);
    let handle = spawn_session(backend.clone(), options).await;

    handle.send("first").await.unwrap();
    run_until_complete(&handle).await;
    handle.set_model("m2").await.unwrap();
    handle.send("second").await.unwrap();
    run_until_complete(&handle).await;

    assert_eq!(backend.models(), vec!["m1", "m2"]);
    handle.shutdown().await.unwrap();
}

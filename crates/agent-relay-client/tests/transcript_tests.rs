//! Transcript reconstruction from relay message sequences.

use agent_relay_client::{Applied, DropReason, EntryKind, Role, ToolStatus, Transcript};
use agent_relay_protocol::ServerMessage;
use serde_json::{Value, json};

fn record(data: Value) -> ServerMessage {
    ServerMessage::ClaudeResponse {
        message_id: "msg_1".into(),
        data,
    }
}

fn stream(event: Value) -> ServerMessage {
    record(json!({"type": "stream_event", "event": event, "session_id": "s1"}))
}

fn block_start(index: usize, kind: &str) -> ServerMessage {
    let block = match kind {
        "text" => json!({"type": "text", "text": ""}),
        "thinking" => json!({"type": "thinking", "thinking": ""}),
        other => json!({"type": other, "id": "tu_x", "name": "Read", "input": {}}),
    };
    stream(json!({"type": "content_block_start", "index": index, "content_block": block}))
}

fn text_delta(index: usize, text: &str) -> ServerMessage {
    stream(json!({
        "type": "content_block_delta",
        "index": index,
        "delta": {"type": "text_delta", "text": text}
    }))
}

fn thinking_delta(index: usize, thinking: &str) -> ServerMessage {
    stream(json!({
        "type": "content_block_delta",
        "index": index,
        "delta": {"type": "thinking_delta", "thinking": thinking}
    }))
}

fn block_stop(index: usize) -> ServerMessage {
    stream(json!({"type": "content_block_stop", "index": index}))
}

fn assistant(content: Value) -> ServerMessage {
    record(json!({"type": "assistant", "message": {"role": "assistant", "content": content}}))
}

fn tool_result(id: &str, content: Value, is_error: bool) -> ServerMessage {
    record(json!({
        "type": "user",
        "message": {"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": id, "content": content, "is_error": is_error}
        ]}
    }))
}

fn complete() -> ServerMessage {
    ServerMessage::ClaudeComplete {
        message_id: "msg_1".into(),
        exit_code: Some(0),
        error: None,
    }
}

fn apply_all(transcript: &mut Transcript, messages: &[ServerMessage]) {
    for message in messages {
        transcript.apply(message);
    }
}

#[test]
fn test_streamed_text_forms_one_entry() {
    let mut transcript = Transcript::new();
    apply_all(
        &mut transcript,
        &[
            block_start(0, "text"),
            text_delta(0, "Hel"),
            text_delta(0, "lo"),
            block_stop(0),
        ],
    );

    let entries = transcript.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Text);
    assert_eq!(entries[0].role, Role::Assistant);
    assert_eq!(entries[0].content, "Hello");
    assert!(!entries[0].streaming);
}

#[test]
fn test_fragment_without_start_opens_entry() {
    let mut transcript = Transcript::new();
    assert_eq!(transcript.apply(&text_delta(0, "Hi")), Applied::Changed);
    assert!(transcript.is_streaming());
    assert_eq!(transcript.entries()[0].content, "Hi");
}

#[test]
fn test_new_block_supersedes_open_text() {
    let mut transcript = Transcript::new();
    apply_all(
        &mut transcript,
        &[
            block_start(0, "text"),
            text_delta(0, "first"),
            block_start(1, "text"),
            text_delta(1, "second"),
        ],
    );

    let entries = transcript.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].content, "first");
    assert!(!entries[0].streaming);
    assert_eq!(entries[1].content, "second");
    assert!(entries[1].streaming);
}

#[test]
fn test_thinking_and_text_kept_apart() {
    let mut transcript = Transcript::new();
    apply_all(
        &mut transcript,
        &[
            block_start(0, "thinking"),
            thinking_delta(0, "let me "),
            thinking_delta(0, "see"),
            block_stop(0),
            block_start(1, "text"),
            text_delta(1, "Answer"),
            block_stop(1),
        ],
    );

    let kinds: Vec<_> = transcript.entries().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EntryKind::Thinking, EntryKind::Text]);
    assert_eq!(transcript.entries()[0].content, "let me see");
    assert_eq!(transcript.entries()[1].content, "Answer");
}

#[test]
fn test_full_message_after_stream_is_not_duplicated() {
    let mut transcript = Transcript::new();
    apply_all(
        &mut transcript,
        &[
            stream(json!({"type": "message_start", "message": {}})),
            block_start(0, "text"),
            text_delta(0, "Hello"),
            block_stop(0),
            assistant(json!([{"type": "text", "text": "Hello"}])),
            stream(json!({"type": "message_stop"})),
        ],
    );

    assert_eq!(transcript.entries().len(), 1);
    assert_eq!(transcript.entries()[0].content, "Hello");
}

#[test]
fn test_full_message_without_stream_builds_entries_in_order() {
    let mut transcript = Transcript::new();
    transcript.apply(&assistant(json!([
        {"type": "thinking", "thinking": "plan"},
        {"type": "text", "text": "Reading the file."},
        {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {"file_path": "a.rs"}}
    ])));

    let entries = transcript.entries();
    let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EntryKind::Thinking, EntryKind::Text, EntryKind::ToolUse]
    );
    // The tool entry closes the text before it.
    assert!(!entries[1].streaming);
    let tool = entries[2].tool.as_ref().unwrap();
    assert_eq!(tool.name, "Read");
    assert_eq!(tool.status, ToolStatus::Running);
}

#[test]
fn test_tool_result_attaches_to_running_tool() {
    let mut transcript = Transcript::new();
    transcript.apply(&assistant(json!([
        {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"command": "ls"}}
    ])));
    let applied = transcript.apply(&tool_result(
        "tu_1",
        json!([{"type": "text", "text": "a.rs"}, {"type": "text", "text": "b.rs"}]),
        false,
    ));

    assert_eq!(applied, Applied::Changed);
    let tool = transcript.entries()[0].tool.as_ref().unwrap();
    assert_eq!(tool.status, ToolStatus::Success);
    assert_eq!(tool.output.as_deref(), Some("a.rs\nb.rs"));
}

#[test]
fn test_tool_error_result() {
    let mut transcript = Transcript::new();
    transcript.apply(&assistant(json!([
        {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {}}
    ])));
    transcript.apply(&tool_result("tu_1", json!("permission denied"), true));

    let tool = transcript.entries()[0].tool.as_ref().unwrap();
    assert_eq!(tool.status, ToolStatus::Error);
    assert_eq!(tool.output.as_deref(), Some("permission denied"));
}

#[test]
fn test_result_goes_to_most_recent_running_tool() {
    let mut transcript = Transcript::new();
    transcript.apply(&assistant(json!([
        {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {}},
        {"type": "tool_use", "id": "tu_2", "name": "Grep", "input": {}}
    ])));
    transcript.apply(&tool_result("tu_2", json!("found"), false));

    let entries = transcript.entries();
    assert_eq!(entries[0].tool.as_ref().unwrap().status, ToolStatus::Running);
    assert_eq!(entries[1].tool.as_ref().unwrap().status, ToolStatus::Success);
}

#[test]
fn test_orphan_tool_result_changes_nothing() {
    let mut transcript = Transcript::new();
    apply_all(&mut transcript, &[text_delta(0, "hi"), complete()]);
    let before = transcript.entries().to_vec();

    let applied = transcript.apply(&tool_result("tu_9", json!("late"), false));

    assert_eq!(
        applied,
        Applied::Dropped(DropReason::OrphanToolResult {
            tool_use_id: "tu_9".into()
        })
    );
    assert_eq!(transcript.entries(), before.as_slice());
}

#[test]
fn test_repeated_tool_use_is_ignored() {
    let mut transcript = Transcript::new();
    let message = assistant(json!([
        {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {}}
    ]));
    transcript.apply(&message);
    assert_eq!(transcript.apply(&message), Applied::Unchanged);
    assert_eq!(transcript.entries().len(), 1);
}

#[test]
fn test_raw_output_lines_accumulate() {
    let mut transcript = Transcript::new();
    for line in ["one", "two"] {
        transcript.apply(&ServerMessage::ClaudeOutput {
            message_id: "msg_1".into(),
            content: line.into(),
        });
    }
    assert_eq!(transcript.entries().len(), 1);
    assert_eq!(transcript.entries()[0].content, "one\ntwo\n");
}

#[test]
fn test_errors_are_separate_closed_entries() {
    let mut transcript = Transcript::new();
    apply_all(
        &mut transcript,
        &[
            text_delta(0, "partial"),
            ServerMessage::ClaudeError {
                message_id: "msg_1".into(),
                error: "rate limited".into(),
            },
            ServerMessage::error("second"),
        ],
    );

    let entries = transcript.entries();
    assert_eq!(entries.len(), 3);
    for entry in &entries[1..] {
        assert_eq!(entry.kind, EntryKind::Error);
        assert_eq!(entry.role, Role::System);
        assert!(!entry.streaming);
    }
    // The open text is untouched by errors.
    assert!(entries[0].streaming);
}

#[test]
fn test_complete_closes_everything() {
    let mut transcript = Transcript::new();
    apply_all(
        &mut transcript,
        &[
            block_start(0, "thinking"),
            thinking_delta(0, "hmm"),
            block_start(1, "text"),
            text_delta(1, "partial"),
        ],
    );
    assert!(transcript.is_streaming());

    assert_eq!(transcript.apply(&complete()), Applied::Changed);
    assert!(!transcript.is_streaming());
    assert!(transcript.entries().iter().all(|e| !e.streaming));

    // A later fragment starts a fresh entry instead of reopening.
    transcript.apply(&text_delta(0, "next"));
    assert_eq!(transcript.entries().len(), 3);
}

#[test]
fn test_failed_completion_adds_error() {
    let mut transcript = Transcript::new();
    transcript.apply(&ServerMessage::ClaudeComplete {
        message_id: "msg_1".into(),
        exit_code: Some(137),
        error: Some("claude timed out after 600s".into()),
    });
    assert_eq!(transcript.entries().len(), 1);
    assert_eq!(transcript.entries()[0].kind, EntryKind::Error);
}

#[test]
fn test_interrupt_confirmation_notice() {
    let mut transcript = Transcript::new();
    transcript.apply(&ServerMessage::InterruptConfirmed {
        message: "Process interrupted".into(),
    });
    let entry = &transcript.entries()[0];
    assert_eq!(entry.kind, EntryKind::System);
    assert_eq!(entry.content, "Stopped by user");
}

#[test]
fn test_session_and_client_ids_remembered() {
    let mut transcript = Transcript::new();
    transcript.apply(&ServerMessage::Connection {
        status: "connected".into(),
        client_id: "c1".into(),
        message: None,
    });
    transcript.apply(&record(
        json!({"type": "system", "subtype": "init", "session_id": "abc"}),
    ));
    assert_eq!(transcript.client_id(), Some("c1"));
    assert_eq!(transcript.session_id(), Some("abc"));
    assert!(transcript.entries().is_empty());
}

#[test]
fn test_entry_ids_are_unique_and_ordered() {
    let mut transcript = Transcript::new();
    transcript.push_user("hello");
    apply_all(
        &mut transcript,
        &[text_delta(0, "a"), ServerMessage::error("x"), complete()],
    );
    let ids: Vec<_> = transcript.entries().iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["entry-1", "entry-2", "entry-3"]);
}

#[test]
fn test_non_event_records_ignored() {
    let mut transcript = Transcript::new();
    assert_eq!(transcript.apply(&record(json!([1, 2, 3]))), Applied::Unchanged);
    assert_eq!(
        transcript.apply(&record(json!({"type": "rate_limit_event"}))),
        Applied::Unchanged
    );
    assert!(transcript.entries().is_empty());
}

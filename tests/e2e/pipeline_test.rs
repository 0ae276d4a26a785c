use std::sync::Arc;

use httpmock::prelude::*;
use quill_context::{ContextError, Session, SessionManager, Settings};
use quill_core::{Message, Note, NoteKind};
use quill_runtime::{GeminiConfig, GeminiProvider};
use quill_store::InMemoryStore;
use serde_json::json;

const INSTRUCTION: &str = "Condense the conversation.";
const CHAT_PATH: &str = "/v1beta/models/gemini-2.0-flash:generateContent";

fn provider(server: &MockServer) -> Arc<GeminiProvider> {
    Arc::new(
        GeminiProvider::new(GeminiConfig::new("test-key"))
            .unwrap()
            .with_base_url(server.base_url()),
    )
}

async fn manager(server: &MockServer) -> SessionManager {
    let manager = SessionManager::new(Arc::new(InMemoryStore::new()), provider(server))
        .with_rng_seed(1);

    let mut settings = Settings {
        context_note_random_frequency: 0.0,
        ..Settings::default()
    };
    settings.set_compression_prompt(INSTRUCTION);
    manager.update_settings(settings).await.unwrap();
    manager
}

async fn long_session(manager: &SessionManager) -> quill_core::SessionId {
    let mut session = Session::new("voyage");
    for i in 0..30 {
        session.push(if i % 2 == 0 {
            Message::user(format!("question {i}"))
        } else {
            Message::model(format!("answer {i}"))
        });
    }
    manager.insert_session(session).await.unwrap()
}

#[tokio::test]
async fn compaction_notes_and_rules_over_the_wire() {
    let server = MockServer::start_async().await;

    let count_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-2.0-flash:countTokens")
                .query_param("key", "test-key")
                .body_includes(INSTRUCTION);
            then.status(200).json_body(json!({"totalTokens": 25}));
        })
        .await;

    let summary_mock = server
        .mock_async(|when, then| {
            when.method(POST).path(CHAT_PATH).body_includes(INSTRUCTION);
            then.status(200).json_body(json!({
                "candidates": [{"content": {"parts": [{"text": "The story so far."}]}}],
                "usageMetadata": {
                    "promptTokenCount": 300,
                    "candidatesTokenCount": 40,
                    "totalTokenCount": 340
                }
            }));
        })
        .await;

    let chat_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(CHAT_PATH)
                .body_includes("[summary] The story so far.")
                .body_includes("【Lighthouse】");
            then.status(200).json_body(json!({
                "candidates": [{"content": {"parts": [
                    {"text": "weighing the options", "thought": true},
                    {"text": "Onwardddd"}
                ]}}],
                "usageMetadata": {
                    "promptTokenCount": 430,
                    "candidatesTokenCount": 20,
                    "thoughtsTokenCount": 50,
                    "totalTokenCount": 500
                }
            }));
        })
        .await;

    let manager = manager(&server).await;
    let id = long_session(&manager).await;
    manager
        .import_rules("pattern: d+\nreplacement: d\n")
        .await
        .unwrap();
    manager
        .edit_notes(|notes| {
            notes.add(Note::new(
                NoteKind::Keyword,
                "Lighthouse",
                "A tower on the northern cliff",
                vec![],
            )?)
        })
        .await
        .unwrap();

    let report = manager.compact(id).await.unwrap();
    assert_eq!(report.compacted_count, 5);
    assert_eq!(report.state.original_token_count, 275);
    assert_eq!(report.state.compressed_token_count, 40);

    let outcome = manager
        .send_message(id, "sail to the Lighthouse")
        .await
        .unwrap();
    assert_eq!(outcome.message.content, "Onward");
    assert_eq!(outcome.message.thoughts.as_deref(), Some("weighing the options"));
    assert!(outcome.compacted);

    count_mock.assert_async().await;
    summary_mock.assert_async().await;
    chat_mock.assert_async().await;

    let session = manager.get_session(id).await.unwrap();
    assert_eq!(session.messages.len(), 32);
    assert_eq!(session.current_total_tokens(), 450);
    assert_eq!(session.original_token_estimate(), Some(685));
}

#[tokio::test]
async fn failed_summary_leaves_session_untouched() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-2.0-flash:countTokens");
            then.status(200).json_body(json!({"totalTokens": 5}));
        })
        .await;
    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path(CHAT_PATH);
            then.status(503)
                .json_body(json!({"error": {"message": "overloaded"}}));
        })
        .await;

    let manager = manager(&server).await;
    let id = long_session(&manager).await;

    let err = manager.compact(id).await.unwrap_err();
    match err {
        ContextError::Service(inner) => assert!(inner.to_string().contains("overloaded")),
        other => panic!("unexpected error: {other:?}"),
    }
    failing.assert_async().await;

    let session = manager.get_session(id).await.unwrap();
    assert!(session.compaction.is_none());
    assert!(!session.is_compacting());
    assert_eq!(session.messages.len(), 30);
}

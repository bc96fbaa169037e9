//! Shared fixtures for promptgate tests: canned message lists, rendered
//! prompts, requests, and scratch workspaces.

use chrono::Utc;
use promptgate_core::{
    ChatLocation, ChatMessage, ContentPart, EditableChatRequest, RenderedPrompt, RequestMetadata,
    SessionKey, build_sections, estimate_token_count, render_message_content,
};
use tempfile::TempDir;
use uuid::Uuid;

pub fn scratch_workspace() -> TempDir {
    tempfile::tempdir().expect("create scratch workspace")
}

pub fn test_session_key() -> SessionKey {
    SessionKey::new(Uuid::now_v7(), ChatLocation::Panel)
}

/// `[system, user, user]` — the minimal shape most edit tests need.
pub fn sample_messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("sys"),
        ChatMessage::user("u1"),
        ChatMessage::user("u2"),
    ]
}

/// A user message with a text part, an image part, and a trailing text
/// part, for exercising part-preservation rules.
pub fn multi_part_user_message() -> ChatMessage {
    ChatMessage::User {
        content: vec![
            ContentPart::text("before"),
            ContentPart::Image {
                mime: "image/png".to_string(),
                alt: Some("screenshot".to_string()),
            },
            ContentPart::text("after"),
        ],
        name: None,
    }
}

pub fn sample_rendered_prompt() -> RenderedPrompt {
    let messages = sample_messages();
    let token_count: u32 = messages
        .iter()
        .map(|m| estimate_token_count(&render_message_content(m)))
        .sum();
    let mut prompt = RenderedPrompt::new(messages, "test-model");
    prompt.token_count = token_count;
    prompt
}

pub fn sample_request(key: SessionKey) -> EditableChatRequest {
    let prompt = sample_rendered_prompt();
    let sections = build_sections(&prompt.messages);
    EditableChatRequest {
        id: Uuid::now_v7(),
        key,
        debug_name: "test-request".to_string(),
        model: prompt.model.clone(),
        messages: prompt.messages.clone(),
        original_messages: prompt.messages,
        sections,
        metadata: RequestMetadata {
            request_id: Uuid::now_v7(),
            intent_id: None,
            endpoint_url: None,
            model_family: None,
            token_count: prompt.token_count,
            max_prompt_tokens: prompt.max_prompt_tokens,
            request_options: serde_json::Value::Null,
            created_at: Utc::now(),
            last_logged_hash: None,
            subagent: false,
        },
        is_dirty: false,
    }
}

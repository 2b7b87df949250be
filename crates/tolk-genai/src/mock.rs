// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic scripted transport for tests.
//!
//! Each endpoint pops the next scripted response from a queue; when a queue
//! runs dry the transport falls back to benign defaults (auto chat ids,
//! auto user-message ids, a PROCESSING poll status) so tests only script
//! what they actually assert on. All calls are recorded for inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::error::GenAiError;
use crate::protocol::{ByteStream, GenAiTransport, MessageStatus};

enum StreamScript {
    Chunks(Vec<String>),
    /// Never yields; used to test abort handling.
    Hang,
}

#[derive(Default)]
struct Recorded {
    sends: Vec<(String, String, Option<String>)>,
    deletes: Vec<String>,
    cancels: Vec<String>,
    polls: Vec<String>,
}

/// Scripted [`GenAiTransport`] in the spirit of a pre-scripted mock
/// provider: push responses up front, run the code under test, then inspect
/// what was recorded.
pub struct ScriptedTransport {
    created: AtomicU32,
    auto_user: AtomicU32,
    send_results: Mutex<VecDeque<Result<String, GenAiError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    messages: Mutex<VecDeque<Result<MessageStatus, GenAiError>>>,
    recorded: Mutex<Recorded>,
    session_ok: bool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicU32::new(0),
            auto_user: AtomicU32::new(0),
            send_results: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            messages: Mutex::new(VecDeque::new()),
            recorded: Mutex::new(Recorded::default()),
            session_ok: true,
        })
    }

    // ── Scripting ────────────────────────────────────────────────────────────

    pub fn push_send(&self, result: Result<String, GenAiError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    pub fn push_stream_chunks(&self, chunks: Vec<String>) {
        self.streams
            .lock()
            .unwrap()
            .push_back(StreamScript::Chunks(chunks));
    }

    /// Queue a minimal stream: optional visible chunk text, then a
    /// completion frame naming `response_id`.
    pub fn push_stream_completion(&self, response_id: &str, chunk_text: &str) {
        let mut chunks = Vec::new();
        if !chunk_text.is_empty() {
            chunks.push(format!(
                "data: {{\"guid\":\"{response_id}\",\"status\":\"CHUNK\",\"content\":\"{chunk_text}\"}}\n\n"
            ));
        }
        chunks.push(format!(
            "data: {{\"guid\":\"{response_id}\",\"status\":\"FINAL_ANSWER\"}}\n\n"
        ));
        self.push_stream_chunks(chunks);
    }

    pub fn push_stream_hang(&self) {
        self.streams.lock().unwrap().push_back(StreamScript::Hang);
    }

    pub fn push_message(&self, result: Result<MessageStatus, GenAiError>) {
        self.messages.lock().unwrap().push_back(result);
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.recorded.lock().unwrap().deletes.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.recorded.lock().unwrap().cancels.clone()
    }

    pub fn polled(&self) -> Vec<String> {
        self.recorded.lock().unwrap().polls.clone()
    }

    pub fn sends(&self) -> Vec<(String, String, Option<String>)> {
        self.recorded.lock().unwrap().sends.clone()
    }

    pub fn send_parents(&self) -> Vec<Option<String>> {
        self.recorded
            .lock()
            .unwrap()
            .sends
            .iter()
            .map(|(_, _, parent)| parent.clone())
            .collect()
    }
}

#[async_trait]
impl GenAiTransport for ScriptedTransport {
    async fn check_session(&self) -> anyhow::Result<bool> {
        Ok(self.session_ok)
    }

    async fn create_chat(&self) -> anyhow::Result<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("chat-{n}"))
    }

    async fn delete_chats(&self, chat_ids: &[String]) -> anyhow::Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .deletes
            .extend(chat_ids.iter().cloned());
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        parent_message_id: Option<&str>,
    ) -> Result<String, GenAiError> {
        self.recorded.lock().unwrap().sends.push((
            chat_id.to_string(),
            content.to_string(),
            parent_message_id.map(str::to_string),
        ));
        if let Some(scripted) = self.send_results.lock().unwrap().pop_front() {
            return scripted;
        }
        let n = self.auto_user.fetch_add(1, Ordering::SeqCst);
        Ok(format!("user-{n}"))
    }

    async fn open_stream(
        &self,
        _chat_id: &str,
        user_message_id: &str,
        _model_id: &str,
    ) -> Result<ByteStream, GenAiError> {
        let script = self.streams.lock().unwrap().pop_front();
        match script {
            Some(StreamScript::Chunks(chunks)) => Ok(Box::pin(stream::iter(
                chunks
                    .into_iter()
                    .map(|c| Ok(bytes::Bytes::from(c)))
                    .collect::<Vec<_>>(),
            ))),
            Some(StreamScript::Hang) => Ok(Box::pin(stream::pending())),
            None => {
                // Default: immediately complete with a derived response id.
                let frame = format!(
                    "data: {{\"guid\":\"resp-{user_message_id}\",\"status\":\"FINAL_ANSWER\"}}\n\n"
                );
                Ok(Box::pin(stream::iter(vec![Ok(bytes::Bytes::from(frame))])))
            }
        }
    }

    async fn cancel_response(&self, message_guid: &str) -> anyhow::Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .cancels
            .push(message_guid.to_string());
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<MessageStatus, GenAiError> {
        self.recorded
            .lock()
            .unwrap()
            .polls
            .push(message_id.to_string());
        if let Some(scripted) = self.messages.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(MessageStatus {
            content: None,
            status: Some("PROCESSING".into()),
            response_code: None,
        })
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::OnceLock;

use futures::{Stream, StreamExt};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::abort::AbortSignal;
use crate::error::GenAiError;

/// Statuses and response codes that terminate an assistant reply.
const COMPLETION_STATUSES: [&str; 6] = [
    "FINAL_ANSWER",
    "SUCCESS",
    "R20000",
    "DONE",
    "COMPLETED",
    "COMPLETE",
];

/// Statuses whose `content` belongs to the visible streamed reply.
const CHUNK_STATUSES: [&str; 2] = ["CHUNK", "STREAM"];

/// Whether a status word or response code terminates a reply.
pub(crate) fn is_completion_word(word: &str) -> bool {
    let upper = word.trim().to_ascii_uppercase();
    COMPLETION_STATUSES.contains(&upper.as_str())
}

fn is_chunk_status(word: &str) -> bool {
    let upper = word.trim().to_ascii_uppercase();
    CHUNK_STATUSES.contains(&upper.as_str())
}

/// Line-buffered pull parser for `text/event-stream` frames.
///
/// SSE lines can be split across TCP chunks, so a remainder buffer is
/// carried forward and only complete `\n`-terminated lines are consumed
/// (CR/LF tolerated). Multi-line `data:` values within one event are joined
/// with newlines; a blank line emits the accumulated event payload.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stream text; returns the data payloads of every event
    /// completed by this chunk.
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        while let Some(nl_pos) = self.buf.find('\n') {
            let line = self.buf[..nl_pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=nl_pos);
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // Field lines other than data: (event:, id:, retry:, comments)
            // carry nothing we need.
        }
        events
    }

    /// Flush the event left open when the stream ends without a final blank
    /// line.
    pub fn finish(&mut self) -> Option<String> {
        let trailing = self.buf.trim_end_matches('\r');
        if let Some(data) = trailing.strip_prefix("data:") {
            self.data_lines
                .push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        self.buf.clear();
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }
}

/// What one decoded event contributed.
#[derive(Debug, Default, PartialEq)]
struct EventFields {
    id: Option<String>,
    status: Option<String>,
    response_code: Option<String>,
    content: Option<String>,
}

fn first_string(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .find(|s| !s.is_empty())
}

/// Decode one event payload into the fields of interest. JSON is the main
/// path; on parse failure only, regex heuristics pull out a guid and scan
/// for completion keywords in the raw text.
fn parse_event(data: &str) -> EventFields {
    match serde_json::from_str::<Value>(data) {
        Ok(v) => {
            let id = first_string(
                &v,
                &[
                    "guid",
                    "id",
                    "message_guid",
                    "messageGuid",
                    "response_guid",
                    "responseGuid",
                ],
            );
            let response_code = first_string(&v, &["response_code", "responseCode"]);
            let mut status = first_string(&v, &["event_status", "eventStatus", "status"])
                .or_else(|| response_code.clone());
            if status.is_none() {
                // Some frames nest the status one level down.
                status = v
                    .get("processing_content")
                    .and_then(Value::as_array)
                    .and_then(|items| {
                        items
                            .iter()
                            .filter_map(|i| first_string(i, &["event_status"]))
                            .next()
                    });
            }
            let content = v
                .get("content")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            EventFields {
                id,
                status,
                response_code,
                content,
            }
        }
        Err(e) => {
            trace!(error = %e, "event is not valid JSON, using regex fallback");
            static GUID_RE: OnceLock<Regex> = OnceLock::new();
            let re = GUID_RE
                .get_or_init(|| Regex::new(r#""guid"\s*:\s*"([^"]+)""#).expect("static regex"));
            let id = re
                .captures(data)
                .map(|c| c[1].to_string());
            let upper = data.to_ascii_uppercase();
            let status = COMPLETION_STATUSES
                .iter()
                .find(|s| upper.contains(*s))
                .map(|s| s.to_string());
            EventFields {
                id,
                status,
                response_code: None,
                content: None,
            }
        }
    }
}

/// Result of decoding an assistant reply stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    /// The response (assistant message) id named by the stream.
    pub response_id: String,
    /// Text accumulated from visible streamed chunks; used when the
    /// follow-up REST poll comes back empty.
    pub fallback_content: String,
}

/// Decode an SSE byte stream into `(response_id, fallback_content)`.
///
/// Returns as soon as the first completion event is seen. A stream that ends
/// without a completion event still succeeds if any event named an id;
/// otherwise the call fails with [`GenAiError::StreamMissingId`]. The abort
/// signal interrupts the read at any chunk boundary.
pub async fn decode_sse_stream<S>(
    mut stream: S,
    mut abort: AbortSignal,
) -> Result<StreamOutcome, GenAiError>
where
    S: Stream<Item = Result<bytes::Bytes, GenAiError>> + Unpin,
{
    let mut parser = SseParser::new();
    let mut last_id: Option<String> = None;
    let mut fallback = String::new();

    loop {
        let chunk = tokio::select! {
            _ = abort.fired() => {
                debug!("sse read aborted by signal");
                return Err(GenAiError::Aborted("stream cancelled".into()));
            }
            next = stream.next() => next,
        };

        let Some(chunk) = chunk else { break };
        let bytes = chunk?;
        let text = String::from_utf8_lossy(&bytes);
        for payload in parser.push_chunk(&text) {
            if let Some(outcome) = apply_event(&payload, &mut last_id, &mut fallback) {
                return outcome;
            }
        }
    }

    if let Some(payload) = parser.finish() {
        if let Some(outcome) = apply_event(&payload, &mut last_id, &mut fallback) {
            return outcome;
        }
    }

    match last_id {
        Some(response_id) => Ok(StreamOutcome {
            response_id,
            fallback_content: fallback,
        }),
        None => Err(GenAiError::StreamMissingId),
    }
}

/// Fold one event into the decoder state; `Some` means the stream is done.
fn apply_event(
    payload: &str,
    last_id: &mut Option<String>,
    fallback: &mut String,
) -> Option<Result<StreamOutcome, GenAiError>> {
    let fields = parse_event(payload);
    if let Some(id) = &fields.id {
        *last_id = Some(id.clone());
    }

    // Visible chunk: non-empty content, a chunk-ish status, and no response
    // code on the event.
    if let (Some(content), Some(status)) = (&fields.content, &fields.status) {
        if is_chunk_status(status) && fields.response_code.is_none() {
            fallback.push_str(content);
        }
    }

    if fields.status.as_deref().is_some_and(is_completion_word) {
        return Some(match last_id.take() {
            Some(response_id) => Ok(StreamOutcome {
                response_id,
                fallback_content: std::mem::take(fallback),
            }),
            None => Err(GenAiError::StreamMissingId),
        });
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::abort_pair;
    use futures::stream;

    fn byte_stream(
        chunks: Vec<&str>,
    ) -> impl Stream<Item = Result<bytes::Bytes, GenAiError>> + Unpin {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(bytes::Bytes::copy_from_slice(c.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn decode(chunks: Vec<&str>) -> Result<StreamOutcome, GenAiError> {
        decode_sse_stream(byte_stream(chunks), AbortSignal::never()).await
    }

    // ── SseParser framing ────────────────────────────────────────────────────

    #[test]
    fn parser_emits_event_at_blank_line() {
        let mut p = SseParser::new();
        let events = p.push_chunk("data: {\"a\":1}\n\n");
        assert_eq!(events, vec!["{\"a\":1}"]);
    }

    #[test]
    fn parser_joins_multiline_data_with_newlines() {
        let mut p = SseParser::new();
        let events = p.push_chunk("data: line one\ndata: line two\n\n");
        assert_eq!(events, vec!["line one\nline two"]);
    }

    #[test]
    fn parser_keeps_partial_lines_across_chunks() {
        let mut p = SseParser::new();
        assert!(p.push_chunk("data: {\"gu").is_empty());
        let events = p.push_chunk("id\":\"m-1\"}\n\n");
        assert_eq!(events, vec!["{\"guid\":\"m-1\"}"]);
    }

    #[test]
    fn parser_tolerates_crlf() {
        let mut p = SseParser::new();
        let events = p.push_chunk("data: x\r\n\r\n");
        assert_eq!(events, vec!["x"]);
    }

    #[test]
    fn parser_finish_flushes_open_event() {
        let mut p = SseParser::new();
        assert!(p.push_chunk("data: tail\n").is_empty());
        assert_eq!(p.finish().as_deref(), Some("tail"));
        assert!(p.finish().is_none());
    }

    #[test]
    fn parser_ignores_non_data_fields() {
        let mut p = SseParser::new();
        let events = p.push_chunk("event: message\nid: 7\ndata: payload\n\n");
        assert_eq!(events, vec!["payload"]);
    }

    // ── Event field extraction ───────────────────────────────────────────────

    #[test]
    fn id_is_taken_from_any_known_key() {
        for key in [
            "guid",
            "id",
            "message_guid",
            "messageGuid",
            "response_guid",
            "responseGuid",
        ] {
            let fields = parse_event(&format!("{{\"{key}\":\"m-9\"}}"));
            assert_eq!(fields.id.as_deref(), Some("m-9"), "key {key}");
        }
    }

    #[test]
    fn nested_processing_content_status_is_found() {
        let fields = parse_event(
            r#"{"guid":"g","processing_content":[{"event_status":"FINAL_ANSWER"}]}"#,
        );
        assert_eq!(fields.status.as_deref(), Some("FINAL_ANSWER"));
    }

    #[test]
    fn malformed_json_falls_back_to_regex() {
        let fields = parse_event(r#"{"guid":"m-3", oops FINAL_ANSWER"#);
        assert_eq!(fields.id.as_deref(), Some("m-3"));
        assert_eq!(fields.status.as_deref(), Some("FINAL_ANSWER"));
    }

    // ── Stream decoding ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn completion_event_returns_immediately() {
        let out = decode(vec![
            "data: {\"guid\":\"m-1\",\"status\":\"CHUNK\",\"content\":\"hej \"}\n\n",
            "data: {\"guid\":\"m-1\",\"status\":\"FINAL_ANSWER\"}\n\n",
            "data: {\"guid\":\"m-2\",\"status\":\"CHUNK\",\"content\":\"never seen\"}\n\n",
        ])
        .await
        .unwrap();
        assert_eq!(out.response_id, "m-1");
        assert_eq!(out.fallback_content, "hej ");
    }

    #[tokio::test]
    async fn chunk_content_accumulates_in_order() {
        let out = decode(vec![
            "data: {\"guid\":\"m\",\"status\":\"CHUNK\",\"content\":\"god \"}\n\n",
            "data: {\"guid\":\"m\",\"status\":\"STREAM\",\"content\":\"morgon\"}\n\n",
            "data: {\"guid\":\"m\",\"status\":\"DONE\"}\n\n",
        ])
        .await
        .unwrap();
        assert_eq!(out.fallback_content, "god morgon");
    }

    #[tokio::test]
    async fn response_code_bearing_content_is_not_fallback() {
        let out = decode(vec![
            "data: {\"guid\":\"m\",\"status\":\"CHUNK\",\"content\":\"keep\"}\n\n",
            "data: {\"guid\":\"m\",\"status\":\"CHUNK\",\"responseCode\":\"R10000\",\"content\":\"drop\"}\n\n",
            "data: {\"guid\":\"m\",\"status\":\"COMPLETED\"}\n\n",
        ])
        .await
        .unwrap();
        assert_eq!(out.fallback_content, "keep");
    }

    #[tokio::test]
    async fn stream_end_without_completion_returns_last_id() {
        let out = decode(vec![
            "data: {\"guid\":\"m-7\",\"status\":\"CHUNK\",\"content\":\"partial\"}\n\n",
        ])
        .await
        .unwrap();
        assert_eq!(out.response_id, "m-7");
        assert_eq!(out.fallback_content, "partial");
    }

    #[tokio::test]
    async fn trailing_unterminated_event_still_counts() {
        let out = decode(vec!["data: {\"guid\":\"m-8\"}"]).await.unwrap();
        assert_eq!(out.response_id, "m-8");
    }

    #[tokio::test]
    async fn no_id_at_all_is_missing_id() {
        let err = decode(vec![
            "data: {\"status\":\"CHUNK\",\"content\":\"text\"}\n\n",
        ])
        .await
        .unwrap_err();
        assert!(matches!(err, GenAiError::StreamMissingId));
    }

    #[tokio::test]
    async fn completion_via_r20000_response_code() {
        let out = decode(vec![
            "data: {\"guid\":\"m\",\"responseCode\":\"R20000\"}\n\n",
        ])
        .await
        .unwrap();
        assert_eq!(out.response_id, "m");
    }

    #[tokio::test]
    async fn events_split_across_chunks_decode() {
        let out = decode(vec![
            "data: {\"guid\":\"m-1\",\"sta",
            "tus\":\"FINAL_ANSWER\"}\n\n",
        ])
        .await
        .unwrap();
        assert_eq!(out.response_id, "m-1");
    }

    #[tokio::test]
    async fn malformed_event_with_completion_keyword_ends_stream() {
        let out = decode(vec![
            "data: {\"guid\":\"m-4\" FINAL_ANSWER garbled\n\n",
        ])
        .await
        .unwrap();
        assert_eq!(out.response_id, "m-4");
    }

    #[tokio::test]
    async fn abort_interrupts_the_read() {
        let (handle, signal) = abort_pair();
        // A stream that never yields; abort must break the select.
        let pending = stream::pending::<Result<bytes::Bytes, GenAiError>>();
        handle.fire();
        let err = decode_sse_stream(Box::pin(pending), signal)
            .await
            .unwrap_err();
        assert!(matches!(err, GenAiError::Aborted(_)));
    }

    #[tokio::test]
    async fn transport_error_propagates() {
        let chunks: Vec<Result<bytes::Bytes, GenAiError>> = vec![
            Ok(bytes::Bytes::from_static(b"data: {\"guid\":\"m\"}\n\n")),
            Err(GenAiError::Transport("connection reset".into())),
        ];
        let err = decode_sse_stream(stream::iter(chunks), AbortSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, GenAiError::Transport(_)));
    }
}

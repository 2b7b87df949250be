// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;
mod provider;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use provider::LlmHttpProvider;
use tolk_dispatch::{DispatchRequest, DispatchResponse, Dispatcher, TranslateProvider};
use tolk_genai::{GenAiTransport, HttpGenAiTransport};
use tolk_store::{JsonFileStore, KvStore, MemoryStore};

/// One request line on stdin. The `id` is echoed back so callers can match
/// responses to requests regardless of completion order.
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    id: u64,
    #[serde(flatten)]
    request: DispatchRequest,
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    id: u64,
    #[serde(flatten)]
    response: DispatchResponse,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::ShowConfig) = &cli.command {
        let config = tolk_config::load(cli.config.as_deref())?;
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    let config = tolk_config::load(cli.config.as_deref())?;

    let store: Arc<dyn KvStore> = match &cli.state_file {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };

    let http = reqwest::Client::builder()
        .cookie_store(true)
        .build()
        .context("building HTTP client")?;
    let llm_api_key = std::env::var(&cli.llm_api_key_env).ok();
    let llm: Arc<dyn TranslateProvider> = Arc::new(LlmHttpProvider::new(
        http.clone(),
        &cli.llm_base_url,
        llm_api_key,
        &cli.llm_model,
    ));
    let genai: Arc<dyn GenAiTransport> =
        Arc::new(HttpGenAiTransport::new(http, &cli.genai_base_url));

    let dispatcher = Arc::new(Dispatcher::new(&config, llm, genai, store).await);
    info!(
        genai_base_url = %cli.genai_base_url,
        llm_base_url = %cli.llm_base_url,
        "tolk dispatch core ready"
    );

    serve_stdio(dispatcher).await
}

/// Serve newline-delimited JSON over stdin/stdout. Requests are handled
/// concurrently; a single writer task keeps response lines atomic.
async fn serve_stdio(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: RequestEnvelope = match serde_json::from_str(&line) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "unparseable request line");
                let resp = ResponseEnvelope {
                    id: 0,
                    response: DispatchResponse::Error {
                        message: format!("invalid request: {e}"),
                    },
                };
                let _ = out_tx.send(serde_json::to_string(&resp).expect("serializable"));
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let response = dispatcher.handle(envelope.request).await;
            let resp = ResponseEnvelope {
                id: envelope.id,
                response,
            };
            let _ = out_tx.send(serde_json::to_string(&resp).expect("serializable"));
        });
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn init_logging(verbose: bool) {
    // stdout carries the protocol; all diagnostics go to stderr.
    let filter = EnvFilter::try_from_env("TOLK_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_flattens_the_dispatch_request() {
        let raw = r#"{ "id": 42, "type": "notifyTabClosed", "tabId": 7 }"#;
        let env: RequestEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.id, 42);
        assert!(matches!(
            env.request,
            DispatchRequest::NotifyTabClosed { tab_id: 7 }
        ));
    }

    #[test]
    fn response_envelope_keeps_the_id() {
        let env = ResponseEnvelope {
            id: 9,
            response: DispatchResponse::Translation { text: "hej".into() },
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"id\":9"));
        assert!(json.contains("\"type\":\"translation\""));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Translation dispatch core for an immersive web translator.
///
/// Runs as a headless service speaking newline-delimited JSON on
/// stdin/stdout (one request object in, one response object out, matched by
/// `id`). Logs go to stderr so they never corrupt the protocol stream.
#[derive(Parser, Debug)]
#[command(name = "tolk", version, about)]
pub struct Cli {
    /// Path to the config file (YAML). Defaults are used when absent.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Durable state file for the translation cache and chat pool.
    /// Omitting it keeps all state in memory.
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Base URL of the conversational GenAI provider.
    #[arg(long, env = "TOLK_GENAI_BASE_URL", default_value = "https://genai.example.com")]
    pub genai_base_url: String,

    /// Base URL of the OpenAI-compatible LLM endpoint used for the generic
    /// provider path (e.g. http://localhost:11434/v1).
    #[arg(long, env = "TOLK_LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub llm_base_url: String,

    /// Model name sent to the generic LLM endpoint.
    #[arg(long, env = "TOLK_LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Environment variable holding the LLM API key (read at startup).
    #[arg(long, default_value = "TOLK_LLM_API_KEY")]
    pub llm_api_key_env: String,

    /// Log debug output to stderr (TOLK_LOG overrides this).
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration and exit.
    ShowConfig,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_parse_without_arguments() {
        let cli = Cli::parse_from(["tolk"]);
        assert!(cli.config.is_none());
        assert!(cli.state_file.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn show_config_subcommand_parses() {
        let cli = Cli::parse_from(["tolk", "show-config"]);
        assert!(matches!(cli.command, Some(Commands::ShowConfig)));
    }
}

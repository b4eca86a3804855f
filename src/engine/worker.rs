//! Worker subprocess invocation and stream parsing.
//!
//! The worker receives the assembled prompt on stdin and emits
//! newline-delimited JSON events on stdout. Three shapes matter: incremental
//! assistant text, streaming text deltas, and the terminal result carrying
//! usage and an error flag. Everything else is skipped with a warning; a
//! worker that streams garbage still runs to completion.

use crate::config::WorkerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerEvent {
    Assistant {
        message: AssistantMessage,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

/// Everything the resolve step needs from one worker run.
#[derive(Debug, Default)]
pub struct WorkerRun {
    pub exit_code: i32,
    /// Accumulated assistant text from the stream, incremental and final.
    pub text: String,
    /// Final text from the terminal result event, when one arrived.
    pub result_text: Option<String>,
    pub is_error: bool,
    pub tokens_in: i64,
    pub tokens_out: i64,
    /// Worker-reported authoritative cost, when present.
    pub api_cost_usd: Option<f64>,
    pub stderr: String,
}

impl WorkerRun {
    /// Billed cost: the worker's own figure when it reported one, otherwise
    /// computed from token counts at the configured per-million-token rates.
    pub fn cost_usd(&self, config: &WorkerConfig) -> f64 {
        match self.api_cost_usd {
            Some(cost) => cost,
            None => {
                self.tokens_in as f64 / 1_000_000.0 * config.input_rate_per_mtok
                    + self.tokens_out as f64 / 1_000_000.0 * config.output_rate_per_mtok
            }
        }
    }

    /// The text to report: the terminal result when present, the accumulated
    /// stream otherwise.
    pub fn output(&self) -> &str {
        match &self.result_text {
            Some(text) if !text.is_empty() => text,
            _ => &self.text,
        }
    }
}

/// Run the configured worker once: write the prompt to stdin, consume the
/// NDJSON stream until exit, return the collected run.
pub async fn run_worker(config: &WorkerConfig, prompt: &str) -> Result<WorkerRun> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning worker {}", config.program))?;

    let mut stdin = child.stdin.take().context("worker stdin unavailable")?;
    let stdout = child.stdout.take().context("worker stdout unavailable")?;
    let stderr = child.stderr.take().context("worker stderr unavailable")?;

    // Closing stdin signals end-of-prompt.
    stdin.write_all(prompt.as_bytes()).await?;
    drop(stdin);

    let stderr_task = tokio::spawn(async move {
        let mut captured = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(line = %line, "worker stderr");
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    });

    let mut run = WorkerRun::default();
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let event: WorkerEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "skipping malformed worker event");
                continue;
            }
        };

        match event {
            WorkerEvent::Assistant { message } => {
                for block in message.content {
                    if let Some(text) = block.text {
                        run.text.push_str(&text);
                    }
                }
            }
            WorkerEvent::ContentBlockDelta { delta } => {
                if let Some(text) = delta.text {
                    run.text.push_str(&text);
                }
            }
            WorkerEvent::Result {
                result,
                usage,
                total_cost_usd,
                is_error,
            } => {
                run.result_text = result;
                run.is_error = is_error;
                run.api_cost_usd = total_cost_usd;
                if let Some(usage) = usage {
                    run.tokens_in = usage.input_tokens;
                    run.tokens_out = usage.output_tokens;
                }
            }
            WorkerEvent::Unknown => {}
        }
    }

    let status = child.wait().await?;
    run.exit_code = status.code().unwrap_or(-1);
    run.stderr = stderr_task.await.unwrap_or_default();

    debug!(
        exit = run.exit_code,
        tokens_in = run.tokens_in,
        tokens_out = run.tokens_out,
        "worker exited"
    );

    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_and_delta_text() {
        let assistant = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello "}]}}"#;
        let delta = r#"{"type":"content_block_delta","delta":{"text":"world"}}"#;

        let mut run = WorkerRun::default();
        for line in [assistant, delta] {
            match serde_json::from_str::<WorkerEvent>(line).unwrap() {
                WorkerEvent::Assistant { message } => {
                    for block in message.content {
                        if let Some(text) = block.text {
                            run.text.push_str(&text);
                        }
                    }
                }
                WorkerEvent::ContentBlockDelta { delta } => {
                    run.text.push_str(&delta.text.unwrap());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(run.text, "hello world");
    }

    #[test]
    fn parses_result_with_usage() {
        let line = r#"{"type":"result","result":"done","usage":{"input_tokens":1000,"output_tokens":200},"total_cost_usd":0.05,"is_error":false}"#;
        match serde_json::from_str::<WorkerEvent>(line).unwrap() {
            WorkerEvent::Result {
                result,
                usage,
                total_cost_usd,
                is_error,
            } => {
                assert_eq!(result.as_deref(), Some("done"));
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 1000);
                assert_eq!(usage.output_tokens, 200);
                assert_eq!(total_cost_usd, Some(0.05));
                assert!(!is_error);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let line = r#"{"type":"system","subtype":"init"}"#;
        assert!(matches!(
            serde_json::from_str::<WorkerEvent>(line).unwrap(),
            WorkerEvent::Unknown
        ));
    }

    #[test]
    fn cost_falls_back_to_token_rates() {
        let config = WorkerConfig::default();
        let run = WorkerRun {
            tokens_in: 1_000_000,
            tokens_out: 1_000_000,
            ..Default::default()
        };
        assert!((run.cost_usd(&config) - 18.0).abs() < 1e-9);

        let run = WorkerRun {
            api_cost_usd: Some(0.25),
            tokens_in: 1_000_000,
            ..Default::default()
        };
        assert!((run.cost_usd(&config) - 0.25).abs() < 1e-9);
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph engine subprocess management.

use anyhow::{bail, Context, Result};
use ce_comfy::ComfyClient;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Split a configured command line on whitespace, honoring single and
/// double quotes.
pub fn split_command(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in raw.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => quote = Some(c),
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// A running engine subprocess with stdout/stderr forwarded through
/// tracing.
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    /// Spawn the engine from its configured command line.
    pub fn spawn(command_line: &str) -> Result<Self> {
        let parts = split_command(command_line);
        let Some((program, args)) = parts.split_first() else {
            bail!("engine command is empty");
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn engine: {program}"))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, true));
        }

        info!(command = command_line, "engine subprocess started");
        Ok(Self { child })
    }

    /// Wait for the subprocess to exit and return its code.
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await.context("wait for engine")?;
        Ok(status.code().unwrap_or(1))
    }

    /// Kill the subprocess and reap it.
    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

async fn forward_lines(stream: impl tokio::io::AsyncRead + Unpin, is_stderr: bool) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let s = line.trim_end();
                if s.is_empty() {
                    continue;
                }
                if is_stderr {
                    warn!(target: "ce_supervisor.engine", "{s}");
                } else {
                    info!(target: "ce_supervisor.engine", "{s}");
                }
            }
            Err(_) => break,
        }
    }
}

/// Poll the engine's stats endpoint until it answers or the deadline
/// passes.
pub async fn await_engine_ready(
    client: &ComfyClient,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match client.system_stats().await {
            Ok(_) => {
                info!("engine is ready");
                return Ok(());
            }
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    bail!("engine did not become ready within {timeout:?}: {e}");
                }
            }
        }
        tokio::time::sleep(poll).await;
    }
}

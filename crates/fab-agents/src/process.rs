//! Subprocess wrapper around the external LLM coding-assistant process.
//!
//! The process itself — its prompt, tools, stream-json dialect — is an
//! external collaborator (spec §1); this module only starts/stops it,
//! writes messages to its stdin, and decodes its stdout into a `ChatEntry`
//! stream, one JSON object per line. Replaces the teacher's PTY-pool/HTTP
//! session-manager approach (`claude_runtime.rs`, `claude_session.rs`) with
//! plain piped `tokio::process` I/O, since this system treats the agent as
//! an opaque subprocess rather than something the core drives over an SDK.

use std::path::Path;
use std::process::Stdio;

use fab_core::error::{Error, Result};
use fab_core::types::ChatEntry;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

pub struct AgentProcess {
    child: Child,
    stdin: ChildStdin,
}

impl AgentProcess {
    /// Spawn `command` with piped stdio in `worktree`, and begin streaming
    /// decoded `ChatEntry` lines to the returned receiver. The reader task
    /// exits (closing the channel) when the process closes stdout.
    pub fn spawn(
        command: &str,
        args: &[String],
        worktree: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChatEntry>)> {
        let mut child = Command::new(command)
            .args(args)
            .current_dir(worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Unavailable("agent process has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Unavailable("agent process has no stdout".into()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ChatEntry>(&line) {
                            Ok(entry) => {
                                if tx.send(entry).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%err, "failed to decode agent stdout line")
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(%err, "error reading agent stdout");
                        break;
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "agent_stderr", "{line}");
                }
            });
        }

        Ok((Self { child, stdin }, rx))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write a newline-delimited message to the process's stdin.
    pub async fn send(&mut self, message: &str) -> Result<()> {
        self.stdin.write_all(message.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        Ok(self.child.wait().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_process_echoes_stdin_as_chat_entries() {
        let (mut proc, mut rx) =
            AgentProcess::spawn("sh", &["-c".into(), "cat".into()], Path::new("."))
                .expect("spawn cat");

        let entry = serde_json::json!({
            "role": "assistant",
            "content": "hello",
            "timestamp": chrono::Utc::now(),
        });
        proc.send(&entry.to_string()).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for echoed entry")
            .expect("channel closed early");
        assert_eq!(received.role, "assistant");
        assert_eq!(received.content, "hello");

        proc.kill().await.unwrap();
    }

    #[tokio::test]
    async fn spawning_nonexistent_command_returns_io_error() {
        let result = AgentProcess::spawn("definitely-not-a-real-binary", &[], Path::new("."));
        assert!(result.is_err());
    }
}

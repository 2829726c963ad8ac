//! Command hook: run an executable per delivery and map its exit status to
//! an [`Outcome`].
//!
//! The message body is written to the command's stdin as JSON. Exit 0 is
//! success, the configured abort code aborts, anything else retries.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;
use crate::model::{Delivery, Outcome};

/// `EX_TEMPFAIL` from sysexits.h, reused as "give up on this message".
pub const DEFAULT_ABORT_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone)]
pub struct CommandHook {
    command: PathBuf,
    abort_exit_code: i32,
}

impl CommandHook {
    /// Relative paths with a directory part (`./bin/x`) resolve against the
    /// current directory now; bare names are looked up on `PATH` at spawn.
    pub fn new(command: impl AsRef<Path>) -> Result<Self> {
        let command = command.as_ref();
        let command = if command.is_relative() && command.components().count() > 1 {
            std::env::current_dir()?.join(command)
        } else {
            command.to_path_buf()
        };
        Ok(Self {
            command,
            abort_exit_code: DEFAULT_ABORT_EXIT_CODE,
        })
    }

    pub fn abort_exit_code(mut self, code: i32) -> Self {
        self.abort_exit_code = code;
        self
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    /// Run the command once for `delivery`.
    pub async fn handle(&self, body: serde_json::Value, delivery: Delivery) -> Outcome {
        match self.spawn(&body, &delivery).await {
            Ok(Some(0)) => Outcome::Success,
            Ok(Some(code)) if code == self.abort_exit_code => {
                Outcome::Abort(format!("hook exited with abort code {code}"))
            }
            Ok(Some(code)) => Outcome::Retry(format!("hook exited with status {code}")),
            Ok(None) => Outcome::Retry("hook terminated by signal".to_string()),
            Err(e) => Outcome::Retry(format!("hook failed to run: {e}")),
        }
    }

    async fn spawn(&self, body: &serde_json::Value, delivery: &Delivery) -> Result<Option<i32>> {
        debug!(
            command = %self.command.display(),
            message_id = %delivery.message_id,
            attempt = delivery.attempt_count,
            "running hook"
        );

        let mut child = Command::new(&self.command)
            .env("QUEUELITE_MESSAGE_ID", delivery.message_id.to_string())
            .env("QUEUELITE_PRIORITY", delivery.message_id.priority().to_string())
            .env("QUEUELITE_ATTEMPT", delivery.attempt_count.to_string())
            .stdin(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(body)?;
            // A hook that exits without reading stdin closes the pipe; its
            // exit status is what counts.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!("hook did not consume stdin: {e}");
            }
            drop(stdin);
        }

        let status = child.wait().await?;
        Ok(status.code())
    }
}

//! VM monitor access
//!
//! The monitor speaks newline-delimited JSON:
//! ```text
//! <- {"QMP": {"version": ..., "capabilities": [...]}}
//! -> {"execute": "qmp_capabilities"}
//! <- {"return": {}}
//! -> {"execute": "query-sev"}
//! <- {"event": "...", ...}          (asynchronous, skipped)
//! <- {"return": {...}} | {"error": {"class": ..., "desc": ...}}
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result};

/// SEV state reported by the monitor
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SevInfo {
    pub enabled: bool,
    #[serde(default)]
    pub api_major: u32,
    #[serde(default)]
    pub api_minor: u32,
    #[serde(default)]
    pub build_id: u32,
    #[serde(default)]
    pub policy: u32,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub handle: u32,
}

/// Command channel to a running VM
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Execute a command and return its `return` payload
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value>;

    async fn query_sev(&self) -> Result<SevInfo> {
        let value = self.execute("query-sev", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Base64 launch measurement of an SEV guest
    async fn query_sev_launch_measure(&self) -> Result<String> {
        let value = self.execute("query-sev-launch-measure", None).await?;
        value
            .get("data")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Monitor(format!("launch measure without data: {}", value)))
    }
}

/// Read one JSON object, skipping blank lines
async fn read_object<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Value> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Monitor("connection closed".to_string()));
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        return Ok(serde_json::from_str(line)?);
    }
}

/// Read and check the server greeting
pub async fn read_greeting<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Value> {
    let greeting = read_object(reader).await?;
    match greeting.get("QMP") {
        Some(info) => Ok(info.clone()),
        None => Err(Error::Monitor(format!("unexpected greeting: {}", greeting))),
    }
}

/// Read the reply to `command`, skipping events
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R, command: &str) -> Result<Value> {
    loop {
        let msg = read_object(reader).await?;
        if let Some(event) = msg.get("event") {
            tracing::debug!(%event, "Monitor event");
            continue;
        }
        if let Some(ret) = msg.get("return") {
            return Ok(ret.clone());
        }
        if let Some(err) = msg.get("error") {
            let field = |name: &str| {
                err.get(name)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string()
            };
            return Err(Error::MonitorCommand {
                command: command.to_string(),
                class: field("class"),
                desc: field("desc"),
            });
        }
        return Err(Error::Monitor(format!("unexpected message: {}", msg)));
    }
}

/// Write one command
pub async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    command: &str,
    arguments: Option<&Value>,
) -> Result<()> {
    let msg = match arguments {
        Some(args) => json!({ "execute": command, "arguments": args }),
        None => json!({ "execute": command }),
    };
    let mut line = serde_json::to_string(&msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(unix)]
pub use unix::QmpMonitor;

#[cfg(unix)]
mod unix {
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::io::BufReader;
    use tokio::net::UnixStream;

    use super::{read_greeting, read_reply, write_command, Monitor};
    use crate::common::{Error, Result};

    /// Default time allowed for one monitor exchange
    const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Monitor over a UNIX socket, connecting once per command
    #[derive(Debug, Clone)]
    pub struct QmpMonitor {
        path: PathBuf,
        timeout: Duration,
    }

    impl QmpMonitor {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                timeout: EXCHANGE_TIMEOUT,
            }
        }

        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        async fn exchange(&self, command: &str, arguments: Option<&Value>) -> Result<Value> {
            let stream = UnixStream::connect(&self.path).await.map_err(|e| {
                Error::Monitor(format!("cannot connect to {}: {}", self.path.display(), e))
            })?;
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);

            read_greeting(&mut reader).await?;
            write_command(&mut write, "qmp_capabilities", None).await?;
            read_reply(&mut reader, "qmp_capabilities").await?;

            write_command(&mut write, command, arguments).await?;
            read_reply(&mut reader, command).await
        }
    }

    #[async_trait]
    impl Monitor for QmpMonitor {
        async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
            tracing::debug!(command, socket = %self.path.display(), "Monitor command");
            tokio::time::timeout(self.timeout, self.exchange(command, arguments.as_ref()))
                .await
                .map_err(|_| Error::timeout(command, self.timeout.as_secs()))?
        }
    }
}

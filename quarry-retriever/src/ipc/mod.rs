//! Line-delimited JSON protocol between the supervisor and its child.
//!
//! Every frame is one UTF-8 JSON object terminated by `\n`, discriminated by
//! a `type` field. Requests that expect a reply carry a string `id`; replies
//! echo it. Unsolicited frames (`event`, `memory`, the startup `ready`) have
//! no id.
//!
//! | host → child | child → host |
//! |--------------|--------------|
//! | `init`       | `ready`      |
//! | `call`       | `result`     |
//! | `shutdown`   | `shutting_down` |
//! | `ping`       | `pong`       |
//! |              | `event`, `memory`, `error` |

pub mod call;
pub mod child;

pub use call::{EngineCall, execute};
pub use child::run_child;

use crate::config::EngineConfig;
use crate::error::{ErrorKind, QuarryError};
use crate::events::EngineEvent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Frames sent by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Init {
        id: String,
        root: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        database: Option<PathBuf>,
        #[serde(default)]
        config: Box<EngineConfig>,
        /// Interval of `memory` reports; 0 disables them.
        #[serde(default)]
        memory_interval_ms: u64,
    },
    Call {
        id: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
    Shutdown {
        id: String,
    },
    Ping {
        id: String,
    },
}

impl HostMessage {
    pub fn id(&self) -> &str {
        match self {
            Self::Init { id, .. }
            | Self::Call { id, .. }
            | Self::Shutdown { id }
            | Self::Ping { id } => id,
        }
    }
}

/// Error payload of a failed `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let (kind, message) = QuarryError::classify(err);
        Self { kind, message }
    }

    pub fn into_error(self) -> QuarryError {
        QuarryError::from_kind(self.kind, self.message)
    }
}

/// Frames sent by the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Sent once on startup (no id) and in reply to `init`.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        pid: u32,
    },
    Result {
        id: String,
        ok: bool,
        #[serde(default)]
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Event {
        event: EngineEvent,
    },
    Memory {
        rss_mb: u64,
        virtual_mb: u64,
    },
    /// A failure outside any call (`id` absent) or one that ends the child
    /// (`fatal`).
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
        fatal: bool,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    ShuttingDown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ChildMessage {
    pub fn success(id: impl Into<String>, value: Value) -> Self {
        Self::Result {
            id: id.into(),
            ok: true,
            value,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: WireError) -> Self {
        Self::Result {
            id: id.into(),
            ok: false,
            value: Value::Null,
            error: Some(error),
        }
    }
}

/// Serialize one frame, without the trailing newline.
pub fn encode<M: Serialize>(message: &M) -> Result<String, QuarryError> {
    serde_json::to_string(message).map_err(|e| QuarryError::protocol(format!("unencodable frame: {e}")))
}

/// Parse one line into a frame; malformed or unknown frames yield `None`.
pub fn parse_message<M: DeserializeOwned>(line: &str) -> Option<M> {
    decode(line).ok()
}

fn decode<M: DeserializeOwned>(line: &str) -> Result<M, QuarryError> {
    serde_json::from_str(line.trim()).map_err(|e| QuarryError::protocol(format!("malformed frame: {e}")))
}

/// Reads newline-delimited frames.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// The next frame; `Ok(None)` at end of stream. A line that is not UTF-8
    /// or does not parse is returned as `Some(Err(ProtocolError))` so the
    /// caller decides whether to answer or skip it. Blank lines are skipped.
    pub async fn next<M: DeserializeOwned>(
        &mut self,
    ) -> std::io::Result<Option<Result<M, QuarryError>>> {
        loop {
            self.buf.clear();
            if self.inner.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line,
                Err(e) => {
                    return Ok(Some(Err(QuarryError::protocol(format!(
                        "frame is not valid UTF-8: {e}"
                    )))));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(decode(line)));
        }
    }
}

/// Writes newline-delimited frames, flushing after each one.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send<M: Serialize>(&mut self, message: &M) -> anyhow::Result<()> {
        let mut line = encode(message)?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use serde_json::json;

    #[test]
    fn test_frames_round_trip() {
        let host = vec![
            HostMessage::Init {
                id: "1".into(),
                root: "/work".into(),
                database: Some("/work/.quarry/index.db".into()),
                config: Box::new(EngineConfig::for_testing()),
                memory_interval_ms: 1000,
            },
            HostMessage::Call {
                id: "2".into(),
                method: "search".into(),
                args: json!({"query": "rust"}),
            },
            HostMessage::Shutdown { id: "3".into() },
            HostMessage::Ping { id: "4".into() },
        ];
        for message in host {
            let line = encode(&message).unwrap();
            assert!(!line.contains('\n'));
            assert_eq!(parse_message::<HostMessage>(&line), Some(message));
        }

        let child = vec![
            ChildMessage::Ready { id: None, pid: 42 },
            ChildMessage::success("2", json!({"indexed": 3})),
            ChildMessage::failure(
                "5",
                WireError {
                    kind: ErrorKind::NotFound,
                    message: "chunker x".into(),
                },
            ),
            ChildMessage::Event {
                event: EngineEvent::Sync(SyncEvent::Progress { checked: 1, total: 9 }),
            },
            ChildMessage::Memory {
                rss_mb: 512,
                virtual_mb: 2048,
            },
            ChildMessage::Error {
                id: None,
                message: "out of memory".into(),
                fatal: true,
            },
            ChildMessage::Pong { id: Some("4".into()) },
            ChildMessage::ShuttingDown { id: Some("3".into()) },
        ];
        for message in child {
            let line = encode(&message).unwrap();
            assert_eq!(parse_message::<ChildMessage>(&line), Some(message));
        }
    }

    #[test]
    fn test_wire_shape() {
        let line = encode(&ChildMessage::Ready { id: None, pid: 7 }).unwrap();
        assert_eq!(line, r#"{"type":"ready","pid":7}"#);
        let ping: HostMessage = parse_message(r#"{"type":"ping","id":"x"}"#).unwrap();
        assert_eq!(ping.id(), "x");
    }

    #[test]
    fn test_malformed_frames_are_none() {
        assert_eq!(parse_message::<HostMessage>("not json"), None);
        assert_eq!(parse_message::<HostMessage>(r#"{"type":"launch","id":"1"}"#), None);
        assert_eq!(parse_message::<HostMessage>(r#"{"type":"ping"}"#), None);
        assert_eq!(parse_message::<ChildMessage>(""), None);
    }

    #[tokio::test]
    async fn test_reader_and_writer_frame_lines() -> anyhow::Result<()> {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = MessageWriter::new(client);
        writer.send(&HostMessage::Ping { id: "a".into() }).await?;
        writer.send(&HostMessage::Shutdown { id: "b".into() }).await?;
        writer.shutdown().await?;

        let mut reader = MessageReader::new(server);
        let first: HostMessage = reader.next().await?.unwrap()?;
        assert_eq!(first, HostMessage::Ping { id: "a".into() });
        let second: HostMessage = reader.next().await?.unwrap()?;
        assert_eq!(second.id(), "b");
        assert!(reader.next::<HostMessage>().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_reader_reports_bad_line() -> anyhow::Result<()> {
        let input: &[u8] = b"\n{oops\n{\"type\":\"ping\",\"id\":\"z\"}\n";
        let mut reader = MessageReader::new(input);
        let bad = reader.next::<HostMessage>().await?.unwrap();
        assert!(matches!(bad, Err(QuarryError::ProtocolError(_))));
        let good = reader.next::<HostMessage>().await?.unwrap()?;
        assert_eq!(good.id(), "z");
        Ok(())
    }

    #[tokio::test]
    async fn test_reader_survives_invalid_utf8() -> anyhow::Result<()> {
        let input: &[u8] = b"\xff\xfe garbage\n{\"type\":\"ping\",\"id\":\"p\"}";
        let mut reader = MessageReader::new(input);
        let bad = reader.next::<HostMessage>().await?.unwrap();
        assert!(matches!(bad, Err(QuarryError::ProtocolError(_))));
        // A final frame without a trailing newline is still read.
        let good = reader.next::<HostMessage>().await?.unwrap()?;
        assert_eq!(good, HostMessage::Ping { id: "p".into() });
        assert!(reader.next::<HostMessage>().await?.is_none());
        Ok(())
    }
}

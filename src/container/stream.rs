//! Log streaming
//!
//! Splits runtime output into lines, decodes them according to the stream's
//! framing and forwards the result to the caller's log sink.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use super::runtime::LogStream;

/// Caller-owned, bounded destination for streamed output
pub type LogSink = mpsc::Sender<Vec<u8>>;

/// One progress document from a build or pull stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl RuntimeMessage {
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Text surfaced to the sink
    pub fn value(&self) -> String {
        format!("{}{}{}", self.stream, self.status, self.error)
    }
}

/// How lines of a stream are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Exec output, forwarded verbatim
    Raw,
    /// Build/pull progress, one [`RuntimeMessage`] JSON document per line
    Message,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to read stream: {0}")]
    Read(#[from] io::Error),

    #[error("malformed progress message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The runtime reported an error inside the stream
    #[error("{0}")]
    Reported(String),

    #[error("log sink closed")]
    SinkClosed,
}

/// Decode a single build/pull progress line
pub fn decode_message(line: &[u8]) -> Result<Vec<u8>, StreamError> {
    let message: RuntimeMessage = serde_json::from_slice(line)?;
    if message.is_error() {
        return Err(StreamError::Reported(message.value()));
    }
    Ok(message.value().into_bytes())
}

/// Forward every line of `stream` to `sink` until end-of-output.
///
/// Suspends while the sink is full. Returns the number of records sent.
pub async fn forward_lines(
    stream: LogStream,
    sink: &LogSink,
    framing: Framing,
) -> Result<usize, StreamError> {
    let mut lines = StreamReader::new(stream).split(b'\n');
    let mut sent = 0;

    while let Some(mut line) = lines.next_segment().await? {
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let record = match framing {
            Framing::Raw => line,
            Framing::Message => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                decode_message(&line)?
            }
        };

        sink.send(record).await.map_err(|_| StreamError::SinkClosed)?;
        sent += 1;
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use pretty_assertions::assert_eq;

    fn chunks(parts: &[&'static str]) -> LogStream {
        let items: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        stream::iter(items).boxed()
    }

    async fn drain(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = rx.recv().await {
            out.push(String::from_utf8(line).unwrap());
        }
        out
    }

    #[test]
    fn test_message_value_concatenates_fields() {
        let msg: RuntimeMessage =
            serde_json::from_str(r#"{"stream":"Step 1/2","status":" ok"}"#).unwrap();
        assert!(!msg.is_error());
        assert_eq!(msg.value(), "Step 1/2 ok");
    }

    #[test]
    fn test_decode_reported_error() {
        let err = decode_message(br#"{"error":"manifest not found"}"#).unwrap_err();
        assert!(matches!(err, StreamError::Reported(ref m) if m == "manifest not found"));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode_message(b"not json"),
            Err(StreamError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_raw_lines_split_across_chunks() {
        let (tx, rx) = mpsc::channel(16);
        let sent = forward_lines(chunks(&["hel", "lo\r\nwor", "ld\nlast"]), &tx, Framing::Raw)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(sent, 3);
        assert_eq!(drain(rx).await, vec!["hello", "world", "last"]);
    }

    #[tokio::test]
    async fn test_message_lines_decoded() {
        let (tx, rx) = mpsc::channel(16);
        let input = chunks(&["{\"status\":\"Pulling\"}\n\n", "{\"stream\":\"Done\"}\n"]);
        forward_lines(input, &tx, Framing::Message).await.unwrap();
        drop(tx);

        assert_eq!(drain(rx).await, vec!["Pulling", "Done"]);
    }

    #[tokio::test]
    async fn test_error_line_stops_forwarding() {
        let (tx, rx) = mpsc::channel(16);
        let input = chunks(&[
            "{\"status\":\"Pulling\"}\n",
            "{\"error\":\"manifest not found\"}\n",
            "{\"status\":\"never\"}\n",
        ]);
        let err = forward_lines(input, &tx, Framing::Message).await.unwrap_err();
        drop(tx);

        assert_eq!(err.to_string(), "manifest not found");
        assert_eq!(drain(rx).await, vec!["Pulling"]);
    }

    #[tokio::test]
    async fn test_closed_sink_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = forward_lines(chunks(&["a\n"]), &tx, Framing::Raw)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::SinkClosed));
    }

    #[tokio::test]
    async fn test_backpressure_waits_for_consumer() {
        let (tx, mut rx) = mpsc::channel(1);
        let producer = tokio::spawn(async move {
            forward_lines(chunks(&["1\n2\n3\n"]), &tx, Framing::Raw).await
        });

        let mut got = Vec::new();
        while let Some(line) = rx.recv().await {
            got.push(line);
        }
        assert_eq!(producer.await.unwrap().unwrap(), 3);
        assert_eq!(got, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }
}

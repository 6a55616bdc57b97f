//! Local socket wire format between a supervisor and its worker.
//!
//! Wire format: one compact UTF-8 JSON document per line, terminated by `\n`.
//! Serialized documents never contain a raw newline (string newlines are
//! escaped), so the terminator is unambiguous.
//!
//! A worker may also emit `OUTPUT:<text>` lines, which carry console output
//! and are never treated as a protocol document.

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Maximum document size (16 MiB). A longer line is rejected before it is
/// buffered in full.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Prefix of a worker console-output line.
pub const OUTPUT_PREFIX: &str = "OUTPUT:";

/// Encode a document as a single terminated line.
pub fn encode(document: &Value) -> Result<Bytes, serde_json::Error> {
    let body = serde_json::to_vec(document)?;
    Ok(encode_line(&body))
}

/// Terminate an already-serialized document.
pub fn encode_line(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put(body);
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Write a serialized document line and flush.
pub async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    if text.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "document must not contain a newline",
        ));
    }
    writer.write_all(&encode_line(text.as_bytes())).await?;
    writer.flush().await
}

/// Serialize and write a document, then flush.
pub async fn write_document<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    document: &Value,
) -> io::Result<()> {
    let encoded = encode(document).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Write a console-output line.
pub async fn write_output<W: AsyncWriteExt + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    let flattened = text.replace('\n', " ");
    write_line(writer, &format!("{OUTPUT_PREFIX}{flattened}")).await
}

/// What a received line carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Worker console output, prefix stripped.
    Output(String),
    /// A protocol document (not yet parsed).
    Document(String),
}

pub fn classify(line: String) -> Inbound {
    match line.strip_prefix(OUTPUT_PREFIX) {
        Some(text) => Inbound::Output(text.to_string()),
        None => Inbound::Document(line),
    }
}

/// Line reader over the read half of a socket.
///
/// [`DocumentReader::next_line`] is cancel safe, so it can sit in a
/// `tokio::select!` loop next to other event sources.
pub struct DocumentReader<R> {
    lines: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> DocumentReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_DOCUMENT_SIZE)),
        }
    }

    /// Read the next non-empty line. `Ok(None)` means the peer closed the
    /// stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let line = match self.lines.next().await {
                None => return Ok(None),
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("document exceeds {MAX_DOCUMENT_SIZE} bytes"),
                    ));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e),
            };
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(line.to_string()));
        }
    }

    /// Read and parse the next document.
    pub async fn next_document(&mut self) -> io::Result<Option<Value>> {
        match self.next_line().await? {
            Some(line) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_terminates_with_single_newline() {
        let encoded = encode(&json!({"Action": "Ping"})).unwrap();
        assert_eq!(encoded.as_ref(), b"{\"Action\":\"Ping\"}\n");
    }

    #[test]
    fn encode_escapes_embedded_newlines() {
        let encoded = encode(&json!({"Value": "a\nb"})).unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn classify_output_lines() {
        assert_eq!(
            classify("OUTPUT:hello world".to_string()),
            Inbound::Output("hello world".to_string())
        );
        assert_eq!(
            classify(r#"{"Status":"Ok","What":"Ping"}"#.to_string()),
            Inbound::Document(r#"{"Status":"Ok","What":"Ping"}"#.to_string())
        );
    }

    #[tokio::test]
    async fn write_then_read_sequential_documents() {
        let mut buf = Vec::new();
        write_document(&mut buf, &json!({"Action": "Ping"})).await.unwrap();
        write_output(&mut buf, "progress\n50%").await.unwrap();
        write_line(&mut buf, r#"{"Status":"Ok","What":"hi"}"#).await.unwrap();

        let mut reader = DocumentReader::new(io::Cursor::new(buf));
        assert_eq!(
            reader.next_document().await.unwrap(),
            Some(json!({"Action": "Ping"}))
        );
        assert_eq!(
            reader.next_line().await.unwrap().map(classify),
            Some(Inbound::Output("progress 50%".to_string()))
        );
        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some(r#"{"Status":"Ok","What":"hi"}"#)
        );
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn blank_and_crlf_lines_are_skipped() {
        let data = b"\n\r\n{\"a\":1}\r\n".to_vec();
        let mut reader = DocumentReader::new(io::Cursor::new(data));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_eof_is_none() {
        let mut reader = DocumentReader::new(io::Cursor::new(Vec::<u8>::new()));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_line_is_rejected_without_newline() {
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let feeder = tokio::spawn(async move {
            let chunk = vec![b'a'; 64 * 1024];
            let mut sent = 0;
            while sent <= MAX_DOCUMENT_SIZE {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
                sent += chunk.len();
            }
            // Keep the stream open: the limit must trip before any EOF.
            writer
        });

        let mut reader = DocumentReader::new(reader);
        let err = reader.next_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        drop(reader);
        let _ = feeder.await;
    }

    #[tokio::test]
    async fn malformed_document_is_invalid_data() {
        let mut reader = DocumentReader::new(io::Cursor::new(b"{not json\n".to_vec()));
        let err = reader.next_document().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn write_line_rejects_embedded_newline() {
        let mut buf = Vec::new();
        let err = write_line(&mut buf, "a\nb").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }
}

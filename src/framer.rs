//! Incremental SSE line framing.
//!
//! Bytes are buffered until a full `\n`-terminated line is available, so a
//! multi-byte character split across two network chunks is only decoded once
//! both halves have arrived. Only `data: ` lines are surfaced; a trailing
//! unterminated fragment at end of stream is dropped.

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

use crate::constants::MAX_SSE_LINE_BYTES;
use crate::types::RelayError;

const DATA_PREFIX: &[u8] = b"data: ";

#[derive(Error, Debug)]
pub enum SseFrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSE line exceeded {0} bytes")]
    MaxLineLengthExceeded(usize),
}

impl From<SseFrameError> for RelayError {
    fn from(e: SseFrameError) -> Self {
        match e {
            SseFrameError::Io(io) => RelayError::Io(io),
            other => RelayError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SseLineCodec {
    /// Bytes of the buffer already scanned for a newline.
    next_index: usize,
    max_length: usize,
}

impl SseLineCodec {
    pub fn new() -> Self {
        Self::new_with_max_length(MAX_SSE_LINE_BYTES)
    }

    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
        }
    }
}

impl Default for SseLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let rest = line.strip_prefix(DATA_PREFIX)?;
    Some(String::from_utf8_lossy(rest).trim().to_string())
}

impl Decoder for SseLineCodec {
    type Item = String;
    type Error = SseFrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, SseFrameError> {
        loop {
            let read_to = std::cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match newline {
                Some(offset) => {
                    let newline_index = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(newline_index + 1);
                    if let Some(payload) = data_payload(&line[..line.len() - 1]) {
                        return Ok(Some(payload));
                    }
                }
                None if buf.len() > self.max_length => {
                    return Err(SseFrameError::MaxLineLengthExceeded(self.max_length));
                }
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, SseFrameError> {
        let line = self.decode(buf)?;
        if line.is_none() && !buf.is_empty() {
            tracing::debug!(
                "[FRAMER] Discarding {} unterminated bytes at end of stream",
                buf.len()
            );
            buf.clear();
            self.next_index = 0;
        }
        Ok(line)
    }
}

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;
pub type SseLines = FramedRead<StreamReader<ByteStream, Bytes>, SseLineCodec>;

/// Frames a raw body stream into the payloads of its `data: ` lines.
pub fn sse_data_lines<S, E>(stream: S) -> SseLines
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let bytes: ByteStream = stream.map(|r| r.map_err(std::io::Error::other)).boxed();
    FramedRead::new(StreamReader::new(bytes), SseLineCodec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn frame_chunks(chunks: Vec<Vec<u8>>) -> Vec<String> {
        let stream = futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(Bytes::from(c))),
        );
        let mut lines = sse_data_lines(stream);
        let mut out = Vec::new();
        while let Some(line) = lines.next().await {
            out.push(line.expect("frame"));
        }
        out
    }

    fn split_every(bytes: &[u8], size: usize) -> Vec<Vec<u8>> {
        bytes.chunks(size).map(|c| c.to_vec()).collect()
    }

    #[tokio::test]
    async fn frames_survive_any_chunk_boundary() {
        let payloads = vec![
            r#"{"type":"content","content":"北京"}"#.to_string(),
            r#"{"type":"content","content":"今天晴朗 ☀️"}"#.to_string(),
            "[DONE]".to_string(),
        ];
        let wire: String = payloads.iter().map(|p| format!("data: {}\n\n", p)).collect();

        for size in 1..=wire.len() {
            let lines = frame_chunks(split_every(wire.as_bytes(), size)).await;
            assert_eq!(lines, payloads, "chunk size {}", size);
        }
    }

    #[tokio::test]
    async fn non_data_lines_are_skipped() {
        let wire = ": keepalive\nevent: message\n\ndata: one\r\nid: 7\ndata: two\n";
        let lines = frame_chunks(vec![wire.as_bytes().to_vec()]).await;
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn unterminated_tail_is_discarded() {
        let lines = frame_chunks(vec![b"data: kept\ndata: {\"partial\":".to_vec()]).await;
        assert_eq!(lines, vec!["kept".to_string()]);
    }

    #[test]
    fn oversized_line_is_an_error() {
        let mut codec = SseLineCodec::new_with_max_length(8);
        let mut buf = BytesMut::from(&b"data: 0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(SseFrameError::MaxLineLengthExceeded(8))
        ));
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let mut codec = SseLineCodec::new();
        let mut buf = BytesMut::from(&b"data: hel"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lo\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("hello".to_string()));
    }
}

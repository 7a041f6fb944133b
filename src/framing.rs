//! `0x00`-terminated framing over any async byte stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::FRAME_TERMINATOR;

const READ_CHUNK: usize = 8 * 1024;

/// Splits a byte stream into terminated frames.
///
/// A frame growing past `max_frame_len` is dropped: the reader stops
/// buffering it and discards bytes until the next terminator, then resumes.
/// All partial state lives on the struct, so `next_frame` can be cancelled
/// (e.g. inside `select!`) without losing bytes.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
    frame: Vec<u8>,
    skipping: Option<usize>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self::with_buffered(inner, max_frame_len, Vec::new())
    }

    /// Starts from bytes that were already read off `inner` elsewhere.
    pub fn with_buffered(inner: R, max_frame_len: usize, buffered: Vec<u8>) -> Self {
        let filled = buffered.len();
        let mut buf = buffered;
        buf.resize(filled.max(READ_CHUNK), 0);
        Self {
            inner,
            buf,
            pos: 0,
            filled,
            frame: Vec::new(),
            skipping: None,
            max_frame_len,
        }
    }

    /// Returns the next complete frame without its terminator.
    ///
    /// End of input before a terminator yields `UnexpectedEof`; the peer is
    /// gone and the stream must not be used again.
    pub async fn next_frame(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if self.pos == self.filled {
                let read = self.inner.read(&mut self.buf).await?;
                if read == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed before frame terminator",
                    ));
                }
                self.pos = 0;
                self.filled = read;
            }

            let available = &self.buf[self.pos..self.filled];
            match available.iter().position(|b| *b == FRAME_TERMINATOR) {
                Some(end) => {
                    self.pos += end + 1;
                    if let Some(skipped) = self.skipping.take() {
                        tracing::warn!(
                            target = "arena_broker::framing",
                            bytes = skipped + end,
                            limit = self.max_frame_len,
                            "discarded oversized frame"
                        );
                        continue;
                    }
                    if self.frame.len() + end > self.max_frame_len {
                        tracing::warn!(
                            target = "arena_broker::framing",
                            bytes = self.frame.len() + end,
                            limit = self.max_frame_len,
                            "discarded oversized frame"
                        );
                        self.frame.clear();
                        continue;
                    }
                    self.frame.extend_from_slice(&available[..end]);
                    return Ok(std::mem::take(&mut self.frame));
                }
                None => {
                    let len = available.len();
                    self.pos = self.filled;
                    if let Some(skipped) = self.skipping.as_mut() {
                        *skipped += len;
                    } else if self.frame.len() + len > self.max_frame_len {
                        self.skipping = Some(self.frame.len() + len);
                        self.frame = Vec::new();
                    } else {
                        self.frame.extend_from_slice(available);
                    }
                }
            }
        }
    }

    /// Gives back the stream plus any bytes read past the last returned frame.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        let mut leftover = if self.skipping.is_some() {
            Vec::new()
        } else {
            self.frame
        };
        leftover.extend_from_slice(&self.buf[self.pos..self.filled]);
        (self.inner, leftover)
    }
}

/// Writes one already-encoded frame and flushes it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn splits_consecutive_frames() {
        let input: &[u8] = b"{\"a\":1}\0{\"b\":2}\0";
        let mut reader = FrameReader::new(input, 1024);
        assert_eq!(reader.next_frame().await.unwrap(), b"{\"a\":1}");
        assert_eq!(reader.next_frame().await.unwrap(), b"{\"b\":2}");
    }

    #[tokio::test]
    async fn eof_mid_frame_is_fatal() {
        let input: &[u8] = b"{\"a\":1}\0{\"b\"";
        let mut reader = FrameReader::new(input, 1024);
        reader.next_frame().await.unwrap();
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped() {
        let mut input = vec![b'x'; 40];
        input.push(0);
        input.extend_from_slice(b"ok\0");
        let mut reader = FrameReader::new(input.as_slice(), 16);
        assert_eq!(reader.next_frame().await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn frame_at_exact_limit_is_kept() {
        let input: &[u8] = b"0123456789abcdef\0";
        let mut reader = FrameReader::new(input, 16);
        assert_eq!(reader.next_frame().await.unwrap(), b"0123456789abcdef");
    }

    #[tokio::test]
    async fn resynchronises_across_many_reads() {
        let (mut client, server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            for _ in 0..64 {
                client.write_all(b"zzzzzzzz").await.unwrap();
            }
            client.write_all(b"\0small\0").await.unwrap();
        });
        let mut reader = FrameReader::new(server, 32);
        assert_eq!(reader.next_frame().await.unwrap(), b"small");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn into_parts_keeps_pipelined_bytes() {
        let input: &[u8] = b"first\0second\0thi";
        let mut reader = FrameReader::new(input, 64);
        assert_eq!(reader.next_frame().await.unwrap(), b"first");
        let (rest, leftover) = reader.into_parts();
        assert_eq!(leftover, b"second\0thi");

        let mut resumed = FrameReader::with_buffered(rest, 64, leftover);
        assert_eq!(resumed.next_frame().await.unwrap(), b"second");
        assert_eq!(
            resumed.next_frame().await.unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[tokio::test]
    async fn write_frame_writes_bytes_verbatim() {
        let mut out = Vec::new();
        write_frame(&mut out, b"{}\0").await.unwrap();
        assert_eq!(out, b"{}\0");
    }
}

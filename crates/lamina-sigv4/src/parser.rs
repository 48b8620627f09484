//! Push-parser for the `aws-chunked` body framing (spec §4.2):
//!
//! ```text
//! <hex-size>;chunk-signature=<hex>\r\n<payload:size bytes>\r\n
//! ...
//! 0;chunk-signature=<hex>\r\n
//! [trailer-name: value\r\n]*
//! x-amz-trailer-signature: <hex>\r\n
//! \r\n
//! ```
//!
//! The parser operates as a push parser over a pull source: while the
//! source has bytes, it extracts complete frames and hands decoded payload
//! to a sink. A frame header may arrive split across source reads; the
//! carry buffer retains *the entire unconsumed frame, header included*
//! until the whole frame (header + payload + trailing CRLF) is present.
//! This sidesteps a prior bug class where a parser would drain the header
//! bytes as soon as it was parsed and compute the next scan position from
//! the post-header offset — if the payload then turned out to be only
//! partially available, the next read would re-scan from the wrong place
//! and corrupt or drop data. Here nothing is drained until a full frame is
//! in hand, so the rewind position is always implicitly the start of the
//! (still fully buffered) header line.

use std::future::Future;

use anyhow::{bail, Context};
use lamina_common::S3Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::validator::ChunkSignatureValidator;

const READ_SIZE: usize = 64 * 1024;

/// Incremental frame extractor over an in-memory carry buffer. Kept
/// separate from the I/O loop so it can be unit tested without an async
/// source.
#[derive(Default)]
struct FrameScanner {
    carry: Vec<u8>,
}

enum ScanOutcome {
    /// A complete frame was found; `consumed` bytes should be drained from
    /// the front of the carry buffer by the caller after it is done
    /// borrowing `payload`.
    Frame { consumed: usize, frame: ParsedFrame },
    /// Not enough data yet; caller should read more from the source and
    /// retry without consuming anything.
    NeedMoreData,
}

enum ParsedFrame {
    Chunk { payload: Vec<u8>, signature: String },
    Terminator { signature: String, trailers: Vec<(String, String)> },
}

impl FrameScanner {
    fn feed(&mut self, data: &[u8]) {
        self.carry.extend_from_slice(data);
    }

    fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
        buf[from..].windows(2).position(|w| w == b"\r\n").map(|p| p + from)
    }

    /// Tries to parse one frame from the front of the carry buffer. Never
    /// consumes a partial frame: on insufficient data it returns
    /// `NeedMoreData` and leaves `self.carry` untouched so the next `feed`
    /// extends the same, still-intact buffer.
    fn try_scan(&mut self) -> anyhow::Result<ScanOutcome> {
        let header_end = match Self::find_crlf(&self.carry, 0) {
            Some(pos) => pos,
            None => return Ok(ScanOutcome::NeedMoreData),
        };
        let header_line = std::str::from_utf8(&self.carry[..header_end])
            .context("chunk header is not valid UTF-8")?;

        let (size_hex, signature) = parse_chunk_header(header_line)
            .with_context(|| format!("unparseable chunk size in header {header_line:?}"))?;

        let size = usize::from_str_radix(size_hex, 16)
            .with_context(|| format!("unparseable chunk size hex {size_hex:?}"))?;

        let body_start = header_end + 2;

        if size == 0 {
            // Terminator frame: scan forward for the blank line ending the
            // trailer section. Nothing is consumed until that blank line
            // is actually present.
            return self.try_scan_terminator(body_start, signature);
        }

        let body_end = body_start + size;
        let frame_end = body_end + 2; // trailing CRLF after payload
        if self.carry.len() < frame_end {
            return Ok(ScanOutcome::NeedMoreData);
        }
        if &self.carry[body_end..frame_end] != b"\r\n" {
            bail!("chunk payload not terminated by CRLF");
        }

        let payload = self.carry[body_start..body_end].to_vec();
        Ok(ScanOutcome::Frame {
            consumed: frame_end,
            frame: ParsedFrame::Chunk { payload, signature },
        })
    }

    fn try_scan_terminator(&mut self, trailers_start: usize, signature: String) -> anyhow::Result<ScanOutcome> {
        // Trailer lines, then a blank line. We need to see the blank line
        // before we can say how much of the buffer this frame consumes.
        let mut cursor = trailers_start;
        let mut trailers = Vec::new();
        loop {
            let line_end = match Self::find_crlf(&self.carry, cursor) {
                Some(pos) => pos,
                None => return Ok(ScanOutcome::NeedMoreData),
            };
            if line_end == cursor {
                // Blank line: end of trailer section.
                let consumed = line_end + 2;
                return Ok(ScanOutcome::Frame {
                    consumed,
                    frame: ParsedFrame::Terminator { signature, trailers },
                });
            }
            let line = std::str::from_utf8(&self.carry[cursor..line_end])
                .context("trailer line is not valid UTF-8")?;
            let (name, value) = line
                .split_once(':')
                .with_context(|| format!("malformed trailer line {line:?}"))?;
            trailers.push((name.trim().to_string(), value.trim().to_string()));
            cursor = line_end + 2;
        }
    }

    fn consume(&mut self, n: usize) {
        self.carry.drain(0..n);
    }

    fn is_empty(&self) -> bool {
        self.carry.is_empty()
    }
}

fn parse_chunk_header(header_line: &str) -> anyhow::Result<(&str, String)> {
    let mut parts = header_line.splitn(2, ';');
    let size_hex = parts.next().context("empty chunk header")?;
    let rest = parts.next().unwrap_or("");
    let signature = rest
        .strip_prefix("chunk-signature=")
        .map(|s| s.to_string())
        .unwrap_or_default();
    Ok((size_hex, signature))
}

/// Outcome of decoding a chunked body to a sink, with trailer collection
/// (mode (c) in spec §4.2).
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub bytes_written: u64,
    pub trailers: Vec<(String, String)>,
    /// `None` when no trailer validation was requested (no validator, or a
    /// body with no trailers). `Some(false)` is non-fatal to the bytes
    /// already written, per spec §4.2, but the caller must fail the
    /// request.
    pub trailer_ok: Option<bool>,
}

/// Decodes an `aws-chunked` body from `source`, writing payload bytes to
/// `sink` as they're decoded, validating each chunk (and the trailer, if
/// present) against `validator` when supplied. Returns once the terminator
/// and any trailers have been consumed.
pub async fn decode_to_sink<R, W>(
    mut source: R,
    mut sink: W,
    mut validator: Option<&mut ChunkSignatureValidator>,
) -> anyhow::Result<DecodeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut scanner = FrameScanner::default();
    let mut read_buf = vec![0u8; READ_SIZE];
    let mut outcome = DecodeOutcome::default();

    loop {
        match scanner.try_scan()? {
            ScanOutcome::Frame { consumed, frame } => {
                scanner.consume(consumed);
                match frame {
                    ParsedFrame::Chunk { payload, signature } => {
                        if let Some(v) = validator.as_deref_mut() {
                            if !v.validate_chunk(&payload, &signature, false) {
                                bail!(anyhow::Error::new(S3Error::signature_does_not_match(
                                    format!("chunk {} signature mismatch", v.chunk_index())
                                )));
                            }
                        }
                        sink.write_all(&payload).await.context("writing decoded chunk to sink")?;
                        outcome.bytes_written += payload.len() as u64;
                    },
                    ParsedFrame::Terminator { signature, trailers } => {
                        if let Some(v) = validator.as_deref_mut() {
                            if !trailers.is_empty() || v.expects_trailers() {
                                outcome.trailer_ok = Some(v.validate_trailer(&trailers, &signature));
                            } else {
                                // No trailers expected and none present: the
                                // terminator's own chunk-signature still
                                // chains as the final "chunk" in the
                                // sequence (the empty-payload chunk).
                                let ok = v.validate_chunk(b"", &signature, true);
                                if !ok {
                                    bail!(anyhow::Error::new(S3Error::signature_does_not_match(
                                        "terminator chunk signature mismatch"
                                    )));
                                }
                            }
                        }
                        outcome.trailers = trailers;
                        sink.flush().await.context("flushing sink")?;
                        return Ok(outcome);
                    },
                }
            },
            ScanOutcome::NeedMoreData => {
                let n = source
                    .read(&mut read_buf)
                    .await
                    .context("reading aws-chunked source")?;
                if n == 0 {
                    if scanner.is_empty() {
                        bail!("source ended without a terminator frame");
                    }
                    bail!(anyhow::Error::new(S3Error::invalid_argument(
                        "end of stream inside an aws-chunked frame"
                    )));
                }
                scanner.feed(&read_buf[..n]);
            },
        }
    }
}

/// Mode (a) from spec §4.2: yields decoded chunks as a lazy finite byte
/// stream. Implemented as a `tokio::io::duplex` pipe feeding a background
/// task that drives [`decode_to_sink`] — the "bounded channel + two tasks"
/// shape spec §9 calls out, with backpressure flowing from the stream
/// consumer back to the decode task via the duplex's bounded buffer.
pub fn decode_chunk_stream<R>(
    source: R,
    mut validator: Option<ChunkSignatureValidator>,
) -> tokio_stream::wrappers::ReceiverStream<anyhow::Result<bytes::Bytes>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        let sink = ChannelSink { tx: tx.clone() };
        let result = decode_to_sink(source, sink, validator.as_mut()).await;
        if let Err(e) = result {
            let _ = tx.send(Err(e)).await;
        }
    });
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

/// An `AsyncWrite` sink that forwards each write as one `Bytes` item over
/// an mpsc channel, used to adapt [`decode_to_sink`] into a `Stream`.
struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<anyhow::Result<bytes::Bytes>>,
}

impl AsyncWrite for ChannelSink {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let tx = self.tx.clone();
        let data = bytes::Bytes::copy_from_slice(buf);
        let len = data.len();
        let mut send_fut = Box::pin(async move { tx.send(Ok(data)).await });
        match send_fut.as_mut().poll(cx) {
            std::task::Poll::Ready(Ok(())) => std::task::Poll::Ready(Ok(len)),
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Ok(len)), // receiver dropped; nothing to write to
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

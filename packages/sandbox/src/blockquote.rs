// ABOUTME: Byte-stream "blockquote" framing for live container output
// ABOUTME: Indents every visual line and brackets the stream with border lines

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const TOP_BORDER: &[u8] = "\r╭─────┄┈\n".as_bytes();
pub const BOTTOM_BORDER: &[u8] = "\r╰─────┄┈\n".as_bytes();
pub const INDENT: &[u8] = "│ ".as_bytes();

/// What the previously emitted byte was.
///
/// A bare carriage return starts a new visual line (progress displays redraw
/// the current line with it) unless the next byte is a newline, so that a
/// conventional CR-LF pair is not indented twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineState {
    #[default]
    AfterNewline,
    AfterCarriageReturn,
    Normal,
}

impl LineState {
    /// Whether `next` is the first byte of a new visual line.
    pub fn starts_visual_line(self, next: u8) -> bool {
        match self {
            LineState::AfterNewline => true,
            LineState::AfterCarriageReturn => next != b'\n',
            LineState::Normal => false,
        }
    }

    pub fn advance(self, byte: u8) -> Self {
        match byte {
            b'\n' => LineState::AfterNewline,
            b'\r' => LineState::AfterCarriageReturn,
            _ => LineState::Normal,
        }
    }
}

/// Byte-at-a-time line indenter with O(1) state.
///
/// State persists across chunks, so a CR-LF pair split over a chunk boundary
/// behaves exactly as if it arrived in one piece.
#[derive(Debug, Default)]
pub struct StreamIndenter {
    state: LineState,
}

impl StreamIndenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indent one chunk, inserting `indent` before every visual line start.
    pub fn feed(&mut self, chunk: &[u8], indent: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len() + indent.len());
        for &byte in chunk {
            if self.state.starts_visual_line(byte) {
                out.extend_from_slice(indent);
            }
            out.push(byte);
            self.state = self.state.advance(byte);
        }
        out
    }

    /// Trailing carriage return, if one is needed so that whatever follows
    /// the stream starts at column zero.
    pub fn finish(&mut self) -> Option<u8> {
        match std::mem::take(&mut self.state) {
            LineState::Normal => Some(b'\r'),
            _ => None,
        }
    }
}

/// Writes a framed stream to an async sink, flushing per chunk.
///
/// Callers must pair `open` with `close` on every exit path so the closing
/// border is always emitted, whatever happened to the stream in between.
pub struct BlockquoteWriter<W> {
    sink: W,
    indenter: StreamIndenter,
}

impl<W: AsyncWrite + Unpin> BlockquoteWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            indenter: StreamIndenter::new(),
        }
    }

    pub async fn open(&mut self) -> io::Result<()> {
        self.sink.write_all(TOP_BORDER).await?;
        self.sink.flush().await
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let indented = self.indenter.feed(chunk, INDENT);
        self.sink.write_all(&indented).await?;
        self.sink.flush().await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        if let Some(byte) = self.indenter.finish() {
            self.sink.write_all(&[byte]).await?;
        }
        self.sink.write_all(BOTTOM_BORDER).await?;
        self.sink.flush().await
    }
}

//! Newline-delimited JSON framing
//!
//! Reading: one request per `\n`-terminated line. Blank lines are liveness
//! probes and decode to [`Frame::Blank`]; anything that is not a well-formed
//! request decodes to a ready-made `error` response so the stream continues.
//!
//! Writing: [`ResponseWriter`] is the single writer shared by the dispatch
//! thread and the subscription poller. Each response is serialised first and
//! then written as one line under the lock, so two lines never interleave.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::{Request, Response};

/// Outcome of decoding one line
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    /// Empty or whitespace-only line
    Blank,
    /// Malformed line; the response should be written back as-is
    Invalid(Response),
}

/// Decode a single line (without its trailing newline)
pub fn decode_line(line: &str) -> Frame {
    let line = line.trim();
    if line.is_empty() {
        return Frame::Blank;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Frame::Invalid(Response::error(None, format!("Invalid JSON: {e}"))),
    };

    let Some(object) = value.as_object() else {
        return Frame::Invalid(Response::error(None, "Invalid request: expected a JSON object"));
    };

    let id = object.get("id").filter(|v| !v.is_null()).cloned();
    let tag = object.get("type").and_then(Value::as_str);

    match tag {
        Some(tag) if Request::TAGS.contains(&tag) => match serde_json::from_value(value.clone()) {
            Ok(request) => Frame::Request(request),
            Err(e) => Frame::Invalid(Response::error(id, format!("Invalid {tag} request: {e}"))),
        },
        _ => {
            let shown = object
                .get("type")
                .map(|t| match t {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "None".to_string());
            Frame::Invalid(Response::error(id, format!("Unknown command type: {shown}")))
        }
    }
}

/// Blocking line reader over any buffered byte stream
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Read the next frame, or `None` at end of stream.
    ///
    /// A final line without a trailing newline is still decoded. Invalid
    /// UTF-8 is replaced rather than rejected so the JSON parser reports it.
    pub fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(decode_line(&line)))
    }
}

/// Mutex-guarded line writer shared by every producer of responses
#[derive(Clone)]
pub struct ResponseWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ResponseWriter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write one response as a single flushed line
    pub fn send(&self, response: &Response) -> Result<()> {
        let line = encode_line(response)?;
        let mut out = self.inner.lock();
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }

    /// Write one response only if `still_wanted` holds while the writer lock
    /// is held. Returns whether the line was written.
    ///
    /// The poller uses this so that a cancelled subscription can never get an
    /// update onto the wire after the acknowledgement of its replacement.
    pub fn send_if(&self, response: &Response, still_wanted: impl FnOnce() -> bool) -> Result<bool> {
        let line = encode_line(response)?;
        let mut out = self.inner.lock();
        if !still_wanted() {
            return Ok(false);
        }
        out.write_all(&line)?;
        out.flush()?;
        Ok(true)
    }
}

fn encode_line(response: &Response) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    Ok(line)
}

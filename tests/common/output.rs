//! Shared output buffer standing in for the transport

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use dh_runner::ResponseWriter;

/// Clonable sink; every clone sees the same bytes
#[derive(Clone, Default)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&self) -> ResponseWriter {
        ResponseWriter::new(self.clone())
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.bytes.lock().clone()).expect("output is not UTF-8")
    }

    /// Every line written so far, parsed as JSON
    pub fn lines(&self) -> Vec<Value> {
        self.text()
            .lines()
            .map(|line| {
                serde_json::from_str(line)
                    .unwrap_or_else(|e| panic!("Invalid JSON line {:?}: {}", line, e))
            })
            .collect()
    }

    pub fn of_type(&self, kind: &str) -> Vec<Value> {
        self.lines()
            .into_iter()
            .filter(|line| line["type"] == kind)
            .collect()
    }

    /// Poll until `predicate` holds for the parsed lines or `timeout` passes
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&[Value]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.lines()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

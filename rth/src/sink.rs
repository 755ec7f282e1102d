//! Per-action output collection.

use rth_common::MESSAGE_STREAM;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Accumulates one action's output.
///
/// Side-channel streams are created on first use and keep their chunks in
/// arrival order; the distinguished `messages` stream routes to the primary
/// message log. Appends from concurrent copiers serialize internally, so a
/// `&ActionSink` can be shared freely.
#[derive(Debug, Default)]
pub struct ActionSink {
    inner: Mutex<SinkInner>,
}

#[derive(Debug, Default)]
struct SinkInner {
    // Insertion order matters for reporting, so no map here.
    streams: Vec<(String, String)>,
    messages: String,
}

impl ActionSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a chunk to the named stream.
    pub fn append(&self, stream: &str, data: &str) {
        let mut inner = self.lock();
        if stream == MESSAGE_STREAM {
            inner.messages.push_str(data);
        } else if let Some((_, buf)) = inner.streams.iter_mut().find(|(name, _)| name == stream) {
            buf.push_str(data);
        } else {
            inner.streams.push((stream.to_string(), data.to_string()));
        }
    }

    /// Append one line to the primary message log.
    pub fn message(&self, line: &str) {
        let mut inner = self.lock();
        inner.messages.push_str(line);
        if !line.ends_with('\n') {
            inner.messages.push('\n');
        }
    }

    /// Contents of a named stream, if anything was written to it.
    pub fn stream(&self, name: &str) -> Option<String> {
        self.lock()
            .streams
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, buf)| buf.clone())
    }

    /// The primary message log.
    pub fn messages(&self) -> String {
        self.lock().messages.clone()
    }

    /// Snapshot of every side-channel stream in creation order.
    pub fn streams(&self) -> Vec<(String, String)> {
        self.lock().streams.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rth_common::{STDERR_STREAM, STDOUT_STREAM};

    #[test]
    fn test_chunks_append_in_arrival_order() {
        let sink = ActionSink::new();
        sink.append(STDOUT_STREAM, "one ");
        sink.append(STDOUT_STREAM, "two ");
        sink.append(STDOUT_STREAM, "three");
        assert_eq!(sink.stream(STDOUT_STREAM).as_deref(), Some("one two three"));
    }

    #[test]
    fn test_streams_are_independent_and_ordered() {
        let sink = ActionSink::new();
        sink.append(STDOUT_STREAM, "out");
        sink.append(STDERR_STREAM, "err");
        sink.append("compile.out", "cc");
        assert_eq!(sink.stream(STDERR_STREAM).as_deref(), Some("err"));
        assert_eq!(sink.stream("missing"), None);
        let names: Vec<_> = sink.streams().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![STDOUT_STREAM, STDERR_STREAM, "compile.out"]);
    }

    #[test]
    fn test_messages_stream_routes_to_message_log() {
        let sink = ActionSink::new();
        sink.append(MESSAGE_STREAM, "from the worker\n");
        sink.message("from the controller");
        assert_eq!(sink.messages(), "from the worker\nfrom the controller\n");
        assert!(sink.streams().is_empty(), "messages must not create a side channel");
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave_within_a_chunk() {
        let sink = ActionSink::new();
        std::thread::scope(|scope| {
            for text in ["aaaa", "bbbb"] {
                let sink = &sink;
                scope.spawn(move || {
                    for _ in 0..100 {
                        sink.append(STDOUT_STREAM, text);
                    }
                });
            }
        });
        let out = sink.stream(STDOUT_STREAM).unwrap_or_default();
        assert_eq!(out.len(), 800);
        for chunk in out.as_bytes().chunks(4) {
            assert!(chunk == b"aaaa" || chunk == b"bbbb");
        }
    }
}

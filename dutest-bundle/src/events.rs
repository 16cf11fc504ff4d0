// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-entity event streams over a shared, serialized sink.
//!
//! The planner hands every entity (test or fixture) an [`EntityStream`].
//! Events written to one stream appear on the wire in call order; the sink
//! mutex serializes concurrent writers. A stream with the empty name is the
//! implicit root of a batch: its events are dropped instead of written, but
//! its error accumulator still works, which lets callers treat the root and
//! named entities uniformly.

use crate::errors::StreamError;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use dutest_metadata::{ErrorObject, Event, TimingLog};
use smol_str::SmolStr;
use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Destination for serialized events. Implementations do not need to be
/// thread-safe; [`Sink`] serializes access.
pub trait EventWrite: Send {
    /// Writes one event. Implementations should flush line-buffered
    /// transports so the runner sees events promptly.
    fn write_event(&mut self, event: &Event) -> io::Result<()>;
}

/// A shared, mutex-guarded event sink.
///
/// Cloning is cheap; all clones write to the same underlying writer.
#[derive(Clone)]
pub struct Sink {
    inner: Arc<Mutex<SinkInner>>,
}

struct SinkInner {
    writer: Box<dyn EventWrite>,
    last_event: Instant,
}

impl Sink {
    /// Creates a sink over the given writer.
    pub fn new(writer: impl EventWrite + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkInner {
                writer: Box::new(writer),
                last_event: Instant::now(),
            })),
        }
    }

    pub(crate) fn send(&self, event: &Event) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.last_event = Instant::now();
        inner.writer.write_event(event).map_err(StreamError::Sink)
    }

    /// Writes a run-level log message.
    pub fn run_log(&self, text: impl Into<String>) -> Result<(), StreamError> {
        self.send(&Event::RunLog { text: text.into() })
    }

    /// Writes a run-level error record with the exit status the bundle will
    /// report.
    pub fn run_error(&self, error: ErrorObject, status: i32) -> Result<(), StreamError> {
        self.send(&Event::RunError { error, status })
    }

    /// Writes a heartbeat record if nothing has been written for at least
    /// `interval`. Returns true if a heartbeat was written.
    pub fn heartbeat_if_idle(&self, interval: Duration) -> Result<bool, StreamError> {
        {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.last_event.elapsed() < interval {
                return Ok(false);
            }
        }
        self.send(&Event::Heartbeat { time: Local::now() })?;
        Ok(true)
    }
}

/// Writes events as newline-delimited JSON, flushing after every record.
pub struct JsonLinesWriter<W> {
    writer: W,
}

impl<W: io::Write + Send> JsonLinesWriter<W> {
    /// Creates a writer over any byte stream, typically standard output.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: io::Write + Send> EventWrite for JsonLinesWriter<W> {
    fn write_event(&mut self, event: &Event) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Accumulates events in memory; the test-suite sink.
#[derive(Clone, Default)]
pub struct MemoryWriter {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event written so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventWrite for MemoryWriter {
    fn write_event(&mut self, event: &Event) -> io::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Ordered event stream for one entity.
///
/// Clones share state; the stream may be written from any thread.
#[derive(Clone)]
pub struct EntityStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    name: SmolStr,
    out_dir: Utf8PathBuf,
    sink: Sink,
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    phase: StreamPhase,
    errors: Vec<ErrorObject>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum StreamPhase {
    #[default]
    Idle,
    Started,
    Ended,
}

impl EntityStream {
    /// Creates a stream for the named entity. The empty name designates the
    /// anonymous batch root.
    pub fn new(sink: Sink, name: impl Into<SmolStr>, out_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                name: name.into(),
                out_dir: out_dir.into(),
                sink,
                state: Mutex::new(StreamState::default()),
            }),
        }
    }

    /// The entity's name; empty for the anonymous root.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The entity's output directory.
    pub fn out_dir(&self) -> &Utf8Path {
        &self.inner.out_dir
    }

    fn is_anonymous(&self) -> bool {
        self.inner.name.is_empty()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Emits `EntityStart`.
    pub fn start(&self) -> Result<(), StreamError> {
        if self.is_anonymous() {
            return Ok(());
        }
        {
            let mut state = self.lock_state();
            match state.phase {
                StreamPhase::Idle => state.phase = StreamPhase::Started,
                StreamPhase::Started => {
                    return Err(StreamError::AlreadyStarted {
                        entity: self.inner.name.to_string(),
                    });
                }
                StreamPhase::Ended => {
                    return Err(StreamError::AlreadyEnded {
                        entity: self.inner.name.to_string(),
                    });
                }
            }
        }
        self.inner.sink.send(&Event::EntityStart {
            entity: self.inner.name.clone(),
            out_dir: self.inner.out_dir.clone(),
        })
    }

    /// Emits `EntityLog`.
    pub fn log(&self, text: impl Into<String>) -> Result<(), StreamError> {
        if self.is_anonymous() {
            return Ok(());
        }
        self.check_writable()?;
        self.inner.sink.send(&Event::EntityLog {
            entity: self.inner.name.clone(),
            text: text.into(),
        })
    }

    /// Records the error and emits `EntityError`.
    pub fn error(&self, error: ErrorObject) -> Result<(), StreamError> {
        if self.is_anonymous() {
            self.lock_state().errors.push(error);
            return Ok(());
        }
        self.check_writable()?;
        self.lock_state().errors.push(error.clone());
        self.inner.sink.send(&Event::EntityError {
            entity: self.inner.name.clone(),
            error,
        })
    }

    /// Emits `EntityEnd`. No further events may follow.
    pub fn end(
        &self,
        skip_reasons: Vec<String>,
        timing_log: Option<TimingLog>,
    ) -> Result<(), StreamError> {
        if self.is_anonymous() {
            return Ok(());
        }
        {
            let mut state = self.lock_state();
            match state.phase {
                StreamPhase::Started => state.phase = StreamPhase::Ended,
                StreamPhase::Idle => {
                    return Err(StreamError::NotStarted {
                        entity: self.inner.name.to_string(),
                    });
                }
                StreamPhase::Ended => {
                    return Err(StreamError::AlreadyEnded {
                        entity: self.inner.name.to_string(),
                    });
                }
            }
        }
        self.inner.sink.send(&Event::EntityEnd {
            entity: self.inner.name.clone(),
            skip_reasons,
            timing_log,
        })
    }

    /// All errors recorded on this stream so far.
    pub fn errors(&self) -> Vec<ErrorObject> {
        self.lock_state().errors.clone()
    }

    /// True if any error has been recorded.
    pub fn has_errors(&self) -> bool {
        !self.lock_state().errors.is_empty()
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        let state = self.lock_state();
        match state.phase {
            StreamPhase::Started => Ok(()),
            StreamPhase::Idle => Err(StreamError::NotStarted {
                entity: self.inner.name.to_string(),
            }),
            StreamPhase::Ended => Err(StreamError::AlreadyEnded {
                entity: self.inner.name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sink_pair() -> (Sink, MemoryWriter) {
        let writer = MemoryWriter::new();
        (Sink::new(writer.clone()), writer)
    }

    #[test]
    fn events_appear_in_call_order() {
        let (sink, writer) = sink_pair();
        let stream = EntityStream::new(sink, "pkg.Test", "/out/pkg.Test");
        stream.start().unwrap();
        stream.log("one").unwrap();
        stream.log("two").unwrap();
        stream.end(vec![], None).unwrap();

        let kinds: Vec<_> = writer
            .events()
            .iter()
            .map(|event| match event {
                Event::EntityStart { .. } => "start",
                Event::EntityLog { .. } => "log",
                Event::EntityEnd { .. } => "end",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["start", "log", "log", "end"]);
    }

    #[test]
    fn ended_stream_rejects_further_events() {
        let (sink, writer) = sink_pair();
        let stream = EntityStream::new(sink, "pkg.Test", "/out");
        stream.start().unwrap();
        stream.end(vec![], None).unwrap();

        assert!(matches!(
            stream.log("late"),
            Err(StreamError::AlreadyEnded { .. })
        ));
        assert!(matches!(
            stream.error(ErrorObject::from_reason("late")),
            Err(StreamError::AlreadyEnded { .. })
        ));
        assert!(matches!(
            stream.end(vec![], None),
            Err(StreamError::AlreadyEnded { .. })
        ));
        // Nothing was written after the end event.
        assert_eq!(writer.events().len(), 2);
    }

    #[test]
    fn anonymous_stream_drops_events_but_accumulates_errors() {
        let (sink, writer) = sink_pair();
        let stream = EntityStream::new(sink, "", "/out");
        stream.start().unwrap();
        stream.log("dropped").unwrap();
        stream.error(ErrorObject::from_reason("kept")).unwrap();
        stream.end(vec![], None).unwrap();

        assert!(writer.events().is_empty());
        assert_eq!(stream.errors().len(), 1);
        assert_eq!(stream.errors()[0].reason, "kept");
    }

    #[test]
    fn error_accumulator_matches_wire() {
        let (sink, writer) = sink_pair();
        let stream = EntityStream::new(sink, "pkg.Test", "/out");
        stream.start().unwrap();
        stream.error(ErrorObject::from_reason("first")).unwrap();
        stream.error(ErrorObject::from_reason("second")).unwrap();

        assert_eq!(stream.errors().len(), 2);
        let wire_errors: Vec<_> = writer
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::EntityError { error, .. } => Some(error.reason),
                _ => None,
            })
            .collect();
        assert_eq!(wire_errors, ["first", "second"]);
    }

    #[test]
    fn heartbeat_only_when_idle() {
        let (sink, writer) = sink_pair();
        sink.run_log("busy").unwrap();
        assert!(!sink.heartbeat_if_idle(Duration::from_secs(60)).unwrap());
        assert!(sink.heartbeat_if_idle(Duration::ZERO).unwrap());
        assert_eq!(writer.events().len(), 2);
    }
}

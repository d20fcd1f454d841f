//! Chrome Tracing profiler.
//!
//! Records profile marks into per-thread ring buffers and exports them as a
//! JSON array compatible with chrome://tracing or ui.perfetto.dev.

use crate::profiler::{MarkerType, ProfileMark, Profiler};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Events kept per thread before the oldest are overwritten.
pub const DEFAULT_EVENTS_PER_THREAD: usize = 16 * 1024;

/// A single recorded mark.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub marker: MarkerType,
    pub name: Option<&'static str>,
    pub identifier: usize,
    pub tid: usize,
    pub system_id: i32,
    pub timestamp_us: u64,
}

/// A [`Profiler`] that keeps the most recent marks of every thread.
pub struct TraceProfiler {
    start: Instant,
    recording: AtomicBool,
    events_per_thread: usize,
    buffers: Vec<Mutex<VecDeque<TraceEvent>>>,
}

impl TraceProfiler {
    /// Creates a profiler with one buffer per thread index in `0..num_threads`.
    pub fn new(num_threads: usize) -> Self {
        Self::with_capacity(num_threads, DEFAULT_EVENTS_PER_THREAD)
    }

    pub fn with_capacity(num_threads: usize, events_per_thread: usize) -> Self {
        let events_per_thread = events_per_thread.max(1);
        TraceProfiler {
            start: Instant::now(),
            recording: AtomicBool::new(true),
            events_per_thread,
            buffers: (0..num_threads.max(1))
                .map(|_| Mutex::new(VecDeque::with_capacity(events_per_thread.min(1024))))
                .collect(),
        }
    }

    /// Pauses or resumes recording. Marks arriving while paused are dropped.
    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Returns a copy of every recorded event, thread by thread.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.buffers
            .iter()
            .flat_map(|buffer| buffer.lock().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn clear(&self) {
        for buffer in &self.buffers {
            buffer.lock().clear();
        }
    }

    /// Writes all recorded events as Chrome Tracing JSON.
    pub fn write_json<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writeln!(writer, "[")?;
        let mut first = true;

        for event in self.events() {
            if !first {
                writeln!(writer, ",")?;
            }
            first = false;

            // B/E are Chrome's nested duration events.
            let phase = if event.marker.is_begin() || event.marker == MarkerType::BeginFunction {
                "B"
            } else {
                "E"
            };
            let name = event.name.unwrap_or(marker_label(event.marker));
            write!(
                writer,
                "{{\"name\":\"{}\",\"cat\":\"{}\",\"ph\":\"{}\",\"ts\":{},\"pid\":1,\"tid\":{},\"args\":{{\"system\":{}}}}}",
                escape_json(name),
                marker_label(event.marker),
                phase,
                event.timestamp_us,
                event.tid,
                event.system_id
            )?;
        }

        writeln!(writer, "\n]")?;
        writer.flush()
    }

    /// Exports all recorded events to a JSON file.
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let file = File::create(path)?;
        self.write_json(BufWriter::new(file))
    }
}

impl Profiler for TraceProfiler {
    fn add_profile_mark(&self, mark: ProfileMark) {
        if !self.is_recording() {
            return;
        }

        let timestamp_us = self.start.elapsed().as_micros() as u64;
        let slot = mark.thread_index.min(self.buffers.len() - 1);
        let mut buffer = self.buffers[slot].lock();
        if buffer.len() == self.events_per_thread {
            buffer.pop_front();
        }
        buffer.push_back(TraceEvent {
            marker: mark.marker,
            name: mark.name,
            identifier: mark.identifier,
            tid: mark.thread_index,
            system_id: mark.system_id,
            timestamp_us,
        });
    }
}

fn marker_label(marker: MarkerType) -> &'static str {
    match marker {
        MarkerType::Begin => "begin",
        MarkerType::End => "end",
        MarkerType::PauseWaitForJob => "wait_for_job",
        MarkerType::PauseWaitForQueueSpace => "wait_for_queue_space",
        MarkerType::ResumeFromPause => "resume",
        MarkerType::BeginIdle | MarkerType::EndIdle => "idle",
        MarkerType::BeginFunction | MarkerType::EndFunction => "function",
    }
}

fn escape_json(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            c if c.is_control() => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

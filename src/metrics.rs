//! Session counters and error history
//!
//! Counters are plain atomics so the capture and playback callbacks can bump
//! them without locking. Response latency and the error log sit behind a
//! mutex and are only touched from the session side.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Record of an error that occurred during a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "decode", "protocol", "service", "transport")
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Frames produced by the capture callback while armed
    pub frames_captured: u64,
    /// Frames written to the transport
    pub frames_sent: u64,
    /// Frames dropped because the hand-off queue was full or gone
    pub frames_dropped: u64,
    /// Inbound frames handed to the speaker
    pub frames_played: u64,
    pub decode_errors: u64,
    pub protocol_errors: u64,
    pub playback_errors: u64,
    pub service_errors: u64,
    /// `response.create` messages sent
    pub responses_triggered: u64,
    /// speech_stopped events that did not trigger a response
    pub duplicate_stops: u64,
    /// Average time from requesting a response to its first audio (ms)
    pub avg_response_latency_ms: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

#[derive(Default)]
struct LatencyTracker {
    requested_at: Option<Instant>,
    total_ms: u64,
    samples: u64,
}

/// Shared counters for one voice session
pub struct SessionMetrics {
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_played: AtomicU64,
    decode_errors: AtomicU64,
    protocol_errors: AtomicU64,
    playback_errors: AtomicU64,
    service_errors: AtomicU64,
    responses_triggered: AtomicU64,
    duplicate_stops: AtomicU64,
    latency: Mutex<LatencyTracker>,
    /// Newest first
    errors: Mutex<VecDeque<ErrorRecord>>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            playback_errors: AtomicU64::new(0),
            service_errors: AtomicU64::new(0),
            responses_triggered: AtomicU64::new(0),
            duplicate_stops: AtomicU64::new(0),
            latency: Mutex::new(LatencyTracker::default()),
            errors: Mutex::new(VecDeque::with_capacity(MAX_ERROR_HISTORY)),
        }
    }

    pub fn frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_played(&self) {
        self.frames_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn playback_error(&self) {
        self.playback_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self, message: impl Into<String>) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error("decode", message);
    }

    pub fn protocol_error(&self, message: impl Into<String>) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error("protocol", message);
    }

    pub fn service_error(&self, message: impl Into<String>) {
        self.service_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error("service", message);
    }

    pub fn duplicate_stop(&self) {
        self.duplicate_stops.fetch_add(1, Ordering::Relaxed);
    }

    /// A `response.create` went out; starts the latency clock
    pub fn response_triggered(&self) {
        self.responses_triggered.fetch_add(1, Ordering::Relaxed);
        self.lock_latency().requested_at = Some(Instant::now());
    }

    /// First audio of a response arrived; stops the latency clock
    pub fn response_audio_started(&self) {
        let mut latency = self.lock_latency();
        if let Some(started) = latency.requested_at.take() {
            let elapsed = started.elapsed().as_millis() as u64;
            latency.total_ms += elapsed;
            latency.samples += 1;
            log::debug!("Metrics: response audio after {}ms", elapsed);
        }
    }

    /// Record an error (not necessarily counted)
    pub fn record_error(&self, error_type: &str, message: impl Into<String>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let error = ErrorRecord {
            timestamp: now,
            error_type: error_type.to_string(),
            message: message.into(),
        };

        log::debug!("Metrics: recording error - {:?}", error);

        let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        errors.push_front(error);
        while errors.len() > MAX_ERROR_HISTORY {
            errors.pop_back();
        }
    }

    /// Get the error history (newest first)
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let avg_response_latency_ms = {
            let latency = self.lock_latency();
            if latency.samples > 0 {
                latency.total_ms / latency.samples
            } else {
                0
            }
        };

        MetricsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            playback_errors: self.playback_errors.load(Ordering::Relaxed),
            service_errors: self.service_errors.load(Ordering::Relaxed),
            responses_triggered: self.responses_triggered.load(Ordering::Relaxed),
            duplicate_stops: self.duplicate_stops.load(Ordering::Relaxed),
            avg_response_latency_ms,
            last_error: self
                .errors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .front()
                .cloned(),
        }
    }

    fn lock_latency(&self) -> std::sync::MutexGuard<'_, LatencyTracker> {
        self.latency.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_empty() {
        let metrics = SessionMetrics::new();
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot, MetricsSnapshot::default());
        assert!(metrics.errors().is_empty());
    }

    #[test]
    fn test_counters() {
        let metrics = SessionMetrics::new();
        metrics.frame_captured();
        metrics.frame_captured();
        metrics.frame_sent();
        metrics.frame_dropped();
        metrics.duplicate_stop();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_captured, 2);
        assert_eq!(snapshot.frames_sent, 1);
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.duplicate_stops, 1);
    }

    #[test]
    fn test_errors_counted_and_recorded() {
        let metrics = SessionMetrics::new();
        metrics.decode_error("bad base64");
        metrics.protocol_error("unexpected shape");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.protocol_errors, 1);
        let last = snapshot.last_error.unwrap();
        assert_eq!(last.error_type, "protocol");
        assert_eq!(last.message, "unexpected shape");
    }

    #[test]
    fn test_response_latency() {
        let metrics = SessionMetrics::new();
        metrics.response_triggered();
        std::thread::sleep(std::time::Duration::from_millis(10));
        metrics.response_audio_started();
        // Second audio chunk of the same response does not count again
        metrics.response_audio_started();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.responses_triggered, 1);
        assert!(snapshot.avg_response_latency_ms >= 10);
    }

    #[test]
    fn test_error_history_limit() {
        let metrics = SessionMetrics::new();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            metrics.record_error("service", format!("error {}", i));
        }

        let errors = metrics.errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        // Newest first
        assert_eq!(errors[0].message, format!("error {}", MAX_ERROR_HISTORY + 4));
    }
}

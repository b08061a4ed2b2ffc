//! Assistant transcript aggregation
//!
//! Collects `response.audio_transcript.delta` fragments per response so the
//! UI can show the assistant's words as they are spoken.
//!
//! # Aggregation Strategy
//!
//! - **Deltas**: Appended to the response's running text as they arrive
//! - **Done**: The service's transcript replaces the running text (it is
//!   authoritative); if it is empty the accumulated deltas are kept
//!
//! Responses are tracked independently, so a late delta of a previous
//! response never bleeds into the next one.

use std::collections::HashMap;

#[derive(Debug, Default)]
struct ResponseTranscript {
    partial_text: String,
    delta_count: u64,
}

/// Per-response transcript builder
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    responses: HashMap<String, ResponseTranscript>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta to a response's running text
    ///
    /// # Returns
    /// The running text so far
    pub fn process_delta(&mut self, response_id: &str, delta: &str) -> &str {
        let entry = self.responses.entry(response_id.to_string()).or_default();
        if !delta.is_empty() {
            entry.partial_text.push_str(delta);
            entry.delta_count += 1;

            if entry.delta_count % 10 == 0 {
                log::debug!(
                    "TranscriptAggregator: {} deltas, {} chars accumulated for {}",
                    entry.delta_count,
                    entry.partial_text.len(),
                    response_id
                );
            }
        }
        &entry.partial_text
    }

    /// Finish a response and forget it
    ///
    /// # Returns
    /// The final text: `transcript` unless it is blank, else the deltas
    pub fn process_completed(&mut self, response_id: &str, transcript: &str) -> String {
        let entry = self.responses.remove(response_id).unwrap_or_default();
        log::debug!(
            "TranscriptAggregator: {} completed with {} chars (had {} deltas, {} partial chars)",
            response_id,
            transcript.len(),
            entry.delta_count,
            entry.partial_text.len()
        );

        if transcript.trim().is_empty() {
            entry.partial_text
        } else {
            transcript.to_string()
        }
    }

    /// Running text of an in-progress response
    pub fn partial_text(&self, response_id: &str) -> Option<&str> {
        self.responses
            .get(response_id)
            .map(|r| r.partial_text.as_str())
    }

    /// Drop a response without producing text
    pub fn discard(&mut self, response_id: &str) {
        self.responses.remove(response_id);
    }

    pub fn in_progress(&self) -> usize {
        self.responses.len()
    }

    pub fn reset(&mut self) {
        self.responses.clear();
    }
}

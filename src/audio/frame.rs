//! Audio frames and utterances
//!
//! An [`AudioFrame`] is immutable once built and is moved, never cloned:
//! capture → session → wire for outbound audio, wire → session → playback for
//! inbound audio.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sample rate of every frame on the wire and at the devices
pub const SAMPLE_RATE: u32 = 24_000;

/// Mono audio
pub const CHANNELS: u16 = 1;

/// Capture-side frame size in samples
pub const CAPTURE_FRAME_SIZE: usize = 4096;

/// Maximum number of finalized utterances kept for transcript correlation
const MAX_UTTERANCE_HISTORY: usize = 64;

static NEXT_UTTERANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Logical id of one speech turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtteranceId(u64);

impl UtteranceId {
    /// Allocate a fresh process-unique id
    pub fn next() -> Self {
        Self(NEXT_UTTERANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "utt-{}", self.0)
    }
}

/// Which side of the conversation produced the audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Microphone → service
    Outbound,
    /// Service → speaker
    Inbound,
}

/// A buffer of PCM16 mono samples at 24 kHz with ordering metadata
#[derive(Debug, PartialEq)]
pub struct AudioFrame {
    utterance: UtteranceId,
    sequence: u64,
    pcm: Vec<u8>,
}

impl AudioFrame {
    /// Wrap PCM16 little-endian bytes
    pub fn new(utterance: UtteranceId, sequence: u64, pcm: Vec<u8>) -> Self {
        Self {
            utterance,
            sequence,
            pcm,
        }
    }

    pub fn utterance(&self) -> UtteranceId {
        self.utterance
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    /// Number of samples in the frame
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self) -> u64 {
        (self.sample_count() as u64 * 1000) / SAMPLE_RATE as u64
    }

    /// Give up the frame, keeping only its payload
    pub fn into_pcm(self) -> Vec<u8> {
        self.pcm
    }
}

/// Bookkeeping for one side's speech turn.
///
/// Frames are not retained here; they have already moved on to the wire or
/// the speaker. What stays is what the transcript needs for correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub direction: Direction,
    /// Service-side id (`response.id` for inbound, `item_id` for outbound)
    pub remote_id: Option<String>,
    pub frame_count: u64,
    pub complete: bool,
    pub transcript: Option<String>,
}

impl Utterance {
    pub fn new(id: UtteranceId, direction: Direction, remote_id: Option<String>) -> Self {
        Self {
            id,
            direction,
            remote_id,
            frame_count: 0,
            complete: false,
            transcript: None,
        }
    }
}

/// Open and recently finalized utterances, oldest first
#[derive(Debug, Default)]
pub struct UtteranceLog {
    entries: VecDeque<Utterance>,
}

impl UtteranceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new utterance
    pub fn open(&mut self, utterance: Utterance) {
        self.entries.push_back(utterance);
        self.evict();
    }

    pub fn get(&self, id: UtteranceId) -> Option<&Utterance> {
        self.entries.iter().find(|u| u.id == id)
    }

    pub fn get_mut(&mut self, id: UtteranceId) -> Option<&mut Utterance> {
        self.entries.iter_mut().find(|u| u.id == id)
    }

    /// Find an utterance by its service-side id
    pub fn by_remote_id(&self, direction: Direction, remote_id: &str) -> Option<&Utterance> {
        self.entries
            .iter()
            .rev()
            .find(|u| u.direction == direction && u.remote_id.as_deref() == Some(remote_id))
    }

    /// Most recent utterance in a direction that has not been finalized
    pub fn latest_open(&self, direction: Direction) -> Option<&Utterance> {
        self.entries
            .iter()
            .rev()
            .find(|u| u.direction == direction && !u.complete)
    }

    /// Set the completion flag. Returns false if the id is unknown.
    pub fn finalize(&mut self, id: UtteranceId) -> bool {
        match self.get_mut(id) {
            Some(utterance) => {
                utterance.complete = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // Only finalized entries are evicted; an open utterance is never dropped.
    fn evict(&mut self) {
        while self.entries.len() > MAX_UTTERANCE_HISTORY {
            match self.entries.iter().position(|u| u.complete) {
                Some(index) => {
                    self.entries.remove(index);
                }
                None => break,
            }
        }
    }
}

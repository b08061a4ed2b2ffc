//! Audio capture and playback
//!
//! Microphone frames flow through [`AudioCaptureEngine`] and assistant audio
//! through [`AudioPlaybackEngine`]. Both talk to hardware through a backend
//! trait; [`CpalInput`] and [`CpalOutput`] are the real devices.
//!
//! # Architecture
//!
//! ```text
//! mic ──▶ CpalInput ──▶ FrameAssembler ──▶ FrameCodec::encode ──▶ hand-off queue
//!
//! playback queue ──▶ PlaybackSource::fill ──▶ FrameCodec::decode ──▶ CpalOutput ──▶ speaker
//! ```

pub mod capture;
pub mod codec;
pub mod device;
pub mod frame;
pub mod playback;

pub use capture::{
    AudioCaptureEngine, CaptureConfig, CaptureHandle, CaptureNotice, CaptureState, FrameAssembler,
    InputBackend,
};
pub use codec::{frame_level, FrameCodec};
pub use device::{list_input_devices, list_output_devices, CpalInput, CpalOutput};
pub use frame::{
    AudioFrame, Direction, Utterance, UtteranceId, UtteranceLog, CAPTURE_FRAME_SIZE, CHANNELS,
    SAMPLE_RATE,
};
pub use playback::{AudioPlaybackEngine, OutputBackend, PlaybackConfig, PlaybackQueue, PlaybackSource};

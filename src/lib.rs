//! Real-time duplex voice client.
//!
//! Streams microphone audio to a speech-to-speech realtime service over one
//! WebSocket and plays the assistant's audio back in order.
//!
//! ```no_run
//! # async fn demo() -> Result<(), vokey_voice::VoiceError> {
//! use vokey_voice::{settings, VoiceSession};
//!
//! let session = VoiceSession::builder(settings::load_settings())
//!     .api_key(vokey_voice::api_key::get_api_key())
//!     .build();
//! let mut events = session.subscribe();
//!
//! session.connect().await?;
//! session.start_conversation()?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api_key;
pub mod audio;
mod console;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;
pub mod testing;
pub mod transcript;

pub use error::VoiceError;
pub use guard::ConnectionGuard;
pub use metrics::MetricsSnapshot;
pub use session::{SessionEvent, VoiceSession, VoiceSessionBuilder};
pub use settings::VoiceSettings;
pub use state_machine::{ConnectionState, ConversationState};
pub use transcript::{Role, TranscriptMessage};

/// Entry point of the `vokey-voice` binary
pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    log::info!("vokey-voice {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vokey-voice")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return;
        }
    };

    runtime.block_on(console::run_console());
    log::info!("vokey-voice exiting");
}

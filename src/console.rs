//! Interactive terminal front end for the `vokey-voice` binary.
//!
//! Reads slash commands from stdin; any other line is sent as a text message.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use crate::api_key;
use crate::audio::{list_input_devices, list_output_devices};
use crate::guard::ConnectionGuard;
use crate::session::{SessionEvent, VoiceSession};
use crate::settings;
use crate::transcript::Role;

const HELP: &str = "\
Commands:
  /connect      open the connection
  /start        start talking (opens the microphone)
  /stop         stop talking (connection stays open)
  /disconnect   close the connection
  /hide /show   simulate the window being hidden or shown
  /stats        session counters
  /devices      list audio devices
  /key <value>  store the API key in the keyring (/key clear removes it)
  /save         write current settings to the config file
  /quit         exit
Anything else is sent as a text message.";

pub(crate) async fn run_console() {
    let settings = settings::load_settings();
    let api_key = api_key::get_api_key();
    match api_key.as_deref() {
        Some(key) => log::info!("Using API key {}", api_key::mask_key(key)),
        None => log::info!("No API key configured; assuming an authenticated proxy"),
    }
    log::info!("Endpoint: {}", settings.effective_endpoint());

    let guard = ConnectionGuard::global();
    let session = VoiceSession::builder(settings.clone())
        .api_key(api_key)
        .guard(guard.clone())
        .build();

    let printer = tokio::spawn(print_events(session.subscribe()));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        };

        if !handle_line(&session, &guard, &settings, line.trim()).await {
            break;
        }
    }

    session.disconnect();
    printer.abort();
}

/// Returns false to quit
async fn handle_line(
    session: &VoiceSession,
    guard: &Arc<ConnectionGuard>,
    settings: &settings::VoiceSettings,
    line: &str,
) -> bool {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    let result = match command {
        "" => Ok(()),
        "/connect" => session.connect().await,
        "/start" => session.start_conversation(),
        "/stop" => session.stop_conversation(),
        "/disconnect" => {
            session.disconnect();
            Ok(())
        }
        "/hide" => {
            guard.set_visible(false);
            Ok(())
        }
        "/show" => {
            guard.set_visible(true);
            Ok(())
        }
        "/stats" => {
            match serde_json::to_string_pretty(&session.metrics()) {
                Ok(json) => println!("{}", json),
                Err(e) => log::warn!("Failed to format metrics: {}", e),
            }
            Ok(())
        }
        "/devices" => {
            print_devices();
            Ok(())
        }
        "/key" => {
            let key = match argument {
                "" | "clear" => None,
                key => Some(key),
            };
            api_key::set_api_key(key).map(|()| {
                println!(
                    "API key {} (takes effect on restart)",
                    if key.is_some() { "stored" } else { "removed" }
                );
            })
        }
        "/save" => settings::save_settings(settings).map(|()| {
            if let Ok(path) = settings::settings_path() {
                println!("Settings written to {}", path.display());
            }
        }),
        "/help" => {
            println!("{}", HELP);
            Ok(())
        }
        "/quit" | "/exit" => return false,
        other if other.starts_with('/') => {
            println!("Unknown command {}; try /help", other);
            Ok(())
        }
        _ => session.send_text(line),
    };

    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

fn print_devices() {
    println!("Input devices: {}", list_input_devices().join(", "));
    println!("Output devices: {}", list_output_devices().join(", "));
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Event printer lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            SessionEvent::MessageAdded(message) => {
                let who = match message.role {
                    Role::User => "you",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                println!("[{}] {}: {}", message.timestamp.format("%H:%M:%S"), who, message.text);
            }
            SessionEvent::UserSpeakingChanged(true) => println!("(you are speaking)"),
            SessionEvent::UserSpeakingChanged(false) => {}
            SessionEvent::AssistantSpeakingChanged(speaking) => {
                log::debug!("Assistant speaking: {}", speaking);
            }
            SessionEvent::ConnectionChanged(state) => println!("-- connection: {:?}", state),
            SessionEvent::ConversationChanged(state) => println!("-- conversation: {}", state),
            SessionEvent::AssistantTranscriptDelta { text, .. } => log::trace!("partial: {}", text),
            SessionEvent::FunctionCall {
                name, arguments, ..
            } => println!("-- function call {}({})", name, arguments),
            SessionEvent::Error(e) => println!("! {}", e),
        }
    }
}

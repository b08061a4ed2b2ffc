//! API key resolution for the realtime service.
//!
//! Looked up in order:
//! - `OPENAI_API_KEY` environment variable
//! - the OS keyring (libsecret, Keychain, Credential Manager)
//!
//! No key is a valid configuration: the endpoint is then assumed to be an
//! authenticated proxy that owns identity.
//!
//! Never log the key value.

use keyring::Entry;

use crate::error::VoiceError;

const SERVICE_NAME: &str = "vokey-voice";
const API_KEY_NAME: &str = "openai-api-key";

/// Environment variable checked before the keyring
pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

/// Retrieve the API key, if any.
/// Returns None if not configured or on keyring error (errors are logged).
pub fn get_api_key() -> Option<String> {
    if let Ok(key) = std::env::var(API_KEY_ENV_VAR) {
        if !key.is_empty() {
            return Some(key);
        }
    }

    let entry = match Entry::new(SERVICE_NAME, API_KEY_NAME) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("ApiKey: failed to create keyring entry: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(key) if key.is_empty() => None,
        Ok(key) => Some(key),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("ApiKey: failed to retrieve key: {}", e);
            None
        }
    }
}

/// Store the API key in the system keyring.
/// Pass None to delete the key.
pub fn set_api_key(key: Option<&str>) -> Result<(), VoiceError> {
    let entry = Entry::new(SERVICE_NAME, API_KEY_NAME)
        .map_err(|e| VoiceError::Config(format!("Failed to create keyring entry: {}", e)))?;

    match key {
        Some(k) if !k.is_empty() => {
            entry
                .set_password(k)
                .map_err(|e| VoiceError::Config(format!("Failed to store API key: {}", e)))?;
            log::info!("ApiKey: stored new API key");
        }
        _ => match entry.delete_credential() {
            Ok(()) => log::info!("ApiKey: deleted API key"),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => {
                return Err(VoiceError::Config(format!(
                    "Failed to delete API key: {}",
                    e
                )))
            }
        },
    }

    Ok(())
}

/// Returns whether an API key is currently available.
pub fn is_api_key_configured() -> bool {
    get_api_key().is_some()
}

/// Masked form for display (e.g., "sk-...abc123")
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

pub fn get_masked_api_key() -> Option<String> {
    get_api_key().map(|key| mask_key(&key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key("sk-proj-1234567890abcdef"), "sk-...abcdef");
    }
}

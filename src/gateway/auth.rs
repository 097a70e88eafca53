//! Bearer token issuance (§4.J). Grounded on the teacher's
//! `gateway::auth::load_or_create_token` — a UUID-v4 token persisted to
//! `~/.mesoclaw/daemon.token` with `0600` permissions on Unix — adapted
//! to this gateway's own dotfile and comparison rule.
//!
//! The teacher compares tokens with plain `==`, which leaks timing
//! information proportional to the length of the matching prefix. This
//! gateway mediates destructive physical-world actions, so the
//! comparison here is constant-time instead; see DESIGN.md.

use std::fs;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use uuid::Uuid;

use crate::error::GatewayError;

pub fn token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".sentrygate")
        .join("daemon.token")
}

/// Load the existing bearer token from disk, or generate and persist a
/// new one.
pub fn load_or_create_token() -> Result<String, GatewayError> {
    let path = token_path();

    if path.exists() {
        return fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(GatewayError::Io);
    }

    let token = Uuid::new_v4().to_string().replace('-', "");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, &token)?;
    restrict_permissions(&path)?;

    tracing::info!(path = %path.display(), "issued new daemon bearer token");
    Ok(token)
}

#[cfg(unix)]
fn restrict_permissions(path: &PathBuf) -> Result<(), GatewayError> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &PathBuf) -> Result<(), GatewayError> {
    Ok(())
}

/// Constant-time comparison of two tokens, to avoid leaking the length of
/// the matching prefix through response timing. Short-circuits only on
/// length mismatch, which is not secret (the token length is fixed and
/// public).
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (a, b) in provided.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_tokens_match() {
        assert!(tokens_match("abc123", "abc123"));
    }

    #[test]
    fn different_tokens_of_equal_length_do_not_match() {
        assert!(!tokens_match("abc123", "abc124"));
    }

    #[test]
    fn different_lengths_do_not_match() {
        assert!(!tokens_match("abc", "abc123"));
    }

    #[test]
    fn empty_strings_match() {
        assert!(tokens_match("", ""));
    }
}

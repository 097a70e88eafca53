//! TOML configuration loading and validation (§4.L). Grounded on the
//! teacher's `config::loader` — parse-or-default, then a fixed set of
//! environment overrides — generalized in one direction (the teacher's
//! handful of discrete `MESOCLAW_*` variables becomes a single recursive
//! `${VAR}` substitution pass, since secrets like the Home Assistant
//! token and the Telegram bot token have no fixed set of names to
//! enumerate) and narrowed in another (no atomic `save_config`; this
//! gateway's configuration is operator-authored, not written back by
//! the process itself).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::GatewayError;

use crate::policy::Permissions;

use super::schema::RuntimeConfig;

pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".sentrygate")
        .join("config.toml")
}

/// Load and validate the runtime config at `path`. A missing file is a
/// hard error here (unlike the teacher, which falls back to defaults) —
/// a gateway with no messenger `allowed_chat_ids` configured would
/// silently ask no one for approval, so there is no safe default to
/// fall back to.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, GatewayError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("failed to read config at {path:?}: {e}")))?;
    let substituted = substitute_env_vars(&raw)?;
    let config: RuntimeConfig = toml::from_str(&substituted)
        .map_err(|e| GatewayError::Config(format!("failed to parse config at {path:?}: {e}")))?;
    validate(&config)?;
    Ok(config)
}

/// Replace every `${VAR}` occurrence with the value of the environment
/// variable `VAR`. Unlike a shell, an unset variable is a hard error —
/// a silently-empty secret is worse than a startup failure.
fn substitute_env_vars(text: &str) -> Result<String, GatewayError> {
    let mut output = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();

    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            output.push(ch);
            continue;
        }
        match chars.peek() {
            Some(&(_, '{')) => {
                chars.next(); // consume '{'
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(GatewayError::Config(format!("unterminated ${{...}} in config: ${{{name}")));
                }
                let value = std::env::var(&name)
                    .map_err(|_| GatewayError::Config(format!("config references unset environment variable: {name}")))?;
                output.push_str(&value);
            }
            _ => output.push('$'),
        }
    }
    Ok(output)
}

fn validate(config: &RuntimeConfig) -> Result<(), GatewayError> {
    if config.approval_timeout_secs == 0 {
        return Err(GatewayError::Config("approval_timeout_secs must be greater than zero".to_string()));
    }
    if config.messenger.kind == "telegram" {
        if config.messenger.telegram_token.is_empty() {
            return Err(GatewayError::Config("messenger.kind = \"telegram\" requires messenger.telegram_token".to_string()));
        }
        if config.messenger.allowed_chat_ids.is_empty() {
            return Err(GatewayError::Config(
                "messenger.allowed_chat_ids must be non-empty for the telegram messenger — an empty list can never approve anything".to_string(),
            ));
        }
    } else if config.messenger.kind != "console" {
        return Err(GatewayError::Config(format!("unknown messenger.kind: {}", config.messenger.kind)));
    }
    Ok(())
}

/// Load the separate permission-policy document (`rules`/`defaults`).
/// Kept distinct from `RuntimeConfig` so the two can be deployed — and
/// reloaded — on independent schedules: a policy tweak is an everyday
/// edit, a transport or credential change is not.
pub fn load_policy(path: &Path) -> Result<Permissions, GatewayError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("failed to read policy at {path:?}: {e}")))?;
    let substituted = substitute_env_vars(&raw)?;
    toml::from_str(&substituted).map_err(|e| GatewayError::Config(format!("failed to parse policy at {path:?}: {e}")))
}

/// Enforced separately from [`validate`] because it depends on the
/// `--insecure` CLI flag, which the schema itself knows nothing about.
pub fn require_tls_unless_insecure(config: &RuntimeConfig, insecure: bool) -> Result<(), GatewayError> {
    if insecure {
        return Ok(());
    }
    match &config.tls {
        Some(tls) if !tls.cert_path.is_empty() && !tls.key_path.is_empty() => Ok(()),
        _ => Err(GatewayError::Config(
            "no TLS certificate configured; pass --insecure to run without TLS (development only)".to_string(),
        )),
    }
}

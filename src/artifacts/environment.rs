//! Environment override file
//!
//! Deployments can drop a `key = value` file next to the gateway to
//! adjust the process environment without touching service definitions.
//! Loaded once at startup, before anything reads the environment. A small
//! deny-list of variables that would change the identity of the process
//! (lock heartbeats embed the hostname) is never overridden.

use anyhow::Context;
use std::path::Path;

/// Variables an override file must not touch.
const PROTECTED: [&str; 4] = ["PATH", "HOME", "LANG", "HOSTNAME"];

/// Apply overrides from `path` to the process environment. A missing
/// file is not an error; a malformed line is.
pub fn apply_overrides(path: &Path) -> anyhow::Result<usize> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("unable to read environment file {}", path.display())
            });
        }
    };

    let mut applied = 0;
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').with_context(|| {
            format!(
                "{}:{} is not a 'key = value' line",
                path.display(),
                lineno + 1
            )
        })?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            anyhow::bail!("{}:{} has an empty key", path.display(), lineno + 1);
        }
        if PROTECTED.contains(&key) {
            tracing::warn!(key, "environment file may not override protected variable");
            continue;
        }

        // single-threaded startup; nothing else is reading the environment yet
        unsafe { std::env::set_var(key, value) };
        applied += 1;
    }

    tracing::debug!(file = %path.display(), applied, "environment overrides applied");
    Ok(applied)
}

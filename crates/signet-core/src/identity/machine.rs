//! Machine identity resolution
//!
//! Produces a stable, non-secret string identifying this host+user. Used
//! only as key-derivation input; losing it means the vault no longer
//! decrypts on a different machine, which is the intended binding.

use std::path::Path;

/// Resolve the machine identifier.
///
/// Order: `/etc/machine-id`, `/var/lib/dbus/machine-id`, the platform UUID
/// on macOS, then a `hostname:username` fallback.
pub fn resolve_machine_id() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Some(id) = read_id_file(path) {
            return id;
        }
    }

    #[cfg(target_os = "macos")]
    if let Some(id) = macos_platform_uuid() {
        return id;
    }

    fallback_host_user()
}

fn read_id_file(path: impl AsRef<Path>) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(target_os = "macos")]
fn macos_platform_uuid() -> Option<String> {
    let output = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if line.contains("IOPlatformUUID") {
            let uuid = line.split('"').nth(3)?;
            if !uuid.is_empty() {
                return Some(uuid.to_string());
            }
        }
    }
    None
}

fn fallback_host_user() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{host}:{}", whoami::username())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_is_stable_and_nonempty() {
        let first = resolve_machine_id();
        let second = resolve_machine_id();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_yields_none() {
        assert!(read_id_file("/nonexistent/machine-id").is_none());
    }

    #[test]
    fn fallback_contains_separator() {
        assert!(fallback_host_user().contains(':'));
    }
}

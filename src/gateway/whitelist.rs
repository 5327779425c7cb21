//! Read-only command allow-list.

use super::GatewayError;

/// Query commands the device may be sent. Matching is by prefix at a word
/// boundary, so `display interface GigabitEthernet0/0/1` is covered by
/// `display interface`.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "display bgp peer",
    "display bgp routing-table peer",
    "display interface brief",
    "display interface",
    "display interface statistics",
    "display ip interface brief",
    "display cpu-usage",
    "display memory-usage",
    "display version",
    "display current-configuration interface",
];

/// Check a command against the allow-list and return it whitespace-normalised.
pub fn authorize(command: &str) -> Result<String, GatewayError> {
    // A line break would smuggle a second command into the interactive shell.
    if command.chars().any(|c| c.is_control()) {
        return Err(GatewayError::Unauthorized(command.escape_debug().to_string()));
    }

    let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = normalized.to_ascii_lowercase();

    let allowed = ALLOWED_COMMANDS.iter().any(|prefix| {
        lower == *prefix || (lower.starts_with(prefix) && lower.as_bytes().get(prefix.len()) == Some(&b' '))
    });

    if allowed {
        Ok(normalized)
    } else {
        Err(GatewayError::Unauthorized(normalized))
    }
}

//! Command safety policy — a fixed deny list checked before any spawn, and a
//! warn list that logs but proceeds.

use once_cell::sync::Lazy;
use regex::Regex;

/// Verdict for a command string, checked before spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Allow,
    /// Proceed, but log a warning with this reason.
    Warn(String),
    /// Refuse with a security error. The child is never spawned.
    Deny(String),
}

/// `rm` with both recursive and force flags aimed at the filesystem root.
static RM_RF_ROOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)rm\s+(?:-[a-zA-Z]*\s+)*-[a-zA-Z]*(?:rf|fr)[a-zA-Z]*\s+/+(?:\s|$)")
        .expect("static pattern")
});

/// `rm -rf` (or `-fr`) pointed anywhere else.
static RM_RF_ANY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)rm\s+(?:-[a-zA-Z]*\s+)*-[a-zA-Z]*(?:rf|fr)[a-zA-Z]*\s+\S")
        .expect("static pattern")
});

/// Any `mkfs` invocation (`mkfs`, `mkfs.ext4`, …).
static MKFS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)mkfs(?:\.[a-z0-9]+)?(?:\s|$)").expect("static pattern"));

/// The classic fork bomb.
const FORK_BOMB: &str = ":(){ :|:& };:";

/// Check a command string against the deny and warn lists.
pub fn check_command(command: &str) -> CommandVerdict {
    if RM_RF_ROOT.is_match(command) {
        return CommandVerdict::Deny("recursive delete of filesystem root".to_string());
    }
    if command.contains(FORK_BOMB) {
        return CommandVerdict::Deny("fork bomb".to_string());
    }
    if MKFS.is_match(command) {
        return CommandVerdict::Deny("filesystem format".to_string());
    }

    if RM_RF_ANY.is_match(command) {
        return CommandVerdict::Warn("recursive force delete".to_string());
    }

    CommandVerdict::Allow
}

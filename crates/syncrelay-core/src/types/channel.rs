//! Bus channel naming and glob matching.

/// Channel every instance listens on for global events.
pub const BROADCAST_CHANNEL: &str = "sync:broadcast";

/// Prefix of user-targeted channels.
pub const USER_CHANNEL_PREFIX: &str = "sync:user:";

/// Pattern matching every user-targeted channel.
pub const USER_CHANNEL_PATTERN: &str = "sync:user:*";

/// Channel for events addressed to `user_id`.
pub fn user_channel(user_id: &str) -> String {
    format!("{USER_CHANNEL_PREFIX}{user_id}")
}

/// Extract the user ID from a user-targeted channel name.
pub fn user_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(USER_CHANNEL_PREFIX)
        .filter(|user| !user.is_empty())
}

/// Match `channel` against a glob `pattern`.
///
/// Supports `*` (any run of characters) and `?` (exactly one), the subset of
/// Redis `PSUBSCRIBE` syntax used for channel routing.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let channel: Vec<char> = channel.chars().collect();

    let (mut p, mut c) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while c < channel.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == channel[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = c;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            c = resume;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

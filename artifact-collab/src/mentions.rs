//! `@mention` extraction.
//!
//! Mentions are always derived from comment content on the server. A token
//! starts at an `@` that is not preceded by a word character; it resolves
//! to the longest known username (case-insensitive) that matches at that
//! position and is followed by a non-word character or end of input.

use crate::collaborators::DirectoryEntry;

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '.'
}

/// User ids mentioned in `content`, deduplicated in order of first appearance.
pub fn extract_mentions(content: &str, known: &[DirectoryEntry]) -> Vec<String> {
    let mut candidates: Vec<&DirectoryEntry> =
        known.iter().filter(|u| !u.username.is_empty()).collect();
    // Longest first so the first hit at a position is the longest match.
    candidates.sort_by(|a, b| b.username.len().cmp(&a.username.len()));

    let mut found: Vec<String> = Vec::new();
    let mut prev: Option<char> = None;
    for (idx, c) in content.char_indices() {
        if c == '@' && !prev.is_some_and(is_word) {
            let rest = &content[idx + 1..];
            if let Some(user) = candidates.iter().find(|u| matches_at(rest, &u.username)) {
                if !found.contains(&user.user_id) {
                    found.push(user.user_id.clone());
                }
            }
        }
        prev = Some(c);
    }
    found
}

fn matches_at(rest: &str, username: &str) -> bool {
    let Some(head) = rest.get(..username.len()) else {
        return false;
    };
    if !head.eq_ignore_ascii_case(username) {
        return false;
    }
    // A trailing '.' is punctuation, not part of the next word.
    let mut tail = rest[username.len()..].chars();
    match tail.next() {
        None => true,
        Some('.') => !tail.next().is_some_and(is_word),
        Some(c) => !is_word(c),
    }
}

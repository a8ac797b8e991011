//! Filesystem-safe basenames for schema/table output files (spec §6).
//!
//! Percent-escapes everything outside `[A-Za-z0-9_]`, caps the result at 225
//! bytes (leaving room for `@<chunk>.<ext>[.idx][.zst]` suffixes under common
//! filesystem name limits), and resolves collisions this process creates by
//! appending a numeric ordinal.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use percent_encoding::{percent_encode, AsciiSet, CONTROLS};

const MAX_LEN: usize = 225;

/// Everything outside `[A-Za-z0-9_]` gets percent-escaped (spec §6 "Basename
/// encoding"); built by starting from `CONTROLS` and adding every ASCII byte
/// that isn't alphanumeric or `_`.
static UNSAFE_BASENAME_CHARS: AsciiSet = CONTROLS
    .add(b' ')
    .add(b'!')
    .add(b'"')
    .add(b'#')
    .add(b'$')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b'+')
    .add(b',')
    .add(b'-')
    .add(b'.')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'~');

fn percent_escape(name: &str) -> String {
    percent_encode(name.as_bytes(), &UNSAFE_BASENAME_CHARS).to_string()
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

static SEEN: Lazy<Mutex<HashMap<String, u32>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Encode `name` into a basename unique among all basenames this process has
/// generated so far (spec §6 "Basename encoding").
pub fn encode(name: &str) -> String {
    let escaped = truncate_bytes(&percent_escape(name), MAX_LEN);

    let mut seen = SEEN.lock().unwrap();
    match seen.get_mut(&escaped) {
        None => {
            seen.insert(escaped.clone(), 0);
            escaped
        }
        Some(ordinal) => {
            *ordinal += 1;
            format!("{}@{}", truncate_bytes(&escaped, MAX_LEN - 12), ordinal)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_identifier_is_unchanged() {
        assert_eq!(encode(&format!("plain_ident_{}", line!())).starts_with("plain_ident_"), true);
    }

    #[test]
    fn escapes_unsafe_characters() {
        let input = format!("weird name/{}!", line!());
        let out = encode(&input);
        assert!(!out.contains('/'));
        assert!(!out.contains(' '));
        assert!(!out.contains('!'));
        assert!(out.contains("%2F"));
    }

    #[test]
    fn collisions_get_distinct_ordinals() {
        let base = format!("dup_{}", line!());
        let a = encode(&base);
        let b = encode(&base);
        assert_ne!(a, b);
    }
}

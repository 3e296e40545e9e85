pub const UID_MAX_LEN: usize = 64;

// Blank or overlong input comes back as "", which callers reject.
pub fn normalize_uid(raw: &str) -> String {
    let uid = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    if uid.chars().count() > UID_MAX_LEN {
        return String::new();
    }
    uid
}

pub fn normalize_text(raw: &str, default: &str, max_len: usize) -> String {
    let value = raw.trim();
    let value = if value.is_empty() { default } else { value };
    if value.chars().count() > max_len {
        value.chars().take(max_len).collect()
    } else {
        value.to_string()
    }
}

pub fn coerce_int(raw: Option<&str>, default: i64) -> i64 {
    match raw {
        Some(value) => value.trim().parse().unwrap_or(default),
        None => default,
    }
}

/// Length of the longest valid UTF-8 prefix in `bytes`.
pub(super) fn utf8_valid_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => e.valid_up_to(),
    }
}

/// Earliest stop-string hit in `buf`, as a byte offset.
///
/// `checked` is how much of `buf` was already scanned without a hit; only
/// matches that end past it are possible, so the scan starts just before it.
pub(super) fn first_stop_hit(buf: &str, stops: &[String], checked: usize) -> Option<usize> {
    let longest = stops.iter().map(String::len).max()?;
    let mut from = checked.saturating_sub(longest.saturating_sub(1)).min(buf.len());
    while !buf.is_char_boundary(from) {
        from -= 1;
    }
    let window = &buf[from..];
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| window.find(s.as_str()))
        .min()
        .map(|i| from + i)
}

//! Topic name and topic filter matching (OASIS MQTT-3.1.1-os §4.7).
//!
//! This is a client-side matcher only: it decides whether a topic a broker
//! delivered matches a filter the client holds, for dispatching PUBLISH
//! packets to the right local subscription. It does not build a broker-style
//! subscription trie (`mqtt-proto`'s `FilterTree`); a client only ever
//! matches one incoming topic against its own (small) filter set, so a linear
//! scan is all `mqtt-session` needs.

/// Returns `true` if `filter` is a syntactically valid topic filter:
/// `#` may only appear alone in the last segment, `+` may only appear alone
/// in a segment. Both are ordinary characters anywhere else.
pub fn is_valid_filter(filter: &str) -> bool {
    let segments: Vec<&str> = filter.split('/').collect();
    segments.iter().enumerate().all(|(i, seg)| match *seg {
        "#" => i == segments.len() - 1,
        "+" => true,
        s => !s.contains('#') && !s.contains('+'),
    })
}

/// Returns `true` if `topic` (a concrete topic name, never containing
/// wildcards) matches `filter`.
///
/// Matching is segment-wise and case-sensitive; empty segments (from a
/// leading, trailing, or doubled `/`) are significant and must match exactly
/// like any other segment.
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut topic_segments = topic.split('/');
    let mut filter_segments = filter.split('/');

    loop {
        match (topic_segments.next(), filter_segments.next()) {
            (_, Some("#")) => return true,
            (Some(_), Some("+")) => continue,
            (Some(t), Some(f)) => {
                if t != f {
                    return false;
                }
            }
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
        }
    }
}

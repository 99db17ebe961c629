//! Keyword detection in log deltas and parsing of incoming-connection records.
//!
//! Matching is plain, case-sensitive substring search. Deltas are not line
//! aligned, so nothing here assumes complete lines except record parsing,
//! which only accepts a line with both fields present.

/// True if any keyword occurs anywhere in `text`. Empty keywords never match.
pub fn contains_any<S: AsRef<str>>(text: &str, keywords: &[S]) -> bool {
    keywords.iter().any(|k| {
        let k: &str = k.as_ref();
        !k.is_empty() && text.contains(k)
    })
}

/// One finished-connection record from the incoming-connections file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRecord {
    pub connection_id: String,
    /// `None` when the remote side reported the literal `null`.
    pub display_name: Option<String>,
}

/// Extract the most recent well-formed record from a delta.
///
/// A record line is `id<TAB>name[<TAB>...]`. Lines with fewer than two fields
/// or an empty id are skipped. Returns `None` if no line qualifies.
pub fn parse_incoming_record(text: &str) -> Option<IncomingRecord> {
    text.lines().rev().find_map(parse_record_line)
}

fn parse_record_line(line: &str) -> Option<IncomingRecord> {
    let mut fields = line.split('\t');
    let id = fields.next()?.trim();
    let name = fields.next()?.trim();
    if id.is_empty() {
        return None;
    }

    let display_name = match name {
        "" | "null" => None,
        n => Some(n.to_string()),
    };
    Some(IncomingRecord {
        connection_id: id.to_string(),
        display_name,
    })
}

/// Reads the appended slice of a watched file.
use crate::offset::ByteRange;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Read bytes `[range.start, range.end]` of `path` as text.
///
/// Returns an empty string when the file cannot be opened or read, or the
/// range is degenerate. Invalid UTF-8 (a delta can split a multi-byte
/// character) is replaced rather than rejected.
pub fn read_range(path: &Path, range: ByteRange) -> String {
    if range.end < range.start {
        return String::new();
    }

    match try_read_range(path, range) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                start = range.start,
                end = range.end,
                error = %e,
                "failed to read appended content"
            );
            String::new()
        }
    }
}

fn try_read_range(path: &Path, range: ByteRange) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let len = range.end - range.start + 1;
    let mut bytes = Vec::new();
    // The file may have shrunk since it was measured; take what is there.
    file.take(len).read_to_end(&mut bytes)?;
    Ok(bytes)
}

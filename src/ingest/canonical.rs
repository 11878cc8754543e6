// =============================================================================
// Canonical JSON — the byte form that gets signed
// =============================================================================
//
// Canonical form: object keys lexicographically sorted at every depth, no
// insignificant whitespace (separators `,` and `:`), UTF-8. serde_json's
// default object representation is an ordered map, so re-serialising a parsed
// value compactly yields exactly this form; two encodings of the same content
// that differ only in key order or whitespace canonicalise to identical
// bytes.
// =============================================================================

use serde_json::Value;

/// Parse the exact bytes received and produce their canonical serialisation.
pub fn canonicalize(raw: &[u8]) -> Result<(Value, Vec<u8>), serde_json::Error> {
    let value: Value = serde_json::from_slice(raw)?;
    let bytes = serde_json::to_vec(&value)?;
    Ok((value, bytes))
}

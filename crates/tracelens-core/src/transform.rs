//! Vendor span id derivation
//!
//! Skywalking and Tingyun do not report OpenTelemetry-shaped span ids. These
//! functions turn their identifiers into ids that join against sampled records.

/// Derive a 16-hex-char span id from a Skywalking segment id and span sequence.
///
/// Accepted segment formats:
/// - `56a5e1c519ae4c76a2b8b11d92cead7f`
/// - `56a5e1c519ae4c76a2b8b11d92cead7f.12.16563474296430001`
///
/// The 16-byte uuid decoded from the hex prefix is XOR-ed with
/// `seq (4 bytes LE) . mid (4 bytes LE) . last (8 bytes LE)` and folded to 8 bytes.
/// Returns an empty string for malformed input.
pub fn segment_id_to_span_id(segment_id: &str, seq: u32) -> String {
    match segment_to_uuid(segment_id, seq) {
        Some(uuid) => hex::encode(fold_uuid(&uuid)),
        None => String::new(),
    }
}

/// Derive a span id from a Tingyun GUID and span sequence
pub fn guid_to_span_id(guid: &str, seq: u32) -> String {
    if seq == 0 {
        guid.to_string()
    } else {
        format!("{}-{}", guid, seq)
    }
}

fn segment_to_uuid(segment_id: &str, seq: u32) -> Option<[u8; 16]> {
    let prefix = segment_id.get(..32)?;
    let mut uuid = [0u8; 16];
    hex::decode_to_slice(prefix, &mut uuid).ok()?;

    xor_into(&mut uuid[0..4], &seq.to_le_bytes());

    if segment_id.len() == 32 {
        return Some(uuid);
    }

    let (first, last) = (segment_id.find('.')?, segment_id.rfind('.')?);
    if first != 32 || last == first {
        return None;
    }
    let mid: i64 = segment_id[first + 1..last].parse().ok()?;
    let offset: i64 = segment_id[last + 1..].parse().ok()?;

    xor_into(&mut uuid[4..8], &mid.to_le_bytes()[..4]);
    xor_into(&mut uuid[8..16], &offset.to_le_bytes());

    Some(uuid)
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

fn fold_uuid(uuid: &[u8; 16]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, b) in out.iter_mut().enumerate() {
        *b = uuid[i] ^ uuid[i + 8];
    }
    out
}

//! Key encoding: filesystem paths become stable replicated identifiers by
//! percent-escaping every byte outside `[A-Za-z0-9._-]`.

/// Errors decoding a key back into a path.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("malformed escape in key `{0}`")]
    BadEscape(String),

    #[error("key `{0}` does not decode to valid utf-8")]
    NotUtf8(String),
}

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.')
}

/// Encode a path into its replicated key.
pub fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        if is_plain(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Decode a replicated key back into a path. Malformed escapes fail.
pub fn decode_path(key: &str) -> Result<String, PathError> {
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| PathError::BadEscape(key.to_owned()))?;
                out.push(hex);
                i += 3;
            }
            byte if is_plain(byte) => {
                out.push(byte);
                i += 1;
            }
            _ => return Err(PathError::BadEscape(key.to_owned())),
        }
    }
    String::from_utf8(out).map_err(|_| PathError::NotUtf8(key.to_owned()))
}

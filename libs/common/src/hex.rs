//! Hex rendering for frame traces

use std::fmt::Write;

/// Encode bytes as uppercase hex separated by spaces
///
/// `[0x01, 0x03, 0x0B]` becomes `"01 03 0B"`, the layout used when tracing
/// serial frames.
pub fn encode_frame(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

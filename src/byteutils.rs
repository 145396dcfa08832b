pub fn u32_from_le_bytes(bytes: &[u8]) -> u32 {
    debug_assert_eq!(bytes.len(), 4);
    let mut buf = [0u8; 4];
    buf.clone_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Hex representation used in log lines and file names.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

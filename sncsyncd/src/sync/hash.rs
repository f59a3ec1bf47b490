/// Hex md5 digest of `content`; comparable across runs and machines.
pub fn fingerprint(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

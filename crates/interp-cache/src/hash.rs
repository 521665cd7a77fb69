use blake3::Hasher;

pub fn hash_bytes(prefix: &str, bytes: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    format!("{}_{}", prefix, hasher.finalize().to_hex())
}

/// Hash an ordered list of fields. Each field is length-prefixed so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn hash_fields<S: AsRef<str>>(prefix: &str, fields: &[S]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(prefix.as_bytes());
    for field in fields {
        let bytes = field.as_ref().as_bytes();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("{}_{}", prefix, hasher.finalize().to_hex())
}

pub fn to_hex(digest: &[u8; 32]) -> String {
    hex::encode(digest)
}

/// Ordered digest over a sequence of records: blake3 of each record's blake3.
#[derive(Clone, Default)]
pub struct RecordDigest {
    outer: blake3::Hasher,
    count: u64,
}

impl RecordDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: &[u8]) {
        self.outer.update(blake3::hash(record).as_bytes());
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finish_hex(&self) -> String {
        to_hex(self.outer.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_and_full_length() {
        let s = to_hex(blake3::hash(b"x").as_bytes());
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn record_digest_is_order_sensitive() {
        let mut a = RecordDigest::new();
        a.push(b"1");
        a.push(b"2");
        let mut b = RecordDigest::new();
        b.push(b"2");
        b.push(b"1");
        assert_ne!(a.finish_hex(), b.finish_hex());
        assert_eq!(a.count(), 2);
    }
}

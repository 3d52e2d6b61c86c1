use std::io::{Result, Write};

/// Forwards writes to `inner`, hashing and counting every byte on the way.
pub struct HashingForward<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
    pub written: u64,
}

impl<W: Write> HashingForward<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            written: 0,
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Returns the inner writer, the blake3 digest and the byte count.
    pub fn finish(self) -> (W, [u8; 32], u64) {
        let digest = *self.hasher.finalize().as_bytes();
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingForward<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }
    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_one_shot_hash() {
        let mut w = HashingForward::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (buf, digest, n) = w.finish();
        assert_eq!(buf, b"hello world");
        assert_eq!(n, 11);
        assert_eq!(&digest, blake3::hash(b"hello world").as_bytes());
    }
}

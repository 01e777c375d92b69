use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Read size for streaming hashes and copies.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of everything `reader` yields.
pub fn hash_reader<R: Read>(reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::with_capacity(BLOCK_SIZE, reader), &mut hasher)?;
    Ok(to_hex(&hasher.finalize()))
}

/// Writer that hashes every byte it passes on to `inner`.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// The wrapped writer and the hex digest of the bytes written through it.
    pub fn finish(self) -> (W, String) {
        (self.inner, to_hex(&self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub fn hash_file(path: &Path) -> io::Result<String> {
    hash_reader(File::open(path)?)
}

pub fn hash_bytes(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

pub fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            hash_bytes(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_reader_spanning_several_blocks_matches_one_shot() {
        let data: Vec<u8> = (0..BLOCK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        assert_eq!(hash_reader(Cursor::new(&data)).unwrap(), hash_bytes(&data));
    }

    /// Yields `Interrupted` before every chunk.
    struct Flaky<'a> {
        data: &'a [u8],
        interrupt: bool,
    }

    impl Read for Flaky<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt && !self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "signal"));
            }
            let n = buf.len().min(self.data.len()).min(7);
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_interrupted_reads_are_retried() {
        let data = b"interrupted reads must not end the hash early";
        let reader = Flaky {
            data,
            interrupt: false,
        };
        assert_eq!(hash_reader(reader).unwrap(), hash_bytes(data));
    }

    #[test]
    fn test_hashing_writer_passes_bytes_through() {
        let mut writer = HashingWriter::new(Vec::new());
        io::copy(&mut Cursor::new(b"hello world"), &mut writer).unwrap();
        let (written, checksum) = writer.finish();
        assert_eq!(written, b"hello world");
        assert_eq!(checksum, hash_bytes(b"hello world"));
    }
}

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::info;

use crate::{DigestAlgorithm, Digester, HASH_BUFFER_SIZE, HashError, MIN_SIZE_COMPUTE_LOGGING};

/// Running digests for every algorithm a transfer validates.
#[derive(Debug, Clone, Default)]
pub struct DigestSet {
    digesters: BTreeMap<DigestAlgorithm, Digester>,
    bytes: u64,
}

impl DigestSet {
    pub fn new(algorithms: &[DigestAlgorithm]) -> Self {
        Self {
            digesters: algorithms
                .iter()
                .map(|&alg| (alg, Digester::new(alg)))
                .collect(),
            bytes: 0,
        }
    }

    pub fn algorithms(&self) -> Vec<DigestAlgorithm> {
        self.digesters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.digesters.is_empty()
    }

    /// Number of bytes fed into the digests since creation or the last reset.
    pub fn bytes_digested(&self) -> u64 {
        self.bytes
    }

    pub fn update(&mut self, data: &[u8]) {
        for digester in self.digesters.values_mut() {
            digester.update(data);
        }
        self.bytes += data.len() as u64;
    }

    /// Drops all running state, keeping the algorithm selection.
    pub fn reset(&mut self) {
        for (alg, digester) in self.digesters.iter_mut() {
            *digester = Digester::new(*alg);
        }
        self.bytes = 0;
    }

    /// Feeds up to `len` bytes from `reader` into the digests.
    ///
    /// Returns the number of bytes consumed, which is short of `len` only
    /// when the reader hits EOF first.
    pub fn catch_up<R: Read>(&mut self, reader: &mut R, len: u64) -> Result<u64, HashError> {
        if len >= MIN_SIZE_COMPUTE_LOGGING {
            info!(bytes = len, "catching up digests for already transferred data");
        }
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = match reader.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(len - remaining)
    }

    /// Encoded digests keyed by algorithm name.
    pub fn finalize(&self) -> BTreeMap<String, String> {
        self.digesters
            .iter()
            .map(|(alg, digester)| (alg.name().to_string(), digester.encoded()))
            .collect()
    }
}

/// Digests `len` bytes of `path` starting at `start`.
pub fn digest_range(
    path: &Path,
    start: u64,
    len: u64,
    algorithms: &[DigestAlgorithm],
) -> Result<BTreeMap<String, String>, HashError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut set = DigestSet::new(algorithms);
    set.catch_up(&mut file, len)?;
    Ok(set.finalize())
}

/// Digests the whole of `path`.
pub fn digest_file(
    path: &Path,
    algorithms: &[DigestAlgorithm],
) -> Result<BTreeMap<String, String>, HashError> {
    let len = std::fs::metadata(path)?.len();
    digest_range(path, 0, len, algorithms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join("data.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn incremental_matches_whole() {
        let algs = DigestAlgorithm::ALL;
        let mut a = DigestSet::new(&algs);
        a.update(b"hello ");
        a.update(b"world");
        let mut b = DigestSet::new(&algs);
        b.update(b"hello world");
        assert_eq!(a.finalize(), b.finalize());
        assert_eq!(a.bytes_digested(), 11);
        assert_eq!(a.finalize().len(), 3);
    }

    #[test]
    fn reset_clears_state() {
        let mut set = DigestSet::new(&[DigestAlgorithm::Md5]);
        set.update(b"junk");
        set.reset();
        set.update(b"abc");
        let mut fresh = DigestSet::new(&[DigestAlgorithm::Md5]);
        fresh.update(b"abc");
        assert_eq!(set.finalize(), fresh.finalize());
        assert_eq!(set.bytes_digested(), 3);
    }

    #[test]
    fn catch_up_stops_at_eof() {
        let mut set = DigestSet::new(&[DigestAlgorithm::Crc32]);
        let mut reader = &b"short"[..];
        let n = set.catch_up(&mut reader, 100).unwrap();
        assert_eq!(n, 5);
        assert_eq!(set.bytes_digested(), 5);
    }

    #[test]
    fn range_digest_matches_slice() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let path = write_file(dir.path(), &data);

        let range = digest_range(&path, 10_000, 20_000, &[DigestAlgorithm::Md5]).unwrap();
        let mut expected = DigestSet::new(&[DigestAlgorithm::Md5]);
        expected.update(&data[10_000..30_000]);
        assert_eq!(range, expected.finalize());

        let whole = digest_file(&path, &[DigestAlgorithm::Md5]).unwrap();
        let mut expected = DigestSet::new(&[DigestAlgorithm::Md5]);
        expected.update(&data);
        assert_eq!(whole, expected.finalize());
    }
}

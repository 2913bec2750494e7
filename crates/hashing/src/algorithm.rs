use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use md5::Md5;
use sha2::{Digest, Sha256};

/// A digest algorithm an object store may report for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Md5,
    Crc32,
    Sha256,
}

impl DigestAlgorithm {
    /// Every supported algorithm.
    pub const ALL: [DigestAlgorithm; 3] = [Self::Md5, Self::Crc32, Self::Sha256];

    /// Name used as the key in digest maps.
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Crc32 => "crc32",
            Self::Sha256 => "sha256",
        }
    }

    /// Parses an algorithm name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Cyclic checks are cheap enough to always compute.
    pub fn is_fast(self) -> bool {
        matches!(self, Self::Crc32)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A running digest for one algorithm.
///
/// Cloning snapshots the running state, which is how transfers checkpoint
/// digests before a read they may have to replay.
#[derive(Clone)]
pub struct Digester {
    state: State,
}

#[derive(Clone)]
enum State {
    Md5(Md5),
    Crc32(crc32fast::Hasher),
    Sha256(Sha256),
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let state = match algorithm {
            DigestAlgorithm::Md5 => State::Md5(Md5::new()),
            DigestAlgorithm::Crc32 => State::Crc32(crc32fast::Hasher::new()),
            DigestAlgorithm::Sha256 => State::Sha256(Sha256::new()),
        };
        Self { state }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self.state {
            State::Md5(_) => DigestAlgorithm::Md5,
            State::Crc32(_) => DigestAlgorithm::Crc32,
            State::Sha256(_) => DigestAlgorithm::Sha256,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Md5(h) => h.update(data),
            State::Crc32(h) => h.update(data),
            State::Sha256(h) => h.update(data),
        }
    }

    /// Returns the base64 encoding of the digest so far without consuming
    /// the running state.
    pub fn encoded(&self) -> String {
        match self.state.clone() {
            State::Md5(h) => STANDARD.encode(h.finalize()),
            State::Crc32(h) => STANDARD.encode(h.finalize().to_be_bytes()),
            State::Sha256(h) => STANDARD.encode(h.finalize()),
        }
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

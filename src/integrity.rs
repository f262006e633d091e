use std::{fmt::Display, io, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256, Sha512};

use crate::model::ParseError;

/// Supported SRI algorithms, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: Algorithm,
    pub digest: Vec<u8>,
}

impl Hash {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.algorithm.name(), STANDARD.encode(&self.digest))
    }
}

/// A subresource integrity string, e.g. `sha512-<base64>`.
///
/// Several space separated hashes are allowed; `sha1` entries are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Integrity {
    hashes: Vec<Hash>,
}

impl Integrity {
    pub fn from_bytes(data: &[u8]) -> Integrity {
        let mut hasher = IntegrityHasher::new();
        hasher.update(data);
        hasher.finish()
    }

    pub fn strongest(&self) -> &Hash {
        // Never empty: parsing rejects strings without a usable hash.
        self.hashes
            .iter()
            .max_by_key(|hash| hash.algorithm)
            .unwrap_or(&self.hashes[0])
    }

    pub fn get(&self, algorithm: Algorithm) -> Option<&Hash> {
        self.hashes.iter().find(|hash| hash.algorithm == algorithm)
    }

    /// Compares using the strongest algorithm `self` carries.
    pub fn matches(&self, other: &Integrity) -> bool {
        let wanted = self.strongest();
        other
            .get(wanted.algorithm)
            .is_some_and(|hash| hash.digest == wanted.digest)
    }
}

impl FromStr for Integrity {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidIntegrity(value.to_owned());
        let mut hashes = Vec::new();
        for token in value.split_whitespace() {
            let token = token.split('?').next().unwrap_or(token);
            let Some((algorithm, encoded)) = token.split_once('-') else {
                return Err(invalid());
            };
            let algorithm = match algorithm {
                "sha512" => Algorithm::Sha512,
                "sha256" => Algorithm::Sha256,
                "sha1" => continue,
                _ => return Err(invalid()),
            };
            let digest = STANDARD.decode(encoded).map_err(|_| invalid())?;
            hashes.push(Hash { algorithm, digest });
        }
        if hashes.is_empty() {
            return Err(invalid());
        }
        Ok(Integrity { hashes })
    }
}

impl Display for Integrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, hash) in self.hashes.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{hash}")?;
        }
        Ok(())
    }
}

/// Incremental hasher computing every supported algorithm at once, so the
/// result can be checked against an expected integrity of any strength.
#[derive(Default, Clone)]
pub struct IntegrityHasher {
    sha256: Sha256,
    sha512: Sha512,
}

impl IntegrityHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.sha512.update(data);
    }

    pub fn finish(self) -> Integrity {
        Integrity {
            hashes: vec![
                Hash {
                    algorithm: Algorithm::Sha512,
                    digest: self.sha512.finalize().to_vec(),
                },
                Hash {
                    algorithm: Algorithm::Sha256,
                    digest: self.sha256.finalize().to_vec(),
                },
            ],
        }
    }
}

impl io::Write for IntegrityHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The label attached to tarballs and manifests: the strongest hash only.
pub fn label(integrity: &Integrity) -> String {
    integrity.strongest().to_string()
}

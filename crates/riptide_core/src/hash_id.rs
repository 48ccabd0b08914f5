use data_encoding::BASE32;
use std::str::FromStr;

/// A fixed-size binary id with hex and base32 text forms.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<const N: usize>(pub [u8; N]);

impl<const N: usize> Id<N> {
    pub fn new(from: [u8; N]) -> Id<N> {
        Id(from)
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<Self> {
        let mut v = [0u8; N];
        if b.len() != N {
            anyhow::bail!("buffer length must be {}, but it's {}", N, b.len());
        }
        v.copy_from_slice(b);
        Ok(Id(v))
    }
}

impl<const N: usize> Default for Id<N> {
    fn default() -> Self {
        Id([0; N])
    }
}

impl<const N: usize> std::fmt::Debug for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

impl<const N: usize> std::fmt::Display for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

impl<const N: usize> FromStr for Id<N> {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; N];
        let base32_encoded_size = (N as f64 / 5f64).ceil() as usize * 8;
        if s.len() == N * 2 {
            hex::decode_to_slice(s, &mut out)?;
            Ok(Id(out))
        } else if s.len() == base32_encoded_size {
            match BASE32.decode(s.to_ascii_uppercase().as_bytes()) {
                Ok(decoded) if decoded.len() == N => {
                    out.copy_from_slice(&decoded);
                    Ok(Id(out))
                }
                Ok(decoded) => {
                    anyhow::bail!(
                        "base32 string {} decodes to {} bytes, expected {}",
                        s,
                        decoded.len(),
                        N
                    )
                }
                Err(err) => {
                    anyhow::bail!("failed to decode base32 string {}: {}", s, err)
                }
            }
        } else {
            anyhow::bail!(
                "expected a hex string of length {} or a base32 string of length {}",
                N * 2,
                base32_encoded_size
            );
        }
    }
}

/// A 20-byte hash: v1 info-hashes, peer ids, SHA-1 digests.
pub type Id20 = Id<20>;
/// A 32-byte hash: BitTorrent v2 info-hashes and SHA-256 digests.
pub type Id32 = Id<32>;

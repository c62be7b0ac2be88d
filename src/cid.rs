use std::error::Error;
use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Number of hex characters in the printed form of a content identifier.
pub const CID_HEX_LEN: usize = 64;

/// A content identifier.
///
/// The printed form is the lowercase hex SHA256 digest of the block the
/// identifier refers to. It is a single ASCII token, safe both as a URL
/// segment and inside a quoted ETag value. Ordering and equality are by
/// bytes of the printed form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid(String);

#[derive(Debug, PartialEq)]
pub struct CidError;

impl Error for CidError {}

impl fmt::Display for CidError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("malformed content identifier")
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Cid, CidError> {
        if s.len() != CID_HEX_LEN {
            return Err(CidError {});
        }
        for c in s.chars() {
            if !(c.is_ascii_digit() || ('a'..='f').contains(&c)) {
                return Err(CidError {});
            }
        }
        Ok(Cid(s.to_string()))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Cid({})", self.short())
    }
}

impl Cid {
    /// Identifier of a block, computed over its encoded bytes.
    pub fn from_block(data: &[u8]) -> Cid {
        let mut h = Sha256::new();
        h.update(data);
        Cid(hex::encode(h.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in directory listings: the leading and
    /// trailing four characters joined by an ellipsis. Identifiers of
    /// nine characters or fewer are returned whole.
    pub fn short(&self) -> String {
        if self.0.len() <= 9 {
            return self.0.clone();
        }
        format!("{}\u{2026}{}", &self.0[..4], &self.0[self.0.len() - 4..])
    }

    /// ETag value for responses whose representation is fully determined
    /// by this identifier.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

use regex::Regex;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn image_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
            .expect("image name pattern is valid")
    })
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").expect("reference pattern is valid")
    })
}

fn digest_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^sha256:[a-f0-9]{64}$").expect("digest pattern is valid"))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct InvalidIdentifier {
    pub kind: &'static str,
    pub value: String,
}

/// A validated `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    /// Digest of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self::from_sha256(&Sha256::digest(data))
    }

    pub fn from_sha256(hash: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(hash)))
    }

    /// The hex part, which is also the content store key.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if digest_pattern().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidIdentifier { kind: "digest", value: s.to_string() })
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated, lowercase image name. May contain `/` separated segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName(String);

impl ImageName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ImageName {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if image_name_pattern().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidIdentifier { kind: "image name", value: s.to_string() })
        }
    }
}

/// Manifest reference from a request path: a digest or a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Digest(Digest),
    Tag(String),
}

impl Reference {
    pub fn is_tag(&self) -> bool {
        matches!(self, Reference::Tag(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Reference::Digest(digest) => digest.as_str(),
            Reference::Tag(tag) => tag,
        }
    }
}

impl FromStr for Reference {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(digest) = s.parse::<Digest>() {
            return Ok(Reference::Digest(digest));
        }
        if reference_pattern().is_match(s) {
            return Ok(Reference::Tag(s.to_string()));
        }
        Err(InvalidIdentifier { kind: "reference", value: s.to_string() })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_of_hello() {
        let digest = Digest::of(b"hello");
        assert_eq!(
            digest.as_str(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest.hex().len(), 64);
    }

    #[test]
    fn test_digest_rejects_other_algorithms_and_case() {
        assert!("sha512:abcd".parse::<Digest>().is_err());
        assert!("sha256:2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824"
            .parse::<Digest>()
            .is_err());
        assert!("sha256:2cf2".parse::<Digest>().is_err());
    }

    #[test]
    fn test_image_names() {
        for name in ["app", "tools/app", "a.b-c_d/e", "x9/y/z"] {
            assert!(name.parse::<ImageName>().is_ok(), "{name}");
        }
        for name in ["", "App", "-app", "app/", "a//b", "a..b"] {
            assert!(name.parse::<ImageName>().is_err(), "{name}");
        }
    }

    #[test]
    fn test_references() {
        assert!(matches!("latest".parse::<Reference>(), Ok(Reference::Tag(_))));
        assert!(matches!(
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824".parse::<Reference>(),
            Ok(Reference::Digest(_))
        ));
        assert!(".hidden".parse::<Reference>().is_err());
        assert!("a".repeat(129).parse::<Reference>().is_err());
        assert!("a".repeat(128).parse::<Reference>().is_ok());
    }
}

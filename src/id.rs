//! External blob identifiers.
//!
//! Callers see `<native key><extension>`, e.g.
//! `67e55044-10b1-426f-9247-bb680e5fe0c8.txt`. The extension is carried along
//! so clients can infer a content type, but only the key part is ever used to
//! look anything up.

use core::fmt;
use core::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};

/// The store-assigned key of a files record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeKey(Uuid);

impl NativeKey {
    /// Allocates a fresh random key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl fmt::Debug for NativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeKey({})", self.0.hyphenated())
    }
}

impl FromStr for NativeKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Builds the external identifier for `key`, keeping the extension of `filename`.
pub fn encode(key: NativeKey, filename: &str) -> String {
    match extension(filename) {
        Some(ext) => format!("{key}{ext}"),
        None => key.to_string(),
    }
}

/// Recovers the native key from an external identifier.
pub fn decode(external_id: &str) -> Result<NativeKey> {
    let key = match external_id.rsplit_once('.') {
        Some((key, _ext)) => key,
        None => external_id,
    };
    key.parse()
        .map_err(|_| Error::InvalidIdentifier(external_id.to_owned()))
}

/// The extension of the last path component of `filename`, dot included.
///
/// Dotfiles (`.bashrc`) and names ending in a dot have no extension.
pub fn extension(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(dot) if dot + 1 == name.len() => None,
        Some(dot) => Some(&name[dot..]),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encodes_extension() {
        let key = NativeKey::generate();
        let id = encode(key, "note.txt");
        assert_eq!(id, format!("{key}.txt"));
        assert_eq!(decode(&id).unwrap(), key);
    }

    #[test]
    fn only_last_extension_is_kept() {
        let key = NativeKey::generate();
        assert_eq!(encode(key, "backup.tar.gz"), format!("{key}.gz"));
        assert_eq!(encode(key, "dir.d/README"), key.to_string());
    }

    #[test]
    fn no_extension_for_dotfiles() {
        assert_eq!(extension(".bashrc"), None);
        assert_eq!(extension("config/.env"), None);
        assert_eq!(extension("trailing."), None);
        assert_eq!(extension("photo.JPEG"), Some(".JPEG"));
    }

    #[test]
    fn rejects_malformed_keys() {
        for id in ["", ".txt", "not-a-key.txt", "507f1f77bcf86cd799439011.png"] {
            let err = decode(id).unwrap_err();
            assert!(matches!(err, Error::InvalidIdentifier(ref s) if s == id), "{id:?}");
        }
    }

    #[test]
    fn canonical_form_is_lowercase_hyphenated() {
        let key: NativeKey = "67E55044-10B1-426F-9247-BB680E5FE0C8".parse().unwrap();
        assert_eq!(key.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert_eq!(NativeKey::from_bytes(*key.as_bytes()), key);
    }

    proptest! {
        #[test]
        fn key_survives_any_filename(bytes in any::<[u8; 16]>(), filename in ".*") {
            let key = NativeKey::from_bytes(bytes);
            prop_assert_eq!(decode(&encode(key, &filename)).unwrap(), key);
        }

        #[test]
        fn extension_never_changes_the_key(bytes in any::<[u8; 16]>(), a in "[a-z]{0,8}\\.[a-z]{1,4}", b in "[a-z]{0,8}") {
            let key = NativeKey::from_bytes(bytes);
            let decoded = decode(&encode(key, &a)).unwrap();
            prop_assert_eq!(decode(&encode(decoded, &b)).unwrap(), decoded);
        }
    }
}

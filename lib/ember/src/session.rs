use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Deref, DerefMut};

const SESSION_KEY_SIZE: usize = 40;

/// Shared secret negotiated during account logon. The realm hands it to the
/// world server through the auth database, hex encoded.
#[derive(Clone)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    pub const SIZE: usize = SESSION_KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> SessionKey {
        SessionKey(key)
    }

    /// Parses a hex encoded session key. Returns `None` when the input is not
    /// exactly 80 hex digits.
    pub fn from_hex(raw: &str) -> Option<SessionKey> {
        if raw.len() != Self::SIZE * 2 {
            return None;
        }

        let mut key = [0u8; Self::SIZE];

        for (i, slot) in key.iter_mut().enumerate() {
            let chunk = raw.get(i * 2..i * 2 + 2)?;
            *slot = u8::from_str_radix(chunk, 16).ok()?;
        }

        Some(SessionKey(key))
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(Self::SIZE * 2);

        for byte in self.0.iter() {
            out.push_str(&format!("{:02X}", byte));
        }

        out
    }
}

impl Deref for SessionKey {
    type Target = [u8; SessionKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; SessionKey::SIZE] {
        &self.0
    }
}

impl DerefMut for SessionKey {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8; SessionKey::SIZE] {
        &mut self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Never leak key material into logs
        write!(f, "SessionKey(..)")
    }
}

impl Serialize for SessionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<SessionKey, D::Error> {
        let raw = <&str>::deserialize(deserializer)?;
        SessionKey::from_hex(raw).ok_or_else(|| de::Error::custom("malformed session key"))
    }
}

use crate::session::SessionKey;
use hmac::{Hmac, Mac};
use rc4::consts::U20;
use rc4::{Key, KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};

pub const DIGEST_SIZE: usize = 20;

// Number of leading keystream bytes discarded to desynchronize the cipher
// from its key schedule. Both peers must drop the same amount.
const DROP_N: usize = 1024;

const SERVER_ENCRYPT_SEED: [u8; 16] = [
    0x40, 0xAA, 0xD3, 0x92, 0x26, 0x71, 0x43, 0x47, 0x3A, 0x31, 0x08, 0xA6, 0xE7, 0xDC, 0x98,
    0x2A,
];
const SERVER_DECRYPT_SEED: [u8; 16] = [
    0x08, 0xF1, 0x95, 0x9F, 0x47, 0xE5, 0xD2, 0xDB, 0xA1, 0x3D, 0x77, 0x8F, 0x3F, 0x3E, 0xE7,
    0x00,
];

type HeaderRc4 = Rc4<U20>;
type HmacSha1 = Hmac<Sha1>;

/// Stream cipher pair protecting packet headers after authentication. Payloads
/// are left in the clear, only the framing words pass through the keystreams.
///
/// The two directions run independent keystreams derived from the session key,
/// so every header must pass through the cipher exactly once and in wire order.
pub struct HeaderCrypt {
    encrypt: HeaderRc4,
    decrypt: HeaderRc4,
}

impl HeaderCrypt {
    /// Cipher pair for the server end of a connection.
    pub fn server(key: &SessionKey) -> HeaderCrypt {
        HeaderCrypt {
            encrypt: Self::keystream(&SERVER_ENCRYPT_SEED, key),
            decrypt: Self::keystream(&SERVER_DECRYPT_SEED, key),
        }
    }

    /// Cipher pair for the client end. Mirror image of `server`, used by tests
    /// exercising both directions.
    pub fn client(key: &SessionKey) -> HeaderCrypt {
        HeaderCrypt {
            encrypt: Self::keystream(&SERVER_DECRYPT_SEED, key),
            decrypt: Self::keystream(&SERVER_ENCRYPT_SEED, key),
        }
    }

    #[inline]
    pub fn encrypt(&mut self, header: &mut [u8]) {
        self.encrypt.apply_keystream(header);
    }

    #[inline]
    pub fn decrypt(&mut self, header: &mut [u8]) {
        self.decrypt.apply_keystream(header);
    }

    fn keystream(seed: &[u8; 16], key: &SessionKey) -> HeaderRc4 {
        let mut mac =
            <HmacSha1 as Mac>::new_from_slice(seed).expect("Hmac accepts any key size");
        mac.update(&key[..]);
        let digest = mac.finalize().into_bytes();

        let mut cipher = HeaderRc4::new(Key::<U20>::from_slice(&digest));

        let mut sync = [0u8; DROP_N];
        cipher.apply_keystream(&mut sync);

        cipher
    }
}

/// SHA1 over the concatenation of the supplied parts.
pub fn sha1(parts: &[&[u8]]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha1::new();

    for part in parts {
        hasher.update(part);
    }

    hasher.finalize().into()
}

/// Fills the provided buffer with random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(out);
}

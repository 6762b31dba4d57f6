//! Toy public-key cipher used on the wire.
//!
//! Every plaintext byte is encrypted on its own with textbook RSA, so a
//! message turns into a sequence of integers. This is deliberately weak: the
//! relay reproduces the protocol, it does not try to make it secure.

use std::fmt;

/// Encryption half of a key pair, sent in the clear during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub e: u64,
    pub n: u64,
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.e, self.n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateKey {
    pub d: u64,
    pub n: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Key pair the relay ships with (`n = 17 * 19`).
    pub const SERVER_DEFAULT: KeyPair = KeyPair::new(5, 173, 323);
    /// Key pair the bundled client ships with (`n = 13 * 23`).
    pub const CLIENT_DEFAULT: KeyPair = KeyPair::new(7, 151, 299);

    pub const fn new(e: u64, d: u64, n: u64) -> Self {
        Self {
            public: PublicKey { e, n },
            private: PrivateKey { d, n },
        }
    }
}

/// The encryption capability the session manager consumes.
///
/// Kept behind a trait so the relay never depends on how units are produced,
/// only on the shape of the ciphertext.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &str, key: &PublicKey) -> Vec<u64>;
    fn decrypt(&self, ciphertext: &[u64], key: &PrivateKey) -> String;
}

/// Byte-wise modular exponentiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToyRsa;

impl Cipher for ToyRsa {
    fn encrypt(&self, plaintext: &str, key: &PublicKey) -> Vec<u64> {
        plaintext
            .bytes()
            .map(|byte| modexp(u64::from(byte), key.e, key.n))
            .collect()
    }

    fn decrypt(&self, ciphertext: &[u64], key: &PrivateKey) -> String {
        let bytes: Vec<u8> = ciphertext
            .iter()
            .map(|&unit| u8::try_from(modexp(unit, key.d, key.n)).unwrap_or(b'?'))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn modexp(base: u64, exp: u64, modulus: u64) -> u64 {
    if modulus <= 1 {
        return 0;
    }

    let modulus = u128::from(modulus);
    let mut base = u128::from(base) % modulus;
    let mut exp = exp;
    let mut result: u128 = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exp >>= 1;
    }
    // result < modulus <= u64::MAX
    result as u64
}

/// Renders ciphertext as space-separated decimal integers.
pub fn serialize(ciphertext: &[u64]) -> String {
    ciphertext
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a chat frame back into ciphertext.
///
/// Parsing stops at the first token that is not an integer, so garbage input
/// yields an empty (or truncated) sequence rather than an error.
pub fn deserialize(frame: &str) -> Vec<u64> {
    frame
        .split_whitespace()
        .map_while(|token| token.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_keys_round_trip_ascii() {
        let keys = KeyPair::SERVER_DEFAULT;
        let ciphertext = ToyRsa.encrypt("bob/hello there", &keys.public);
        assert_eq!(ToyRsa.decrypt(&ciphertext, &keys.private), "bob/hello there");
    }

    #[test]
    fn encryption_is_per_byte() {
        let keys = KeyPair::CLIENT_DEFAULT;
        let ciphertext = ToyRsa.encrypt("aa", &keys.public);
        assert_eq!(ciphertext.len(), 2);
        assert_eq!(ciphertext[0], ciphertext[1]);
        // 97^7 mod 299
        assert_eq!(ciphertext[0], modexp(97, 7, 299));
    }

    #[test]
    fn out_of_range_units_decrypt_to_question_mark() {
        // 300 survives the round trip under n = 323 but is not a byte.
        let keys = KeyPair::SERVER_DEFAULT;
        let unit = modexp(300, keys.public.e, keys.public.n);
        assert_eq!(ToyRsa.decrypt(&[unit], &keys.private), "?");
    }

    #[test]
    fn serialize_joins_with_single_spaces() {
        assert_eq!(serialize(&[1, 22, 333]), "1 22 333");
        assert_eq!(serialize(&[]), "");
    }

    #[test]
    fn deserialize_stops_at_first_invalid_token() {
        assert_eq!(deserialize("  12 7\t9 "), vec![12, 7, 9]);
        assert_eq!(deserialize("4 5 oops 6"), vec![4, 5]);
        assert!(deserialize("Error: nope").is_empty());
        assert!(deserialize(" ").is_empty());
    }

    #[test]
    fn degenerate_modulus_does_not_panic() {
        assert_eq!(modexp(42, 3, 0), 0);
        assert_eq!(modexp(42, 3, 1), 0);
    }
}

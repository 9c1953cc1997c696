use crate::{message, Error};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The only signing method the wire protocol recognizes. Kept as an enum
/// (rather than a bare string) so a future algorithm can be added without
/// touching every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMethod {
    Sha256,
}

impl SignMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SHA-256" => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
        }
    }
}

/// HMAC-SHA256 digest, truncated to the first 4 bytes and hex-encoded (8
/// lowercase hex characters). The truncation is intentional: it is the
/// whole signature budget the UDP payload allows alongside a full path
/// list, not a full-strength MAC.
///
/// # Test
///
/// ```
/// use portal_codec::crypto::sign;
///
/// let sig = sign(b"00112233445566778899aabbccddeeff", b"REDIRECT 1700000000 host:1 /a");
/// assert_eq!(sig.len(), 8);
/// ```
pub fn sign(key: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(payload);
    let full = mac.finalize().into_bytes();
    hex::encode(&full[..4])
}

pub fn verify(key: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    sign(key, payload).eq_ignore_ascii_case(signature_hex)
}

/// An ordered set of `(method, key)` pairs loaded from `SIGN` config
/// directives. An empty set means the portal accepts unsigned traffic;
/// a non-empty set requires every inbound message to verify against at
/// least one configured key.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<(SignMethod, Vec<u8>)>,
}

impl KeySet {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn push(&mut self, method: SignMethod, key_hex: &str) -> Result<(), Error> {
        let key = hex::decode(key_hex).map_err(|_| Error::Malformed)?;
        self.keys.push((method, key));
        Ok(())
    }

    /// Appends a ` <METHOD> <HEXSIG>` suffix signed with the first
    /// configured key, or returns `body` unchanged if no key is set.
    pub fn sign(&self, body: &str) -> String {
        match self.keys.first() {
            Some((method, key)) => format!("{} {} {}", body, method.as_str(), sign(key, body.as_bytes())),
            None => body.to_string(),
        }
    }

    /// Validates an inbound wire line against this key set, returning the
    /// de-suffixed body on success.
    pub fn verify<'a>(&self, line: &'a str) -> Result<&'a str, Error> {
        let (body, suffix) = message::strip_signature(line);

        match suffix {
            Some((method_str, sig)) => {
                let method = SignMethod::parse(method_str).ok_or(Error::UnknownKeyword)?;
                let ok = self
                    .keys
                    .iter()
                    .any(|(m, k)| *m == method && verify(k, body.as_bytes(), sig));

                if ok {
                    Ok(body)
                } else {
                    Err(Error::BadSignature)
                }
            }
            None if self.is_empty() => Ok(body),
            None => Err(Error::Unsigned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_signature() {
        let mut keys = KeySet::default();
        keys.push(SignMethod::Sha256, "00112233445566778899aabbccddeeff")
            .unwrap();

        let body = "REDIRECT 1700000000 127.0.0.1:9000 /api";
        let line = keys.sign(body);
        assert_eq!(keys.verify(&line).unwrap(), body);
    }

    #[test]
    fn rejects_tampered_signature() {
        let mut keys = KeySet::default();
        keys.push(SignMethod::Sha256, "00112233445566778899aabbccddeeff")
            .unwrap();

        let line = keys.sign("REDIRECT 1700000000 127.0.0.1:9000 /api");
        let tampered = line.replace("9000", "9001");
        assert_eq!(keys.verify(&tampered), Err(Error::BadSignature));
    }

    #[test]
    fn rejects_unsigned_when_keys_configured() {
        let mut keys = KeySet::default();
        keys.push(SignMethod::Sha256, "00112233445566778899aabbccddeeff")
            .unwrap();

        assert_eq!(
            keys.verify("REDIRECT 1700000000 127.0.0.1:9000 /api"),
            Err(Error::Unsigned)
        );
    }

    #[test]
    fn accepts_unsigned_when_no_keys_configured() {
        let keys = KeySet::default();
        let body = "REDIRECT 1700000000 127.0.0.1:9000 /api";
        assert_eq!(keys.verify(body).unwrap(), body);
    }
}

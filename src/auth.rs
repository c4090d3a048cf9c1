//! HTTP Basic authentication against an htpasswd file (Apache `$apr1$`
//! hashes).
//!
//! Grounded on `hat.juggler.basic_auth.BasicAuthMiddleware`: parse
//! `user:hash` lines at startup (rejecting anything but `$apr1$`), verify
//! credentials by recomputing the hash, and cache accepted passwords
//! in-memory so a repeat request from the same user skips the expensive
//! crypt. The original shells out to `openssl passwd -stdin -apr1`; this
//! implementation computes the apr1-crypt digest natively with the `md5`
//! crate instead, per this crate's note that either approach is acceptable.

use std::collections::HashMap;
use std::path::Path;

use dashmap::DashMap;

use crate::error::{JugglerError, JugglerResult};

/// Parsed, validated htpasswd credentials plus an in-memory verification
/// cache.
pub struct HtpasswdAuth {
    hashes: HashMap<String, String>,
    verified: DashMap<String, String>,
}

impl HtpasswdAuth {
    /// Read and parse `path`. Every non-blank line must be `user:$apr1$...`;
    /// any other hash scheme is a startup [`JugglerError::ConfigError`].
    pub fn load(path: impl AsRef<Path>) -> JugglerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut hashes = HashMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (user, hash) = line.split_once(':').ok_or_else(|| {
                JugglerError::ConfigError(format!("malformed htpasswd line: {line:?}"))
            })?;
            if !hash.starts_with("$apr1$") {
                return Err(JugglerError::ConfigError(format!(
                    "unsupported password encoding for user {user:?}: only $apr1$ is supported"
                )));
            }
            hashes.insert(user.to_string(), hash.to_string());
        }

        Ok(Self {
            hashes,
            verified: DashMap::new(),
        })
    }

    /// Verify `user`/`password` against the loaded hashes, consulting (and
    /// populating) the in-memory cache.
    pub fn verify(&self, user: &str, password: &str) -> bool {
        if let Some(cached) = self.verified.get(user) {
            return *cached == password;
        }
        let Some(hash) = self.hashes.get(user) else {
            return false;
        };
        let ok = apr1_crypt(password, salt_of(hash)) == *hash;
        if ok {
            self.verified.insert(user.to_string(), password.to_string());
        }
        ok
    }
}

fn salt_of(hash: &str) -> &str {
    // "$apr1$salt$digest" -> "salt"
    hash.trim_start_matches("$apr1$")
        .split('$')
        .next()
        .unwrap_or("")
}

/// Compute the Apache `apr1` MD5-crypt digest of `password` with `salt`,
/// formatted as `$apr1$salt$digest`.
///
/// This is the well-known apr1-crypt algorithm (a variant of the BSD
/// MD5-crypt), implemented directly against `md5::compute` rather than
/// shelling out to a system utility.
pub fn apr1_crypt(password: &str, salt: &str) -> String {
    let pw = password.as_bytes();
    let salt = salt.as_bytes();

    let mut ctx1 = Vec::with_capacity(pw.len() * 2 + salt.len() + 6);
    ctx1.extend_from_slice(pw);
    ctx1.extend_from_slice(b"$apr1$");
    ctx1.extend_from_slice(salt);

    let mut ctx2 = Vec::with_capacity(pw.len() * 2 + salt.len());
    ctx2.extend_from_slice(pw);
    ctx2.extend_from_slice(salt);
    ctx2.extend_from_slice(pw);
    let mut bin = *md5::compute(&ctx2);

    let mut i = pw.len();
    while i > 0 {
        let take = i.min(16);
        ctx1.extend_from_slice(&bin[..take]);
        i -= take;
    }

    let mut i = pw.len();
    while i > 0 {
        if i & 1 != 0 {
            ctx1.push(0);
        } else {
            ctx1.push(pw[0]);
        }
        i >>= 1;
    }

    bin = *md5::compute(&ctx1);

    for round in 0..1000 {
        let mut ctx = Vec::with_capacity(pw.len() * 2 + 16);
        if round & 1 != 0 {
            ctx.extend_from_slice(pw);
        } else {
            ctx.extend_from_slice(&bin);
        }
        if round % 3 != 0 {
            ctx.extend_from_slice(salt);
        }
        if round % 7 != 0 {
            ctx.extend_from_slice(pw);
        }
        if round & 1 != 0 {
            ctx.extend_from_slice(&bin);
        } else {
            ctx.extend_from_slice(pw);
        }
        bin = *md5::compute(&ctx);
    }

    let encoded = to_apr1_b64(&bin);
    format!("$apr1${}${}", String::from_utf8_lossy(salt), encoded)
}

const ITOA64: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn to_apr1_b64(bin: &[u8; 16]) -> String {
    // The apr1/BSD MD5-crypt custom base64, 3 bytes -> 4 chars, permuted
    // byte groups, per the canonical algorithm.
    let groups: [(usize, usize, usize); 5] = [(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)];
    let mut out = String::with_capacity(22);
    for (a, b, c) in groups {
        encode_group(&mut out, bin[a], bin[b], bin[c], 4);
    }
    encode_group(&mut out, 0, 0, bin[11], 2);
    out
}

fn encode_group(out: &mut String, a: u8, b: u8, c: u8, n: usize) {
    let mut v = ((a as u32) << 16) | ((b as u32) << 8) | (c as u32);
    for _ in 0..n {
        out.push(ITOA64[(v & 0x3f) as usize] as char);
        v >>= 6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apr1_crypt_is_deterministic_and_salt_sensitive() {
        let a = apr1_crypt("secret", "saltsalt");
        let b = apr1_crypt("secret", "saltsalt");
        assert_eq!(a, b);
        assert!(a.starts_with("$apr1$saltsalt$"));
        assert_ne!(a, apr1_crypt("secret", "othersalt"));
        assert_ne!(a, apr1_crypt("different", "saltsalt"));
    }

    #[test]
    fn load_rejects_non_apr1_entries() {
        let dir = std::env::temp_dir().join(format!("juggler-htpasswd-test-{}", std::process::id()));
        std::fs::write(&dir, "user:$6$notapr1$deadbeef\n").unwrap();
        let err = HtpasswdAuth::load(&dir).unwrap_err();
        std::fs::remove_file(&dir).ok();
        assert!(matches!(err, JugglerError::ConfigError(_)));
    }

    #[test]
    fn verify_caches_and_accepts_correct_password() {
        let hash = apr1_crypt("hunter2", "abcdefgh");
        let dir = std::env::temp_dir().join(format!("juggler-htpasswd-test-ok-{}", std::process::id()));
        std::fs::write(&dir, format!("alice:{hash}\n")).unwrap();
        let auth = HtpasswdAuth::load(&dir).unwrap();
        std::fs::remove_file(&dir).ok();

        assert!(auth.verify("alice", "hunter2"));
        assert!(!auth.verify("alice", "wrong"));
        assert!(!auth.verify("bob", "hunter2"));
        // Cached path still accepts the same correct password.
        assert!(auth.verify("alice", "hunter2"));
    }
}

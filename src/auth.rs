// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server-side request authentication: Basic and Digest-MD5 (`qop=auth`) as
//! described in RFC 2069/2617, applied to RTSP per RFC 2326 section 16.
//!
//! The client side of the exchange lives in [`crate::client`] and uses the
//! `digest_auth` crate; this module is the verifying half, with nonce
//! lifetime enforcement and nonce-count replay detection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;

/// Per-connection authentication state.
pub(crate) struct Authenticator {
    username: String,
    password: String,
    realm: String,
    use_digest: bool,

    nonce: String,
    nonce_created: Instant,
    nonce_ttl: Duration,

    /// `username|cnonce|nonce` -> highest accepted nc value.
    nc_seen: HashMap<String, u64>,
}

/// Why a request was rejected, with the challenge to send back.
#[derive(Debug)]
pub(crate) struct Challenge {
    pub(crate) www_authenticate: String,
    pub(crate) stale: bool,
}

impl Authenticator {
    pub(crate) fn new(
        username: &str,
        password: &str,
        realm: &str,
        use_digest: bool,
        nonce: Option<&str>,
        nonce_ttl: Duration,
    ) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
            realm: realm.to_owned(),
            use_digest,
            nonce: nonce
                .map(str::to_owned)
                .unwrap_or_else(|| format!("nonce-{}", generate_token())),
            nonce_created: Instant::now(),
            nonce_ttl,
            nc_seen: HashMap::new(),
        }
    }

    /// Verifies the `Authorization` header of a request.
    ///
    /// `method` is the RTSP method token; the digest URI comes from the
    /// client's own `uri=` parameter so it matches what the client hashed.
    pub(crate) fn check(
        &mut self,
        method: &str,
        authorization: Option<&str>,
    ) -> Result<(), Challenge> {
        if self.use_digest {
            self.check_digest(method, authorization)
        } else {
            self.check_basic(authorization)
        }
    }

    fn challenge(&self, stale: bool) -> Challenge {
        let www_authenticate = if self.use_digest {
            format!(
                "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"{}",
                self.realm,
                self.nonce,
                if stale { ", stale=true" } else { "" }
            )
        } else {
            format!("Basic realm=\"{}\"", self.realm)
        };
        Challenge {
            www_authenticate,
            stale,
        }
    }

    fn check_basic(&self, authorization: Option<&str>) -> Result<(), Challenge> {
        let encoded = authorization
            .and_then(|a| a.strip_prefix("Basic "))
            .ok_or_else(|| self.challenge(false))?;
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| self.challenge(false))?;
        let expected = format!("{}:{}", self.username, self.password);
        if !ct_eq(&decoded, expected.as_bytes()) {
            return Err(self.challenge(false));
        }
        Ok(())
    }

    fn check_digest(&mut self, method: &str, authorization: Option<&str>) -> Result<(), Challenge> {
        // Expired nonce: rotate, forget nc state, and ask the client to retry
        // with `stale=true` so it doesn't re-prompt for credentials.
        if self.nonce_created.elapsed() > self.nonce_ttl {
            self.nonce = format!("nonce-{}", generate_token());
            self.nonce_created = Instant::now();
            self.nc_seen.clear();
            return Err(self.challenge(true));
        }

        let params = authorization
            .and_then(|a| a.strip_prefix("Digest "))
            .map(parse_auth_params)
            .ok_or_else(|| self.challenge(false))?;

        let username = params.get("username").map(String::as_str).unwrap_or("");
        let realm = params.get("realm").map(String::as_str).unwrap_or("");
        let nonce = params.get("nonce").map(String::as_str).unwrap_or("");
        let uri = params.get("uri").map(String::as_str).unwrap_or("");
        let response = params.get("response").map(String::as_str).unwrap_or("");
        let qop = params.get("qop").map(String::as_str).unwrap_or("");

        if username.is_empty() || realm.is_empty() || nonce.is_empty() || uri.is_empty()
            || response.is_empty()
        {
            return Err(self.challenge(false));
        }
        if username != self.username || realm != self.realm || nonce != self.nonce {
            return Err(self.challenge(false));
        }

        let ha1 = md5_hex(format!("{}:{}:{}", self.username, self.realm, self.password));
        let ha2 = md5_hex(format!("{method}:{uri}"));
        let expected = if !qop.is_empty() {
            let nc = params.get("nc").map(String::as_str).unwrap_or("");
            let cnonce = params.get("cnonce").map(String::as_str).unwrap_or("");
            if nc.is_empty() || cnonce.is_empty() {
                return Err(self.challenge(false));
            }
            let nc_value = match u64::from_str_radix(nc, 16) {
                Ok(v) => v,
                Err(_) => return Err(self.challenge(false)),
            };
            // Replay check: nc must strictly increase per (user, cnonce, nonce).
            let nc_key = format!("{username}|{cnonce}|{nonce}");
            if let Some(&seen) = self.nc_seen.get(&nc_key) {
                if nc_value <= seen {
                    debug!("digest replay: nc {nc_value:08x} <= seen {seen:08x}");
                    return Err(self.challenge(false));
                }
            }
            self.nc_seen.insert(nc_key, nc_value);
            md5_hex(format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"))
        } else {
            md5_hex(format!("{ha1}:{nonce}:{ha2}"))
        };

        if !ct_eq(expected.as_bytes(), response.as_bytes()) {
            return Err(self.challenge(false));
        }
        Ok(())
    }
}

pub(crate) fn md5_hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(data.as_ref()))
}

/// A short random token for nonces and session ids.
pub(crate) fn generate_token() -> String {
    let v: u64 = rand::random();
    let c: u32 = rand::random();
    format!("{v:016x}{c:08x}")
}

/// Constant-time byte comparison. Folds over the full length of both inputs
/// so the comparison time doesn't depend on where a mismatch occurs.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Parses the comma-separated `key=value` / `key="value"` list of an
/// `Authorization` or `WWW-Authenticate` header.
pub(crate) fn parse_auth_params(value: &str) -> HashMap<String, String> {
    let mut kv = HashMap::new();
    let bytes = value.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b',') {
            pos += 1;
        }
        let Some(eq) = value[pos..].find('=').map(|i| i + pos) else {
            break;
        };
        let key = value[pos..eq].trim().to_owned();
        pos = eq + 1;
        let val;
        if pos < bytes.len() && bytes[pos] == b'"' {
            let Some(endq) = value[pos + 1..].find('"').map(|i| i + pos + 1) else {
                break;
            };
            val = value[pos + 1..endq].to_owned();
            pos = endq + 1;
        } else {
            match value[pos..].find(',') {
                None => {
                    val = value[pos..].trim().to_owned();
                    pos = bytes.len();
                }
                Some(comma) => {
                    val = value[pos..pos + comma].trim().to_owned();
                    pos += comma + 1;
                }
            }
        }
        kv.insert(key, val);
    }
    kv
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    /// Computes the digest a well-behaved client would send.
    fn client_response(
        user: &str,
        pass: &str,
        realm: &str,
        nonce: &str,
        method: &str,
        uri: &str,
        nc: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(format!("{user}:{realm}:{pass}"));
        let ha2 = md5_hex(format!("{method}:{uri}"));
        md5_hex(format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"))
    }

    fn digest_header(nonce: &str, nc: &str, cnonce: &str) -> String {
        let response = client_response(
            "admin",
            "secret",
            "RTSP Server",
            nonce,
            "DESCRIBE",
            "rtsp://h/s",
            nc,
            cnonce,
        );
        format!(
            "Digest username=\"admin\", realm=\"RTSP Server\", nonce=\"{nonce}\", \
             uri=\"rtsp://h/s\", response=\"{response}\", qop=auth, nc={nc}, cnonce=\"{cnonce}\""
        )
    }

    fn digest_auth() -> Authenticator {
        Authenticator::new(
            "admin",
            "secret",
            "RTSP Server",
            true,
            Some("fixednonce123"),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn md5_empty_string() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn base64_roundtrip() {
        let b64 = base64::engine::general_purpose::STANDARD;
        for input in [&b""[..], b"a", b"ab", b"abc", &[0u8, 255, 128, 7]] {
            assert_eq!(b64.decode(b64.encode(input)).unwrap(), input);
        }
    }

    #[test]
    fn basic_accepts_good_credentials() {
        let mut a = Authenticator::new(
            "user",
            "pw",
            "r",
            false,
            None,
            Duration::from_secs(60),
        );
        let b64 = base64::engine::general_purpose::STANDARD;
        let header = format!("Basic {}", b64.encode("user:pw"));
        a.check("DESCRIBE", Some(&header)).unwrap();

        let bad = format!("Basic {}", b64.encode("user:nope"));
        let ch = a.check("DESCRIBE", Some(&bad)).unwrap_err();
        assert_eq!(ch.www_authenticate, "Basic realm=\"r\"");
        assert!(!ch.stale);
    }

    #[test]
    fn digest_accepts_and_rejects() {
        let mut a = digest_auth();
        a.check("DESCRIBE", Some(&digest_header("fixednonce123", "00000001", "abc")))
            .unwrap();

        // Wrong password -> different response hash.
        let response = client_response(
            "admin", "wrong", "RTSP Server", "fixednonce123", "DESCRIBE", "rtsp://h/s",
            "00000002", "abc",
        );
        let header = format!(
            "Digest username=\"admin\", realm=\"RTSP Server\", nonce=\"fixednonce123\", \
             uri=\"rtsp://h/s\", response=\"{response}\", qop=auth, nc=00000002, cnonce=\"abc\""
        );
        a.check("DESCRIBE", Some(&header)).unwrap_err();
    }

    #[test]
    fn digest_missing_header_challenges() {
        let mut a = digest_auth();
        let ch = a.check("DESCRIBE", None).unwrap_err();
        assert!(ch.www_authenticate.contains("nonce=\"fixednonce123\""));
        assert!(ch.www_authenticate.contains("qop=\"auth\""));
        assert!(!ch.stale);
    }

    #[test]
    fn nc_replay_rejected() {
        let mut a = digest_auth();
        a.check("DESCRIBE", Some(&digest_header("fixednonce123", "00000002", "abc")))
            .unwrap();
        // Same nc again -> replay.
        a.check("DESCRIBE", Some(&digest_header("fixednonce123", "00000002", "abc")))
            .unwrap_err();
        // Lower nc -> replay.
        a.check("DESCRIBE", Some(&digest_header("fixednonce123", "00000001", "abc")))
            .unwrap_err();
        // Higher nc -> accepted; recorded maximum strictly increases.
        a.check("DESCRIBE", Some(&digest_header("fixednonce123", "00000003", "abc")))
            .unwrap();
        // A different cnonce keys its own counter.
        a.check("DESCRIBE", Some(&digest_header("fixednonce123", "00000001", "xyz")))
            .unwrap();
    }

    #[test]
    fn stale_nonce_rotates() {
        let mut a = Authenticator::new(
            "admin",
            "secret",
            "RTSP Server",
            true,
            Some("fixednonce123"),
            Duration::from_millis(1),
        );
        std::thread::sleep(Duration::from_millis(5));
        let ch = a
            .check("DESCRIBE", Some(&digest_header("fixednonce123", "00000001", "abc")))
            .unwrap_err();
        assert!(ch.stale);
        assert!(ch.www_authenticate.contains("stale=true"));
        assert!(!ch.www_authenticate.contains("fixednonce123"));

        // The new nonce is usable immediately.
        let nonce = a.nonce.clone();
        a.check("DESCRIBE", Some(&digest_header(&nonce, "00000001", "abc")))
            .unwrap();
    }

    #[test]
    fn parses_quoted_and_bare_params() {
        let kv = parse_auth_params(
            "username=\"u, with comma\", realm=\"r\", qop=auth, nc=00000001, uri=\"rtsp://h/s\"",
        );
        assert_eq!(kv["username"], "u, with comma");
        assert_eq!(kv["realm"], "r");
        assert_eq!(kv["qop"], "auth");
        assert_eq!(kv["nc"], "00000001");
        assert_eq!(kv["uri"], "rtsp://h/s");
    }
}

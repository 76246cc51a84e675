//! The secrets file: whitespace-separated `side type id secret` rows.
//!
//! ```text
//! # side     type     id      secret
//! server     plain    alice   sesame
//! server     md5      bob     3q2+7w==
//! client     plain    relay   hunter+32
//! pop        plain    carol   pop+20pass
//! ```
//!
//! `id` and `secret` are xtext-encoded, except that `plain:b` rows
//! carry both base64-encoded and hashed-key rows carry a base64
//! secret. A `server.login`-style side field restricts the row to one
//! mechanism.

use std::{fmt, path::Path};

use crate::{HashKind, Mechanism};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use smtp_proto::xtext_decode;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    Client,
    Server,
    Pop,
}

impl Side {
    fn parse(s: &str) -> Option<Side> {
        if s.eq_ignore_ascii_case("client") {
            Some(Side::Client)
        } else if s.eq_ignore_ascii_case("server") {
            Some(Side::Server)
        } else if s.eq_ignore_ascii_case("pop") {
            Some(Side::Pop)
        } else {
            None
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Side::Client => "client",
            Side::Server => "server",
            Side::Pop => "pop",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecretKind {
    /// The clear-text secret; serves every mechanism.
    Plain,
    /// A pre-hashed HMAC key; serves only the matching CRAM mechanism.
    HmacKey(HashKind),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Secret {
    pub id: String,
    pub value: Vec<u8>,
    pub kind: SecretKind,
}

#[derive(Debug)]
struct Row {
    side: Side,
    /// From a `server.login`-style side field.
    restrict: Option<Mechanism>,
    secret: Secret,
}

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("reading secrets file ‘{0}’")]
    Io(String, #[source] std::io::Error),

    #[error("secrets line {0}: {1}")]
    Bad(usize, String),

    #[error("pam secrets backend is not supported")]
    PamUnsupported,
}

#[derive(Debug, Default)]
pub struct Secrets {
    rows: Vec<Row>,
}

impl Secrets {
    pub fn load(path: &Path) -> Result<Secrets, SecretsError> {
        if path.to_str() == Some("pam:") {
            return Err(SecretsError::PamUnsupported);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| SecretsError::Io(path.display().to_string(), e))?;
        Secrets::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Secrets, SecretsError> {
        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let lineno = idx + 1;
            let bad = |msg: &str| SecretsError::Bad(lineno, msg.to_owned());
            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            if fields.len() != 4 {
                return Err(bad("expected 4 fields: side type id secret"));
            }
            let (side_field, type_field, id_field, secret_field) =
                (fields[0], fields[1], fields[2], fields[3]);

            let (side_name, restrict) = match side_field.split_once('.') {
                Some((s, m)) => {
                    let m = Mechanism::parse(m)
                        .ok_or_else(|| bad("unknown mechanism restriction"))?;
                    (s, Some(m))
                }
                None => (side_field, None),
            };
            let side = Side::parse(side_name).ok_or_else(|| bad("unknown side"))?;

            let (kind, base64_fields) = parse_type(type_field).ok_or_else(|| bad("unknown type"))?;

            let id_raw = if base64_fields {
                BASE64
                    .decode(id_field)
                    .map_err(|_| bad("id is not valid base64"))?
            } else {
                xtext_decode(id_field).map_err(|_| bad("id is not valid xtext"))?
            };
            let id =
                String::from_utf8(id_raw).map_err(|_| bad("id is not valid utf-8"))?;

            let value = match kind {
                SecretKind::Plain if !base64_fields => xtext_decode(secret_field)
                    .map_err(|_| bad("secret is not valid xtext"))?,
                _ => BASE64
                    .decode(secret_field)
                    .map_err(|_| bad("secret is not valid base64"))?,
            };

            rows.push(Row {
                side,
                restrict,
                secret: Secret { id, value, kind },
            });
        }
        Ok(Secrets { rows })
    }

    /// True if any row exists for `side` (drives the "authentication
    /// required" policy).
    pub fn any_for(&self, side: Side) -> bool {
        self.rows.iter().any(|r| r.side == side)
    }

    /// Mechanisms the server can actually verify for `side`.
    pub fn server_mechanisms(&self, side: Side) -> Vec<Mechanism> {
        Mechanism::ALL
            .iter()
            .copied()
            .filter(|&m| {
                self.rows
                    .iter()
                    .any(|r| r.side == side && r.serves(m))
            })
            .collect()
    }

    /// The secret verifying `id` under `mechanism`, if any.
    pub fn lookup(&self, side: Side, mechanism: Mechanism, id: &str) -> Option<&Secret> {
        // A pre-hashed key beats the plain secret for its mechanism
        self.rows
            .iter()
            .filter(|r| r.side == side && r.secret.id == id && r.serves(mechanism))
            .max_by_key(|r| matches!(r.secret.kind, SecretKind::HmacKey(_)))
            .map(|r| &r.secret)
    }

    /// The client-side secret to use under `mechanism`, if any.
    pub fn client_secret(&self, mechanism: Mechanism) -> Option<&Secret> {
        self.rows
            .iter()
            .filter(|r| r.side == Side::Client && r.serves(mechanism))
            .max_by_key(|r| matches!(r.secret.kind, SecretKind::HmacKey(_)))
            .map(|r| &r.secret)
    }
}

impl Row {
    fn serves(&self, mechanism: Mechanism) -> bool {
        if let Some(only) = self.restrict {
            if only != mechanism {
                return false;
            }
        }
        match self.secret.kind {
            SecretKind::Plain => true,
            SecretKind::HmacKey(hash) => mechanism.cram_hash() == Some(hash),
        }
    }
}

fn parse_type(s: &str) -> Option<(SecretKind, bool)> {
    if s.eq_ignore_ascii_case("plain") {
        Some((SecretKind::Plain, false))
    } else if s.eq_ignore_ascii_case("plain:b") {
        Some((SecretKind::Plain, true))
    } else if s.eq_ignore_ascii_case("md5") || s.eq_ignore_ascii_case("cram-md5") {
        Some((SecretKind::HmacKey(HashKind::Md5), false))
    } else if s.eq_ignore_ascii_case("sha1") || s.eq_ignore_ascii_case("cram-sha1") {
        Some((SecretKind::HmacKey(HashKind::Sha1), false))
    } else if s.eq_ignore_ascii_case("sha256") || s.eq_ignore_ascii_case("cram-sha256") {
        Some((SecretKind::HmacKey(HashKind::Sha256), false))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_typical_file() {
        let s = Secrets::parse(
            "# comment\n\
             \n\
             server plain alice sesame+20salt\n\
             server.login plain bob onlylogin\n\
             client plain relay hunter2\n\
             pop plain carol pw\n\
             server md5 dan 3q2+7w==\n",
        )
        .unwrap();
        assert!(s.any_for(Side::Server));
        assert!(s.any_for(Side::Client));
        assert!(s.any_for(Side::Pop));

        let alice = s.lookup(Side::Server, Mechanism::Plain, "alice").unwrap();
        assert_eq!(alice.value, b"sesame salt");

        // bob is restricted to LOGIN
        assert!(s.lookup(Side::Server, Mechanism::Plain, "bob").is_none());
        assert!(s.lookup(Side::Server, Mechanism::Login, "bob").is_some());

        // dan's key only serves CRAM-MD5
        assert!(s.lookup(Side::Server, Mechanism::Plain, "dan").is_none());
        let dan = s.lookup(Side::Server, Mechanism::CramMd5, "dan").unwrap();
        assert_eq!(dan.kind, SecretKind::HmacKey(HashKind::Md5));
        assert_eq!(dan.value, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn base64_rows() {
        let s = Secrets::parse("server plain:b YWxpY2U= c2VzYW1l\n").unwrap();
        let alice = s.lookup(Side::Server, Mechanism::Plain, "alice").unwrap();
        assert_eq!(alice.value, b"sesame");
    }

    #[test]
    fn advertised_mechanisms() {
        let s = Secrets::parse("server plain alice sesame\n").unwrap();
        assert_eq!(s.server_mechanisms(Side::Server), Mechanism::ALL.to_vec());

        let s = Secrets::parse("server md5 dan 3q2+7w==\n").unwrap();
        assert_eq!(
            s.server_mechanisms(Side::Server),
            vec![Mechanism::CramMd5]
        );
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Secrets::parse("server plain alice\n"),
            Err(SecretsError::Bad(1, _))
        ));
        assert!(matches!(
            Secrets::parse("elsewhere plain alice pw\n"),
            Err(SecretsError::Bad(1, _))
        ));
        assert!(matches!(
            Secrets::parse("server quantum alice pw\n"),
            Err(SecretsError::Bad(1, _))
        ));
        assert!(matches!(
            Secrets::parse("server plain alice bad=xtext\n"),
            Err(SecretsError::Bad(1, _))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempdir::TempDir::new("secrets-test").unwrap();
        let path = dir.path().join("auth");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "server plain alice sesame").unwrap();
        drop(f);
        let s = Secrets::load(&path).unwrap();
        assert!(s.any_for(Side::Server));
        assert!(matches!(
            Secrets::load(Path::new("pam:")),
            Err(SecretsError::PamUnsupported)
        ));
    }
}

//! SASL challenge/response machinery for the SMTP AUTH extension.
//!
//! Supports PLAIN, LOGIN and the CRAM family (MD5, SHA1, SHA256) on
//! both sides of the connection, backed by the secrets store of
//! [`secrets`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;

mod secrets;

pub use secrets::{Secret, SecretKind, Secrets, SecretsError, Side};

const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6"; // base64("Username:")
const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6"; // base64("Password:")

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
}

/// Mechanisms, in decreasing order of client preference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mechanism {
    CramSha256,
    CramSha1,
    CramMd5,
    Plain,
    Login,
}

impl Mechanism {
    pub const ALL: &'static [Mechanism] = &[
        Mechanism::CramSha256,
        Mechanism::CramSha1,
        Mechanism::CramMd5,
        Mechanism::Plain,
        Mechanism::Login,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::CramSha256 => "CRAM-SHA256",
            Mechanism::CramSha1 => "CRAM-SHA1",
            Mechanism::CramMd5 => "CRAM-MD5",
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
        }
    }

    pub fn parse(s: &str) -> Option<Mechanism> {
        Mechanism::ALL
            .iter()
            .copied()
            .find(|m| s.eq_ignore_ascii_case(m.as_str()))
    }

    /// Mechanisms that put the secret on the wire, and so are only
    /// offered over an encrypted channel unless explicitly allowed.
    pub fn sends_secret_in_clear(self) -> bool {
        matches!(self, Mechanism::Plain | Mechanism::Login)
    }

    pub fn cram_hash(self) -> Option<HashKind> {
        match self {
            Mechanism::CramSha256 => Some(HashKind::Sha256),
            Mechanism::CramSha1 => Some(HashKind::Sha1),
            Mechanism::CramMd5 => Some(HashKind::Md5),
            _ => None,
        }
    }
}

/// Generates per-process-unique CRAM challenges: monotonic counter,
/// process id and start time, scoped by the configured challenge
/// hostname.
#[derive(Debug)]
pub struct ChallengeSource {
    domain: String,
    pid: u32,
    start: u64,
    counter: std::sync::atomic::AtomicU64,
}

impl ChallengeSource {
    pub fn new(domain: impl Into<String>, pid: u32, start: u64) -> ChallengeSource {
        ChallengeSource {
            domain: domain.into(),
            pid,
            start,
            counter: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> String {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("<{}.{}.{}@{}>", n, self.pid, self.start, self.domain)
    }
}

/// One step of a server-side exchange.
#[derive(Debug, Eq, PartialEq)]
pub enum Step {
    /// Send `334 <data>` and feed the next client line back in.
    Challenge(String),
    /// `235`: the client is `id`.
    Success { id: String },
    /// `535`.
    Failure,
}

enum ServerState {
    Initial,
    WaitPlain,
    WaitLoginUser,
    WaitLoginPass { user: String },
    WaitCramResponse { challenge: String },
    Done,
}

/// Server side of one AUTH exchange.
pub struct ServerSession<'a> {
    mechanism: Mechanism,
    side: Side,
    secrets: &'a Secrets,
    state: ServerState,
}

impl<'a> ServerSession<'a> {
    pub fn new(mechanism: Mechanism, side: Side, secrets: &'a Secrets) -> ServerSession<'a> {
        ServerSession {
            mechanism,
            side,
            secrets,
            state: ServerState::Initial,
        }
    }

    /// Starts the exchange. `initial` is the optional initial response
    /// from the AUTH command line; `challenges` is consulted for the
    /// CRAM family.
    pub fn start(&mut self, initial: Option<&str>, challenges: &ChallengeSource) -> Step {
        match self.mechanism {
            Mechanism::Plain => match initial {
                Some(line) => self.check_plain(line),
                None => {
                    self.state = ServerState::WaitPlain;
                    Step::Challenge(String::new())
                }
            },
            Mechanism::Login => {
                // Some clients send the username as initial response
                if let Some(line) = initial {
                    self.state = ServerState::WaitLoginUser;
                    return self.respond(line);
                }
                self.state = ServerState::WaitLoginUser;
                Step::Challenge(LOGIN_USERNAME_PROMPT.to_owned())
            }
            _ => {
                if initial.is_some() {
                    self.state = ServerState::Done;
                    return Step::Failure;
                }
                let challenge = challenges.next();
                let encoded = BASE64.encode(challenge.as_bytes());
                self.state = ServerState::WaitCramResponse { challenge };
                Step::Challenge(encoded)
            }
        }
    }

    /// Feeds one client response line in.
    pub fn respond(&mut self, line: &str) -> Step {
        match std::mem::replace(&mut self.state, ServerState::Done) {
            ServerState::WaitPlain => self.check_plain(line),
            ServerState::WaitLoginUser => match decode_utf8(line) {
                Some(user) => {
                    self.state = ServerState::WaitLoginPass { user };
                    Step::Challenge(LOGIN_PASSWORD_PROMPT.to_owned())
                }
                None => Step::Failure,
            },
            ServerState::WaitLoginPass { user } => match decode_utf8(line) {
                Some(pass) => self.check_password(&user, pass.as_bytes()),
                None => Step::Failure,
            },
            ServerState::WaitCramResponse { challenge } => self.check_cram(&challenge, line),
            ServerState::Initial | ServerState::Done => Step::Failure,
        }
    }

    fn check_plain(&mut self, line: &str) -> Step {
        self.state = ServerState::Done;
        let raw = match BASE64.decode(line) {
            Ok(raw) => raw,
            Err(_) => return Step::Failure,
        };
        let mut fields = raw.split(|&b| b == 0);
        let (authzid, authcid, passwd) = match (fields.next(), fields.next(), fields.next()) {
            (Some(z), Some(c), Some(p)) if fields.next().is_none() => (z, c, p),
            _ => return Step::Failure,
        };
        if !authzid.is_empty() && authzid != authcid {
            return Step::Failure;
        }
        let user = match String::from_utf8(authcid.to_vec()) {
            Ok(u) => u,
            Err(_) => return Step::Failure,
        };
        self.check_password(&user, passwd)
    }

    fn check_password(&mut self, user: &str, passwd: &[u8]) -> Step {
        self.state = ServerState::Done;
        match self.secrets.lookup(self.side, self.mechanism, user) {
            Some(secret) if secret.kind == SecretKind::Plain && secret.value == passwd => {
                Step::Success {
                    id: user.to_owned(),
                }
            }
            _ => Step::Failure,
        }
    }

    fn check_cram(&mut self, challenge: &str, line: &str) -> Step {
        self.state = ServerState::Done;
        let hash = match self.mechanism.cram_hash() {
            Some(h) => h,
            None => return Step::Failure,
        };
        let raw = match BASE64.decode(line) {
            Ok(raw) => raw,
            Err(_) => return Step::Failure,
        };
        let raw = match String::from_utf8(raw) {
            Ok(s) => s,
            Err(_) => return Step::Failure,
        };
        let (user, digest) = match raw.rsplit_once(' ') {
            Some(pair) => pair,
            None => return Step::Failure,
        };
        let key = match self.secrets.lookup(self.side, self.mechanism, user) {
            Some(secret) => &secret.value,
            None => return Step::Failure,
        };
        if hmac_hex(hash, key, challenge.as_bytes()).eq_ignore_ascii_case(digest) {
            Step::Success {
                id: user.to_owned(),
            }
        } else {
            Step::Failure
        }
    }
}

/// Client-side initial response, where the mechanism has one.
pub fn client_initial(mechanism: Mechanism, secret: &Secret) -> Option<String> {
    match mechanism {
        Mechanism::Plain => {
            let mut raw = Vec::with_capacity(secret.id.len() + secret.value.len() + 2);
            raw.push(0);
            raw.extend_from_slice(secret.id.as_bytes());
            raw.push(0);
            raw.extend_from_slice(&secret.value);
            Some(BASE64.encode(raw))
        }
        _ => None,
    }
}

/// Client-side answer to a `334` challenge line.
pub fn client_respond(
    mechanism: Mechanism,
    secret: &Secret,
    challenge_b64: &str,
) -> Option<String> {
    match mechanism {
        Mechanism::Plain => client_initial(mechanism, secret),
        Mechanism::Login => {
            if challenge_b64 == LOGIN_USERNAME_PROMPT {
                Some(BASE64.encode(secret.id.as_bytes()))
            } else {
                Some(BASE64.encode(&secret.value))
            }
        }
        _ => {
            let hash = mechanism.cram_hash()?;
            let challenge = BASE64.decode(challenge_b64).ok()?;
            let digest = hmac_hex(hash, &secret.value, &challenge);
            Some(BASE64.encode(format!("{} {}", secret.id, digest).as_bytes()))
        }
    }
}

/// Picks the preferred mechanism the peer advertises and we hold a
/// client secret for.
pub fn choose_client_mechanism(advertised: &[String], secrets: &Secrets) -> Option<Mechanism> {
    Mechanism::ALL
        .iter()
        .copied()
        .filter(|m| advertised.iter().any(|a| a.eq_ignore_ascii_case(m.as_str())))
        .find(|&m| secrets.client_secret(m).is_some())
}

pub(crate) fn hmac_hex(kind: HashKind, key: &[u8], msg: &[u8]) -> String {
    // new_from_slice cannot fail: HMAC accepts keys of any length
    match kind {
        HashKind::Md5 => {
            let mut mac = Hmac::<Md5>::new_from_slice(key).expect("any key length");
            mac.update(msg);
            hex(&mac.finalize().into_bytes())
        }
        HashKind::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("any key length");
            mac.update(msg);
            hex(&mac.finalize().into_bytes())
        }
        HashKind::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("any key length");
            mac.update(msg);
            hex(&mac.finalize().into_bytes())
        }
    }
}

fn hex(out: &[u8]) -> String {
    let mut hex = String::with_capacity(out.len() * 2);
    for b in out {
        hex.push_str(&format!("{:02x}", b));
    }
    hex
}

fn decode_utf8(line: &str) -> Option<String> {
    BASE64
        .decode(line)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> Secrets {
        Secrets::parse(
            "server plain alice sesame\n\
             server plain:b bob cGFzcw==\n\
             client plain carol letmein\n",
        )
        .unwrap()
    }

    fn challenges() -> ChallengeSource {
        ChallengeSource::new("mail.example.org", 42, 1700000000)
    }

    #[test]
    fn plain_with_initial_response() {
        let secrets = secrets();
        let mut s = ServerSession::new(Mechanism::Plain, Side::Server, &secrets);
        let initial = BASE64.encode(b"\0alice\0sesame");
        assert_eq!(
            s.start(Some(&initial), &challenges()),
            Step::Success {
                id: "alice".to_owned()
            }
        );
    }

    #[test]
    fn plain_two_step() {
        let secrets = secrets();
        let mut s = ServerSession::new(Mechanism::Plain, Side::Server, &secrets);
        assert_eq!(s.start(None, &challenges()), Step::Challenge(String::new()));
        let resp = BASE64.encode(b"\0bob\0pass");
        assert_eq!(
            s.respond(&resp),
            Step::Success {
                id: "bob".to_owned()
            }
        );
    }

    #[test]
    fn plain_bad_password() {
        let secrets = secrets();
        let mut s = ServerSession::new(Mechanism::Plain, Side::Server, &secrets);
        let initial = BASE64.encode(b"\0alice\0wrong");
        assert_eq!(s.start(Some(&initial), &challenges()), Step::Failure);
    }

    #[test]
    fn login_flow() {
        let secrets = secrets();
        let mut s = ServerSession::new(Mechanism::Login, Side::Server, &secrets);
        assert_eq!(
            s.start(None, &challenges()),
            Step::Challenge(LOGIN_USERNAME_PROMPT.to_owned())
        );
        assert_eq!(
            s.respond(&BASE64.encode(b"alice")),
            Step::Challenge(LOGIN_PASSWORD_PROMPT.to_owned())
        );
        assert_eq!(
            s.respond(&BASE64.encode(b"sesame")),
            Step::Success {
                id: "alice".to_owned()
            }
        );
    }

    #[test]
    fn cram_md5_round() {
        let secrets = secrets();
        let source = challenges();
        let mut s = ServerSession::new(Mechanism::CramMd5, Side::Server, &secrets);
        let challenge_b64 = match s.start(None, &source) {
            Step::Challenge(c) => c,
            other => panic!("got {:?}", other),
        };
        // Forge the client side with the shared secret
        let client_secret = Secret {
            id: "alice".to_owned(),
            value: b"sesame".to_vec(),
            kind: SecretKind::Plain,
        };
        let resp = client_respond(Mechanism::CramMd5, &client_secret, &challenge_b64).unwrap();
        assert_eq!(
            s.respond(&resp),
            Step::Success {
                id: "alice".to_owned()
            }
        );
    }

    #[test]
    fn cram_challenges_are_unique() {
        let source = challenges();
        assert_ne!(source.next(), source.next());
    }

    #[test]
    fn mechanism_preference() {
        let secrets = secrets();
        let advertised = vec!["LOGIN".to_owned(), "PLAIN".to_owned(), "CRAM-MD5".to_owned()];
        // carol only has a plain secret, which serves every mechanism;
        // the CRAM family wins by preference.
        assert_eq!(
            choose_client_mechanism(&advertised, &secrets),
            Some(Mechanism::CramMd5)
        );
        assert_eq!(
            choose_client_mechanism(&["LOGIN".to_owned()], &secrets),
            Some(Mechanism::Login)
        );
        assert_eq!(choose_client_mechanism(&["GSSAPI".to_owned()], &secrets), None);
    }

    #[test]
    fn known_hmac_md5_vector() {
        // RFC 2195 §2 example
        let digest = hmac_hex(
            HashKind::Md5,
            b"tanstaaftanstaaf",
            b"<1896.697170952@postoffice.reston.mci.net>",
        );
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }
}

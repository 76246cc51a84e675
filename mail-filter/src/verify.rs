//! Per-RCPT address verification.
//!
//! The verifier classifies one recipient as local (with a mailbox
//! name), remote (possibly rewritten), invalid, temporarily
//! unverifiable, or tells the server to drop the connection.

use std::{path::PathBuf, str::FromStr, time::Duration};

use futures::{AsyncReadExt, AsyncWriteExt};
use smol::future::FutureExt;
use tracing::warn;

use crate::{read_one_line, timed_out, BadFilterSpec};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerifyStatus {
    Local { mailbox: String, fullname: String },
    Remote { address: String },
    Invalid { reason: String },
    Temporary { reason: String },
    Abort,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerifierSpec {
    /// `file:<path>`: run an executable; request fields arrive in the
    /// environment, classification in the exit code:
    /// 0 local (stdout: mailbox, fullname), 1 remote (stdout:
    /// optional rewritten address), 2..99 invalid, 100 abort, others
    /// temporary.
    File(PathBuf),
    /// `net:<host:port>`: send `<address>\n`, read one line back:
    /// `ok`, `local <mailbox> [fullname]`, `temporary <reason>`, or
    /// anything else as an invalid-reason.
    Net(String),
    /// `exit:<n>`: fixed classification, same code mapping as `file:`.
    Exit(i32),
}

impl FromStr for VerifierSpec {
    type Err = BadFilterSpec;

    fn from_str(s: &str) -> Result<VerifierSpec, BadFilterSpec> {
        if let Some(path) = s.strip_prefix("file:") {
            Ok(VerifierSpec::File(path.into()))
        } else if let Some(addr) = s.strip_prefix("net:") {
            Ok(VerifierSpec::Net(addr.to_owned()))
        } else if let Some(code) = s.strip_prefix("exit:") {
            Ok(VerifierSpec::Exit(
                code.parse().map_err(|_| BadFilterSpec(s.to_owned()))?,
            ))
        } else if !s.is_empty() && !s.contains(':') {
            Ok(VerifierSpec::File(s.into()))
        } else {
            Err(BadFilterSpec(s.to_owned()))
        }
    }
}

/// The fields handed to an external verifier.
#[derive(Debug)]
pub struct VerifyRequest<'a> {
    pub address: &'a str,
    pub domain: &'a str,
    /// Submitter peer address.
    pub client: &'a str,
    /// Authentication id of the submitter, empty if unauthenticated.
    pub auth: &'a str,
}

#[derive(Clone, Debug)]
pub struct Verifier {
    spec: Option<VerifierSpec>,
    timeout: Duration,
}

impl Verifier {
    pub fn new(spec: VerifierSpec, timeout: Duration) -> Verifier {
        Verifier {
            spec: Some(spec),
            timeout,
        }
    }

    /// The default verifier of a relay: every recipient is remote.
    pub fn allow_all() -> Verifier {
        Verifier {
            spec: None,
            timeout: Duration::from_secs(0),
        }
    }

    pub async fn verify(&self, req: &VerifyRequest<'_>) -> VerifyStatus {
        match &self.spec {
            None => VerifyStatus::Remote {
                address: req.address.to_owned(),
            },
            Some(VerifierSpec::Exit(code)) => exit_status(*code, req, &[]),
            Some(VerifierSpec::File(path)) => self.run_program(path, req).await,
            Some(VerifierSpec::Net(addr)) => self.run_net(addr, req).await,
        }
    }

    async fn run_program(&self, path: &std::path::Path, req: &VerifyRequest<'_>) -> VerifyStatus {
        let mut child = match smol::process::Command::new(path)
            .env("ADDRESS", req.address)
            .env("DOMAIN", req.domain)
            .env("CLIENT", req.client)
            .env("AUTH", req.auth)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(error = ?e, path = %path.display(), "cannot start verifier");
                return VerifyStatus::Temporary {
                    reason: format!("cannot start verifier: {}", e),
                };
            }
        };
        let mut stdout = child.stdout.take();
        let run = async {
            let mut out = String::new();
            if let Some(pipe) = &mut stdout {
                let _ = pipe.read_to_string(&mut out).await;
            }
            let status = child.status().await?;
            Ok::<_, std::io::Error>((status, out))
        };
        let res = run.or(timed_out(self.timeout)).await;
        match res {
            Ok((status, out)) => {
                let lines: Vec<&str> = out.lines().map(str::trim).collect();
                match status.code() {
                    Some(code) => exit_status(code, req, &lines),
                    None => VerifyStatus::Temporary {
                        reason: "verifier killed by signal".to_owned(),
                    },
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                let _ = child.kill();
                VerifyStatus::Temporary {
                    reason: "verifier timed out".to_owned(),
                }
            }
            Err(e) => VerifyStatus::Temporary {
                reason: format!("verifier failed: {}", e),
            },
        }
    }

    async fn run_net(&self, addr: &str, req: &VerifyRequest<'_>) -> VerifyStatus {
        let exchange = async {
            let mut io = smol::net::TcpStream::connect(addr).await?;
            io.write_all(format!("{}\n", req.address).as_bytes()).await?;
            io.flush().await?;
            read_one_line(&mut io).await
        };
        match exchange.or(timed_out(self.timeout)).await {
            Ok(reply) => parse_net_reply(reply.trim(), req),
            Err(e) => VerifyStatus::Temporary {
                reason: format!("network verifier failed: {}", e),
            },
        }
    }
}

fn exit_status(code: i32, req: &VerifyRequest<'_>, stdout: &[&str]) -> VerifyStatus {
    match code {
        0 => VerifyStatus::Local {
            mailbox: stdout
                .first()
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .unwrap_or_else(|| localpart_of(req.address)),
            fullname: stdout.get(1).map(|l| l.to_string()).unwrap_or_default(),
        },
        1 => VerifyStatus::Remote {
            address: stdout
                .first()
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .unwrap_or_else(|| req.address.to_owned()),
        },
        100 => VerifyStatus::Abort,
        2..=99 => VerifyStatus::Invalid {
            reason: stdout
                .first()
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .unwrap_or_else(|| "invalid recipient".to_owned()),
        },
        _ => VerifyStatus::Temporary {
            reason: format!("verifier exit code {}", code),
        },
    }
}

fn parse_net_reply(reply: &str, req: &VerifyRequest<'_>) -> VerifyStatus {
    if reply.is_empty() || reply.eq_ignore_ascii_case("ok") {
        return VerifyStatus::Remote {
            address: req.address.to_owned(),
        };
    }
    let (word, rest) = match reply.split_once(' ') {
        Some((w, r)) => (w, r.trim()),
        None => (reply, ""),
    };
    if word.eq_ignore_ascii_case("local") {
        let (mailbox, fullname) = match rest.split_once(' ') {
            Some((m, f)) => (m.to_owned(), f.trim().to_owned()),
            None if !rest.is_empty() => (rest.to_owned(), String::new()),
            None => (localpart_of(req.address), String::new()),
        };
        VerifyStatus::Local { mailbox, fullname }
    } else if word.eq_ignore_ascii_case("temporary") {
        VerifyStatus::Temporary {
            reason: if rest.is_empty() {
                "temporarily unverifiable".to_owned()
            } else {
                rest.to_owned()
            },
        }
    } else {
        VerifyStatus::Invalid {
            reason: reply.to_owned(),
        }
    }
}

fn localpart_of(address: &str) -> String {
    address
        .split('@')
        .next()
        .unwrap_or(address)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req<'a>() -> VerifyRequest<'a> {
        VerifyRequest {
            address: "alice@here.example",
            domain: "here.example",
            client: "192.0.2.1:1234",
            auth: "",
        }
    }

    #[test]
    fn default_is_remote() {
        smol::block_on(async {
            let v = Verifier::allow_all();
            assert_eq!(
                v.verify(&req()).await,
                VerifyStatus::Remote {
                    address: "alice@here.example".to_owned()
                }
            );
        });
    }

    #[test]
    fn exit_codes() {
        smol::block_on(async {
            let local = Verifier::new(VerifierSpec::Exit(0), Duration::from_secs(1));
            assert_eq!(
                local.verify(&req()).await,
                VerifyStatus::Local {
                    mailbox: "alice".to_owned(),
                    fullname: String::new()
                }
            );
            let abort = Verifier::new(VerifierSpec::Exit(100), Duration::from_secs(1));
            assert_eq!(abort.verify(&req()).await, VerifyStatus::Abort);
            let invalid = Verifier::new(VerifierSpec::Exit(2), Duration::from_secs(1));
            assert!(matches!(
                invalid.verify(&req()).await,
                VerifyStatus::Invalid { .. }
            ));
        });
    }

    #[cfg(unix)]
    #[test]
    fn program_verifier_local() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempdir::TempDir::new("verify-test").unwrap();
        let script = tmp.path().join("verify.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             [ \"$ADDRESS\" = \"alice@here.example\" ] || exit 3\n\
             echo alice\n\
             echo Alice Example\n\
             exit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        smol::block_on(async {
            let v = Verifier::new(VerifierSpec::File(script), Duration::from_secs(10));
            assert_eq!(
                v.verify(&req()).await,
                VerifyStatus::Local {
                    mailbox: "alice".to_owned(),
                    fullname: "Alice Example".to_owned()
                }
            );
        });
    }

    #[test]
    fn net_replies() {
        assert_eq!(
            parse_net_reply("ok", &req()),
            VerifyStatus::Remote {
                address: "alice@here.example".to_owned()
            }
        );
        assert_eq!(
            parse_net_reply("local alice Alice Example", &req()),
            VerifyStatus::Local {
                mailbox: "alice".to_owned(),
                fullname: "Alice Example".to_owned()
            }
        );
        assert!(matches!(
            parse_net_reply("temporary backend down", &req()),
            VerifyStatus::Temporary { .. }
        ));
        assert!(matches!(
            parse_net_reply("no such user", &req()),
            VerifyStatus::Invalid { .. }
        ));
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(
            "net:127.0.0.1:10102".parse::<VerifierSpec>().unwrap(),
            VerifierSpec::Net("127.0.0.1:10102".to_owned())
        );
        assert_eq!(
            "exit:1".parse::<VerifierSpec>().unwrap(),
            VerifierSpec::Exit(1)
        );
        assert!("spam:x".parse::<VerifierSpec>().is_err());
    }
}

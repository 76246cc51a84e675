//! Filter and verifier dispatch.
//!
//! A filter inspects (and may rewrite or reject) a just-committed
//! spool message; a verifier classifies one RCPT address. Both may be
//! an external program, a network helper or a built-in action, and
//! both are bounded by a timeout that kills the helper.

use std::{path::PathBuf, str::FromStr, time::Duration};

use futures::{AsyncReadExt, AsyncWriteExt};
use smol::future::FutureExt;
use tracing::{debug, warn};

use mail_spool::{MessageId, Store};

mod deliver;
mod spam;
mod verify;

pub use verify::{Verifier, VerifierSpec, VerifyRequest, VerifyStatus};

/// What a filter decided about a message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Ok,
    /// Accept, and tell the store that unknown entries may have
    /// appeared (filter exit code 103).
    OkAndRescan,
    Reject(String),
    /// Keep the spooled message but answer the submitter with a
    /// failure (reception), or stop processing the message silently
    /// (forwarding). Exit code 100.
    Abandon(String),
    Temporary(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FilterSpec {
    /// `file:<path>`: run an executable with the content and envelope
    /// paths as arguments.
    File(PathBuf),
    /// `net:<host:port>`: one-line exchange with a helper daemon.
    Net(String),
    /// `spam:<host:port>`: SpamAssassin verdict.
    Spam(String),
    /// `spam-edit:<host:port>`: SpamAssassin rewrite, always accepts.
    SpamEdit(String),
    /// `exit:<n>`: no-op with a fixed exit code.
    Exit(i32),
    /// Built-in local delivery (move).
    Deliver,
    /// Built-in local delivery (copy).
    Copy,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid filter specification ‘{0}’")]
pub struct BadFilterSpec(String);

impl FromStr for FilterSpec {
    type Err = BadFilterSpec;

    fn from_str(s: &str) -> Result<FilterSpec, BadFilterSpec> {
        let bad = || BadFilterSpec(s.to_owned());
        if let Some(path) = s.strip_prefix("file:") {
            Ok(FilterSpec::File(path.into()))
        } else if let Some(addr) = s.strip_prefix("net:") {
            Ok(FilterSpec::Net(addr.to_owned()))
        } else if let Some(addr) = s.strip_prefix("spam-edit:") {
            Ok(FilterSpec::SpamEdit(addr.to_owned()))
        } else if let Some(addr) = s.strip_prefix("spam:") {
            Ok(FilterSpec::Spam(addr.to_owned()))
        } else if let Some(code) = s.strip_prefix("exit:") {
            Ok(FilterSpec::Exit(code.parse().map_err(|_| bad())?))
        } else if s == "deliver:" {
            Ok(FilterSpec::Deliver)
        } else if s == "copy:" {
            Ok(FilterSpec::Copy)
        } else if !s.is_empty() && !s.contains(':') {
            // A bare path is shorthand for file:
            Ok(FilterSpec::File(s.into()))
        } else {
            Err(bad())
        }
    }
}

/// A configured filter, ready to run against spool messages.
#[derive(Clone, Debug)]
pub struct Filter {
    spec: FilterSpec,
    timeout: Duration,
    delivery_dir: Option<PathBuf>,
}

impl Filter {
    pub fn new(spec: FilterSpec, timeout: Duration) -> Filter {
        Filter {
            spec,
            timeout,
            delivery_dir: None,
        }
    }

    /// Where the deliver/copy built-ins place mailboxes.
    pub fn with_delivery_dir(mut self, dir: PathBuf) -> Filter {
        self.delivery_dir = Some(dir);
        self
    }

    /// Runs the filter on a committed message. All helper failures
    /// are temporary per the error model; the helper is killed when
    /// the timeout strikes.
    pub async fn run(&self, store: &Store, id: &MessageId) -> Outcome {
        debug!(id = %id, spec = ?self.spec, "running filter");
        match &self.spec {
            FilterSpec::Exit(code) => exit_code_outcome(*code, None),
            FilterSpec::File(path) => self.run_program(path, store, id).await,
            FilterSpec::Net(addr) => self.run_net(addr, store, id).await,
            FilterSpec::Spam(addr) => {
                spam::run(addr, store, id, false, self.timeout).await
            }
            FilterSpec::SpamEdit(addr) => {
                spam::run(addr, store, id, true, self.timeout).await
            }
            FilterSpec::Deliver => {
                deliver::run(store, id, self.delivery_dir.as_deref(), true).await
            }
            FilterSpec::Copy => {
                deliver::run(store, id, self.delivery_dir.as_deref(), false).await
            }
        }
    }

    async fn run_program(&self, path: &std::path::Path, store: &Store, id: &MessageId) -> Outcome {
        let mut child = match smol::process::Command::new(path)
            .arg(store.content_path(id))
            .arg(store.envelope_path(id))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(error = ?e, path = %path.display(), "cannot start filter");
                return Outcome::Temporary(format!("cannot start filter: {}", e));
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
            Ok((status, out)) => match status.code() {
                Some(code) => exit_code_outcome(code, first_line(&out)),
                None => Outcome::Temporary("filter killed by signal".to_owned()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                let _ = child.kill();
                Outcome::Temporary("filter timed out".to_owned())
            }
            Err(e) => Outcome::Temporary(format!("filter failed: {}", e)),
        }
    }

    async fn run_net(&self, addr: &str, store: &Store, id: &MessageId) -> Outcome {
        let exchange = async {
            let mut io = smol::net::TcpStream::connect(addr).await?;
            let mut line = store.content_path(id).display().to_string();
            line.push('\n');
            io.write_all(line.as_bytes()).await?;
            io.flush().await?;
            read_one_line(&mut io).await
        };
        match exchange.or(timed_out(self.timeout)).await {
            Ok(reply) => {
                let reply = reply.trim();
                if reply.is_empty() || reply.eq_ignore_ascii_case("ok") {
                    Outcome::Ok
                } else {
                    Outcome::Reject(reply.to_owned())
                }
            }
            Err(e) => Outcome::Temporary(format!("network filter failed: {}", e)),
        }
    }
}

fn exit_code_outcome(code: i32, stdout_line: Option<String>) -> Outcome {
    match code {
        0 => Outcome::Ok,
        103 => Outcome::OkAndRescan,
        100 => Outcome::Abandon(stdout_line.unwrap_or_else(|| "abandoned".to_owned())),
        1..=99 => Outcome::Reject(stdout_line.unwrap_or_else(|| "rejected".to_owned())),
        _ => Outcome::Temporary(
            stdout_line.unwrap_or_else(|| format!("filter exit code {}", code)),
        ),
    }
}

fn first_line(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.to_owned())
}

pub(crate) async fn read_one_line<R>(io: &mut R) -> std::io::Result<String>
where
    R: futures::AsyncRead + Unpin,
{
    let mut buf = smtp_proto::LineBuffer::new(smtp_proto::Terminator::Auto);
    let mut chunk = [0u8; 512];
    loop {
        if let Some(smtp_proto::Scanned::Line { data, .. }) = buf.next() {
            return Ok(String::from_utf8_lossy(&data).into_owned());
        }
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            // EOF without a newline still counts as the reply line
            return Ok(String::from_utf8_lossy(buf.fragment()).into_owned());
        }
        buf.add(&chunk[..n]);
    }
}

pub(crate) fn timed_out<T>(d: Duration) -> impl std::future::Future<Output = std::io::Result<T>> {
    async move {
        smol::Timer::after(d).await;
        Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "helper timed out",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_spool::Envelope;

    fn block_on<T>(f: impl std::future::Future<Output = T>) -> T {
        smol::block_on(f)
    }

    async fn store_with_message(dir: &std::path::Path) -> (Store, MessageId) {
        let store = Store::open(dir.to_owned()).await.unwrap();
        let mut w = store
            .new_message(Envelope {
                from: "u@a.example".to_owned(),
                from_is_local: true,
                client: "127.0.0.1:1".to_owned(),
                ..Envelope::default()
            })
            .await
            .unwrap();
        w.add_to("v@b.example", false);
        w.write_line(b"Subject: x").await.unwrap();
        let id = w.commit(false).await.unwrap();
        (store, id)
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(
            "file:/usr/local/bin/scan".parse::<FilterSpec>().unwrap(),
            FilterSpec::File("/usr/local/bin/scan".into())
        );
        assert_eq!(
            "net:127.0.0.1:10101".parse::<FilterSpec>().unwrap(),
            FilterSpec::Net("127.0.0.1:10101".to_owned())
        );
        assert_eq!(
            "spam:127.0.0.1:783".parse::<FilterSpec>().unwrap(),
            FilterSpec::Spam("127.0.0.1:783".to_owned())
        );
        assert_eq!(
            "spam-edit:127.0.0.1:783".parse::<FilterSpec>().unwrap(),
            FilterSpec::SpamEdit("127.0.0.1:783".to_owned())
        );
        assert_eq!("exit:73".parse::<FilterSpec>().unwrap(), FilterSpec::Exit(73));
        assert_eq!("deliver:".parse::<FilterSpec>().unwrap(), FilterSpec::Deliver);
        assert_eq!("copy:".parse::<FilterSpec>().unwrap(), FilterSpec::Copy);
        assert!("exit:many".parse::<FilterSpec>().is_err());
        assert!("gopher:x".parse::<FilterSpec>().is_err());
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(exit_code_outcome(0, None), Outcome::Ok);
        assert_eq!(exit_code_outcome(103, None), Outcome::OkAndRescan);
        assert_eq!(
            exit_code_outcome(73, None),
            Outcome::Reject("rejected".to_owned())
        );
        assert_eq!(
            exit_code_outcome(73, Some("no thanks".to_owned())),
            Outcome::Reject("no thanks".to_owned())
        );
        assert_eq!(
            exit_code_outcome(100, None),
            Outcome::Abandon("abandoned".to_owned())
        );
        assert!(matches!(exit_code_outcome(111, None), Outcome::Temporary(_)));
    }

    #[test]
    fn exit_filter() {
        let tmp = tempdir::TempDir::new("filter-test").unwrap();
        block_on(async {
            let (store, id) = store_with_message(tmp.path()).await;
            let filter = Filter::new(FilterSpec::Exit(73), Duration::from_secs(5));
            assert_eq!(
                filter.run(&store, &id).await,
                Outcome::Reject("rejected".to_owned())
            );
        });
    }

    #[cfg(unix)]
    #[test]
    fn executable_filter() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempdir::TempDir::new("filter-test").unwrap();
        let script = tmp.path().join("reject.sh");
        std::fs::write(&script, "#!/bin/sh\necho blocked by policy\nexit 42\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spool = tempdir::TempDir::new("filter-spool").unwrap();
        block_on(async {
            let (store, id) = store_with_message(spool.path()).await;
            let filter = Filter::new(FilterSpec::File(script.clone()), Duration::from_secs(10));
            assert_eq!(
                filter.run(&store, &id).await,
                Outcome::Reject("blocked by policy".to_owned())
            );
        });
    }

    #[cfg(unix)]
    #[test]
    fn executable_filter_sees_the_files() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempdir::TempDir::new("filter-test").unwrap();
        let script = tmp.path().join("check.sh");
        // Accept iff both argument files exist
        std::fs::write(
            &script,
            "#!/bin/sh\ntest -f \"$1\" || exit 9\ntest -f \"$2\" || exit 9\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spool = tempdir::TempDir::new("filter-spool").unwrap();
        block_on(async {
            let (store, id) = store_with_message(spool.path()).await;
            let filter = Filter::new(FilterSpec::File(script.clone()), Duration::from_secs(10));
            assert_eq!(filter.run(&store, &id).await, Outcome::Ok);
        });
    }

    #[test]
    fn net_filter() {
        let tmp = tempdir::TempDir::new("filter-test").unwrap();
        block_on(async {
            let (store, id) = store_with_message(tmp.path()).await;
            let listener = smol::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server = async {
                let (mut io, _) = listener.accept().await.unwrap();
                let line = read_one_line(&mut io).await.unwrap();
                assert!(line.ends_with(".content"));
                io.write_all(b"ok\n").await.unwrap();
            };
            let client = async {
                let filter =
                    Filter::new(FilterSpec::Net(addr.to_string()), Duration::from_secs(10));
                filter.run(&store, &id).await
            };
            let (_, outcome) = futures::join!(server, client);
            assert_eq!(outcome, Outcome::Ok);
        });
    }

    #[test]
    fn net_filter_reject_text() {
        let tmp = tempdir::TempDir::new("filter-test").unwrap();
        block_on(async {
            let (store, id) = store_with_message(tmp.path()).await;
            let listener = smol::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server = async {
                let (mut io, _) = listener.accept().await.unwrap();
                let _ = read_one_line(&mut io).await.unwrap();
                io.write_all(b"552 too fat\n").await.unwrap();
            };
            let client = async {
                let filter =
                    Filter::new(FilterSpec::Net(addr.to_string()), Duration::from_secs(10));
                filter.run(&store, &id).await
            };
            let (_, outcome) = futures::join!(server, client);
            assert_eq!(outcome, Outcome::Reject("552 too fat".to_owned()));
        });
    }
}

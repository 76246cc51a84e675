//! SpamAssassin (spamd) client, SPAMC protocol.
//!
//! `spam:` asks for a verdict with CHECK and rejects at or above the
//! spamd threshold; `spam-edit:` runs PROCESS, overwrites the content
//! file with the rewritten body and always accepts.

use std::time::Duration;

use futures::{AsyncReadExt, AsyncWriteExt};
use smol::future::FutureExt;
use tracing::debug;

use mail_spool::{MessageId, Store};
use smtp_proto::{LineBuffer, Scanned, Terminator};

use crate::{timed_out, Outcome};

pub(crate) async fn run(
    addr: &str,
    store: &Store,
    id: &MessageId,
    edit: bool,
    timeout: Duration,
) -> Outcome {
    match exchange(addr, store, id, edit).or(timed_out(timeout)).await {
        Ok(verdict) => {
            debug!(id = %id, spam = verdict.is_spam, score = verdict.score, "spamd verdict");
            if edit || !verdict.is_spam {
                Outcome::Ok
            } else {
                Outcome::Reject(format!(
                    "rejected as spam ({} / {})",
                    verdict.score, verdict.threshold
                ))
            }
        }
        Err(e) => Outcome::Temporary(format!("spamd failed: {}", e)),
    }
}

struct Verdict {
    is_spam: bool,
    score: f64,
    threshold: f64,
}

async fn exchange(
    addr: &str,
    store: &Store,
    id: &MessageId,
    edit: bool,
) -> std::io::Result<Verdict> {
    let size = store
        .content_size(id)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let mut content = store
        .open_content(id)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let mut io = smol::net::TcpStream::connect(addr).await?;
    let verb = if edit { "PROCESS" } else { "CHECK" };
    io.write_all(format!("{} SPAMC/1.5\r\nContent-length: {}\r\n\r\n", verb, size).as_bytes())
        .await?;
    futures::io::copy(&mut content, &mut io).await?;
    io.flush().await?;
    io.shutdown(std::net::Shutdown::Write)?;

    // Response: status line, headers, blank line, optional body
    let mut raw = Vec::new();
    io.read_to_end(&mut raw).await?;

    let mut lines = LineBuffer::new(Terminator::Auto);
    lines.add(&raw);
    let mut verdict = None;
    let mut in_headers = true;
    let mut body_start = 0usize;
    let mut consumed = 0usize;
    lines.apply(|item| {
        if let Scanned::Line { data, eol_len } = item {
            consumed += data.len() + eol_len;
            if in_headers {
                let line = String::from_utf8_lossy(&data);
                if line.is_empty() {
                    in_headers = false;
                    body_start = consumed;
                } else if let Some(value) = header_value(&line, "Spam") {
                    verdict = parse_spam_header(value);
                }
            }
        }
    });

    let verdict = verdict.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "no Spam header from spamd")
    })?;

    if edit {
        let body = &raw[body_start..];
        if body.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty body from spamd PROCESS",
            ));
        }
        store
            .replace_content(id, body)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    Ok(verdict)
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (k, v) = line.split_once(':')?;
    if k.trim().eq_ignore_ascii_case(name) {
        Some(v.trim())
    } else {
        None
    }
}

// "True ; 15.2 / 5.0"
fn parse_spam_header(value: &str) -> Option<Verdict> {
    let (flag, scores) = value.split_once(';')?;
    let (score, threshold) = scores.split_once('/')?;
    Some(Verdict {
        is_spam: flag.trim().eq_ignore_ascii_case("true")
            || flag.trim().eq_ignore_ascii_case("yes"),
        score: score.trim().parse().ok()?,
        threshold: threshold.trim().parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_spool::Envelope;

    #[test]
    fn spam_header_parsing() {
        let v = parse_spam_header("True ; 15.2 / 5.0").unwrap();
        assert!(v.is_spam);
        assert!((v.score - 15.2).abs() < f64::EPSILON);
        let v = parse_spam_header("False ; -1.0 / 5.0").unwrap();
        assert!(!v.is_spam);
        assert!(parse_spam_header("nonsense").is_none());
    }

    fn spamd_response(spam: bool, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "SPAMD/1.1 0 EX_OK\r\nSpam: {} ; 7.0 / 5.0\r\nContent-length: {}\r\n\r\n",
            if spam { "True" } else { "False" },
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    async fn spooled(dir: &std::path::Path) -> (Store, MessageId) {
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
        w.write_line(b"subject: buy things").await.unwrap();
        let id = w.commit(false).await.unwrap();
        (store, id)
    }

    #[test]
    fn verdict_rejects_spam() {
        let tmp = tempdir::TempDir::new("spam-test").unwrap();
        smol::block_on(async {
            let (store, id) = spooled(tmp.path()).await;
            let listener = smol::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();

            let server = async {
                let (mut io, _) = listener.accept().await.unwrap();
                let mut req = Vec::new();
                io.read_to_end(&mut req).await.unwrap();
                assert!(req.starts_with(b"CHECK SPAMC/1.5\r\n"));
                io.write_all(&spamd_response(true, b"")).await.unwrap();
            };
            let client = run(&addr, &store, &id, false, Duration::from_secs(10));
            let (_, outcome) = futures::join!(server, client);
            assert!(matches!(outcome, Outcome::Reject(_)));
        });
    }

    #[test]
    fn edit_rewrites_content() {
        let tmp = tempdir::TempDir::new("spam-test").unwrap();
        smol::block_on(async {
            let (store, id) = spooled(tmp.path()).await;
            let listener = smol::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();

            let server = async {
                let (mut io, _) = listener.accept().await.unwrap();
                let mut req = Vec::new();
                io.read_to_end(&mut req).await.unwrap();
                assert!(req.starts_with(b"PROCESS SPAMC/1.5\r\n"));
                io.write_all(&spamd_response(true, b"X-Spam-Flag: YES\r\n\r\nmarked\r\n"))
                    .await
                    .unwrap();
            };
            let client = run(&addr, &store, &id, true, Duration::from_secs(10));
            let (_, outcome) = futures::join!(server, client);
            assert_eq!(outcome, Outcome::Ok);
            let content = std::fs::read(store.content_path(&id)).unwrap();
            assert_eq!(content, b"X-Spam-Flag: YES\r\n\r\nmarked\r\n");
        });
    }
}

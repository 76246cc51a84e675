//! POP3 access to the spool: enough of RFC 1939 for a mail client to
//! collect what the relay has stored. Authentication comes from the
//! pop side of the secrets file; with `--pop-by-name` each user sees
//! the `<spool>/<user>` subdirectory instead of the spool itself.

use std::sync::Arc;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use mail_spool::{MessageId, Store};
use sasl::{Mechanism, SecretKind, Side};
use smtp_proto::{DotEscaper, LineBuffer, Scanned, Terminator};

use crate::unit::Unit;

struct Maildrop {
    store: Store,
    messages: Vec<(MessageId, u64)>,
    deleted: Vec<bool>,
}

pub async fn interact<IO>(io: IO, unit: Arc<Unit>) -> std::io::Result<()>
where
    IO: Unpin + Send + AsyncRead + AsyncWrite,
{
    let mut io = io;
    let mut lines = LineBuffer::new(Terminator::Auto);
    let mut chunk = [0u8; 1024];
    let mut user: Option<String> = None;
    let mut drop: Option<Maildrop> = None;

    macro_rules! say {
        ($($arg:tt)*) => {
            io.write_all(format!($($arg)*).as_bytes()).await?;
            io.write_all(b"\r\n").await?;
        };
    }

    say!("+OK mailrelay POP3 ready");

    loop {
        let line = loop {
            match lines.next() {
                Some(Scanned::Line { data, .. }) => break data,
                Some(_) => continue,
                None => {
                    let n = io.read(&mut chunk).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    lines.add(&chunk[..n]);
                }
            }
        };
        let line = String::from_utf8_lossy(&line).into_owned();
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or("").to_ascii_uppercase();
        let arg = words.next().unwrap_or("");
        debug!(command = command.as_str(), "pop command");

        match command.as_str() {
            "CAPA" => {
                say!("+OK capability list follows");
                say!("USER");
                say!("UIDL");
                say!(".");
            }
            "USER" => {
                if unit.pop_secrets.is_none() {
                    say!("-ERR no pop accounts");
                } else if arg.is_empty() {
                    say!("-ERR USER <name>");
                } else {
                    user = Some(arg.to_owned());
                    say!("+OK");
                }
            }
            "PASS" => match (&user, &unit.pop_secrets) {
                (Some(name), Some(secrets)) => {
                    let good = secrets
                        .lookup(Side::Pop, Mechanism::Plain, name)
                        .map(|s| s.kind == SecretKind::Plain && s.value == arg.as_bytes())
                        .unwrap_or(false);
                    if !good {
                        say!("-ERR authentication failed");
                        continue;
                    }
                    match open_maildrop(&unit, name).await {
                        Ok(maildrop) => {
                            info!(user = name.as_str(), "pop login");
                            say!("+OK maildrop has {} messages", maildrop.messages.len());
                            drop = Some(maildrop);
                        }
                        Err(e) => {
                            say!("-ERR cannot open maildrop: {}", e);
                        }
                    }
                }
                _ => {
                    say!("-ERR USER first");
                }
            },
            "STAT" => match &drop {
                Some(d) => {
                    let (count, size) = d.stat();
                    say!("+OK {} {}", count, size);
                }
                None => {
                    say!("-ERR not authenticated");
                }
            },
            "LIST" => match &drop {
                Some(d) => {
                    if arg.is_empty() {
                        let (count, size) = d.stat();
                        say!("+OK {} messages ({} octets)", count, size);
                        for (n, (_, size)) in d.live() {
                            say!("{} {}", n, size);
                        }
                        say!(".");
                    } else {
                        match d.find(arg) {
                            Some((n, (_, size))) => {
                                say!("+OK {} {}", n, size);
                            }
                            None => {
                                say!("-ERR no such message");
                            }
                        }
                    }
                }
                None => {
                    say!("-ERR not authenticated");
                }
            },
            "UIDL" => match &drop {
                Some(d) => {
                    if arg.is_empty() {
                        say!("+OK");
                        for (n, (id, _)) in d.live() {
                            say!("{} {}", n, id);
                        }
                        say!(".");
                    } else {
                        match d.find(arg) {
                            Some((n, (id, _))) => {
                                say!("+OK {} {}", n, id);
                            }
                            None => {
                                say!("-ERR no such message");
                            }
                        }
                    }
                }
                None => {
                    say!("-ERR not authenticated");
                }
            },
            "RETR" => match &drop {
                Some(d) => match d.find(arg) {
                    Some((_, (id, _))) => {
                        let id = id.clone();
                        match smol::fs::read(d.store.content_path(&id)).await {
                            Ok(content) => {
                                say!("+OK message follows");
                                let mut wire = Vec::with_capacity(content.len() + 16);
                                let mut escaper = DotEscaper::new();
                                escaper.escape(&content, &mut wire);
                                escaper.finish(&mut wire);
                                io.write_all(&wire).await?;
                            }
                            Err(e) => {
                                say!("-ERR cannot read message: {}", e);
                            }
                        }
                    }
                    None => {
                        say!("-ERR no such message");
                    }
                },
                None => {
                    say!("-ERR not authenticated");
                }
            },
            "DELE" => match &mut drop {
                Some(d) => match d.find(arg).map(|(n, _)| n) {
                    Some(n) => {
                        d.deleted[n - 1] = true;
                        say!("+OK deleted");
                    }
                    None => {
                        say!("-ERR no such message");
                    }
                },
                None => {
                    say!("-ERR not authenticated");
                }
            },
            "RSET" => match &mut drop {
                Some(d) => {
                    for flag in d.deleted.iter_mut() {
                        *flag = false;
                    }
                    say!("+OK");
                }
                None => {
                    say!("-ERR not authenticated");
                }
            },
            "NOOP" => {
                say!("+OK");
            }
            "QUIT" => {
                if let Some(d) = &drop {
                    if !unit.settings.pop_no_delete {
                        for (i, (id, _)) in d.messages.iter().enumerate() {
                            if d.deleted[i] {
                                if let Err(e) = d.store.delete(id).await {
                                    debug!(error = ?e, id = %id, "pop delete failed");
                                }
                            }
                        }
                    }
                }
                say!("+OK bye");
                return Ok(());
            }
            _ => {
                say!("-ERR unrecognised command");
            }
        }
    }
}

impl Maildrop {
    fn stat(&self) -> (usize, u64) {
        let mut count = 0;
        let mut size = 0;
        for (i, (_, sz)) in self.messages.iter().enumerate() {
            if !self.deleted[i] {
                count += 1;
                size += sz;
            }
        }
        (count, size)
    }

    /// Live messages with their 1-based numbers.
    fn live(&self) -> impl Iterator<Item = (usize, &(MessageId, u64))> {
        self.messages
            .iter()
            .enumerate()
            .filter(move |(i, _)| !self.deleted[*i])
            .map(|(i, m)| (i + 1, m))
    }

    fn find(&self, arg: &str) -> Option<(usize, &(MessageId, u64))> {
        let n: usize = arg.parse().ok()?;
        if n == 0 || n > self.messages.len() || self.deleted[n - 1] {
            return None;
        }
        Some((n, &self.messages[n - 1]))
    }
}

async fn open_maildrop(unit: &Arc<Unit>, user: &str) -> Result<Maildrop, String> {
    let store = if unit.settings.pop_by_name {
        if user.contains('/') || user.contains('\\') || user.contains("..") {
            return Err("bad user name".to_owned());
        }
        let dir = unit.settings.spool_dir.join(user);
        smol::fs::create_dir_all(&dir)
            .await
            .map_err(|e| e.to_string())?;
        Store::open(dir).await.map_err(|e| e.to_string())?
    } else {
        unit.store.clone()
    };
    let ids = store.scan().await.map_err(|e| e.to_string())?;
    let mut messages = Vec::with_capacity(ids.len());
    for id in ids {
        let size = store.content_size(&id).await.unwrap_or(0);
        messages.push((id, size));
    }
    let deleted = vec![false; messages.len()];
    Ok(Maildrop {
        store,
        messages,
        deleted,
    })
}

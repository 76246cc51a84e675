//! The admin text interface: CRLF-framed lines, one command per
//! line, with optional push notifications on subscribed connections.

use std::sync::Arc;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol::future::FutureExt;
use tracing::debug;

use smtp_proto::{LineBuffer, Scanned, Terminator};

use crate::{monitor::Monitor, unit::Unit};

const MAX_ERRORS: u32 = 30;

pub struct AdminContext {
    pub unit: Arc<Unit>,
    pub monitor: Arc<Monitor>,
    pub allow_terminate: bool,
    pub stop_tx: smol::channel::Sender<()>,
}

pub async fn interact<IO>(io: IO, ctx: Arc<AdminContext>) -> std::io::Result<()>
where
    IO: Unpin + Send + AsyncRead + AsyncWrite,
{
    let mut io = io;
    let mut lines = LineBuffer::new(Terminator::Auto);
    let mut chunk = [0u8; 1024];
    let mut errors = 0u32;
    let mut events: Option<smol::channel::Receiver<String>> = None;

    macro_rules! say {
        ($($arg:tt)*) => {
            io.write_all(format!($($arg)*).as_bytes()).await?;
            io.write_all(b"\r\n").await?;
        };
    }

    loop {
        // One complete line, interleaving push events while we wait
        let line = loop {
            match lines.next() {
                Some(Scanned::Line { data, .. }) => break data,
                Some(_) => continue,
                None => (),
            }
            enum Got {
                Read(usize),
                Event(String),
                EventsGone,
            }
            let got: std::io::Result<Got> = async { io.read(&mut chunk).await.map(Got::Read) }
                .or(async {
                    match &events {
                        Some(rx) => match rx.recv().await {
                            Ok(event) => Ok(Got::Event(event)),
                            Err(_) => Ok(Got::EventsGone),
                        },
                        None => futures::future::pending().await,
                    }
                })
                .await;
            match got? {
                Got::Read(0) => return Ok(()),
                Got::Read(n) => lines.add(&chunk[..n]),
                Got::Event(event) => {
                    io.write_all(format!("\r\nEVENT: {}\r\n", event).as_bytes())
                        .await?;
                }
                Got::EventsGone => events = None,
            }
        };

        let line = String::from_utf8_lossy(&line).into_owned();
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or("").to_ascii_lowercase();
        let arg = words.next().unwrap_or("").to_ascii_lowercase();
        debug!(command = command.as_str(), "admin command");

        match command.as_str() {
            "" => (),
            "help" => {
                say!(
                    "commands: help, status, list, failures, unfail-all, pid, notify, \
                     flush, forward, dnsbl, smtp, info, terminate, quit"
                );
            }
            "status" => {
                for report_line in ctx.monitor.report() {
                    say!("{}", report_line);
                }
            }
            "list" => {
                let ids = ctx.unit.store.scan().await.unwrap_or_default();
                if ids.is_empty() {
                    say!("<none>");
                } else {
                    for id in ids {
                        say!("{}", id);
                    }
                }
            }
            "failures" => {
                let ids = ctx.unit.store.failures().await.unwrap_or_default();
                if ids.is_empty() {
                    say!("<none>");
                } else {
                    for id in ids {
                        say!("{}", id);
                    }
                }
            }
            "unfail-all" => match ctx.unit.store.unfail_all().await {
                Ok(_) => {
                    say!("");
                }
                Err(e) => {
                    say!("error: {}", e);
                }
            },
            "pid" => {
                say!("{}", std::process::id());
            }
            "notify" => {
                events = Some(ctx.monitor.subscribe());
                say!("OK");
            }
            "flush" => {
                if ctx.unit.settings.forward_to.is_none() {
                    say!("error: no forward-to address");
                } else {
                    ctx.unit.request_forward("flush");
                    say!("OK");
                }
            }
            "forward" => {
                ctx.unit.request_forward("forward");
                say!("OK");
            }
            "dnsbl" => match (&ctx.unit.dnsbl, arg.as_str()) {
                (None, _) => {
                    say!("error: no dnsbl configuration");
                }
                (Some(dnsbl), "start") => {
                    dnsbl.set_enabled(true);
                    say!("OK");
                }
                (Some(dnsbl), "stop") => {
                    dnsbl.set_enabled(false);
                    say!("OK");
                }
                (Some(_), _) => {
                    say!("error: dnsbl start|stop");
                }
            },
            "smtp" => match arg.as_str() {
                "enable" => {
                    ctx.unit.set_smtp_enabled(true);
                    say!("OK");
                }
                "disable" => {
                    ctx.unit.set_smtp_enabled(false);
                    say!("OK");
                }
                _ => {
                    say!("error: smtp enable|disable");
                }
            },
            "info" => match arg.as_str() {
                "version" => {
                    say!("{}", env!("CARGO_PKG_VERSION"));
                }
                "domain" => {
                    say!("{}", ctx.unit.hostname());
                }
                "spool" => {
                    say!("{}", ctx.unit.store.dir().display());
                }
                "unit" => {
                    say!("{}", ctx.unit.settings.name);
                }
                _ => {
                    say!("error: no such info");
                }
            },
            "terminate" => {
                if ctx.allow_terminate {
                    say!("OK");
                    ctx.stop_tx.close();
                    return Ok(());
                }
                say!("error: not allowed");
            }
            "quit" => return Ok(()),
            _ => {
                errors += 1;
                if errors >= MAX_ERRORS {
                    return Ok(());
                }
                say!("error: unrecognised command");
            }
        }
    }
}

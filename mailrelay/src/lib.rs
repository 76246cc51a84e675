//! mailrelay: a store-and-forward SMTP relay.
//!
//! Mail arrives over SMTP, is committed to an on-disk spool as an
//! envelope/content pair, optionally passes through filter and
//! verifier helpers, and is forwarded to a configured smarthost. The
//! spool can also be read back over POP3, and a small admin interface
//! watches and drives the whole thing. One process can run several
//! independent relay units.

use std::{fmt, io, sync::Arc};

use anyhow::Context;
use easy_parallel::Parallel;
use futures::StreamExt;
use smol::future::FutureExt;
use tracing::{debug, info, warn};

mod admin;
mod client_config;
mod dnsbl;
mod listen;
mod monitor;
mod options;
mod pop;
mod received;
mod server_config;
mod tls;
mod unit;

pub use options::Opt;

use admin::AdminContext;
use listen::Service;
use monitor::Monitor;
use server_config::{ConnInfo, UnitServerConfig};
use unit::Unit;

const NUM_THREADS: usize = 4;

/// Marker context for errors that should exit with the usage code.
#[derive(Debug)]
struct Usage;

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("usage error")
    }
}

/// 2 for usage errors and ports already in use, 3 for i/o trouble,
/// 1 otherwise.
pub fn exit_code(e: &anyhow::Error) -> i32 {
    if e.downcast_ref::<Usage>().is_some() {
        return 2;
    }
    for cause in e.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return if io_err.kind() == io::ErrorKind::AddrInUse {
                2
            } else {
                3
            };
        }
    }
    1
}

pub fn init_logging(opt: &Opt) {
    let level = if opt.debug {
        "trace"
    } else if opt.verbose {
        "debug"
    } else if opt.log {
        "info"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    struct FileWriter(Arc<std::fs::File>);
    impl io::Write for FileWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            (&*self.0).write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            (&*self.0).flush()
        }
    }

    let file = opt.log_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("mailrelay: cannot open log file: {}", e))
            .ok()
            .map(Arc::new)
    });

    match (file, opt.log_time) {
        (Some(file), true) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(move || FileWriter(file.clone()))
            .init(),
        (Some(file), false) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .without_time()
            .with_writer(move || FileWriter(file.clone()))
            .init(),
        (None, true) => tracing_subscriber::fmt().with_env_filter(filter).init(),
        (None, false) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .without_time()
            .init(),
    }
}

pub fn run(opt: &Opt, shutdown: smol::channel::Receiver<()>) -> anyhow::Result<()> {
    info!("mailrelay starting up");

    let unit_settings = options::load_units(opt).context(Usage)?;

    let ex = &Arc::new(smol::Executor::new());
    let (stop_tx, local_shutdown) = smol::channel::unbounded::<()>();
    let monitor = Monitor::new();

    let (_, res): (_, anyhow::Result<()>) = Parallel::new()
        .each(0..NUM_THREADS, |_| {
            smol::block_on(ex.run(async {
                let _ = shutdown.recv().or(local_shutdown.recv()).await;
                Ok::<_, anyhow::Error>(())
            }))
        })
        .finish(|| {
            smol::block_on(async {
                let resolver = async_std_resolver::resolver_from_system_conf()
                    .await
                    .context("Configuring a resolver from system configuration")?;

                for settings in unit_settings {
                    let unit = Unit::new(
                        settings,
                        monitor.clone(),
                        resolver.clone(),
                        stop_tx.clone(),
                    )
                    .await?;
                    start_unit(ex, unit, monitor.clone(), stop_tx.clone()).await?;
                }

                info!("up, waiting for connections");
                let _ = shutdown.recv().or(local_shutdown.recv()).await;
                info!("shutting down");
                // Wake the worker threads too
                local_shutdown.close();
                Ok(())
            })
        });

    res
}

async fn start_unit(
    ex: &Arc<smol::Executor<'static>>,
    unit: Arc<Unit>,
    monitor: Arc<Monitor>,
    stop_tx: smol::channel::Sender<()>,
) -> anyhow::Result<()> {
    let specs = listen::parse_interfaces(&unit.settings.interfaces);

    // SMTP listeners
    let server_cfg = Arc::new(UnitServerConfig { unit: unit.clone() });
    for listener in
        listen::bind_all(&listen::specs_for(&specs, Service::Smtp), unit.settings.port).await?
    {
        if let Ok(addr) = listener.local_addr() {
            monitor.add_listener(format!("smtp {} ({})", addr, unit.settings.name));
        }
        ex.spawn(smtp_accept_loop(
            ex.clone(),
            listener,
            unit.clone(),
            server_cfg.clone(),
            monitor.clone(),
        ))
        .detach();
    }

    // POP listeners
    if unit.settings.pop {
        for listener in
            listen::bind_all(&listen::specs_for(&specs, Service::Pop), unit.settings.pop_port)
                .await?
        {
            if let Ok(addr) = listener.local_addr() {
                monitor.add_listener(format!("pop {} ({})", addr, unit.settings.name));
            }
            ex.spawn(pop_accept_loop(ex.clone(), listener, unit.clone(), monitor.clone()))
                .detach();
        }
    }

    // Admin listener
    if let Some(admin_port) = unit.settings.admin_port {
        let ctx = Arc::new(AdminContext {
            unit: unit.clone(),
            monitor: monitor.clone(),
            allow_terminate: unit.settings.admin_terminate,
            stop_tx,
        });
        for listener in
            listen::bind_all(&listen::specs_for(&specs, Service::Admin), admin_port).await?
        {
            if let Ok(addr) = listener.local_addr() {
                monitor.add_listener(format!("admin {} ({})", addr, unit.settings.name));
            }
            ex.spawn(admin_accept_loop(ex.clone(), listener, ctx.clone(), monitor.clone()))
                .detach();
        }
    }

    // The forwarding state machine
    ex.spawn(unit.clone().forwarder_task()).detach();

    if let Some(secs) = unit.settings.poll {
        let poll_unit = unit.clone();
        ex.spawn(async move {
            loop {
                smol::Timer::after(std::time::Duration::from_secs(secs)).await;
                poll_unit.request_forward("poll");
            }
        })
        .detach();
    }

    if unit.settings.forward_on_startup || unit.settings.quit_when_sent {
        unit.request_forward("startup");
    }

    Ok(())
}

async fn smtp_accept_loop(
    ex: Arc<smol::Executor<'static>>,
    listener: smol::net::TcpListener,
    unit: Arc<Unit>,
    server_cfg: Arc<UnitServerConfig>,
    monitor: Arc<Monitor>,
) {
    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = ?e, "accept failed");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());

        if !unit.smtp_enabled() {
            debug!(peer = peer.as_str(), "smtp disabled, turning the client away");
            continue;
        }
        if let Some(dnsbl) = &unit.dnsbl {
            if let Ok(addr) = stream.peer_addr() {
                if dnsbl.deny(addr.ip()).await {
                    continue;
                }
            }
        }

        let token = monitor.add_connection(format!("smtp {} ({})", peer, unit.settings.name));
        monitor.push_event(&format!("in: connect: {}", peer));
        let conn_unit = unit.clone();
        let conn_cfg = server_cfg.clone();
        let conn_monitor = monitor.clone();
        ex.spawn(async move {
            let res = if conn_unit.settings.server_tls_connection {
                // Implicit TLS: handshake before the greeting
                match conn_unit.tls.acceptor.as_ref() {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => {
                            smtp_server::interact(
                                tls,
                                smtp_server::IsAlreadyTls::Yes,
                                ConnInfo { peer: peer.clone() },
                                conn_cfg,
                            )
                            .await
                        }
                        Err(e) => Err(e),
                    },
                    None => Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "implicit TLS without a server certificate",
                    )),
                }
            } else {
                smtp_server::interact(
                    stream,
                    smtp_server::IsAlreadyTls::No,
                    ConnInfo { peer: peer.clone() },
                    conn_cfg,
                )
                .await
            };
            if let Err(e) = res {
                debug!(peer = peer.as_str(), error = ?e, "smtp session ended with error");
            }
            drop(token);
            conn_monitor.push_event(&format!("in: done: {}", peer));
            if conn_unit.settings.forward_on_disconnect {
                conn_unit.request_forward("disconnect");
            }
        })
        .detach();
    }
}

async fn pop_accept_loop(
    ex: Arc<smol::Executor<'static>>,
    listener: smol::net::TcpListener,
    unit: Arc<Unit>,
    monitor: Arc<Monitor>,
) {
    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = ?e, "accept failed");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        let token = monitor.add_connection(format!("pop {} ({})", peer, unit.settings.name));
        let conn_unit = unit.clone();
        ex.spawn(async move {
            if let Err(e) = pop::interact(stream, conn_unit).await {
                debug!(peer = peer.as_str(), error = ?e, "pop session ended with error");
            }
            drop(token);
        })
        .detach();
    }
}

async fn admin_accept_loop(
    ex: Arc<smol::Executor<'static>>,
    listener: smol::net::TcpListener,
    ctx: Arc<AdminContext>,
    monitor: Arc<Monitor>,
) {
    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = ?e, "accept failed");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        let token = monitor.add_connection(format!("admin {}", peer));
        let conn_ctx = ctx.clone();
        ex.spawn(async move {
            if let Err(e) = admin::interact(stream, conn_ctx).await {
                debug!(peer = peer.as_str(), error = ?e, "admin session ended with error");
            }
            drop(token);
        })
        .detach();
    }
}

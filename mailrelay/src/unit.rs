//! One relay unit: a spool, its filters and verifier, the receiving
//! policy, and the forwarding client, composed from one settings
//! block. Several units run side by side in one process, fully
//! independent of each other.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use tracing::{debug, info, warn};

use mail_filter::{Filter, FilterSpec, Outcome, Verifier, VerifierSpec};
use mail_spool::Store;
use sasl::{ChallengeSource, Secrets};
use smtp_client::{OutgoingMail, Severity, TransportError};
use smtp_proto::{xtext_encode, Hostname};

use crate::{
    client_config::UnitClientConfig, dnsbl::Dnsbl, monitor::Monitor, options::UnitSettings,
    tls::TlsProfiles,
};

pub type Resolver = async_std_resolver::AsyncStdResolver;
type SmtpClient = smtp_client::Client<
    async_std_resolver::AsyncStdConnection,
    async_std_resolver::AsyncStdConnectionProvider,
    UnitClientConfig,
>;

pub struct Unit {
    pub settings: UnitSettings,
    pub store: Store,
    pub monitor: Arc<Monitor>,
    pub challenges: ChallengeSource,
    pub server_secrets: Option<Secrets>,
    pub pop_secrets: Option<Secrets>,
    pub tls: TlsProfiles,
    pub dnsbl: Option<Dnsbl>,
    /// Admin `smtp enable|disable`.
    pub smtp_enabled: AtomicBool,
    /// AUTH id recorded as From-Authentication-Out on new envelopes.
    pub from_auth_out: String,
    pub(crate) filter: Option<Filter>,
    pub(crate) verifier: Verifier,
    client_filter: Option<Filter>,
    client: SmtpClient,
    forward_tx: smol::channel::Sender<String>,
    forward_rx: smol::channel::Receiver<String>,
    stop_tx: smol::channel::Sender<()>,
}

impl Unit {
    pub async fn new(
        settings: UnitSettings,
        monitor: Arc<Monitor>,
        resolver: Resolver,
        stop_tx: smol::channel::Sender<()>,
    ) -> anyhow::Result<Arc<Unit>> {
        smol::fs::create_dir_all(&settings.spool_dir)
            .await
            .with_context(|| {
                format!("Creating the spool directory ‘{}’", settings.spool_dir.display())
            })?;
        let store = Store::open(settings.spool_dir.clone())
            .await
            .with_context(|| {
                format!("Opening the spool directory ‘{}’", settings.spool_dir.display())
            })?;

        let server_secrets = match &settings.server_auth {
            Some(path) => Some(
                Secrets::load(path)
                    .with_context(|| format!("Loading ‘{}’", path.display()))?,
            ),
            None => None,
        };
        let pop_secrets = match &settings.pop_auth {
            Some(path) => Some(
                Secrets::load(path)
                    .with_context(|| format!("Loading ‘{}’", path.display()))?,
            ),
            None => None,
        };
        let (client_secrets, from_auth_out) = client_secrets(&settings)?;

        let timeout = std::time::Duration::from_secs(settings.filter_timeout);
        let with_delivery = |mut filter: Filter| {
            if let Some(dir) = &settings.delivery_dir {
                filter = filter.with_delivery_dir(dir.clone());
            }
            filter
        };
        let filter = match &settings.filter {
            Some(spec) => {
                let spec: FilterSpec = spec
                    .parse()
                    .with_context(|| format!("Parsing --filter ‘{}’", spec))?;
                Some(with_delivery(Filter::new(spec, timeout)))
            }
            None => None,
        };
        let client_filter = match &settings.client_filter {
            Some(spec) => {
                let spec: FilterSpec = spec
                    .parse()
                    .with_context(|| format!("Parsing --client-filter ‘{}’", spec))?;
                Some(with_delivery(Filter::new(spec, timeout)))
            }
            None => None,
        };
        let verifier = match &settings.address_verifier {
            Some(spec) => {
                let spec: VerifierSpec = spec
                    .parse()
                    .with_context(|| format!("Parsing --address-verifier ‘{}’", spec))?;
                Verifier::new(spec, timeout)
            }
            None => Verifier::allow_all(),
        };

        let tls = TlsProfiles::build(&settings)?;
        let dnsbl = match &settings.dnsbl {
            Some(spec) => Some(Dnsbl::from_spec(spec).await?),
            None => None,
        };

        let domain = settings.domain.clone().unwrap_or_else(|| "localhost".to_owned());
        let ehlo = Hostname::parse(&domain)
            .with_context(|| format!("Bad domain name ‘{}’", domain))?;
        let client_cfg = UnitClientConfig::new(
            &settings,
            ehlo,
            tls.connector.clone(),
            client_secrets,
        );
        let client = SmtpClient::new(resolver, Arc::new(client_cfg));

        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let challenges = ChallengeSource::new(domain, std::process::id(), start);

        let (forward_tx, forward_rx) = smol::channel::unbounded();
        Ok(Arc::new(Unit {
            settings,
            store,
            monitor,
            challenges,
            server_secrets,
            pop_secrets,
            tls,
            dnsbl,
            smtp_enabled: AtomicBool::new(true),
            from_auth_out,
            filter,
            verifier,
            client_filter,
            client,
            forward_tx,
            forward_rx,
            stop_tx,
        }))
    }

    pub fn hostname(&self) -> String {
        self.settings
            .domain
            .clone()
            .unwrap_or_else(|| "localhost".to_owned())
    }

    pub fn smtp_enabled(&self) -> bool {
        self.smtp_enabled.load(Ordering::Relaxed)
    }

    pub fn set_smtp_enabled(&self, on: bool) {
        self.smtp_enabled.store(on, Ordering::Relaxed);
    }

    /// Asks for a forwarding run. Requests arriving while a run is in
    /// progress are remembered and fire one more run when it ends.
    pub fn request_forward(&self, reason: &str) {
        debug!(unit = self.settings.name.as_str(), reason = reason, "forward requested");
        let _ = self.forward_tx.try_send(reason.to_owned());
    }

    /// The per-unit forwarding loop: waits for a request, coalesces
    /// the backlog, runs once. Runs are serialised per unit by
    /// construction.
    pub async fn forwarder_task(self: Arc<Self>) {
        use smol::future::FutureExt;
        let rescans = self.store.rescan_events();
        loop {
            let mut reason = match self.forward_rx.recv().or(rescans.recv()).await {
                Ok(reason) => reason,
                Err(_) => return,
            };
            // Coalesce queued requests into this run
            while let Ok(more) = self.forward_rx.try_recv() {
                reason = more;
            }
            while let Ok(more) = rescans.try_recv() {
                reason = more;
            }
            self.monitor.push_event("out: start");
            info!(unit = self.settings.name.as_str(), reason = reason.as_str(), "forwarding");
            let all_sent = self.forward_run().await;
            self.monitor.push_event("out: done");
            if all_sent && self.settings.quit_when_sent {
                info!(unit = self.settings.name.as_str(), "spool empty, quitting");
                // Closing the channel wakes every waiting thread
                self.stop_tx.close();
            }
        }
    }

    /// One forwarding run: scan the spool and hand each committed
    /// message to the smarthost. Returns true when the spool ended up
    /// empty.
    async fn forward_run(&self) -> bool {
        let ids = match self.store.scan().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = ?e, "spool scan failed");
                return false;
            }
        };
        if ids.is_empty() {
            return true;
        }
        let (host, port) = match self.forward_address() {
            Some(hp) => hp,
            None => {
                warn!("messages spooled but no --forward-to configured");
                return false;
            }
        };

        let mut sender = match self.client.connect(&host, port).await {
            Ok(sender) => sender,
            Err(e) => {
                warn!(error = ?anyhow::Error::new(e), "cannot reach the smarthost");
                return false;
            }
        };

        let mut rescan = false;
        let mut session_dead = false;
        for id in ids {
            if session_dead {
                break;
            }
            let envelope = match self.store.read_envelope(&id).await {
                Ok(env) => env,
                // Vanished or incomplete entries are someone else's
                // business, scan tolerance covers them
                Err(_) => continue,
            };

            if let Some(filter) = &self.client_filter {
                match filter.run(&self.store, &id).await {
                    Outcome::Ok => (),
                    Outcome::OkAndRescan => rescan = true,
                    Outcome::Reject(reason) => {
                        if let Err(e) = self.store.fail(&id, &reason).await {
                            warn!(error = ?e, id = %id, "cannot mark failed");
                        }
                        continue;
                    }
                    // Forwarding-side abandon: stop processing this
                    // message silently, leave it in the spool
                    Outcome::Abandon(_) => continue,
                    Outcome::Temporary(reason) => {
                        debug!(id = %id, reason = reason.as_str(), "client filter deferred");
                        continue;
                    }
                }
            }

            if envelope.to_remote.is_empty() {
                // Local-only message: POP or the deliver filter owns it
                continue;
            }

            let size = self.store.content_size(&id).await.ok();
            let content = match self.store.open_content(&id).await {
                Ok(content) => content,
                Err(_) => continue,
            };
            let mail = OutgoingMail {
                from: if envelope.from.is_empty() {
                    None
                } else {
                    Some(&envelope.from)
                },
                to: &envelope.to_remote,
                size,
                body: envelope.body,
                utf8: envelope.utf8_mailboxes,
                auth: if envelope.from_auth_out.is_empty() {
                    None
                } else {
                    Some(&envelope.from_auth_out)
                },
            };

            match sender.send(&mail, content).await {
                Ok(result) => {
                    for (addr, reply) in &result.rejected {
                        warn!(id = %id, to = addr.as_str(), reply = %reply, "not forwarded to");
                    }
                    if let Err(e) = self.store.delete(&id).await {
                        warn!(error = ?e, id = %id, "sent but not removed");
                    } else {
                        info!(id = %id, "forwarded");
                        self.monitor.push_event(&format!("out: sent: {}", id));
                    }
                }
                Err(e) => {
                    let severity = e.severity();
                    let mail_level = matches!(
                        &e,
                        TransportError::Transient(_)
                            | TransportError::Permanent(_)
                            | TransportError::RecipientRefused(_)
                            | TransportError::EightBitContentRefused
                            | TransportError::BinaryContentRefused
                            | TransportError::Utf8ContentRefused
                            | TransportError::TooBigForRemote(_)
                            | TransportError::BinarySizeUnknown
                    );
                    let text = format!("{:#}", anyhow::Error::new(e));
                    match severity {
                        Severity::Permanent => {
                            warn!(id = %id, error = text.as_str(), "message failed");
                            if let Err(e) = self.store.fail(&id, &text).await {
                                warn!(error = ?e, id = %id, "cannot mark failed");
                            }
                        }
                        Severity::Temporary => {
                            debug!(id = %id, error = text.as_str(), "message deferred");
                        }
                    }
                    if !mail_level {
                        // The session itself is in doubt
                        session_dead = true;
                    }
                }
            }
        }

        if !session_dead {
            sender.quit().await;
        }
        if rescan {
            self.store.request_rescan("client filter");
        }
        self.store
            .scan()
            .await
            .map(|ids| ids.is_empty())
            .unwrap_or(false)
    }

    fn forward_address(&self) -> Option<(String, u16)> {
        let spec = self.settings.forward_to.as_ref()?;
        match spec.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => Some((host.to_owned(), port)),
                Err(_) => {
                    warn!(spec = spec.as_str(), "bad --forward-to port, using 25");
                    Some((spec.clone(), 25))
                }
            },
            None => Some((spec.clone(), 25)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;

    use futures::{
        io::Cursor, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    };
    use structopt::StructOpt;

    use crate::options::{Opt, UnitSettings};
    use crate::server_config::{ConnInfo, UnitServerConfig};

    fn settings(spool: &std::path::Path) -> UnitSettings {
        let opt = Opt::from_iter(["mailrelay"].iter().copied());
        let mut settings = UnitSettings::from_opt(&opt);
        settings.spool_dir = spool.to_owned();
        settings
    }

    async fn resolver() -> Resolver {
        async_std_resolver::resolver(
            trust_dns_resolver::config::ResolverConfig::default(),
            trust_dns_resolver::config::ResolverOpts::default(),
        )
        .await
        .expect("test resolver")
    }

    async fn submit(unit: &Arc<Unit>, input: &[u8]) -> String {
        let cfg = Arc::new(UnitServerConfig { unit: unit.clone() });
        let out = Box::leak(Box::new(Vec::new()));
        let out2 = unsafe { &mut *(out as *mut Vec<u8>) };
        let io = duplexify::Duplex::new(
            Box::pin(Cursor::new(input.to_vec())) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(Cursor::new(out2)) as Pin<Box<dyn Send + AsyncWrite>>,
        );
        smtp_server::interact(
            io,
            smtp_server::IsAlreadyTls::No,
            ConnInfo {
                peer: "192.0.2.9:4321".to_owned(),
            },
            cfg,
        )
        .await
        .expect("smtp session");
        String::from_utf8_lossy(out).into_owned()
    }

    const SUBMISSION: &[u8] = b"EHLO a.example\r\n\
                                MAIL FROM:<u@a.example>\r\n\
                                RCPT TO:<v@b.example>\r\n\
                                DATA\r\n\
                                Subject: x\r\n\
                                \r\n\
                                hi\r\n\
                                .\r\n\
                                QUIT\r\n";

    /// An upstream that accepts everything over one session.
    async fn accepting_upstream(listener: smol::net::TcpListener) {
        let (mut io, _) = listener.accept().await.expect("upstream accept");
        io.write_all(b"220 up.example ESMTP\r\n").await.unwrap();
        let mut buf = [0u8; 4096];
        let mut lines = smtp_proto::LineBuffer::new(smtp_proto::Terminator::CrLf);
        let mut in_data = false;
        'session: loop {
            let n = io.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            lines.add(&buf[..n]);
            while let Some(item) = lines.next() {
                let data = match item {
                    smtp_proto::Scanned::Line { data, .. } => data,
                    _ => continue,
                };
                let line = String::from_utf8_lossy(&data).to_ascii_uppercase();
                if in_data {
                    if line == "." {
                        in_data = false;
                        io.write_all(b"250 queued\r\n").await.unwrap();
                    }
                } else if line.starts_with("EHLO") {
                    io.write_all(b"250-up.example\r\n250 8BITMIME\r\n")
                        .await
                        .unwrap();
                } else if line.starts_with("MAIL") || line.starts_with("RCPT") {
                    io.write_all(b"250 ok\r\n").await.unwrap();
                } else if line == "DATA" {
                    in_data = true;
                    io.write_all(b"354 go\r\n").await.unwrap();
                } else if line == "QUIT" {
                    io.write_all(b"221 bye\r\n").await.unwrap();
                    break 'session;
                }
            }
        }
    }

    #[test]
    fn receive_then_forward() {
        let spool = tempdir::TempDir::new("unit-spool").unwrap();
        smol::block_on(async {
            let upstream = smol::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = upstream.local_addr().unwrap().port();

            let mut s = settings(spool.path());
            s.forward_to = Some(format!("127.0.0.1:{}", port));
            let (stop_tx, _stop_rx) = smol::channel::unbounded();
            let unit = Unit::new(s, Monitor::new(), resolver().await, stop_tx)
                .await
                .unwrap();

            let replies = submit(&unit, SUBMISSION).await;
            assert!(replies.contains("250 OK "), "got {:?}", replies);
            assert!(replies.ends_with("221 Bye\r\n"), "got {:?}", replies);

            let ids = unit.store.scan().await.unwrap();
            assert_eq!(ids.len(), 1);
            let content =
                std::fs::read_to_string(unit.store.content_path(&ids[0])).unwrap();
            assert!(content.starts_with("Received: from a.example"), "got {:?}", content);
            assert!(content.ends_with("Subject: x\r\n\r\nhi\r\n"));

            let (_, all_sent) = futures::join!(accepting_upstream(upstream), unit.forward_run());
            assert!(all_sent);
            assert!(unit.store.scan().await.unwrap().is_empty());
        });
    }

    #[test]
    fn filter_reject_discards_the_message() {
        let spool = tempdir::TempDir::new("unit-spool").unwrap();
        smol::block_on(async {
            let mut s = settings(spool.path());
            s.filter = Some("exit:73".to_owned());
            let (stop_tx, _stop_rx) = smol::channel::unbounded();
            let unit = Unit::new(s, Monitor::new(), resolver().await, stop_tx)
                .await
                .unwrap();

            let replies = submit(&unit, SUBMISSION).await;
            assert!(replies.contains("550 rejected"), "got {:?}", replies);
            assert!(unit.store.scan().await.unwrap().is_empty());
        });
    }

    #[test]
    fn temporary_smarthost_failure_keeps_the_spool() {
        let spool = tempdir::TempDir::new("unit-spool").unwrap();
        smol::block_on(async {
            let mut s = settings(spool.path());
            // Nothing listens here
            s.forward_to = Some("127.0.0.1:1".to_owned());
            let (stop_tx, _stop_rx) = smol::channel::unbounded();
            let unit = Unit::new(s, Monitor::new(), resolver().await, stop_tx)
                .await
                .unwrap();

            submit(&unit, SUBMISSION).await;
            assert!(!unit.forward_run().await);
            // The message survives for the next run
            assert_eq!(unit.store.scan().await.unwrap().len(), 1);
        });
    }
}

/// `--client-auth` is a secrets file path or an inline
/// `plain:<user>:<password>`. Also yields the id recorded as
/// From-Authentication-Out.
fn client_secrets(settings: &UnitSettings) -> anyhow::Result<(Option<Secrets>, String)> {
    let spec = match &settings.client_auth {
        Some(spec) => spec,
        None => return Ok((None, String::new())),
    };
    if let Some(rest) = spec.strip_prefix("plain:") {
        let (user, password) = rest
            .split_once(':')
            .context("--client-auth plain:<user>:<password>")?;
        let text = format!(
            "client plain {} {}\n",
            xtext_encode(user.as_bytes()),
            xtext_encode(password.as_bytes()),
        );
        let secrets = Secrets::parse(&text).context("Building inline client credentials")?;
        return Ok((Some(secrets), xtext_encode(user.as_bytes())));
    }
    let secrets = Secrets::load(std::path::Path::new(spec))
        .with_context(|| format!("Loading ‘{}’", spec))?;
    let id = secrets
        .client_secret(sasl::Mechanism::Plain)
        .map(|s| xtext_encode(s.id.as_bytes()))
        .unwrap_or_default();
    Ok((Some(secrets), id))
}

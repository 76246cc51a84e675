//! The SMTP forwarding state machine.
//!
//! A [`Client`] resolves and connects to the configured smarthost; a
//! [`Sender`] then drives one session: banner, EHLO, opportunistic or
//! required STARTTLS, AUTH, and one MAIL/RCPT/DATA (or BDAT) cycle per
//! spool message. Failures are typed and carry a severity so the
//! caller can decide between retrying later and marking the message
//! failed.

use std::{cmp, fmt, io, net::IpAddr, ops::Range, pin::Pin, str::FromStr, sync::Arc};

use async_trait::async_trait;
use bitflags::bitflags;
use chrono::Utc;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol::{future::FutureExt, net::TcpStream};
use tracing::{debug, trace};
use trust_dns_resolver::AsyncResolver;

use sasl::{client_initial, client_respond, choose_client_mechanism, Secrets};
use smtp_proto::{
    nom, BodyKind, Command, DotEscaper, Hostname, MailParams, Reply, ReplyCode, ReplyCodeKind,
};

const RDBUF_SIZE: usize = 16 * 1024;
const DATABUF_SIZE: usize = 16 * 1024;
const MINIMUM_FREE_BUFSPACE: usize = 128;

const ZERO_DURATION: std::time::Duration = std::time::Duration::from_secs(0);

pub type DynAsyncReadWrite =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

#[async_trait]
pub trait Config: Send + Sync {
    fn ehlo_hostname(&self) -> Hostname;

    fn can_do_tls(&self) -> bool {
        true
    }

    /// Abandon the session if STARTTLS cannot be negotiated.
    fn must_do_tls(&self) -> bool {
        false
    }

    /// Whole-connection TLS: wrap the socket before the banner.
    fn implicit_tls(&self) -> bool {
        false
    }

    fn pipelining(&self) -> bool {
        true
    }

    /// Refuse to downgrade an 8-bit message for a 7-bit-only peer.
    fn eightbit_strict(&self) -> bool {
        true
    }

    fn binarymime_strict(&self) -> bool {
        true
    }

    fn smtputf8_strict(&self) -> bool {
        true
    }

    /// Default policy: any refused recipient abandons the message.
    /// When false, one accepted recipient is enough and the refused
    /// ones are reported back.
    fn must_accept_all_recipients(&self) -> bool {
        true
    }

    fn secrets(&self) -> Option<&Secrets> {
        None
    }

    async fn tls_connect<IO>(&self, io: IO) -> io::Result<DynAsyncReadWrite>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite;

    fn connection_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(40)
    }

    /// Handshake timeout for STARTTLS / implicit TLS.
    fn secure_connection_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(40)
    }

    /// Banner timeout; on expiry the client proceeds anyway.
    fn ready_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(20)
    }

    fn response_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(60)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Resolving ‘{0}’")]
    Resolving(String, #[source] trust_dns_resolver::error::ResolveError),

    #[error("No addresses found for ‘{0}’")]
    NoAddresses(String),

    #[error("Connecting to ‘{0}’ port ‘{1}’")]
    Connecting(IpAddr, u16, #[source] io::Error),

    #[error("Timed out connecting to ‘{0}’")]
    TimedOutConnecting(IpAddr),

    #[error("Receiving reply bytes")]
    ReceivingReplyBytes(#[source] io::Error),

    #[error("Timed out while waiting for a reply")]
    TimedOutWaitingForReply,

    #[error("Connection aborted")]
    ConnectionAborted,

    #[error("Reply does not fit in buffer: ‘{0}’")]
    TooLongReply(String),

    #[error("Syntax error parsing as a reply: ‘{0}’")]
    SyntaxError(String),

    #[error("Timed out while sending a command")]
    TimedOutSendingCommand,

    #[error("Sending command")]
    SendingCommand(#[source] io::Error),

    #[error("Negotiating TLS")]
    NegotiatingTls(#[source] io::Error),

    #[error("Cannot do TLS with remote server")]
    CannotDoTls,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(Reply),

    #[error("Recipient refused: {0}")]
    RecipientRefused(Reply),

    #[error("Remote cannot take 8-bit content")]
    EightBitContentRefused,

    #[error("Remote cannot take binary content")]
    BinaryContentRefused,

    #[error("Remote cannot take utf-8 mailboxes")]
    Utf8ContentRefused,

    #[error("Message larger than the remote maximum of {0} octets")]
    TooBigForRemote(u64),

    #[error("Binary message needs a known size")]
    BinarySizeUnknown,

    #[error("Transient failure: {0}")]
    Transient(Reply),

    #[error("Permanent failure: {0}")]
    Permanent(Reply),

    #[error("Unexpected reply code: {0}")]
    UnexpectedReplyCode(Reply),

    #[error("Timed out while sending data")]
    TimedOutSendingData,

    #[error("Sending data")]
    SendingData(#[source] io::Error),

    #[error("Reading the mail content")]
    ReadingMail(#[source] io::Error),
}

/// Spec-level error categorisation: a permanent failure marks the
/// message `.envelope.bad`, a temporary one leaves it for the next
/// run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Temporary,
    Permanent,
}

impl TransportError {
    pub fn severity(&self) -> Severity {
        use TransportError::*;
        match self {
            Resolving(_, _)
            | NoAddresses(_)
            | Connecting(_, _, _)
            | TimedOutConnecting(_)
            | ReceivingReplyBytes(_)
            | TimedOutWaitingForReply
            | ConnectionAborted
            | TooLongReply(_)
            | SyntaxError(_)
            | TimedOutSendingCommand
            | SendingCommand(_)
            | TimedOutSendingData
            | SendingData(_)
            | ReadingMail(_)
            | UnexpectedReplyCode(_)
            | Transient(_) => Severity::Temporary,
            // TLS failure when required retries later, per the error
            // model
            NegotiatingTls(_) | CannotDoTls => Severity::Temporary,
            EightBitContentRefused
            | BinaryContentRefused
            | Utf8ContentRefused
            | TooBigForRemote(_)
            | BinarySizeUnknown
            | Permanent(_) => Severity::Permanent,
            AuthenticationFailed(r) | RecipientRefused(r) => {
                match r.code.kind() {
                    ReplyCodeKind::PermanentNegative => Severity::Permanent,
                    _ => Severity::Temporary,
                }
            }
        }
    }
}

async fn read_for_reply<T>(
    fut: impl std::future::Future<Output = io::Result<T>>,
    waiting_for_reply_since: &chrono::DateTime<Utc>,
    timeout: chrono::Duration,
) -> Result<T, TransportError> {
    smol::future::or(
        async { fut.await.map_err(TransportError::ReceivingReplyBytes) },
        async {
            let max_delay: std::time::Duration = (*waiting_for_reply_since + timeout - Utc::now())
                .to_std()
                .unwrap_or(ZERO_DURATION);
            smol::Timer::after(max_delay).await;
            Err(TransportError::TimedOutWaitingForReply)
        },
    )
    .await
}

async fn read_reply<IO>(
    io: &mut IO,
    rdbuf: &mut [u8; RDBUF_SIZE],
    unhandled: &mut Range<usize>,
    timeout: chrono::Duration,
) -> Result<Reply, TransportError>
where
    IO: Unpin + Send + AsyncRead + AsyncWrite,
{
    let start = Utc::now();
    if unhandled.is_empty() {
        *unhandled = 0..read_for_reply(io.read(rdbuf), &start, timeout).await?;
        if unhandled.is_empty() {
            return Err(TransportError::ConnectionAborted);
        }
    }
    loop {
        trace!(
            buf = String::from_utf8_lossy(&rdbuf[unhandled.clone()]).as_ref(),
            "Trying to parse a reply from buffer"
        );
        match Reply::parse(&rdbuf[unhandled.clone()]) {
            Err(nom::Err::Incomplete(n)) => {
                if unhandled.start != 0 {
                    let missing = match n {
                        nom::Needed::Unknown => MINIMUM_FREE_BUFSPACE,
                        nom::Needed::Size(s) => cmp::max(MINIMUM_FREE_BUFSPACE, s.into()),
                    };
                    if missing > rdbuf.len() - unhandled.end {
                        rdbuf.copy_within(unhandled.clone(), 0);
                        unhandled.end = unhandled.len();
                        unhandled.start = 0;
                    }
                }
                if unhandled.end == rdbuf.len() {
                    return Err(TransportError::TooLongReply(
                        String::from_utf8_lossy(&rdbuf[unhandled.clone()]).to_string(),
                    ));
                }
                let read =
                    read_for_reply(io.read(&mut rdbuf[unhandled.end..]), &start, timeout).await?;
                if read == 0 {
                    return Err(TransportError::ConnectionAborted);
                }
                unhandled.end += read;
            }
            Err(_) => {
                return Err(TransportError::SyntaxError(
                    String::from_utf8_lossy(&rdbuf[unhandled.clone()]).to_string(),
                ));
            }
            Ok((rem, reply)) => {
                unhandled.start = unhandled.end - rem.len();
                return Ok(reply);
            }
        }
    }
}

fn verify_reply(r: Reply, expected: ReplyCodeKind) -> Result<Reply, TransportError> {
    use TransportError::*;
    match r.code.kind() {
        k if k == expected => Ok(r),
        ReplyCodeKind::TransientNegative => Err(Transient(r)),
        ReplyCodeKind::PermanentNegative => Err(Permanent(r)),
        _ => Err(UnexpectedReplyCode(r)),
    }
}

async fn send_bytes<IO>(
    io: &mut IO,
    bytes: &[u8],
    timeout: chrono::Duration,
) -> Result<(), TransportError>
where
    IO: Unpin + Send + AsyncRead + AsyncWrite,
{
    trace!(
        cmd = String::from_utf8_lossy(bytes).as_ref(),
        "Sending command"
    );
    smol::future::or(
        async {
            io.write_all(bytes)
                .await
                .map_err(TransportError::SendingCommand)?;
            io.flush().await.map_err(TransportError::SendingCommand)
        },
        async {
            smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
            Err(TransportError::TimedOutSendingCommand)
        },
    )
    .await
}

bitflags! {
    pub struct Extensions: u16 {
        const STARTTLS    = 0b000001;
        const EIGHTBITMIME = 0b000010;
        const SMTPUTF8    = 0b000100;
        const BINARYMIME  = 0b001000;
        const PIPELINING  = 0b010000;
        const CHUNKING    = 0b100000;
    }
}

/// What the peer advertised in its EHLO reply.
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub flags: Extensions,
    pub size: Option<u64>,
    pub auth: Vec<String>,
}

impl Capabilities {
    fn from_ehlo(reply: &Reply) -> Capabilities {
        let mut caps = Capabilities {
            flags: Extensions::empty(),
            size: None,
            auth: Vec::new(),
        };
        for line in reply.text.iter().skip(1) {
            let mut words = line.split_ascii_whitespace();
            let keyword = match words.next() {
                Some(k) => k,
                None => continue,
            };
            if keyword.eq_ignore_ascii_case("STARTTLS") {
                caps.flags.insert(Extensions::STARTTLS);
            } else if keyword.eq_ignore_ascii_case("8BITMIME") {
                caps.flags.insert(Extensions::EIGHTBITMIME);
            } else if keyword.eq_ignore_ascii_case("SMTPUTF8") {
                caps.flags.insert(Extensions::SMTPUTF8);
            } else if keyword.eq_ignore_ascii_case("BINARYMIME") {
                caps.flags.insert(Extensions::BINARYMIME);
            } else if keyword.eq_ignore_ascii_case("PIPELINING") {
                caps.flags.insert(Extensions::PIPELINING);
            } else if keyword.eq_ignore_ascii_case("CHUNKING") {
                caps.flags.insert(Extensions::CHUNKING);
            } else if keyword.eq_ignore_ascii_case("SIZE") {
                caps.size = words.next().and_then(|w| w.parse().ok());
            } else if keyword.eq_ignore_ascii_case("AUTH") {
                caps.auth = words.map(|w| w.to_owned()).collect();
            }
        }
        caps
    }
}

/// One message to forward, as recorded in its spool envelope.
#[derive(Debug)]
pub struct OutgoingMail<'a> {
    pub from: Option<&'a str>,
    pub to: &'a [String],
    pub size: Option<u64>,
    pub body: BodyKind,
    pub utf8: bool,
    /// Forwarded AUTH parameter (already xtext).
    pub auth: Option<&'a str>,
}

/// Recipients the peer refused when partial forwarding is allowed.
#[derive(Debug, Default)]
pub struct SendResult {
    pub rejected: Vec<(String, Reply)>,
}

pub struct Client<C, P, Cfg>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
    Cfg: Config,
{
    resolver: AsyncResolver<C, P>,
    cfg: Arc<Cfg>,
}

impl<C, P, Cfg> Client<C, P, Cfg>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
    Cfg: Config,
{
    pub fn new(resolver: AsyncResolver<C, P>, cfg: Arc<Cfg>) -> Client<C, P, Cfg> {
        Client { resolver, cfg }
    }

    /// Connects to the smarthost: resolve, then try each address in
    /// resolver order until one handshake succeeds.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Sender<Cfg>, TransportError> {
        let ips: Vec<IpAddr> = if let Ok(ip) = IpAddr::from_str(host) {
            vec![ip]
        } else {
            self.resolver
                .lookup_ip(host)
                .await
                .map_err(|e| TransportError::Resolving(host.to_owned(), e))?
                .iter()
                .collect()
        };
        if ips.is_empty() {
            return Err(TransportError::NoAddresses(host.to_owned()));
        }
        let mut first_error = None;
        for ip in ips {
            match self.connect_to_ip(ip, port).await {
                Ok(sender) => return Ok(sender),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }
        // Non-empty list and no success means at least one error
        Err(first_error.unwrap())
    }

    pub async fn connect_to_ip(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> Result<Sender<Cfg>, TransportError> {
        debug!(ip = %ip, port = port, "Connecting");
        let io = TcpStream::connect((ip, port))
            .or(async {
                smol::Timer::after(
                    self.cfg
                        .connection_timeout()
                        .to_std()
                        .unwrap_or(ZERO_DURATION),
                )
                .await;
                Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))
            })
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut {
                    TransportError::TimedOutConnecting(ip)
                } else {
                    TransportError::Connecting(ip, port, e)
                }
            })?;
        let (reader, writer) = io.split();
        let io = duplexify::Duplex::new(
            Box::pin(reader) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(writer) as Pin<Box<dyn Send + AsyncWrite>>,
        );
        Sender::handshake(io, self.cfg.clone()).await
    }
}

pub struct Sender<Cfg> {
    io: DynAsyncReadWrite,
    rdbuf: [u8; RDBUF_SIZE],
    unhandled: Range<usize>,
    caps: Capabilities,
    authenticated: bool,
    cfg: Arc<Cfg>,
}

impl<Cfg> fmt::Debug for Sender<Cfg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

impl<Cfg> Sender<Cfg>
where
    Cfg: Config,
{
    /// Runs the session prelude on an established stream: implicit
    /// TLS, banner, EHLO, STARTTLS + EHLO again, AUTH.
    pub async fn handshake(
        io: DynAsyncReadWrite,
        cfg: Arc<Cfg>,
    ) -> Result<Sender<Cfg>, TransportError> {
        let mut io = io;
        if cfg.implicit_tls() {
            io = tls_upgrade(&*cfg, io).await?;
        }
        let mut sender = Sender {
            io,
            rdbuf: [0; RDBUF_SIZE],
            unhandled: 0..0,
            caps: Capabilities {
                flags: Extensions::empty(),
                size: None,
                auth: Vec::new(),
            },
            authenticated: false,
            cfg,
        };

        // Banner; on timeout proceed anyway
        match read_reply(
            &mut sender.io,
            &mut sender.rdbuf,
            &mut sender.unhandled,
            sender.cfg.ready_timeout(),
        )
        .await
        {
            Ok(reply) => {
                verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
            }
            Err(TransportError::TimedOutWaitingForReply) => {
                debug!("No banner within the prompt timeout, proceeding");
            }
            Err(e) => return Err(e),
        }

        sender.ehlo().await?;

        let mut did_tls = sender.cfg.implicit_tls();
        if !did_tls
            && sender.caps.flags.contains(Extensions::STARTTLS)
            && sender.cfg.can_do_tls()
        {
            send_bytes(
                &mut sender.io,
                &Command::Starttls.to_wire(),
                sender.cfg.response_timeout(),
            )
            .await?;
            let reply = read_reply(
                &mut sender.io,
                &mut sender.rdbuf,
                &mut sender.unhandled,
                sender.cfg.response_timeout(),
            )
            .await?;
            if reply.code.kind() == ReplyCodeKind::PositiveCompletion {
                // Pipelining across STARTTLS is forbidden; any
                // leftover bytes would be an attack or a bug
                sender.unhandled = 0..0;
                sender.io = tls_upgrade(&*sender.cfg, std::mem::replace(
                    &mut sender.io,
                    duplexify::Duplex::new(
                        Box::pin(futures::io::empty()) as Pin<Box<dyn Send + AsyncRead>>,
                        Box::pin(futures::io::sink()) as Pin<Box<dyn Send + AsyncWrite>>,
                    ),
                ))
                .await?;
                sender.ehlo().await?;
                did_tls = true;
            } else if sender.cfg.must_do_tls() {
                return Err(TransportError::CannotDoTls);
            }
        }
        if !did_tls && sender.cfg.must_do_tls() {
            return Err(TransportError::CannotDoTls);
        }

        sender.authenticate().await?;

        Ok(sender)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn ehlo(&mut self) -> Result<(), TransportError> {
        send_bytes(
            &mut self.io,
            &Command::Ehlo {
                hostname: self.cfg.ehlo_hostname(),
            }
            .to_wire(),
            self.cfg.response_timeout(),
        )
        .await?;
        let reply = read_reply(
            &mut self.io,
            &mut self.rdbuf,
            &mut self.unhandled,
            self.cfg.response_timeout(),
        )
        .await?;
        let reply = verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
        self.caps = Capabilities::from_ehlo(&reply);
        Ok(())
    }

    /// Picks the preferred mechanism both sides support and runs the
    /// exchange. No matching mechanism means forwarding proceeds
    /// unauthenticated.
    async fn authenticate(&mut self) -> Result<(), TransportError> {
        let secrets = match self.cfg.secrets() {
            Some(secrets) => secrets,
            None => return Ok(()),
        };
        let mech = match choose_client_mechanism(&self.caps.auth, secrets) {
            Some(mech) => mech,
            None => {
                debug!("No matching AUTH mechanism, proceeding unauthenticated");
                return Ok(());
            }
        };
        let secret = match secrets.client_secret(mech) {
            Some(secret) => secret.clone(),
            None => return Ok(()),
        };
        debug!(mechanism = mech.as_str(), "Authenticating");
        let initial = client_initial(mech, &secret);
        send_bytes(
            &mut self.io,
            &Command::Auth {
                mechanism: mech.as_str().to_owned(),
                initial,
            }
            .to_wire(),
            self.cfg.response_timeout(),
        )
        .await?;
        loop {
            let reply = read_reply(
                &mut self.io,
                &mut self.rdbuf,
                &mut self.unhandled,
                self.cfg.response_timeout(),
            )
            .await?;
            match reply.code.code() {
                334 => {
                    let answer = client_respond(mech, &secret, reply.message().trim())
                        .unwrap_or_default();
                    send_bytes(
                        &mut self.io,
                        format!("{}\r\n", answer).as_bytes(),
                        self.cfg.response_timeout(),
                    )
                    .await?;
                }
                code if (200..300).contains(&code) => {
                    self.authenticated = true;
                    return Ok(());
                }
                _ => return Err(TransportError::AuthenticationFailed(reply)),
            }
        }
    }

    /// Sends one spool message. `Ok` means the peer took
    /// responsibility; the caller may then delete the spool entry.
    pub async fn send<R>(
        &mut self,
        mail: &OutgoingMail<'_>,
        content: R,
    ) -> Result<SendResult, TransportError>
    where
        R: Send + Unpin + AsyncRead,
    {
        let params = self.mail_params(mail)?;
        let use_bdat = mail.body == BodyKind::BinaryMime;

        // MAIL FROM + RCPT TO, batched when both sides pipeline
        let from = match mail.from {
            Some(addr) => smtp_proto::Email::parse(addr)
                .or_else(|| smtp_proto::Email::parse_bracketed(addr)),
            None => None,
        };
        let mail_cmd = Command::Mail { from, params };
        let rcpt_cmds: Vec<Vec<u8>> = mail
            .to
            .iter()
            .map(|to| match smtp_proto::Email::parse(to) {
                Some(email) => Command::Rcpt {
                    to: email,
                    params: MailParams::default(),
                }
                .to_wire(),
                None => format!("RCPT TO:<{}>\r\n", to).into_bytes(),
            })
            .collect();

        let pipeline =
            self.caps.flags.contains(Extensions::PIPELINING) && self.cfg.pipelining();
        let mut rejected: Vec<(String, Reply)> = Vec::new();
        let mut accepted = 0usize;

        if pipeline {
            let mut batch = mail_cmd.to_wire();
            for rcpt in &rcpt_cmds {
                batch.extend_from_slice(rcpt);
            }
            send_bytes(&mut self.io, &batch, self.cfg.response_timeout()).await?;
            let reply = self.reply().await?;
            verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
            for to in mail.to {
                let reply = self.reply().await?;
                if reply.code.kind() == ReplyCodeKind::PositiveCompletion {
                    accepted += 1;
                } else {
                    rejected.push((to.clone(), reply));
                }
            }
        } else {
            send_bytes(&mut self.io, &mail_cmd.to_wire(), self.cfg.response_timeout()).await?;
            let reply = self.reply().await?;
            verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
            for (to, cmd) in mail.to.iter().zip(&rcpt_cmds) {
                send_bytes(&mut self.io, cmd, self.cfg.response_timeout()).await?;
                let reply = self.reply().await?;
                if reply.code.kind() == ReplyCodeKind::PositiveCompletion {
                    accepted += 1;
                } else {
                    rejected.push((to.clone(), reply));
                }
            }
        }

        let giving_up = accepted == 0
            || (self.cfg.must_accept_all_recipients() && !rejected.is_empty());
        if giving_up {
            // Clear the transaction and report the most severe refusal
            send_bytes(
                &mut self.io,
                &Command::Rset.to_wire(),
                self.cfg.response_timeout(),
            )
            .await?;
            let _ = self.reply().await?;
            let worst = rejected
                .iter()
                .find(|(_, r)| r.code.kind() == ReplyCodeKind::PermanentNegative)
                .or_else(|| rejected.first())
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| Reply::new(ReplyCode::TRANSACTION_FAILED, "No recipient"));
            return Err(TransportError::RecipientRefused(worst));
        }

        if use_bdat {
            self.send_body_bdat(mail, content).await?;
        } else {
            self.send_body_data(content).await?;
        }

        Ok(SendResult { rejected })
    }

    /// Says goodbye and drops the connection.
    pub async fn quit(mut self) {
        let _ = send_bytes(
            &mut self.io,
            &Command::Quit.to_wire(),
            self.cfg.response_timeout(),
        )
        .await;
        let _ = read_reply(
            &mut self.io,
            &mut self.rdbuf,
            &mut self.unhandled,
            self.cfg.response_timeout(),
        )
        .await;
    }

    fn mail_params(&self, mail: &OutgoingMail<'_>) -> Result<MailParams, TransportError> {
        let mut params = MailParams::default();

        if let (Some(limit), Some(size)) = (self.caps.size, mail.size) {
            if limit > 0 && size > limit {
                return Err(TransportError::TooBigForRemote(limit));
            }
        }
        if self.caps.size.is_some() {
            params.size = mail.size;
        }

        match mail.body {
            BodyKind::SevenBit => (),
            BodyKind::EightBitMime => {
                if self.caps.flags.contains(Extensions::EIGHTBITMIME) {
                    params.body = Some(BodyKind::EightBitMime);
                } else if self.cfg.eightbit_strict() {
                    return Err(TransportError::EightBitContentRefused);
                }
            }
            BodyKind::BinaryMime => {
                let can = self.caps.flags.contains(Extensions::CHUNKING)
                    && self.caps.flags.contains(Extensions::BINARYMIME);
                if can {
                    params.body = Some(BodyKind::BinaryMime);
                } else if self.cfg.binarymime_strict() {
                    return Err(TransportError::BinaryContentRefused);
                } else if self.caps.flags.contains(Extensions::EIGHTBITMIME) {
                    // Downgrade allowed by configuration
                    params.body = Some(BodyKind::EightBitMime);
                }
            }
        }

        if mail.utf8 {
            if self.caps.flags.contains(Extensions::SMTPUTF8) {
                params.smtputf8 = true;
            } else if self.cfg.smtputf8_strict() {
                return Err(TransportError::Utf8ContentRefused);
            }
        }

        if self.authenticated {
            if let Some(auth) = mail.auth {
                if let Ok(decoded) = smtp_proto::xtext_decode(auth) {
                    params.auth = Some(decoded);
                }
            }
        }

        Ok(params)
    }

    async fn send_body_data<R>(&mut self, content: R) -> Result<(), TransportError>
    where
        R: Send + Unpin + AsyncRead,
    {
        send_bytes(&mut self.io, &Command::Data.to_wire(), self.cfg.response_timeout()).await?;
        let reply = self.reply().await?;
        verify_reply(reply, ReplyCodeKind::PositiveIntermediate)?;

        let mut content = content;
        let mut escaper = DotEscaper::new();
        let mut databuf = [0; DATABUF_SIZE];
        let mut wire = Vec::with_capacity(DATABUF_SIZE + 16);
        loop {
            match content.read(&mut databuf).await {
                Ok(0) => break,
                Ok(n) => {
                    wire.clear();
                    escaper.escape(&databuf[..n], &mut wire);
                    self.write_data(&wire).await?;
                }
                Err(e) => return Err(TransportError::ReadingMail(e)),
            }
        }
        wire.clear();
        escaper.finish(&mut wire);
        self.write_data(&wire).await?;

        let reply = self.reply().await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
        Ok(())
    }

    async fn send_body_bdat<R>(
        &mut self,
        mail: &OutgoingMail<'_>,
        content: R,
    ) -> Result<(), TransportError>
    where
        R: Send + Unpin + AsyncRead,
    {
        let size = mail.size.ok_or(TransportError::BinarySizeUnknown)?;
        send_bytes(
            &mut self.io,
            &Command::Bdat { size, last: true }.to_wire(),
            self.cfg.response_timeout(),
        )
        .await?;
        let mut content = content;
        let mut databuf = [0; DATABUF_SIZE];
        loop {
            match content.read(&mut databuf).await {
                Ok(0) => break,
                Ok(n) => self.write_data(&databuf[..n]).await?,
                Err(e) => return Err(TransportError::ReadingMail(e)),
            }
        }
        let reply = self.reply().await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
        Ok(())
    }

    async fn write_data(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let timeout = self.cfg.response_timeout().to_std().unwrap_or(ZERO_DURATION);
        let io = &mut self.io;
        smol::future::or(
            async {
                io.write_all(bytes)
                    .await
                    .map_err(TransportError::SendingData)
            },
            async {
                smol::Timer::after(timeout).await;
                Err(TransportError::TimedOutSendingData)
            },
        )
        .await
    }

    async fn reply(&mut self) -> Result<Reply, TransportError> {
        read_reply(
            &mut self.io,
            &mut self.rdbuf,
            &mut self.unhandled,
            self.cfg.response_timeout(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str;

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use futures::{executor, io::Cursor};

    struct TestConfig {
        secrets: Option<Secrets>,
        must_accept_all: bool,
        eightbit_strict: bool,
    }

    impl TestConfig {
        fn new() -> TestConfig {
            TestConfig {
                secrets: None,
                must_accept_all: true,
                eightbit_strict: true,
            }
        }
    }

    #[async_trait]
    impl Config for TestConfig {
        fn ehlo_hostname(&self) -> Hostname {
            Hostname::parse("client.example.org").expect("test hostname")
        }

        fn can_do_tls(&self) -> bool {
            false
        }

        fn must_accept_all_recipients(&self) -> bool {
            self.must_accept_all
        }

        fn eightbit_strict(&self) -> bool {
            self.eightbit_strict
        }

        fn secrets(&self) -> Option<&Secrets> {
            self.secrets.as_ref()
        }

        async fn tls_connect<IO>(&self, _io: IO) -> io::Result<DynAsyncReadWrite>
        where
            IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
        {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tls connect not implemented for tests",
            ))
        }
    }

    fn scripted(input: &str) -> (DynAsyncReadWrite, &'static mut Vec<u8>) {
        let out = Box::leak(Box::new(Vec::new()));
        let out2 = unsafe { &mut *(out as *mut Vec<u8>) };
        let io = duplexify::Duplex::new(
            Box::pin(Cursor::new(input.as_bytes().to_vec())) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(Cursor::new(out2)) as Pin<Box<dyn Send + AsyncWrite>>,
        );
        (io, out)
    }

    fn mail<'a>(to: &'a [String], size: u64) -> OutgoingMail<'a> {
        OutgoingMail {
            from: Some("u@a.example"),
            to,
            size: Some(size),
            body: BodyKind::SevenBit,
            utf8: false,
            auth: None,
        }
    }

    #[test]
    fn pipelined_happy_path() {
        let input = "220 mx.example.org ESMTP\r\n\
                     250-mx.example.org\r\n\
                     250-PIPELINING\r\n\
                     250-8BITMIME\r\n\
                     250 SIZE 100000\r\n\
                     250 sender ok\r\n\
                     250 rcpt ok\r\n\
                     354 go ahead\r\n\
                     250 queued as 123\r\n\
                     221 bye\r\n";
        let (io, out) = scripted(input);
        let cfg = Arc::new(TestConfig::new());
        let content = b"Subject: t\r\n\r\nhi\r\n";
        executor::block_on(async {
            let mut sender = Sender::handshake(io, cfg).await.unwrap();
            assert!(sender
                .capabilities()
                .flags
                .contains(Extensions::PIPELINING));
            assert_eq!(sender.capabilities().size, Some(100000));
            let to = vec!["v@b.example".to_owned()];
            let res = sender
                .send(&mail(&to, content.len() as u64), Cursor::new(content.to_vec()))
                .await
                .unwrap();
            assert!(res.rejected.is_empty());
            sender.quit().await;
        });
        let expected = "EHLO client.example.org\r\n\
                        MAIL FROM:<u@a.example> SIZE=18\r\n\
                        RCPT TO:<v@b.example>\r\n\
                        DATA\r\n\
                        Subject: t\r\n\r\nhi\r\n\
                        .\r\n\
                        QUIT\r\n";
        assert_eq!(str::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn refused_recipient_abandons_the_message() {
        let input = "220 mx.example.org ESMTP\r\n\
                     250-mx.example.org\r\n\
                     250 8BITMIME\r\n\
                     250 sender ok\r\n\
                     550 no such user\r\n\
                     250 rcpt ok\r\n\
                     250 reset\r\n";
        let (io, out) = scripted(input);
        let cfg = Arc::new(TestConfig::new());
        executor::block_on(async {
            let mut sender = Sender::handshake(io, cfg).await.unwrap();
            let to = vec!["gone@b.example".to_owned(), "v@b.example".to_owned()];
            let err = sender
                .send(&mail(&to, 2), Cursor::new(b"x\r\n".to_vec()))
                .await
                .unwrap_err();
            match &err {
                TransportError::RecipientRefused(r) => assert_eq!(r.code.code(), 550),
                other => panic!("unexpected error {:?}", other),
            }
            assert_eq!(err.severity(), Severity::Permanent);
        });
        // No DATA after the abandoned transaction, just RSET
        assert!(str::from_utf8(out).unwrap().ends_with("RSET\r\n"));
    }

    #[test]
    fn forward_to_some_reports_the_refused() {
        let input = "220 mx.example.org ESMTP\r\n\
                     250-mx.example.org\r\n\
                     250 8BITMIME\r\n\
                     250 sender ok\r\n\
                     550 no such user\r\n\
                     250 rcpt ok\r\n\
                     354 go ahead\r\n\
                     250 queued\r\n";
        let (io, _out) = scripted(input);
        let mut cfg = TestConfig::new();
        cfg.must_accept_all = false;
        executor::block_on(async {
            let mut sender = Sender::handshake(io, Arc::new(cfg)).await.unwrap();
            let to = vec!["gone@b.example".to_owned(), "v@b.example".to_owned()];
            let res = sender
                .send(&mail(&to, 3), Cursor::new(b"x\r\n".to_vec()))
                .await
                .unwrap();
            assert_eq!(res.rejected.len(), 1);
            assert_eq!(res.rejected[0].0, "gone@b.example");
        });
    }

    #[test]
    fn eightbit_needs_peer_support() {
        let input = "220 mx.example.org ESMTP\r\n\
                     250 mx.example.org\r\n";
        let (io, _out) = scripted(input);
        let cfg = Arc::new(TestConfig::new());
        executor::block_on(async {
            let mut sender = Sender::handshake(io, cfg).await.unwrap();
            let to = vec!["v@b.example".to_owned()];
            let err = sender
                .send(
                    &OutgoingMail {
                        from: Some("u@a.example"),
                        to: &to,
                        size: None,
                        body: BodyKind::EightBitMime,
                        utf8: false,
                        auth: None,
                    },
                    Cursor::new(b"x\r\n".to_vec()),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::EightBitContentRefused));
            assert_eq!(err.severity(), Severity::Permanent);
        });
    }

    #[test]
    fn authenticates_with_plain() {
        let input = "220 mx.example.org ESMTP\r\n\
                     250-mx.example.org\r\n\
                     250 AUTH PLAIN LOGIN\r\n\
                     235 welcome\r\n";
        let (io, out) = scripted(input);
        let mut cfg = TestConfig::new();
        cfg.secrets = Some(Secrets::parse("client plain carol letmein\n").unwrap());
        executor::block_on(async {
            let sender = Sender::handshake(io, Arc::new(cfg)).await.unwrap();
            assert!(sender.is_authenticated());
        });
        let expected_auth = format!("AUTH PLAIN {}\r\n", BASE64.encode(b"\0carol\0letmein"));
        assert!(str::from_utf8(out).unwrap().ends_with(&expected_auth));
    }

    #[test]
    fn banner_timeout_proceeds() {
        // Not easily testable without a live timer; covered by the
        // ready_timeout contract in handshake. Checked here: a 4xx
        // banner is a transient error.
        let input = "421 busy\r\n";
        let (io, _out) = scripted(input);
        let cfg = Arc::new(TestConfig::new());
        executor::block_on(async {
            let err = Sender::handshake(io, cfg).await.unwrap_err();
            assert!(matches!(err, TransportError::Transient(_)));
            assert_eq!(err.severity(), Severity::Temporary);
        });
    }
}

async fn tls_upgrade<Cfg>(
    cfg: &Cfg,
    io: DynAsyncReadWrite,
) -> Result<DynAsyncReadWrite, TransportError>
where
    Cfg: Config + ?Sized,
{
    cfg.tls_connect(io)
        .or(async {
            smol::Timer::after(
                cfg.secure_connection_timeout()
                    .to_std()
                    .unwrap_or(ZERO_DURATION),
            )
            .await;
            Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timeout"))
        })
        .await
        .map_err(TransportError::NegotiatingTls)
}

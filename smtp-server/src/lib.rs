//! The SMTP receiving state machine.
//!
//! [`interact`] drives one connection from greeting to QUIT: EHLO and
//! its extension set, STARTTLS, AUTH, MAIL/RCPT with verifier
//! callbacks, DATA with dot-unstuffing and BDAT chunking. Policy and
//! storage live behind the [`Config`] trait; the loop owns the buffer
//! juggling, the reply sequencing and the timeouts.

use std::{borrow::Cow, cmp, io, ops::Range, pin::Pin, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol::future::FutureExt;
use tracing::trace;

use sasl::{ChallengeSource, Mechanism, Secrets, ServerSession, Side, Step};
use smtp_proto::{nom, BodyKind, Command, Email, LineBuffer, MailParams, Reply, ReplyCode, Scanned};

pub const RDBUF_SIZE: usize = 16 * 1024;
const MINIMUM_FREE_BUFSPACE: usize = 128;

/// What a filtering hook decided.
#[must_use]
pub enum Decision {
    Accept,
    Reject(Reply),
    Kill {
        reply: Option<Reply>,
        res: io::Result<()>,
    },
}

/// End-of-body decision, with the reply to send (a `250 OK <msgid>`
/// carries the message id).
#[must_use]
pub enum DataDecision {
    Accept(Reply),
    Reject(Reply),
    Kill {
        reply: Option<Reply>,
        res: io::Result<()>,
    },
}

/// Classification of one RCPT address, per the verifier contract.
#[must_use]
pub enum RcptDecision {
    /// `address` goes on the envelope, locally or remotely.
    Accept { address: String, is_local: bool },
    /// Permanent: 550/553 with the verifier's reason.
    Reject(Reply),
    /// 450, try again later.
    Temporary(Reply),
    /// 451, and the connection is dropped.
    Abort(Reply),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Recipient {
    pub address: String,
    pub is_local: bool,
}

pub struct HelloInfo {
    pub is_ehlo: bool,
    pub hostname: smtp_proto::Hostname,
}

#[derive(Clone, Debug)]
pub struct AuthInfo {
    pub id: String,
    pub mechanism: Mechanism,
}

pub struct ConnectionMetadata<U> {
    pub user: U,
    pub hello: Option<HelloInfo>,
    pub is_encrypted: bool,
    pub authenticated: Option<AuthInfo>,
    pub auth_failures: u32,
}

pub struct MailMetadata<U> {
    pub user: U,
    pub from: Option<Email>,
    pub params: MailParams,
    pub to: Vec<Recipient>,
    /// Body transfer has started (354 sent, or a first BDAT seen).
    pub body_open: bool,
    /// Unstuffed body octets seen so far.
    pub body_size: u64,
    /// A storage hook failed mid-body; drain and reply 451.
    pub body_failed: bool,
}

#[async_trait]
pub trait Config: Send + Sync {
    type ConnectionUserMeta: Send;
    type MailUserMeta: Send;

    fn hostname(&self) -> Cow<'static, str>;

    fn ident(&self) -> Cow<'static, str> {
        "smtp relay".into()
    }

    /// `anonymous=server`: greeting carries no ident.
    fn anonymous_server(&self) -> bool {
        false
    }

    /// `anonymous=vrfy`: VRFY always answers 252.
    fn anonymous_vrfy(&self) -> bool {
        false
    }

    /// SIZE extension value; 0 advertises unlimited.
    fn max_size(&self) -> u64 {
        0
    }

    fn pipelining(&self) -> bool {
        false
    }

    fn chunking(&self) -> bool {
        false
    }

    fn smtputf8(&self) -> bool {
        false
    }

    fn smtputf8_strict(&self) -> bool {
        false
    }

    fn can_do_tls(&self, conn_meta: &ConnectionMetadata<Self::ConnectionUserMeta>) -> bool {
        !conn_meta.is_encrypted && conn_meta.hello.as_ref().map(|h| h.is_ehlo).unwrap_or(false)
    }

    /// `server_tls_required`: MAIL and AUTH refuse until encrypted.
    fn tls_required(&self) -> bool {
        false
    }

    /// Server-side credentials; their presence makes authentication
    /// mandatory for MAIL.
    fn secrets(&self) -> Option<&Secrets> {
        None
    }

    fn challenges(&self) -> &ChallengeSource;

    /// The AUTH set to advertise and accept: what the secrets can
    /// verify, narrowed to challenge-response mechanisms while the
    /// connection is unencrypted but could be upgraded.
    fn allowed_mechanisms(
        &self,
        conn_meta: &ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Vec<Mechanism> {
        let secrets = match self.secrets() {
            Some(secrets) => secrets,
            None => return Vec::new(),
        };
        let hide_clear = !conn_meta.is_encrypted
            && (self.tls_required() || self.can_do_tls(conn_meta));
        secrets
            .server_mechanisms(Side::Server)
            .into_iter()
            .filter(|m| !hide_clear || !m.sends_secret_in_clear())
            .collect()
    }

    async fn tls_accept<IO>(
        &self,
        io: IO,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> io::Result<
        duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>,
    >
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite;

    async fn new_mail(
        &self,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Self::MailUserMeta;

    #[allow(unused_variables)]
    async fn filter_hello(
        &self,
        is_ehlo: bool,
        hostname: &smtp_proto::Hostname,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision {
        Decision::Accept
    }

    #[allow(unused_variables)]
    async fn filter_from(
        &self,
        from: &Option<Email>,
        params: &MailParams,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision {
        Decision::Accept
    }

    /// The per-RCPT verifier.
    async fn verify_to(
        &self,
        to: &Email,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> RcptDecision;

    /// Called when the body transfer opens (354 sent, or first BDAT
    /// chunk). The storage writer should be set up here.
    #[allow(unused_variables)]
    async fn open_body(
        &self,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision {
        Decision::Accept
    }

    /// One chunk of unstuffed body octets (a line plus CRLF on the
    /// DATA path, a raw chunk on the BDAT path).
    async fn body_chunk(
        &self,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        chunk: &[u8],
    ) -> io::Result<()>;

    /// End of body: commit, filter, and produce the final reply.
    async fn commit_body(
        &self,
        meta: MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> DataDecision;

    /// The transaction was dropped mid-body (RSET, a new EHLO,
    /// STARTTLS, or an oversized or failed transfer).
    #[allow(unused_variables)]
    async fn cancel_body(
        &self,
        meta: MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) {
    }

    fn welcome_banner(&self) -> Reply {
        let text = if self.anonymous_server() {
            self.hostname().into_owned()
        } else {
            format!("{} {}", self.hostname(), self.ident())
        };
        Reply::new(ReplyCode::SERVICE_READY, text)
    }

    fn helo_okay(&self) -> Reply {
        Reply::new(ReplyCode::OKAY, self.hostname().into_owned())
    }

    fn ehlo_okay(&self, conn_meta: &ConnectionMetadata<Self::ConnectionUserMeta>) -> Reply {
        let mut reply = Reply::new(ReplyCode::OKAY, self.hostname().into_owned());
        reply = reply.push_line(format!("SIZE {}", self.max_size()));
        reply = reply.push_line("8BITMIME");
        if self.chunking() {
            reply = reply.push_line("BINARYMIME");
            reply = reply.push_line("CHUNKING");
        }
        if self.smtputf8() {
            reply = reply.push_line("SMTPUTF8");
        }
        if self.pipelining() {
            reply = reply.push_line("PIPELINING");
        }
        if self.can_do_tls(conn_meta) {
            reply = reply.push_line("STARTTLS");
        }
        let mechs = self.allowed_mechanisms(conn_meta);
        if !mechs.is_empty() {
            let list: Vec<&str> = mechs.iter().map(|m| m.as_str()).collect();
            reply = reply.push_line(format!("AUTH {}", list.join(" ")));
        }
        reply
    }

    fn mail_okay(&self) -> Reply {
        Reply::new(ReplyCode::OKAY, "Okay")
    }

    fn rcpt_okay(&self) -> Reply {
        Reply::new(ReplyCode::OKAY, "Okay")
    }

    fn data_okay(&self) -> Reply {
        Reply::new(
            ReplyCode::START_MAIL_INPUT,
            "Start mail input; end with <CRLF>.<CRLF>",
        )
    }

    fn bdat_okay(&self, size: u64) -> Reply {
        Reply::new(ReplyCode::OKAY, format!("{} octets received", size))
    }

    fn rset_okay(&self) -> Reply {
        Reply::new(ReplyCode::OKAY, "Okay")
    }

    fn noop_okay(&self) -> Reply {
        Reply::new(ReplyCode::OKAY, "Okay")
    }

    fn quit_reply(&self) -> Reply {
        Reply::new(ReplyCode::CLOSING_CHANNEL, "Bye")
    }

    fn starttls_okay(&self) -> Reply {
        Reply::new(ReplyCode::SERVICE_READY, "ready")
    }

    fn vrfy_reply(&self) -> Reply {
        Reply::new(
            ReplyCode::CANNOT_VRFY_BUT_PLEASE_TRY,
            "Cannot VRFY user, but will accept message and attempt delivery",
        )
    }

    fn help_reply(&self) -> Reply {
        Reply::new(ReplyCode::HELP_MESSAGE, "See RFC 5321")
    }

    fn expn_reply(&self) -> Reply {
        Reply::new(ReplyCode::COMMAND_UNIMPLEMENTED, "Command not implemented")
    }

    fn bad_sequence(&self) -> Reply {
        Reply::new(ReplyCode::BAD_SEQUENCE, "Bad sequence of commands")
    }

    fn command_unrecognized(&self) -> Reply {
        Reply::new(ReplyCode::COMMAND_UNRECOGNIZED, "Command not recognized")
    }

    fn command_not_supported(&self) -> Reply {
        Reply::new(ReplyCode::COMMAND_UNIMPLEMENTED, "Command not supported")
    }

    fn line_too_long(&self) -> Reply {
        Reply::new(ReplyCode::COMMAND_UNRECOGNIZED, "Line too long")
    }

    fn chunking_not_supported(&self) -> Reply {
        Reply::new(ReplyCode::COMMAND_UNRECOGNIZED, "CHUNKING not supported")
    }

    fn parameter_unimplemented(&self) -> Reply {
        Reply::new(ReplyCode::PARAMETER_UNIMPLEMENTED, "Mechanism not supported")
    }

    fn auth_required(&self) -> Reply {
        Reply::new(ReplyCode::AUTHENTICATION_REQUIRED, "Authentication required")
    }

    fn must_starttls(&self) -> Reply {
        Reply::new(
            ReplyCode::AUTHENTICATION_REQUIRED,
            "Must issue a STARTTLS command first",
        )
    }

    fn auth_okay(&self) -> Reply {
        Reply::new(ReplyCode::AUTH_SUCCEEDED, "Authentication succeeded")
    }

    fn auth_failed(&self) -> Reply {
        Reply::new(ReplyCode::AUTHENTICATION_FAILED, "Authentication failed")
    }

    fn auth_cancelled(&self) -> Reply {
        Reply::new(ReplyCode::SYNTAX_ERROR, "Authentication cancelled")
    }

    fn size_exceeded(&self) -> Reply {
        Reply::new(ReplyCode::EXCEEDED_STORAGE, "Message size exceeds maximum")
    }

    fn syntax_error(&self, text: &str) -> Reply {
        Reply::new(ReplyCode::SYNTAX_ERROR, text.to_owned())
    }

    fn pipeline_forbidden_after_starttls(&self) -> Reply {
        Reply::new(ReplyCode::BAD_SEQUENCE, "Pipelining after starttls is forbidden")
    }

    fn internal_server_error(&self) -> Reply {
        Reply::new(ReplyCode::LOCAL_ERROR, "Internal server error")
    }

    /// Idle timeout between commands.
    fn command_read_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(60)
    }

    fn reply_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(60)
    }
}

async fn advance_until_crlf<R>(
    r: &mut R,
    buf: &mut [u8],
    unhandled: &mut Range<usize>,
) -> io::Result<()>
where
    R: Unpin + AsyncRead,
{
    loop {
        if let Some(p) = buf[unhandled.clone()].iter().position(|&b| b == b'\n') {
            unhandled.start += p + 1;
            return Ok(());
        }
        *unhandled = 0..0;
        let read = r.read(buf).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection shutdown while waiting for crlf after invalid command",
            ));
        }
        *unhandled = 0..read;
    }
}

/// Reads one raw CRLF-terminated line (AUTH continuation data).
async fn read_raw_line<R>(
    r: &mut R,
    buf: &mut [u8],
    unhandled: &mut Range<usize>,
) -> io::Result<Vec<u8>>
where
    R: Unpin + AsyncRead,
{
    let mut line = Vec::new();
    loop {
        if let Some(p) = buf[unhandled.clone()].iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[unhandled.start..unhandled.start + p]);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            unhandled.start += p + 1;
            return Ok(line);
        }
        line.extend_from_slice(&buf[unhandled.clone()]);
        *unhandled = 0..0;
        let read = r.read(buf).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection shutdown during authentication",
            ));
        }
        *unhandled = 0..read;
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum IsAlreadyTls {
    Yes,
    No,
}

pub async fn interact<IO, Cfg>(
    io: IO,
    is_already_tls: IsAlreadyTls,
    metadata: Cfg::ConnectionUserMeta,
    cfg: Arc<Cfg>,
) -> io::Result<()>
where
    IO: 'static + Send + AsyncRead + AsyncWrite,
    Cfg: Config,
{
    let (io_r, io_w) = io.split();
    let mut io = duplexify::Duplex::new(
        Box::pin(io_r) as Pin<Box<dyn Send + AsyncRead>>,
        Box::pin(io_w) as Pin<Box<dyn Send + AsyncWrite>>,
    );

    let rdbuf = &mut [0; RDBUF_SIZE];
    let mut unhandled = 0..0;
    let mut conn_meta = ConnectionMetadata {
        user: metadata,
        hello: None,
        is_encrypted: is_already_tls == IsAlreadyTls::Yes,
        authenticated: None,
        auth_failures: 0,
    };
    let mut mail_meta: Option<MailMetadata<Cfg::MailUserMeta>> = None;

    let mut waiting_for_command_since = Utc::now();

    macro_rules! read_for_command {
        ($e:expr) => {
            $e.or(async {
                let max_delay: std::time::Duration =
                    (waiting_for_command_since + cfg.command_read_timeout() - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::from_secs(0));
                smol::Timer::after(max_delay).await;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for a command",
                ))
            })
        };
    }

    macro_rules! send_reply {
        ($writer:expr, $reply:expr) => {
            smol::future::or(
                async {
                    $writer.write_all(&$reply.to_bytes()).await?;
                    waiting_for_command_since = Utc::now();
                    Ok(())
                },
                async {
                    smol::Timer::after(
                        cfg.reply_write_timeout()
                            .to_std()
                            .unwrap_or(std::time::Duration::from_secs(0)),
                    )
                    .await;
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out sending a reply",
                    ))
                },
            )
        };
    }

    macro_rules! handle_decision {
        ($decision:expr, $accept:block) => {
            match $decision {
                Decision::Accept => $accept,
                Decision::Reject(r) => {
                    send_reply!(io, r).await?;
                }
                Decision::Kill { reply, res } => {
                    if let Some(r) = reply {
                        send_reply!(io, r).await?;
                    }
                    return res;
                }
            }
        };
    }

    macro_rules! reset_mail {
        () => {
            if let Some(meta) = mail_meta.take() {
                if meta.body_open {
                    cfg.cancel_body(meta, &mut conn_meta).await;
                }
            }
        };
    }

    macro_rules! finish_body {
        ($meta:expr) => {{
            let meta = $meta;
            if meta.body_failed {
                cfg.cancel_body(meta, &mut conn_meta).await;
                send_reply!(io, cfg.internal_server_error()).await?;
            } else if cfg.max_size() > 0 && meta.body_size > cfg.max_size() {
                cfg.cancel_body(meta, &mut conn_meta).await;
                send_reply!(io, cfg.size_exceeded()).await?;
            } else {
                match cfg.commit_body(meta, &mut conn_meta).await {
                    DataDecision::Accept(r) => send_reply!(io, r).await?,
                    DataDecision::Reject(r) => {
                        // Like other mail systems, drop the transaction
                        // state on an unsuccessful end-of-data
                        send_reply!(io, r).await?;
                    }
                    DataDecision::Kill { reply, res } => {
                        if let Some(r) = reply {
                            send_reply!(io, r).await?;
                        }
                        return res;
                    }
                }
            }
        }};
    }

    send_reply!(io, cfg.welcome_banner()).await?;

    loop {
        if unhandled.is_empty() {
            unhandled = 0..read_for_command!(io.read(rdbuf)).await?;
            if unhandled.is_empty() {
                return Ok(());
            }
        }

        let cmd = match Command::parse(&rdbuf[unhandled.clone()]) {
            Err(nom::Err::Incomplete(n)) => {
                // Not enough data to parse the command, fetch more
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
                    // The unparsable command fills the whole buffer
                    read_for_command!(advance_until_crlf(&mut io, rdbuf, &mut unhandled)).await?;
                    send_reply!(io, cfg.line_too_long()).await?;
                } else {
                    let read = read_for_command!(io.read(&mut rdbuf[unhandled.end..])).await?;
                    if read == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "connection shutdown with partial command",
                        ));
                    }
                    unhandled.end += read;
                }
                None
            }
            Err(_) => {
                // Syntax error
                read_for_command!(advance_until_crlf(&mut io, rdbuf, &mut unhandled)).await?;
                send_reply!(io, cfg.command_unrecognized()).await?;
                None
            }
            Ok((rem, cmd)) => {
                unhandled.start = unhandled.end - rem.len();
                Some(cmd)
            }
        };

        match cmd {
            None => (),

            Some(Command::Ehlo { hostname }) => {
                handle_decision!(cfg.filter_hello(true, &hostname, &mut conn_meta).await, {
                    reset_mail!();
                    conn_meta.hello = Some(HelloInfo {
                        is_ehlo: true,
                        hostname,
                    });
                    send_reply!(io, cfg.ehlo_okay(&conn_meta)).await?;
                })
            }

            Some(Command::Helo { hostname }) => {
                handle_decision!(cfg.filter_hello(false, &hostname, &mut conn_meta).await, {
                    reset_mail!();
                    conn_meta.hello = Some(HelloInfo {
                        is_ehlo: false,
                        hostname,
                    });
                    send_reply!(io, cfg.helo_okay()).await?;
                })
            }

            Some(Command::Mail { from, params }) => {
                if conn_meta.hello.is_none() {
                    send_reply!(io, cfg.bad_sequence()).await?;
                } else if mail_meta.is_some() {
                    // Like postfix and OpenSMTPD: error out and keep
                    // the running transaction
                    send_reply!(io, cfg.bad_sequence()).await?;
                } else if cfg.secrets().is_some() && conn_meta.authenticated.is_none() {
                    send_reply!(io, cfg.auth_required()).await?;
                } else if cfg.tls_required() && !conn_meta.is_encrypted {
                    send_reply!(io, cfg.must_starttls()).await?;
                } else if cfg.max_size() > 0 && params.size.unwrap_or(0) > cfg.max_size() {
                    send_reply!(io, cfg.size_exceeded()).await?;
                } else if params.body == Some(BodyKind::BinaryMime) && !cfg.chunking() {
                    send_reply!(io, cfg.syntax_error("BINARYMIME requires CHUNKING")).await?;
                } else if params.smtputf8 && !cfg.smtputf8() {
                    send_reply!(io, cfg.syntax_error("SMTPUTF8 not supported")).await?;
                } else if !cfg.smtputf8()
                    && cfg.smtputf8_strict()
                    && from.as_ref().map(|e| !e.is_ascii()).unwrap_or(false)
                {
                    send_reply!(io, cfg.syntax_error("non-ASCII address needs SMTPUTF8")).await?;
                } else {
                    let mut meta = MailMetadata {
                        user: cfg.new_mail(&mut conn_meta).await,
                        from: None,
                        params: MailParams::default(),
                        to: Vec::with_capacity(4),
                        body_open: false,
                        body_size: 0,
                        body_failed: false,
                    };
                    handle_decision!(
                        cfg.filter_from(&from, &params, &mut meta, &mut conn_meta).await,
                        {
                            meta.from = from;
                            meta.params = params;
                            mail_meta = Some(meta);
                            send_reply!(io, cfg.mail_okay()).await?;
                        }
                    )
                }
            }

            Some(Command::Rcpt { to, params: _params }) => match mail_meta {
                None => {
                    send_reply!(io, cfg.bad_sequence()).await?;
                }
                Some(ref mut meta) => {
                    match cfg.verify_to(&to, meta, &mut conn_meta).await {
                        RcptDecision::Accept { address, is_local } => {
                            meta.to.push(Recipient { address, is_local });
                            send_reply!(io, cfg.rcpt_okay()).await?;
                        }
                        RcptDecision::Reject(r) | RcptDecision::Temporary(r) => {
                            send_reply!(io, r).await?;
                        }
                        RcptDecision::Abort(r) => {
                            send_reply!(io, r).await?;
                            return Ok(());
                        }
                    }
                }
            },

            Some(Command::Data) => match mail_meta.take() {
                None => {
                    send_reply!(io, cfg.bad_sequence()).await?;
                }
                Some(meta) if meta.to.is_empty() => {
                    mail_meta = Some(meta);
                    send_reply!(io, cfg.bad_sequence()).await?;
                }
                Some(meta) if meta.params.body == Some(BodyKind::BinaryMime) => {
                    mail_meta = Some(meta);
                    send_reply!(io, cfg.bad_sequence()).await?;
                }
                Some(mut meta) => {
                    handle_decision!(cfg.open_body(&mut meta, &mut conn_meta).await, {
                        meta.body_open = true;
                        send_reply!(io, cfg.data_okay()).await?;

                        let mut body = LineBuffer::smtp_body();
                        body.add(&rdbuf[unhandled.clone()]);
                        unhandled = 0..0;
                        'body: loop {
                            while let Some(item) = body.next() {
                                match item {
                                    Scanned::Line { mut data, .. } => {
                                        meta.body_size += data.len() as u64 + 2;
                                        let oversized = cfg.max_size() > 0
                                            && meta.body_size > cfg.max_size();
                                        if !meta.body_failed && !oversized {
                                            data.extend_from_slice(b"\r\n");
                                            if let Err(e) =
                                                cfg.body_chunk(&mut meta, &data).await
                                            {
                                                trace!(error = ?e, "body sink failed");
                                                meta.body_failed = true;
                                            }
                                        }
                                    }
                                    Scanned::EndOfBody => break 'body,
                                    Scanned::Chunk(_) => unreachable!(),
                                }
                            }
                            let read = read_for_command!(io.read(rdbuf)).await?;
                            if read == 0 {
                                cfg.cancel_body(meta, &mut conn_meta).await;
                                return Err(io::Error::new(
                                    io::ErrorKind::ConnectionAborted,
                                    "connection shutdown during email reception",
                                ));
                            }
                            body.add(&rdbuf[..read]);
                        }
                        // Pipelined bytes after the end-of-body marker
                        // go back to the command loop
                        let rem = body.take_remainder();
                        rdbuf[..rem.len()].copy_from_slice(&rem);
                        unhandled = 0..rem.len();

                        finish_body!(meta)
                    })
                }
            },

            Some(Command::Bdat { size, last }) => {
                if !cfg.chunking() {
                    send_reply!(io, cfg.chunking_not_supported()).await?;
                    continue;
                }
                match mail_meta.take() {
                    None => {
                        send_reply!(io, cfg.bad_sequence()).await?;
                    }
                    Some(meta) if meta.to.is_empty() => {
                        mail_meta = Some(meta);
                        send_reply!(io, cfg.bad_sequence()).await?;
                    }
                    Some(mut meta) => {
                        if !meta.body_open {
                            match cfg.open_body(&mut meta, &mut conn_meta).await {
                                Decision::Accept => meta.body_open = true,
                                Decision::Reject(r) => {
                                    // The chunk still has to be drained
                                    skip_chunk(
                                        &mut io,
                                        rdbuf,
                                        &mut unhandled,
                                        size,
                                        &mut waiting_for_command_since,
                                        &*cfg,
                                    )
                                    .await?;
                                    send_reply!(io, r).await?;
                                    continue;
                                }
                                Decision::Kill { reply, res } => {
                                    if let Some(r) = reply {
                                        send_reply!(io, r).await?;
                                    }
                                    return res;
                                }
                            }
                        }
                        let mut remaining = size;
                        while remaining > 0 {
                            if unhandled.is_empty() {
                                let read = read_for_command!(io.read(rdbuf)).await?;
                                if read == 0 {
                                    cfg.cancel_body(meta, &mut conn_meta).await;
                                    return Err(io::Error::new(
                                        io::ErrorKind::ConnectionAborted,
                                        "connection shutdown during chunked reception",
                                    ));
                                }
                                unhandled = 0..read;
                            }
                            let take =
                                cmp::min(unhandled.len() as u64, remaining) as usize;
                            let chunk = &rdbuf[unhandled.start..unhandled.start + take];
                            meta.body_size += take as u64;
                            let oversized =
                                cfg.max_size() > 0 && meta.body_size > cfg.max_size();
                            if !meta.body_failed && !oversized {
                                if let Err(e) = cfg.body_chunk(&mut meta, chunk).await {
                                    trace!(error = ?e, "body sink failed");
                                    meta.body_failed = true;
                                }
                            }
                            unhandled.start += take;
                            remaining -= take as u64;
                        }
                        if last {
                            finish_body!(meta)
                        } else {
                            mail_meta = Some(meta);
                            send_reply!(io, cfg.bdat_okay(size)).await?;
                        }
                    }
                }
            }

            Some(Command::Auth { mechanism, initial }) => {
                if conn_meta.auth_failures >= 3 {
                    // Too many failures: close without any further reply
                    return Ok(());
                }
                if conn_meta.hello.is_none() || conn_meta.authenticated.is_some() {
                    send_reply!(io, cfg.bad_sequence()).await?;
                    continue;
                }
                let secrets = match cfg.secrets() {
                    None => {
                        send_reply!(io, cfg.command_not_supported()).await?;
                        continue;
                    }
                    Some(secrets) => secrets,
                };
                if cfg.tls_required() && !conn_meta.is_encrypted {
                    send_reply!(io, cfg.must_starttls()).await?;
                    continue;
                }
                let mech = Mechanism::parse(&mechanism)
                    .filter(|m| cfg.allowed_mechanisms(&conn_meta).contains(m));
                let mech = match mech {
                    None => {
                        send_reply!(io, cfg.parameter_unimplemented()).await?;
                        continue;
                    }
                    Some(mech) => mech,
                };
                let mut session = ServerSession::new(mech, Side::Server, secrets);
                let mut step = session.start(initial.as_deref(), cfg.challenges());
                enum AuthEnd {
                    Ok(String),
                    Failed,
                    Cancelled,
                }
                let end = loop {
                    match step {
                        Step::Challenge(c) => {
                            send_reply!(io, Reply::new(ReplyCode::AUTH_CONTINUE, c)).await?;
                            let line = read_for_command!(read_raw_line(
                                &mut io,
                                rdbuf,
                                &mut unhandled
                            ))
                            .await?;
                            let line = String::from_utf8_lossy(&line).into_owned();
                            if line == "*" {
                                break AuthEnd::Cancelled;
                            }
                            step = session.respond(&line);
                        }
                        Step::Success { id } => break AuthEnd::Ok(id),
                        Step::Failure => break AuthEnd::Failed,
                    }
                };
                match end {
                    AuthEnd::Ok(id) => {
                        conn_meta.authenticated = Some(AuthInfo {
                            id,
                            mechanism: mech,
                        });
                        send_reply!(io, cfg.auth_okay()).await?;
                    }
                    AuthEnd::Cancelled => {
                        send_reply!(io, cfg.auth_cancelled()).await?;
                    }
                    AuthEnd::Failed => {
                        conn_meta.auth_failures += 1;
                        if conn_meta.auth_failures >= 3 {
                            // Third strike: drop the connection with
                            // no further reply
                            return Ok(());
                        }
                        send_reply!(io, cfg.auth_failed()).await?;
                    }
                }
            }

            Some(Command::Starttls) => {
                if !cfg.can_do_tls(&conn_meta) {
                    send_reply!(io, cfg.command_not_supported()).await?;
                } else if !unhandled.is_empty() {
                    send_reply!(io, cfg.pipeline_forbidden_after_starttls()).await?;
                } else {
                    send_reply!(io, cfg.starttls_okay()).await?;
                    io = cfg.tls_accept(io, &mut conn_meta).await?;
                    // Fresh session: a new EHLO is required
                    reset_mail!();
                    conn_meta.is_encrypted = true;
                    conn_meta.hello = None;
                    conn_meta.authenticated = None;
                }
            }

            Some(Command::Rset) => {
                reset_mail!();
                send_reply!(io, cfg.rset_okay()).await?;
            }

            Some(Command::Noop) => {
                send_reply!(io, cfg.noop_okay()).await?;
            }

            Some(Command::Vrfy { name: _name }) => {
                // With anonymous=vrfy (and by default for a relay),
                // claim nothing about local users
                send_reply!(io, cfg.vrfy_reply()).await?;
            }

            Some(Command::Expn { name: _name }) => {
                send_reply!(io, cfg.expn_reply()).await?;
            }

            Some(Command::Help { subject: _subject }) => {
                send_reply!(io, cfg.help_reply()).await?;
            }

            Some(Command::Quit) => {
                send_reply!(io, cfg.quit_reply()).await?;
                return Ok(());
            }
        }
    }
}


/// Drains one rejected BDAT chunk off the wire.
async fn skip_chunk<Cfg, IO>(
    io: &mut IO,
    rdbuf: &mut [u8],
    unhandled: &mut Range<usize>,
    size: u64,
    waiting_since: &mut chrono::DateTime<Utc>,
    cfg: &Cfg,
) -> io::Result<()>
where
    Cfg: Config + ?Sized,
    IO: Unpin + AsyncRead,
{
    let mut remaining = size;
    while remaining > 0 {
        if unhandled.is_empty() {
            let timeout = cfg.command_read_timeout();
            let since = *waiting_since;
            let read = io
                .read(rdbuf)
                .or(async {
                    let max_delay = (since + timeout - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::from_secs(0));
                    smol::Timer::after(max_delay).await;
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out draining a chunk",
                    ))
                })
                .await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection shutdown during chunked reception",
                ));
            }
            *unhandled = 0..read;
        }
        let take = cmp::min(unhandled.len() as u64, remaining) as usize;
        unhandled.start += take;
        remaining -= take as u64;
    }
    Ok(())
}

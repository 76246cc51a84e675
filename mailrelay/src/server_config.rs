//! The receiving server's configuration for one unit: policy comes
//! from the settings, storage goes through the unit's spool and
//! filters.

use std::{borrow::Cow, io, pin::Pin, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{error, info};

use mail_filter::{Outcome, VerifyRequest, VerifyStatus};
use mail_spool::{Envelope, MessageWriter};
use sasl::{ChallengeSource, Secrets};
use smtp_proto::{xtext_encode, Reply, ReplyCode};
use smtp_server::{
    ConnectionMetadata, DataDecision, Decision, MailMetadata, RcptDecision,
};

use crate::{
    received::{received_line, ReceivedInfo},
    unit::Unit,
};

/// Per-connection context handed to `interact`.
pub struct ConnInfo {
    /// Submitter peer address, `ip:port`.
    pub peer: String,
}

pub struct UnitServerConfig {
    pub unit: Arc<Unit>,
}

#[async_trait]
impl smtp_server::Config for UnitServerConfig {
    type ConnectionUserMeta = ConnInfo;
    type MailUserMeta = Option<MessageWriter>;

    fn hostname(&self) -> Cow<'static, str> {
        self.unit.hostname().into()
    }

    fn ident(&self) -> Cow<'static, str> {
        "mailrelay".into()
    }

    fn anonymous_server(&self) -> bool {
        self.unit.settings.anonymous("server")
    }

    fn anonymous_vrfy(&self) -> bool {
        self.unit.settings.anonymous("vrfy")
    }

    fn max_size(&self) -> u64 {
        self.unit.settings.size
    }

    fn pipelining(&self) -> bool {
        self.unit.settings.server_smtp_flag("pipelining")
    }

    fn chunking(&self) -> bool {
        self.unit.settings.server_smtp_flag("chunking")
    }

    fn smtputf8(&self) -> bool {
        self.unit.settings.server_smtp_flag("smtputf8")
    }

    fn smtputf8_strict(&self) -> bool {
        self.unit.settings.server_smtp_flag("smtputf8strict")
    }

    fn can_do_tls(&self, conn_meta: &ConnectionMetadata<ConnInfo>) -> bool {
        !conn_meta.is_encrypted && self.unit.tls.acceptor.is_some()
    }

    fn tls_required(&self) -> bool {
        self.unit.settings.server_tls_required
    }

    fn secrets(&self) -> Option<&Secrets> {
        self.unit.server_secrets.as_ref()
    }

    fn challenges(&self) -> &ChallengeSource {
        &self.unit.challenges
    }

    fn command_read_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.unit.settings.idle_timeout as i64)
    }

    async fn tls_accept<IO>(
        &self,
        io: IO,
        _conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> io::Result<
        duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>,
    >
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        let acceptor = self.unit.tls.acceptor.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "server TLS is not configured")
        })?;
        let io = acceptor.accept(io).await?;
        let (r, w) = io.split();
        Ok(duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    async fn new_mail(
        &self,
        _conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> Option<MessageWriter> {
        None
    }

    async fn verify_to(
        &self,
        to: &smtp_proto::Email,
        _meta: &mut MailMetadata<Option<MessageWriter>>,
        conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> RcptDecision {
        let address = to.to_string();
        let domain = to.domain().to_string();
        let auth = conn_meta
            .authenticated
            .as_ref()
            .map(|a| a.id.clone())
            .unwrap_or_default();
        let request = VerifyRequest {
            address: &address,
            domain: &domain,
            client: &conn_meta.user.peer,
            auth: &auth,
        };
        match self.unit.verifier.verify(&request).await {
            VerifyStatus::Remote { address } => RcptDecision::Accept {
                address,
                is_local: false,
            },
            VerifyStatus::Local { mailbox, .. } => RcptDecision::Accept {
                address: mailbox,
                is_local: true,
            },
            VerifyStatus::Invalid { reason } => {
                RcptDecision::Reject(Reply::new(ReplyCode::MAILBOX_UNAVAILABLE, reason))
            }
            VerifyStatus::Temporary { reason } => RcptDecision::Temporary(Reply::new(
                ReplyCode::MAILBOX_TEMPORARILY_UNAVAILABLE,
                reason,
            )),
            VerifyStatus::Abort => RcptDecision::Abort(Reply::new(
                ReplyCode::LOCAL_ERROR,
                "Verifier aborted the connection",
            )),
        }
    }

    async fn open_body(
        &self,
        meta: &mut MailMetadata<Option<MessageWriter>>,
        conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> Decision {
        let auth_id = conn_meta
            .authenticated
            .as_ref()
            .map(|a| a.id.clone())
            .unwrap_or_default();
        let envelope = Envelope {
            from: meta
                .from
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            from_is_local: true,
            authentication: xtext_encode(auth_id.as_bytes()),
            client: conn_meta.user.peer.clone(),
            client_certificate: None,
            from_auth_in: meta
                .params
                .auth
                .as_deref()
                .map(xtext_encode)
                .unwrap_or_default(),
            from_auth_out: self.unit.from_auth_out.clone(),
            utf8_mailboxes: meta.params.smtputf8,
            body: meta.params.body.unwrap_or(smtp_proto::BodyKind::SevenBit),
            ..Envelope::default()
        };
        let mut writer = match self.unit.store.new_message(envelope).await {
            Ok(writer) => writer,
            Err(e) => {
                error!(error = ?e, "cannot open a spool entry");
                return Decision::Reject(Reply::new(
                    ReplyCode::INSUFFICIENT_STORAGE,
                    "Cannot store message",
                ));
            }
        };

        if !self.unit.settings.anonymous("content") {
            let peer_host = conn_meta
                .hello
                .as_ref()
                .map(|h| h.hostname.to_string())
                .unwrap_or_else(|| "unknown".to_owned());
            let peer_ip = conn_meta
                .user
                .peer
                .parse::<std::net::SocketAddr>()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| conn_meta.user.peer.clone());
            let header = received_line(&ReceivedInfo {
                peer_host: &peer_host,
                peer_ip: &peer_ip,
                our_domain: &self.unit.hostname(),
                is_esmtp: conn_meta.hello.as_ref().map(|h| h.is_ehlo).unwrap_or(false),
                is_tls: conn_meta.is_encrypted,
                auth_id: &auth_id,
                msgid: writer.id().as_str(),
                when: Utc::now(),
            });
            if let Err(e) = writer.write_line(header.as_bytes()).await {
                error!(error = ?e, "cannot write the trace header");
                writer.cancel().await;
                return Decision::Reject(Reply::new(
                    ReplyCode::INSUFFICIENT_STORAGE,
                    "Cannot store message",
                ));
            }
        }

        meta.user = Some(writer);
        Decision::Accept
    }

    async fn body_chunk(
        &self,
        meta: &mut MailMetadata<Option<MessageWriter>>,
        chunk: &[u8],
    ) -> io::Result<()> {
        match meta.user.as_mut() {
            Some(writer) => writer
                .write(chunk)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no open spool entry",
            )),
        }
    }

    async fn commit_body(
        &self,
        mut meta: MailMetadata<Option<MessageWriter>>,
        _conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) -> DataDecision {
        let mut writer = match meta.user.take() {
            Some(writer) => writer,
            None => {
                return DataDecision::Reject(Reply::new(
                    ReplyCode::LOCAL_ERROR,
                    "Internal server error",
                ))
            }
        };
        for rcpt in &meta.to {
            writer.add_to(&rcpt.address, rcpt.is_local);
        }
        let id = match writer.commit(true).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = ?e, "commit failed");
                return DataDecision::Reject(Reply::new(
                    ReplyCode::INSUFFICIENT_STORAGE,
                    "Cannot store message",
                ));
            }
        };
        info!(id = %id, "message stored");
        self.unit.monitor.push_event(&format!("store: new: {}", id));

        let outcome = match &self.unit.filter {
            Some(filter) => filter.run(&self.unit.store, &id).await,
            None => Outcome::Ok,
        };
        match outcome {
            Outcome::Ok => (),
            Outcome::OkAndRescan => self.unit.store.request_rescan("filter"),
            Outcome::Abandon(reason) => {
                // The filter took over: the submitter sees success and
                // the spooled message is left alone
                info!(id = %id, reason = reason.as_str(), "filter abandoned the message");
                return DataDecision::Accept(Reply::new(
                    ReplyCode::OKAY,
                    format!("OK {}", id),
                ));
            }
            Outcome::Reject(reason) => {
                if let Err(e) = self.unit.store.delete(&id).await {
                    error!(error = ?e, "cannot discard a rejected message");
                }
                return DataDecision::Reject(Reply::new(ReplyCode::POLICY_REASON, reason));
            }
            Outcome::Temporary(reason) => {
                if let Err(e) = self.unit.store.delete(&id).await {
                    error!(error = ?e, "cannot discard a failed message");
                }
                return DataDecision::Reject(Reply::new(
                    ReplyCode::INSUFFICIENT_STORAGE,
                    reason,
                ));
            }
        }

        if self.unit.settings.immediate {
            self.unit.request_forward("immediate");
        }
        DataDecision::Accept(Reply::new(ReplyCode::OKAY, format!("OK {}", id)))
    }

    async fn cancel_body(
        &self,
        mut meta: MailMetadata<Option<MessageWriter>>,
        _conn_meta: &mut ConnectionMetadata<ConnInfo>,
    ) {
        if let Some(writer) = meta.user.take() {
            writer.cancel().await;
        }
    }
}

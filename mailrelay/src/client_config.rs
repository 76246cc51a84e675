//! The forwarding client's configuration for one unit.

use std::{io, pin::Pin};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite};

use sasl::Secrets;
use smtp_proto::Hostname;

use crate::options::UnitSettings;

pub type DynAsyncReadWrite =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

pub struct UnitClientConfig {
    ehlo: Hostname,
    connector: Option<async_tls::TlsConnector>,
    /// SNI / certificate name: --client-tls-verify-name, else the
    /// smarthost name.
    sni: String,
    secrets: Option<Secrets>,
    must_tls: bool,
    implicit_tls: bool,
    pipelining: bool,
    eightbit_strict: bool,
    binarymime_strict: bool,
    smtputf8_strict: bool,
    connection_timeout: u64,
    prompt_timeout: u64,
    response_timeout: u64,
}

impl UnitClientConfig {
    pub fn new(
        settings: &UnitSettings,
        ehlo: Hostname,
        connector: Option<async_tls::TlsConnector>,
        secrets: Option<Secrets>,
    ) -> UnitClientConfig {
        let sni = settings
            .client_tls_verify_name
            .clone()
            .or_else(|| {
                settings
                    .forward_to
                    .as_ref()
                    .map(|fwd| fwd.rsplit_once(':').map(|(h, _)| h).unwrap_or(fwd).to_owned())
            })
            .unwrap_or_else(|| "localhost".to_owned());
        UnitClientConfig {
            ehlo,
            connector,
            sni,
            secrets,
            must_tls: settings.client_tls_required,
            implicit_tls: settings.client_tls_connection,
            pipelining: settings.client_smtp_flag("pipelining"),
            eightbit_strict: settings.client_smtp_flag("eightbitstrict"),
            binarymime_strict: settings.client_smtp_flag("binarymimestrict"),
            smtputf8_strict: settings.client_smtp_flag("smtputf8strict"),
            connection_timeout: settings.connection_timeout,
            prompt_timeout: settings.prompt_timeout,
            response_timeout: settings.response_timeout,
        }
    }
}

#[async_trait]
impl smtp_client::Config for UnitClientConfig {
    fn ehlo_hostname(&self) -> Hostname {
        self.ehlo.clone()
    }

    fn can_do_tls(&self) -> bool {
        self.connector.is_some()
    }

    fn must_do_tls(&self) -> bool {
        self.must_tls
    }

    fn implicit_tls(&self) -> bool {
        self.implicit_tls && self.connector.is_some()
    }

    fn pipelining(&self) -> bool {
        self.pipelining
    }

    fn eightbit_strict(&self) -> bool {
        self.eightbit_strict
    }

    fn binarymime_strict(&self) -> bool {
        self.binarymime_strict
    }

    fn smtputf8_strict(&self) -> bool {
        self.smtputf8_strict
    }

    fn secrets(&self) -> Option<&Secrets> {
        self.secrets.as_ref()
    }

    async fn tls_connect<IO>(&self, io: IO) -> io::Result<DynAsyncReadWrite>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        let connector = self.connector.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "client TLS is not configured")
        })?;
        let io = connector.connect(&self.sni, io).await?;
        let (r, w) = io.split();
        Ok(duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    fn connection_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.connection_timeout as i64)
    }

    fn secure_connection_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.connection_timeout as i64)
    }

    fn ready_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.prompt_timeout as i64)
    }

    fn response_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.response_timeout as i64)
    }
}

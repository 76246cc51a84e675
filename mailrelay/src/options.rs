//! Command line and configuration file handling.
//!
//! The configuration file holds one `<key> [<value>]` per line with
//! the same names as the long options without the leading dashes. A
//! `<prefix>-<key>` line puts the setting into a named unit; any
//! prefixed line turns the process into a multi-unit relay, one fully
//! independent unit per prefix.

use std::path::PathBuf;

use anyhow::Context;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "mailrelay",
    about = "A store-and-forward SMTP relay with POP3 access to the spool."
)]
pub struct Opt {
    /// SMTP listening port
    #[structopt(long, default_value = "25")]
    pub port: u16,

    /// Comma-separated listening addresses; a "smtp=", "pop=" or
    /// "admin=" prefix restricts an entry to one service
    #[structopt(long, number_of_values = 1)]
    pub interface: Vec<String>,

    /// Spool directory
    #[structopt(long, parse(from_os_str), default_value = "spool")]
    pub spool_dir: PathBuf,

    /// Mailbox root for the deliver:/copy: filters
    #[structopt(long, parse(from_os_str))]
    pub delivery_dir: Option<PathBuf>,

    /// Upstream smarthost as host:port
    #[structopt(long)]
    pub forward_to: Option<String>,

    /// Run one forwarding pass at startup
    #[structopt(long)]
    pub forward: bool,

    /// Run a forwarding pass every <n> seconds
    #[structopt(long)]
    pub poll: Option<u64>,

    /// Run a forwarding pass when a submitting client disconnects
    #[structopt(long)]
    pub forward_on_disconnect: bool,

    /// Forward each message as soon as it is stored
    #[structopt(long)]
    pub immediate: bool,

    /// Exit once a forwarding pass leaves the spool empty
    #[structopt(long)]
    pub quit_when_sent: bool,

    /// Offer STARTTLS to submitting clients
    #[structopt(long)]
    pub server_tls: bool,

    /// Serve TLS from the first byte (smtps)
    #[structopt(long)]
    pub server_tls_connection: bool,

    /// Server certificate: a combined pem file, or "key,cert"
    #[structopt(long)]
    pub server_tls_certificate: Option<String>,

    /// CA file used to verify submitting clients' certificates
    #[structopt(long)]
    pub server_tls_verify: Option<String>,

    /// Refuse MAIL and AUTH until the connection is encrypted
    #[structopt(long)]
    pub server_tls_required: bool,

    /// Use STARTTLS towards the smarthost when offered
    #[structopt(long)]
    pub client_tls: bool,

    /// Connect to the smarthost with whole-connection TLS
    #[structopt(long)]
    pub client_tls_connection: bool,

    /// Abandon forwarding if TLS cannot be negotiated
    #[structopt(long)]
    pub client_tls_required: bool,

    /// Client certificate: a combined pem file, or "key,cert"
    #[structopt(long)]
    pub client_tls_certificate: Option<String>,

    /// CA file used to verify the smarthost, or "<default>"
    #[structopt(long)]
    pub client_tls_verify: Option<String>,

    /// Expected name on the smarthost certificate
    #[structopt(long)]
    pub client_tls_verify_name: Option<String>,

    /// Secrets file for submitting clients (makes AUTH mandatory)
    #[structopt(long, parse(from_os_str))]
    pub server_auth: Option<PathBuf>,

    /// Secrets file for POP access
    #[structopt(long, parse(from_os_str))]
    pub pop_auth: Option<PathBuf>,

    /// Client credentials: a secrets file path, or plain:<user>:<password>
    #[structopt(long)]
    pub client_auth: Option<String>,

    /// Store filter: file:<path>, net:<addr>, spam:<addr>,
    /// spam-edit:<addr>, exit:<n>, deliver: or copy:
    #[structopt(long)]
    pub filter: Option<String>,

    /// Filter run against each message before forwarding
    #[structopt(long)]
    pub client_filter: Option<String>,

    /// Recipient verifier: file:<path>, net:<addr> or exit:<n>
    #[structopt(long)]
    pub address_verifier: Option<String>,

    /// Seconds before a filter or verifier helper is killed
    #[structopt(long, default_value = "60")]
    pub filter_timeout: u64,

    /// Seconds of client silence before a connection is dropped
    #[structopt(long, default_value = "60")]
    pub idle_timeout: u64,

    /// Seconds to wait for each smarthost reply
    #[structopt(long, default_value = "60")]
    pub response_timeout: u64,

    /// Seconds to wait for the smarthost TCP connection
    #[structopt(long, default_value = "40")]
    pub connection_timeout: u64,

    /// Seconds to wait for the smarthost banner
    #[structopt(long, default_value = "20")]
    pub prompt_timeout: u64,

    /// Maximum message size in bytes, 0 for unlimited
    #[structopt(long, default_value = "0")]
    pub size: u64,

    /// Our fully qualified domain name
    #[structopt(long)]
    pub domain: Option<String>,

    /// Privacy knobs: vrfy, server, content, client
    #[structopt(long, number_of_values = 1)]
    pub anonymous: Vec<String>,

    /// Admin interface port
    #[structopt(long)]
    pub admin: Option<u16>,

    /// Allow the admin "terminate" command
    #[structopt(long)]
    pub admin_terminate: bool,

    /// Serve POP3 from the spool
    #[structopt(long)]
    pub pop: bool,

    /// POP3 listening port
    #[structopt(long, default_value = "110")]
    pub pop_port: u16,

    /// POP clients see <spool>/<user> instead of the spool itself
    #[structopt(long)]
    pub pop_by_name: bool,

    /// POP DELE succeeds but deletes nothing
    #[structopt(long)]
    pub pop_no_delete: bool,

    /// DNSBL screening: resolver:port,timeout_ms,threshold,server,...
    #[structopt(long)]
    pub dnsbl: Option<String>,

    /// Server protocol knobs: pipelining, chunking, smtputf8,
    /// smtputf8strict, nostrictparsing
    #[structopt(long, number_of_values = 1)]
    pub server_smtp_config: Vec<String>,

    /// Client protocol knobs: pipelining, smtputf8strict,
    /// eightbitstrict, binarymimestrict
    #[structopt(long, number_of_values = 1)]
    pub client_smtp_config: Vec<String>,

    /// Log to stderr
    #[structopt(long)]
    pub log: bool,

    /// Log to a file instead of stderr
    #[structopt(long, parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Timestamp log lines
    #[structopt(long)]
    pub log_time: bool,

    /// Include peer addresses in log lines
    #[structopt(long)]
    pub log_address: bool,

    /// More verbose logging
    #[structopt(long)]
    pub verbose: bool,

    /// Protocol-level debug logging
    #[structopt(long)]
    pub debug: bool,

    /// Stay in the foreground (daemonisation is not implemented, so
    /// this is always the case; accepted for compatibility)
    #[structopt(long)]
    pub no_daemon: bool,

    /// Run as this user after binding sockets (not implemented)
    #[structopt(long)]
    pub user: Option<String>,

    /// Write the process id here at startup (not implemented)
    #[structopt(long, parse(from_os_str))]
    pub pid_file: Option<PathBuf>,

    /// Configuration file, one "<key> [<value>]" per line
    #[structopt(parse(from_os_str))]
    pub config_file: Option<PathBuf>,
}

/// One relay unit's worth of configuration.
#[derive(Clone, Debug)]
pub struct UnitSettings {
    pub name: String,
    pub port: u16,
    pub interfaces: Vec<String>,
    pub spool_dir: PathBuf,
    pub delivery_dir: Option<PathBuf>,
    pub forward_to: Option<String>,
    pub forward_on_startup: bool,
    pub poll: Option<u64>,
    pub forward_on_disconnect: bool,
    pub immediate: bool,
    pub quit_when_sent: bool,
    pub server_tls: bool,
    pub server_tls_connection: bool,
    pub server_tls_certificate: Option<String>,
    pub server_tls_verify: Option<String>,
    pub server_tls_required: bool,
    pub client_tls: bool,
    pub client_tls_connection: bool,
    pub client_tls_required: bool,
    pub client_tls_certificate: Option<String>,
    pub client_tls_verify: Option<String>,
    pub client_tls_verify_name: Option<String>,
    pub server_auth: Option<PathBuf>,
    pub pop_auth: Option<PathBuf>,
    pub client_auth: Option<String>,
    pub filter: Option<String>,
    pub client_filter: Option<String>,
    pub address_verifier: Option<String>,
    pub filter_timeout: u64,
    pub idle_timeout: u64,
    pub response_timeout: u64,
    pub connection_timeout: u64,
    pub prompt_timeout: u64,
    pub size: u64,
    pub domain: Option<String>,
    pub anonymous: Vec<String>,
    pub admin_port: Option<u16>,
    pub admin_terminate: bool,
    pub pop: bool,
    pub pop_port: u16,
    pub pop_by_name: bool,
    pub pop_no_delete: bool,
    pub dnsbl: Option<String>,
    pub server_smtp_config: Vec<String>,
    pub client_smtp_config: Vec<String>,
}

impl UnitSettings {
    pub fn from_opt(opt: &Opt) -> UnitSettings {
        UnitSettings {
            name: "main".to_owned(),
            port: opt.port,
            interfaces: opt.interface.clone(),
            spool_dir: opt.spool_dir.clone(),
            delivery_dir: opt.delivery_dir.clone(),
            forward_to: opt.forward_to.clone(),
            forward_on_startup: opt.forward,
            poll: opt.poll,
            forward_on_disconnect: opt.forward_on_disconnect,
            immediate: opt.immediate,
            quit_when_sent: opt.quit_when_sent,
            server_tls: opt.server_tls,
            server_tls_connection: opt.server_tls_connection,
            server_tls_certificate: opt.server_tls_certificate.clone(),
            server_tls_verify: opt.server_tls_verify.clone(),
            server_tls_required: opt.server_tls_required,
            client_tls: opt.client_tls,
            client_tls_connection: opt.client_tls_connection,
            client_tls_required: opt.client_tls_required,
            client_tls_certificate: opt.client_tls_certificate.clone(),
            client_tls_verify: opt.client_tls_verify.clone(),
            client_tls_verify_name: opt.client_tls_verify_name.clone(),
            server_auth: opt.server_auth.clone(),
            pop_auth: opt.pop_auth.clone(),
            client_auth: opt.client_auth.clone(),
            filter: opt.filter.clone(),
            client_filter: opt.client_filter.clone(),
            address_verifier: opt.address_verifier.clone(),
            filter_timeout: opt.filter_timeout,
            idle_timeout: opt.idle_timeout,
            response_timeout: opt.response_timeout,
            connection_timeout: opt.connection_timeout,
            prompt_timeout: opt.prompt_timeout,
            size: opt.size,
            domain: opt.domain.clone(),
            anonymous: opt.anonymous.clone(),
            admin_port: opt.admin,
            admin_terminate: opt.admin_terminate,
            pop: opt.pop,
            pop_port: opt.pop_port,
            pop_by_name: opt.pop_by_name,
            pop_no_delete: opt.pop_no_delete,
            dnsbl: opt.dnsbl.clone(),
            server_smtp_config: opt.server_smtp_config.clone(),
            client_smtp_config: opt.client_smtp_config.clone(),
        }
    }

    /// `anonymous` knob lookup (vrfy, server, content, client).
    pub fn anonymous(&self, what: &str) -> bool {
        self.anonymous
            .iter()
            .flat_map(|entry| entry.split(','))
            .any(|knob| knob.trim().eq_ignore_ascii_case(what))
    }

    pub fn server_smtp_flag(&self, flag: &str) -> bool {
        has_flag(&self.server_smtp_config, flag)
    }

    pub fn client_smtp_flag(&self, flag: &str) -> bool {
        has_flag(&self.client_smtp_config, flag)
    }

    /// Applies one config-file line. `Unknown` keys bubble up so the
    /// caller can try the multi-unit prefix syntax.
    fn apply(&mut self, key: &str, value: &str) -> Result<(), ApplyError> {
        let bad = |what: &str| ApplyError::BadValue(format!("{}: {}", key, what));
        let flag = || -> Result<bool, ApplyError> {
            match value {
                "" | "yes" | "true" | "1" => Ok(true),
                "no" | "false" | "0" => Ok(false),
                _ => Err(bad("expected a flag")),
            }
        };
        match key {
            "port" => self.port = value.parse().map_err(|_| bad("expected a port"))?,
            "interface" => self.interfaces.push(value.to_owned()),
            "spool-dir" => self.spool_dir = value.into(),
            "delivery-dir" => self.delivery_dir = Some(value.into()),
            "forward-to" => self.forward_to = Some(value.to_owned()),
            "forward" => self.forward_on_startup = flag()?,
            "poll" => self.poll = Some(value.parse().map_err(|_| bad("expected seconds"))?),
            "forward-on-disconnect" => self.forward_on_disconnect = flag()?,
            "immediate" => self.immediate = flag()?,
            "quit-when-sent" => self.quit_when_sent = flag()?,
            "server-tls" => self.server_tls = flag()?,
            "server-tls-connection" => self.server_tls_connection = flag()?,
            "server-tls-certificate" => self.server_tls_certificate = Some(value.to_owned()),
            "server-tls-verify" => self.server_tls_verify = Some(value.to_owned()),
            "server-tls-required" => self.server_tls_required = flag()?,
            "client-tls" => self.client_tls = flag()?,
            "client-tls-connection" => self.client_tls_connection = flag()?,
            "client-tls-required" => self.client_tls_required = flag()?,
            "client-tls-certificate" => self.client_tls_certificate = Some(value.to_owned()),
            "client-tls-verify" => self.client_tls_verify = Some(value.to_owned()),
            "client-tls-verify-name" => self.client_tls_verify_name = Some(value.to_owned()),
            "server-auth" => self.server_auth = Some(value.into()),
            "pop-auth" => self.pop_auth = Some(value.into()),
            "client-auth" => self.client_auth = Some(value.to_owned()),
            "filter" => self.filter = Some(value.to_owned()),
            "client-filter" => self.client_filter = Some(value.to_owned()),
            "address-verifier" => self.address_verifier = Some(value.to_owned()),
            "filter-timeout" => {
                self.filter_timeout = value.parse().map_err(|_| bad("expected seconds"))?
            }
            "idle-timeout" => {
                self.idle_timeout = value.parse().map_err(|_| bad("expected seconds"))?
            }
            "response-timeout" => {
                self.response_timeout = value.parse().map_err(|_| bad("expected seconds"))?
            }
            "connection-timeout" => {
                self.connection_timeout = value.parse().map_err(|_| bad("expected seconds"))?
            }
            "prompt-timeout" => {
                self.prompt_timeout = value.parse().map_err(|_| bad("expected seconds"))?
            }
            "size" => self.size = value.parse().map_err(|_| bad("expected bytes"))?,
            "domain" => self.domain = Some(value.to_owned()),
            "anonymous" => self.anonymous.push(value.to_owned()),
            "admin" => {
                self.admin_port = Some(value.parse().map_err(|_| bad("expected a port"))?)
            }
            "admin-terminate" => self.admin_terminate = flag()?,
            "pop" => self.pop = flag()?,
            "pop-port" => self.pop_port = value.parse().map_err(|_| bad("expected a port"))?,
            "pop-by-name" => self.pop_by_name = flag()?,
            "pop-no-delete" => self.pop_no_delete = flag()?,
            "dnsbl" => self.dnsbl = Some(value.to_owned()),
            "server-smtp-config" => self.server_smtp_config.push(value.to_owned()),
            "client-smtp-config" => self.client_smtp_config.push(value.to_owned()),
            _ => return Err(ApplyError::Unknown),
        }
        Ok(())
    }
}

fn has_flag(list: &[String], flag: &str) -> bool {
    list.iter()
        .flat_map(|entry| entry.split(|c| c == ',' || c == ' '))
        .any(|knob| knob.trim().eq_ignore_ascii_case(flag))
}

enum ApplyError {
    Unknown,
    BadValue(String),
}

/// Builds the units to run: the CLI settings, overlaid with the
/// config file, split by unit prefix.
pub fn load_units(opt: &Opt) -> anyhow::Result<Vec<UnitSettings>> {
    let mut base = UnitSettings::from_opt(opt);
    let mut prefixes: Vec<String> = Vec::new();
    let mut prefixed: Vec<(String, String, String)> = Vec::new();

    if let Some(path) = &opt.config_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading configuration file ‘{}’", path.display()))?;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (line, ""),
            };
            let place = || format!("{}:{}", path.display(), idx + 1);
            match base.apply(key, value) {
                Ok(()) => (),
                Err(ApplyError::BadValue(what)) => {
                    anyhow::bail!("{}: {}", place(), what);
                }
                Err(ApplyError::Unknown) => {
                    // Multi-unit prefix syntax
                    let (prefix, rest) = key
                        .split_once('-')
                        .ok_or_else(|| anyhow::anyhow!("{}: unknown option ‘{}’", place(), key))?;
                    if !prefixes.iter().any(|p| p == prefix) {
                        prefixes.push(prefix.to_owned());
                    }
                    prefixed.push((prefix.to_owned(), rest.to_owned(), value.to_owned()));
                }
            }
        }
    }

    if prefixes.is_empty() {
        return Ok(vec![base]);
    }

    let mut units = Vec::with_capacity(prefixes.len());
    for prefix in prefixes {
        let mut unit = base.clone();
        unit.name = prefix.clone();
        for (p, key, value) in &prefixed {
            if *p != prefix {
                continue;
            }
            match unit.apply(key, value) {
                Ok(()) => (),
                Err(ApplyError::BadValue(what)) => anyhow::bail!("unit {}: {}", prefix, what),
                Err(ApplyError::Unknown) => {
                    anyhow::bail!("unit {}: unknown option ‘{}’", prefix, key)
                }
            }
        }
        units.push(unit);
    }
    Ok(units)
}

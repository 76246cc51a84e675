//! Listening specifications.
//!
//! An `--interface` entry is a comma-separated list of specs, each
//! optionally scoped to one service with a `smtp=`, `pop=` or
//! `admin=` prefix. A spec is a literal address, a family hint
//! (`ipv4`/`ipv6`), a name resolved at startup, or `fd#<n>` for a
//! listening socket inherited from the parent process.

use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use smol::net::TcpListener;
use tracing::info;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Service {
    Smtp,
    Pop,
    Admin,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ListenSpec {
    /// None applies to every service.
    pub service: Option<Service>,
    pub value: String,
}

/// Splits the raw `--interface` values into scoped specs.
pub fn parse_interfaces(raw: &[String]) -> Vec<ListenSpec> {
    let mut specs = Vec::new();
    for entry in raw {
        for part in entry.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (service, value) = if let Some(v) = part.strip_prefix("smtp=") {
                (Some(Service::Smtp), v)
            } else if let Some(v) = part.strip_prefix("pop=") {
                (Some(Service::Pop), v)
            } else if let Some(v) = part.strip_prefix("admin=") {
                (Some(Service::Admin), v)
            } else {
                (None, part)
            };
            specs.push(ListenSpec {
                service,
                value: value.to_owned(),
            });
        }
    }
    specs
}

/// The specs applying to one service; an empty list of raw specs
/// yields the one wildcard entry.
pub fn specs_for(specs: &[ListenSpec], service: Service) -> Vec<String> {
    let mine: Vec<String> = specs
        .iter()
        .filter(|s| s.service.is_none() || s.service == Some(service))
        .map(|s| s.value.clone())
        .collect();
    if mine.is_empty() {
        vec!["ipv4".to_owned()]
    } else {
        mine
    }
}

/// Opens the listening sockets for one service on `port`.
pub async fn bind_all(specs: &[String], port: u16) -> anyhow::Result<Vec<TcpListener>> {
    let mut listeners = Vec::new();
    for spec in specs {
        listeners.push(bind_one(spec, port).await?);
    }
    Ok(listeners)
}

async fn bind_one(spec: &str, port: u16) -> anyhow::Result<TcpListener> {
    if let Some(fd) = spec.strip_prefix("fd#") {
        let fd: i32 = fd
            .parse()
            .with_context(|| format!("Bad inherited descriptor spec ‘{}’", spec))?;
        return inherited(fd);
    }
    let addr: SocketAddr = if spec.eq_ignore_ascii_case("ipv4") {
        (IpAddr::from([0u8, 0, 0, 0]), port).into()
    } else if spec.eq_ignore_ascii_case("ipv6") {
        (IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 0]), port).into()
    } else if let Ok(ip) = spec.parse::<IpAddr>() {
        (ip, port).into()
    } else {
        // A host or interface name, resolved at startup
        let name = spec.to_owned();
        smol::unblock(move || {
            use std::net::ToSocketAddrs;
            (name.as_str(), port)
                .to_socket_addrs()
                .map(|mut addrs| addrs.next())
        })
        .await
        .with_context(|| format!("Resolving listening name ‘{}’", spec))?
        .with_context(|| format!("No addresses for listening name ‘{}’", spec))?
    };
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Binding on {}", addr))?;
    info!(addr = %addr, "listening");
    Ok(listener)
}

#[cfg(unix)]
fn inherited(fd: i32) -> anyhow::Result<TcpListener> {
    use std::os::unix::io::FromRawFd;
    // Safety: the operator told us this descriptor was inherited as a
    // listening socket
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .context("Making the inherited listener non-blocking")?;
    use std::convert::TryFrom;
    TcpListener::try_from(std_listener).context("Registering the inherited listener")
}

#[cfg(not(unix))]
fn inherited(_fd: i32) -> anyhow::Result<TcpListener> {
    anyhow::bail!("fd#<n> listening specs need a unix platform")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_specs() {
        let specs = parse_interfaces(&[
            "127.0.0.1,smtp=192.0.2.1".to_owned(),
            "pop=192.0.2.2".to_owned(),
            "admin=127.0.0.1".to_owned(),
        ]);
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0].service, None);
        assert_eq!(specs[1].service, Some(Service::Smtp));
        assert_eq!(specs[1].value, "192.0.2.1");

        let smtp = specs_for(&specs, Service::Smtp);
        assert_eq!(smtp, vec!["127.0.0.1".to_owned(), "192.0.2.1".to_owned()]);
        let pop = specs_for(&specs, Service::Pop);
        assert_eq!(pop, vec!["127.0.0.1".to_owned(), "192.0.2.2".to_owned()]);
    }

    #[test]
    fn empty_defaults_to_wildcard() {
        let specs = parse_interfaces(&[]);
        assert_eq!(specs_for(&specs, Service::Smtp), vec!["ipv4".to_owned()]);
    }

    #[test]
    fn binds_a_literal_address() {
        smol::block_on(async {
            let listener = bind_one("127.0.0.1", 0).await.unwrap();
            let addr = listener.local_addr().unwrap();
            assert_eq!(addr.ip(), IpAddr::from([127, 0, 0, 1]));
            assert_ne!(addr.port(), 0);
        });
    }
}

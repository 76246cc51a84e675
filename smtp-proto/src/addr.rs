//! Envelope addresses and host names.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{anychar, char, none_of},
    combinator::{all_consuming, opt, recognize},
    multi::{many0_count, separated_list1},
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};

/// A host as it appears in EHLO arguments and on the right-hand side
/// of an envelope address: a domain name or a bracketed address
/// literal.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Hostname {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Hostname {
    pub fn parse(s: &str) -> Option<Hostname> {
        all_consuming(hostname)(s).ok().map(|(_, h)| h)
    }

    pub fn is_ascii(&self) -> bool {
        match self {
            Hostname::Domain(d) => d.is_ascii(),
            _ => true,
        }
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Hostname::Ipv4(ip) => write!(f, "[{}]", ip),
            Hostname::Ipv6(ip) => write!(f, "[IPv6:{}]", ip),
            Hostname::Domain(d) => f.write_str(d),
        }
    }
}

/// An envelope mailbox, `localpart@domain`.
///
/// The localpart is kept in its raw form (quoted-string quoting
/// included) so that addresses round-trip byte for byte. Source
/// routes on parse are accepted and discarded, per RFC 5321 §4.1.2.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Email {
    localpart: String,
    domain: Hostname,
}

impl Email {
    pub fn new(localpart: String, domain: Hostname) -> Email {
        Email { localpart, domain }
    }

    /// Parses a bare `localpart@domain` mailbox.
    pub fn parse(s: &str) -> Option<Email> {
        all_consuming(mailbox)(s).ok().map(|(_, e)| e)
    }

    /// Parses an angle-bracketed path, with optional source route.
    pub fn parse_bracketed(s: &str) -> Option<Email> {
        all_consuming(path)(s).ok().map(|(_, e)| e)
    }

    pub fn localpart(&self) -> &str {
        &self.localpart
    }

    pub fn domain(&self) -> &Hostname {
        &self.domain
    }

    /// True iff the address needs no SMTPUTF8 to be transmitted.
    pub fn is_ascii(&self) -> bool {
        self.localpart.is_ascii() && self.domain.is_ascii()
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.localpart, self.domain)
    }
}

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~".contains(c) || !c.is_ascii()
}

fn dot_string(i: &str) -> IResult<&str, &str> {
    recognize(separated_list1(char('.'), take_while1(is_atext)))(i)
}

fn quoted_string(i: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('"'),
        many0_count(alt((
            recognize(preceded(char('\\'), anychar)),
            recognize(none_of("\"\\\r\n")),
        ))),
        char('"'),
    ))(i)
}

fn localpart(i: &str) -> IResult<&str, &str> {
    alt((quoted_string, dot_string))(i)
}

// Underscores show up in real-world HELO arguments
fn is_domain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || !c.is_ascii()
}

fn domain_name(i: &str) -> IResult<&str, Hostname> {
    let (i, d) = recognize(separated_list1(char('.'), take_while1(is_domain_char)))(i)?;
    Ok((i, Hostname::Domain(d.to_owned())))
}

fn ipv4_literal(i: &str) -> IResult<&str, Hostname> {
    let (i, lit) = delimited(char('['), take_while1(|c: char| c != ']'), char(']'))(i)?;
    match Ipv4Addr::from_str(lit) {
        Ok(ip) => Ok((i, Hostname::Ipv4(ip))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

fn ipv6_literal(i: &str) -> IResult<&str, Hostname> {
    let (i, lit) = delimited(tag("[IPv6:"), take_while1(|c: char| c != ']'), char(']'))(i)?;
    match Ipv6Addr::from_str(lit) {
        Ok(ip) => Ok((i, Hostname::Ipv6(ip))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

pub(crate) fn hostname(i: &str) -> IResult<&str, Hostname> {
    alt((ipv6_literal, ipv4_literal, domain_name))(i)
}

pub(crate) fn mailbox(i: &str) -> IResult<&str, Email> {
    let (i, (lp, host)) = separated_pair(localpart, char('@'), hostname)(i)?;
    Ok((
        i,
        Email {
            localpart: lp.to_owned(),
            domain: host,
        },
    ))
}

fn source_route(i: &str) -> IResult<&str, ()> {
    let (i, _) = tuple((
        separated_list1(char(','), preceded(char('@'), hostname)),
        char(':'),
    ))(i)?;
    Ok((i, ()))
}

/// `<[@route:]mailbox>`
pub(crate) fn path(i: &str) -> IResult<&str, Email> {
    delimited(char('<'), preceded(opt(source_route), mailbox), char('>'))(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mailboxes() {
        let tests: &[(&str, &str, &str)] = &[
            ("foo@bar.example.org", "foo", "bar.example.org"),
            ("foo.bar@baz.example", "foo.bar", "baz.example"),
            ("\"hello world\"@example.com", "\"hello world\"", "example.com"),
            ("\"a\\\"b\"@example.com", "\"a\\\"b\"", "example.com"),
            ("o'hara@example.com", "o'hara", "example.com"),
            ("café@exâmple.org", "café", "exâmple.org"),
        ];
        for &(inp, lp, dom) in tests {
            let e = Email::parse(inp).unwrap_or_else(|| panic!("failed to parse {:?}", inp));
            assert_eq!(e.localpart(), lp);
            assert_eq!(e.domain(), &Hostname::Domain(dom.to_owned()));
            assert_eq!(e.to_string(), inp);
        }
    }

    #[test]
    fn parse_literals() {
        let e = Email::parse("x@[127.0.0.1]").unwrap();
        assert_eq!(e.domain(), &Hostname::Ipv4(Ipv4Addr::LOCALHOST));
        let e = Email::parse("x@[IPv6:::1]").unwrap();
        assert_eq!(e.domain(), &Hostname::Ipv6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn parse_paths() {
        let e = Email::parse_bracketed("<foo@bar.example.org>").unwrap();
        assert_eq!(e.localpart(), "foo");
        // Source routes are accepted and ignored
        let e = Email::parse_bracketed("<@one.example,@two.example:joe@three.example>").unwrap();
        assert_eq!(e.to_string(), "joe@three.example");
    }

    #[test]
    fn reject_invalid() {
        for s in &["", "foo", "@bar", "foo@", "a@b@c", "<foo@bar>", "foo bar@x.example"] {
            assert!(Email::parse(s).is_none(), "unexpectedly parsed {:?}", s);
        }
    }

    #[test]
    fn ascii_detection() {
        assert!(Email::parse("foo@bar.example").unwrap().is_ascii());
        assert!(!Email::parse("café@bar.example").unwrap().is_ascii());
        assert!(!Email::parse("foo@exâmple.org").unwrap().is_ascii());
    }
}

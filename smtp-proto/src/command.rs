//! SMTP command grammar.

use std::str;

use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    bytes::streaming::{tag, take_until},
    character::complete::{char, space0, space1},
    combinator::{all_consuming, map, opt},
    multi::many0,
    sequence::{pair, preceded, terminated},
    IResult,
};

use crate::{
    addr::{mailbox, path, Email, Hostname},
    params::MailParams,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Helo { hostname: Hostname },
    Ehlo { hostname: Hostname },
    Mail { from: Option<Email>, params: MailParams },
    Rcpt { to: Email, params: MailParams },
    Data,
    Bdat { size: u64, last: bool },
    Rset,
    Noop,
    Quit,
    Starttls,
    Auth { mechanism: String, initial: Option<String> },
    Vrfy { name: String },
    Expn { name: String },
    Help { subject: Option<String> },
}

impl Command {
    /// Streaming parse: consumes one CRLF-terminated command line from
    /// `buf`, returning the remainder. `Incomplete` until the CRLF has
    /// arrived.
    pub fn parse(buf: &[u8]) -> IResult<&[u8], Command> {
        let (rest, line) = terminated(take_until("\r\n"), tag("\r\n"))(buf)?;
        let line = str::from_utf8(line).map_err(|_| syntax(buf))?;
        let cmd = parse_line(line).ok_or_else(|| syntax(buf))?;
        Ok((rest, cmd))
    }

    /// Wire form, CRLF included.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut s = match self {
            Command::Helo { hostname } => format!("HELO {}", hostname),
            Command::Ehlo { hostname } => format!("EHLO {}", hostname),
            Command::Mail { from, params } => {
                let mut s = match from {
                    Some(from) => format!("MAIL FROM:<{}>", from),
                    None => "MAIL FROM:<>".to_owned(),
                };
                let params = params.to_wire();
                if !params.is_empty() {
                    s.push(' ');
                    s.push_str(&params);
                }
                s
            }
            Command::Rcpt { to, .. } => format!("RCPT TO:<{}>", to),
            Command::Data => "DATA".to_owned(),
            Command::Bdat { size, last: false } => format!("BDAT {}", size),
            Command::Bdat { size, last: true } => format!("BDAT {} LAST", size),
            Command::Rset => "RSET".to_owned(),
            Command::Noop => "NOOP".to_owned(),
            Command::Quit => "QUIT".to_owned(),
            Command::Starttls => "STARTTLS".to_owned(),
            Command::Auth { mechanism, initial } => match initial {
                Some(i) if i.is_empty() => format!("AUTH {} =", mechanism),
                Some(i) => format!("AUTH {} {}", mechanism, i),
                None => format!("AUTH {}", mechanism),
            },
            Command::Vrfy { name } => format!("VRFY {}", name),
            Command::Expn { name } => format!("EXPN {}", name),
            Command::Help { subject: None } => "HELP".to_owned(),
            Command::Help { subject: Some(s) } => format!("HELP {}", s),
        };
        s.push_str("\r\n");
        s.into_bytes()
    }
}

fn syntax(buf: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Error(nom::error::Error::new(buf, nom::error::ErrorKind::Verify))
}

fn parse_line(line: &str) -> Option<Command> {
    let (verb, args) = match line.find(' ') {
        Some(i) => (&line[..i], &line[i + 1..]),
        None => (line, ""),
    };
    let bare = args.is_empty();
    if verb.eq_ignore_ascii_case("HELO") && !bare {
        Some(Command::Helo {
            hostname: Hostname::parse(args.trim_end())?,
        })
    } else if verb.eq_ignore_ascii_case("EHLO") && !bare {
        Some(Command::Ehlo {
            hostname: Hostname::parse(args.trim_end())?,
        })
    } else if verb.eq_ignore_ascii_case("MAIL") {
        let (from, raw) = ok(all_consuming(mail_args)(args))?;
        Some(Command::Mail {
            from,
            params: MailParams::from_raw(&raw).ok()?,
        })
    } else if verb.eq_ignore_ascii_case("RCPT") {
        let (to, raw) = ok(all_consuming(rcpt_args)(args))?;
        Some(Command::Rcpt {
            to,
            params: MailParams::from_raw(&raw).ok()?,
        })
    } else if verb.eq_ignore_ascii_case("DATA") && bare {
        Some(Command::Data)
    } else if verb.eq_ignore_ascii_case("BDAT") && !bare {
        let mut it = args.split_ascii_whitespace();
        let size: u64 = it.next()?.parse().ok()?;
        let last = match it.next() {
            None => false,
            Some(w) if w.eq_ignore_ascii_case("LAST") => true,
            Some(_) => return None,
        };
        if it.next().is_some() {
            return None;
        }
        Some(Command::Bdat { size, last })
    } else if verb.eq_ignore_ascii_case("RSET") && bare {
        Some(Command::Rset)
    } else if verb.eq_ignore_ascii_case("NOOP") {
        Some(Command::Noop)
    } else if verb.eq_ignore_ascii_case("QUIT") && bare {
        Some(Command::Quit)
    } else if verb.eq_ignore_ascii_case("STARTTLS") && bare {
        Some(Command::Starttls)
    } else if verb.eq_ignore_ascii_case("AUTH") && !bare {
        let mut it = args.split_ascii_whitespace();
        let mechanism = it.next()?.to_ascii_uppercase();
        let initial = it.next().map(|i| {
            if i == "=" {
                String::new()
            } else {
                i.to_owned()
            }
        });
        if it.next().is_some() {
            return None;
        }
        Some(Command::Auth { mechanism, initial })
    } else if verb.eq_ignore_ascii_case("VRFY") && !bare {
        Some(Command::Vrfy {
            name: args.to_owned(),
        })
    } else if verb.eq_ignore_ascii_case("EXPN") && !bare {
        Some(Command::Expn {
            name: args.to_owned(),
        })
    } else if verb.eq_ignore_ascii_case("HELP") {
        Some(Command::Help {
            subject: if bare { None } else { Some(args.to_owned()) },
        })
    } else {
        None
    }
}

fn ok<T>(r: IResult<&str, T>) -> Option<T> {
    r.ok().map(|(_, v)| v)
}

type RawParams = Vec<(String, Option<String>)>;

fn mail_args(i: &str) -> IResult<&str, (Option<Email>, RawParams)> {
    let (i, _) = tag_no_case("FROM:")(i)?;
    let (i, _) = space0(i)?;
    let (i, from) = reverse_path(i)?;
    let (i, raw) = raw_params(i)?;
    Ok((i, (from, raw)))
}

fn rcpt_args(i: &str) -> IResult<&str, (Email, RawParams)> {
    let (i, _) = tag_no_case("TO:")(i)?;
    let (i, _) = space0(i)?;
    // Lenient about missing angle brackets, like most real servers
    let (i, to) = alt((path, mailbox))(i)?;
    let (i, raw) = raw_params(i)?;
    Ok((i, (to, raw)))
}

fn reverse_path(i: &str) -> IResult<&str, Option<Email>> {
    alt((
        map(nom::bytes::complete::tag("<>"), |_| None),
        map(path, Some),
        map(mailbox, Some),
    ))(i)
}

fn is_param_char(c: char) -> bool {
    !c.is_whitespace() && c != '='
}

fn raw_params(i: &str) -> IResult<&str, RawParams> {
    let (i, raw) = many0(preceded(
        space1,
        pair(
            take_while1(is_param_char),
            opt(preceded(char('='), take_while1(|c: char| !c.is_whitespace()))),
        ),
    ))(i)?;
    Ok((
        i,
        raw.into_iter()
            .map(|(k, v)| (k.to_owned(), v.map(|v| v.to_owned())))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::BodyKind;

    fn parse_one(wire: &[u8]) -> Command {
        let (rem, cmd) = Command::parse(wire).unwrap();
        assert!(rem.is_empty(), "unparsed remainder {:?}", rem);
        cmd
    }

    #[test]
    fn basic_commands() {
        assert_eq!(parse_one(b"DATA\r\n"), Command::Data);
        assert_eq!(parse_one(b"rset\r\n"), Command::Rset);
        assert_eq!(parse_one(b"QUIT\r\n"), Command::Quit);
        assert_eq!(parse_one(b"StartTLS\r\n"), Command::Starttls);
        assert_eq!(parse_one(b"NOOP\r\n"), Command::Noop);
        assert_eq!(parse_one(b"NOOP ignored\r\n"), Command::Noop);
        assert_eq!(
            parse_one(b"EHLO mail.example.org\r\n"),
            Command::Ehlo {
                hostname: Hostname::parse("mail.example.org").unwrap()
            }
        );
    }

    #[test]
    fn mail_with_params() {
        match parse_one(b"MAIL FROM:<u@a.example> SIZE=100 BODY=8BITMIME SMTPUTF8\r\n") {
            Command::Mail { from, params } => {
                assert_eq!(from.unwrap().to_string(), "u@a.example");
                assert_eq!(params.size, Some(100));
                assert_eq!(params.body, Some(BodyKind::EightBitMime));
                assert!(params.smtputf8);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn null_reverse_path() {
        match parse_one(b"MAIL FROM:<>\r\n") {
            Command::Mail { from: None, .. } => (),
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn unbracketed_lenient() {
        match parse_one(b"MAIL FROM:u@a.example\r\n") {
            Command::Mail { from: Some(e), .. } => assert_eq!(e.to_string(), "u@a.example"),
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn bdat() {
        assert_eq!(
            parse_one(b"BDAT 1000\r\n"),
            Command::Bdat {
                size: 1000,
                last: false
            }
        );
        assert_eq!(
            parse_one(b"BDAT 0 LAST\r\n"),
            Command::Bdat {
                size: 0,
                last: true
            }
        );
        assert!(Command::parse(b"BDAT ten\r\n").is_err());
    }

    #[test]
    fn auth() {
        assert_eq!(
            parse_one(b"AUTH plain dGVzdA==\r\n"),
            Command::Auth {
                mechanism: "PLAIN".to_owned(),
                initial: Some("dGVzdA==".to_owned()),
            }
        );
        assert_eq!(
            parse_one(b"AUTH LOGIN\r\n"),
            Command::Auth {
                mechanism: "LOGIN".to_owned(),
                initial: None,
            }
        );
        assert_eq!(
            parse_one(b"AUTH PLAIN =\r\n"),
            Command::Auth {
                mechanism: "PLAIN".to_owned(),
                initial: Some(String::new()),
            }
        );
    }

    #[test]
    fn incomplete_and_garbage() {
        assert!(matches!(
            Command::parse(b"MAIL FROM:<u@a"),
            Err(nom::Err::Incomplete(_))
        ));
        assert!(Command::parse(b"THISISNOTACOMMAND\r\n").is_err());
        assert!(Command::parse(b"MAIL FROM:<u@a.example> RET=FULL\r\n").is_err());
        assert!(Command::parse(b"DATA now\r\n").is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let cmds: &[&[u8]] = &[
            b"EHLO mail.example.org\r\n",
            b"MAIL FROM:<u@a.example> SIZE=100\r\n",
            b"RCPT TO:<v@b.example>\r\n",
            b"DATA\r\n",
            b"BDAT 42 LAST\r\n",
            b"QUIT\r\n",
        ];
        for &wire in cmds {
            assert_eq!(parse_one(wire).to_wire(), wire.to_vec());
        }
    }
}

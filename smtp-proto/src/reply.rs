//! SMTP replies: three-digit code plus one or more text lines.

use std::fmt;

use nom::{
    branch::alt,
    bytes::streaming::{tag, take_until, take_while_m_n},
    IResult,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyCode(u16);

#[allow(dead_code)]
impl ReplyCode {
    pub const SYSTEM_STATUS: ReplyCode = ReplyCode(211);
    pub const HELP_MESSAGE: ReplyCode = ReplyCode(214);
    pub const SERVICE_READY: ReplyCode = ReplyCode(220);
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode(221);
    pub const AUTH_SUCCEEDED: ReplyCode = ReplyCode(235);
    pub const OKAY: ReplyCode = ReplyCode(250);
    pub const CANNOT_VRFY_BUT_PLEASE_TRY: ReplyCode = ReplyCode(252);
    pub const AUTH_CONTINUE: ReplyCode = ReplyCode(334);
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode(354);
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode(421);
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: ReplyCode = ReplyCode(450);
    pub const LOCAL_ERROR: ReplyCode = ReplyCode(451);
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode(452);
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode(500);
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode(501);
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode(502);
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode(503);
    pub const PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode(504);
    pub const AUTHENTICATION_REQUIRED: ReplyCode = ReplyCode(530);
    pub const AUTHENTICATION_FAILED: ReplyCode = ReplyCode(535);
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode(550);
    pub const POLICY_REASON: ReplyCode = ReplyCode(550);
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode(552);
    pub const MAILBOX_NAME_INCORRECT: ReplyCode = ReplyCode(553);
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode(554);

    pub fn custom(code: u16) -> ReplyCode {
        assert!((200..600).contains(&code));
        ReplyCode(code)
    }

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn kind(self) -> ReplyCodeKind {
        match self.0 / 100 {
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

/// A full reply, possibly spanning several `NNN-` continuation lines.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    pub code: ReplyCode,
    pub text: Vec<String>,
}

impl Reply {
    pub fn new(code: ReplyCode, line: impl Into<String>) -> Reply {
        Reply {
            code,
            text: vec![line.into()],
        }
    }

    pub fn push_line(mut self, line: impl Into<String>) -> Reply {
        self.text.push(line.into());
        self
    }

    /// First text line, for log and error messages.
    pub fn message(&self) -> &str {
        self.text.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Streaming parse of one full (possibly multi-line) reply.
    pub fn parse(buf: &[u8]) -> IResult<&[u8], Reply> {
        let mut rest = buf;
        let mut code = None;
        let mut text = Vec::new();
        loop {
            let (r, (c, is_last, line)) = reply_line(rest)?;
            match code {
                None => code = Some(c),
                Some(prev) if prev != c => {
                    return Err(nom::Err::Error(nom::error::Error::new(
                        buf,
                        nom::error::ErrorKind::Verify,
                    )))
                }
                Some(_) => (),
            }
            text.push(line);
            rest = r;
            if is_last {
                // code was set when the first line parsed
                return Ok((
                    rest,
                    Reply {
                        code: ReplyCode(code.unwrap()),
                        text,
                    },
                ));
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.text.iter().map(|l| l.len() + 6).sum::<usize>() + 6);
        let last = self.text.len().saturating_sub(1);
        if self.text.is_empty() {
            out.extend_from_slice(format!("{} \r\n", self.code.code()).as_bytes());
        }
        for (i, line) in self.text.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.extend_from_slice(format!("{}{}{}\r\n", self.code.code(), sep, line).as_bytes());
        }
        out
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.code.code(), self.message())
    }
}

fn reply_line(i: &[u8]) -> IResult<&[u8], (u16, bool, String)> {
    let (i, digits) = take_while_m_n(3, 3, |b: u8| b.is_ascii_digit())(i)?;
    let (i, sep) = alt((tag(" "), tag("-")))(i)?;
    let (i, line) = take_until("\r\n")(i)?;
    let (i, _) = tag("\r\n")(i)?;
    // Safe: take_while_m_n only matched ASCII digits
    let code: u16 = std::str::from_utf8(digits).unwrap().parse().unwrap();
    if !(200..600).contains(&code) {
        return Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Verify,
        )));
    }
    Ok((
        i,
        (
            code,
            sep == b" ",
            String::from_utf8_lossy(line).into_owned(),
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let (rem, r) = Reply::parse(b"250 All is well\r\nMAIL").unwrap();
        assert_eq!(rem, b"MAIL");
        assert_eq!(r.code, ReplyCode::OKAY);
        assert_eq!(r.text, vec!["All is well".to_owned()]);
        assert_eq!(r.to_bytes(), b"250 All is well\r\n");
    }

    #[test]
    fn multi_line() {
        let wire = b"250-mail.example.org\r\n250-PIPELINING\r\n250 SIZE 10000\r\n";
        let (rem, r) = Reply::parse(wire).unwrap();
        assert!(rem.is_empty());
        assert_eq!(r.text.len(), 3);
        assert_eq!(r.to_bytes(), wire.to_vec());
    }

    #[test]
    fn incomplete() {
        assert!(matches!(
            Reply::parse(b"250-first\r\n250 seco"),
            Err(nom::Err::Incomplete(_))
        ));
        assert!(matches!(Reply::parse(b"25"), Err(nom::Err::Incomplete(_))));
    }

    #[test]
    fn mismatched_codes() {
        assert!(matches!(
            Reply::parse(b"250-a\r\n550 b\r\n"),
            Err(nom::Err::Error(_))
        ));
    }

    #[test]
    fn kinds() {
        assert_eq!(
            ReplyCode::OKAY.kind(),
            ReplyCodeKind::PositiveCompletion
        );
        assert_eq!(
            ReplyCode::START_MAIL_INPUT.kind(),
            ReplyCodeKind::PositiveIntermediate
        );
        assert_eq!(
            ReplyCode::LOCAL_ERROR.kind(),
            ReplyCodeKind::TransientNegative
        );
        assert_eq!(
            ReplyCode::MAILBOX_UNAVAILABLE.kind(),
            ReplyCodeKind::PermanentNegative
        );
    }
}

//! MAIL FROM / RCPT TO esmtp parameters.

use std::fmt;

use crate::xtext::{xtext_decode, XtextError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyKind {
    SevenBit,
    EightBitMime,
    BinaryMime,
}

impl BodyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BodyKind::SevenBit => "7BIT",
            BodyKind::EightBitMime => "8BITMIME",
            BodyKind::BinaryMime => "BINARYMIME",
        }
    }

    pub fn parse(s: &str) -> Option<BodyKind> {
        if s.eq_ignore_ascii_case("7BIT") {
            Some(BodyKind::SevenBit)
        } else if s.eq_ignore_ascii_case("8BITMIME") {
            Some(BodyKind::EightBitMime)
        } else if s.eq_ignore_ascii_case("BINARYMIME") {
            Some(BodyKind::BinaryMime)
        } else {
            None
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum ParamError {
    UnknownKeyword(String),
    BadValue(String),
    BadXtext(XtextError),
}

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParamError::UnknownKeyword(k) => write!(f, "unknown parameter {}", k),
            ParamError::BadValue(k) => write!(f, "invalid value for parameter {}", k),
            ParamError::BadXtext(e) => write!(f, "invalid AUTH parameter: {}", e),
        }
    }
}

impl std::error::Error for ParamError {}

/// The typed view of the MAIL FROM parameter list. RCPT TO takes no
/// parameters we recognise, so an empty list is required there.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MailParams {
    pub size: Option<u64>,
    pub body: Option<BodyKind>,
    /// Decoded xtext of AUTH=<...>, empty vec for AUTH=<>.
    pub auth: Option<Vec<u8>>,
    pub smtputf8: bool,
}

impl MailParams {
    pub fn from_raw(raw: &[(String, Option<String>)]) -> Result<MailParams, ParamError> {
        let mut params = MailParams::default();
        for (key, value) in raw {
            if key.eq_ignore_ascii_case("SIZE") {
                let v = value.as_deref().ok_or_else(|| bad(key))?;
                params.size = Some(v.parse().map_err(|_| bad(key))?);
            } else if key.eq_ignore_ascii_case("BODY") {
                let v = value.as_deref().ok_or_else(|| bad(key))?;
                params.body = Some(BodyKind::parse(v).ok_or_else(|| bad(key))?);
            } else if key.eq_ignore_ascii_case("AUTH") {
                let v = value.as_deref().ok_or_else(|| bad(key))?;
                let v = v.strip_prefix('<').and_then(|v| v.strip_suffix('>')).unwrap_or(v);
                params.auth = Some(xtext_decode(v).map_err(ParamError::BadXtext)?);
            } else if key.eq_ignore_ascii_case("SMTPUTF8") {
                if value.is_some() {
                    return Err(bad(key));
                }
                params.smtputf8 = true;
            } else {
                return Err(ParamError::UnknownKeyword(key.clone()));
            }
        }
        Ok(params)
    }

    /// Renders the parameter list back to its wire form, without
    /// leading space.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let mut push = |s: String| {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&s);
        };
        if let Some(size) = self.size {
            push(format!("SIZE={}", size));
        }
        if let Some(body) = self.body {
            push(format!("BODY={}", body.as_str()));
        }
        if let Some(auth) = &self.auth {
            push(format!("AUTH=<{}>", crate::xtext::xtext_encode(auth)));
        }
        if self.smtputf8 {
            push("SMTPUTF8".to_owned());
        }
        out
    }
}

fn bad(key: &str) -> ParamError {
    ParamError::BadValue(key.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(|v| v.to_string())))
            .collect()
    }

    #[test]
    fn typical_mail_params() {
        let p = MailParams::from_raw(&raw(&[
            ("SIZE", Some("12345")),
            ("BODY", Some("8BITMIME")),
            ("AUTH", Some("alice")),
            ("SMTPUTF8", None),
        ]))
        .unwrap();
        assert_eq!(p.size, Some(12345));
        assert_eq!(p.body, Some(BodyKind::EightBitMime));
        assert_eq!(p.auth.as_deref(), Some(&b"alice"[..]));
        assert!(p.smtputf8);
        assert_eq!(p.to_wire(), "SIZE=12345 BODY=8BITMIME AUTH=<alice> SMTPUTF8");
    }

    #[test]
    fn case_insensitive_keywords() {
        let p = MailParams::from_raw(&raw(&[("body", Some("binarymime"))])).unwrap();
        assert_eq!(p.body, Some(BodyKind::BinaryMime));
    }

    #[test]
    fn rejects() {
        assert!(matches!(
            MailParams::from_raw(&raw(&[("SIZE", Some("big"))])),
            Err(ParamError::BadValue(_))
        ));
        assert!(matches!(
            MailParams::from_raw(&raw(&[("BODY", Some("QUANTUM"))])),
            Err(ParamError::BadValue(_))
        ));
        assert!(matches!(
            MailParams::from_raw(&raw(&[("RET", Some("FULL"))])),
            Err(ParamError::UnknownKeyword(_))
        ));
        assert!(matches!(
            MailParams::from_raw(&raw(&[("SMTPUTF8", Some("YES"))])),
            Err(ParamError::BadValue(_))
        ));
    }

    #[test]
    fn empty_auth() {
        let p = MailParams::from_raw(&raw(&[("AUTH", Some("<>"))])).unwrap();
        assert_eq!(p.auth.as_deref(), Some(&b""[..]));
    }
}

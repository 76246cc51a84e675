//! RFC 3461 xtext codec, used for AUTH parameters, envelope
//! authentication fields and secrets-file ids.

use std::fmt;

#[derive(Debug, Eq, PartialEq)]
pub struct XtextError {
    pub at: usize,
}

impl fmt::Display for XtextError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid xtext escape at byte {}", self.at)
    }
}

impl std::error::Error for XtextError {}

pub fn xtext_encode(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if (33..=126).contains(&b) && b != b'+' && b != b'=' {
            out.push(b as char);
        } else {
            out.push_str(&format!("+{:02X}", b));
        }
    }
    out
}

pub fn xtext_decode(xtext: &str) -> Result<Vec<u8>, XtextError> {
    let bytes = xtext.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                let hex = bytes.get(i + 1..i + 3).ok_or(XtextError { at: i })?;
                let hex = std::str::from_utf8(hex).map_err(|_| XtextError { at: i })?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| XtextError { at: i })?);
                i += 3;
            }
            b @ 33..=126 if b != b'=' => {
                out.push(b);
                i += 1;
            }
            _ => return Err(XtextError { at: i }),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let tests: &[(&[u8], &str)] = &[
            (b"alice", "alice"),
            (b"", ""),
            (b"a b", "a+20b"),
            (b"a+b=c", "a+2Bb+3Dc"),
            (b"\x01\xff", "+01+FF"),
        ];
        for &(raw, enc) in tests {
            assert_eq!(xtext_encode(raw), enc);
            assert_eq!(xtext_decode(enc).unwrap(), raw);
        }
    }

    #[test]
    fn reject_bad_escapes() {
        assert!(xtext_decode("+").is_err());
        assert!(xtext_decode("+1").is_err());
        assert!(xtext_decode("+zz").is_err());
        assert!(xtext_decode("a=b").is_err());
        assert!(xtext_decode("sp ace").is_err());
    }
}

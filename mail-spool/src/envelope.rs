//! The envelope file: one `Key: value` pair per line, ASCII keys,
//! terminated by the `End: 1` sentinel. A file without the sentinel
//! is a partial write and is never treated as a live message.

use smtp_proto::BodyKind;

use crate::SpoolError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    /// Reverse path, empty for the null sender.
    pub from: String,
    /// Whether the submitter was a local one.
    pub from_is_local: bool,
    pub to_local: Vec<String>,
    /// Remote recipients, in original envelope order.
    pub to_remote: Vec<String>,
    /// Authentication id of the submitter, xtext, possibly empty.
    pub authentication: String,
    /// Submitter peer address, `ip:port`.
    pub client: String,
    /// One-line PEM, if the submitter presented a certificate.
    pub client_certificate: Option<String>,
    pub from_auth_in: String,
    pub from_auth_out: String,
    pub utf8_mailboxes: bool,
    pub body: BodyKind,
    /// Failure reason recorded when the envelope was marked bad.
    pub reason: Option<String>,
}

impl Default for Envelope {
    fn default() -> Envelope {
        Envelope {
            from: String::new(),
            from_is_local: true,
            to_local: Vec::new(),
            to_remote: Vec::new(),
            authentication: String::new(),
            client: String::new(),
            client_certificate: None,
            from_auth_in: String::new(),
            from_auth_out: String::new(),
            utf8_mailboxes: false,
            body: BodyKind::SevenBit,
            reason: None,
        }
    }
}

impl Envelope {
    pub fn recipients(&self) -> usize {
        self.to_local.len() + self.to_remote.len()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if self.from_is_local {
            out.push_str(&format!("From-Local: {}\n", self.from));
        } else {
            out.push_str(&format!("From-Remote: {}\n", self.from));
        }
        for to in &self.to_local {
            out.push_str(&format!("To-Local: {}\n", to));
        }
        for to in &self.to_remote {
            out.push_str(&format!("To-Remote: {}\n", to));
        }
        out.push_str(&format!("Authentication: {}\n", self.authentication));
        out.push_str(&format!("Client: {}\n", self.client));
        if let Some(cert) = &self.client_certificate {
            out.push_str(&format!("Client-Certificate: {}\n", cert));
        }
        out.push_str(&format!("From-Authentication-In: {}\n", self.from_auth_in));
        out.push_str(&format!("From-Authentication-Out: {}\n", self.from_auth_out));
        out.push_str(&format!(
            "Utf8-Mailboxes: {}\n",
            if self.utf8_mailboxes { "yes" } else { "no" }
        ));
        out.push_str(&format!("Body: {}\n", body_name(self.body)));
        if let Some(reason) = &self.reason {
            out.push_str(&format!("Reason: {}\n", reason));
        }
        out.push_str("End: 1\n");
        out
    }

    /// Parses an envelope file. `Err(SpoolError::PartialEnvelope)` if
    /// the sentinel is missing.
    pub fn parse(text: &str) -> Result<Envelope, SpoolError> {
        let mut env = Envelope::default();
        let mut saw_from = false;
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => return Err(SpoolError::BadEnvelope(line.to_owned())),
            };
            match key {
                "From-Local" => {
                    env.from = value.to_owned();
                    env.from_is_local = true;
                    saw_from = true;
                }
                "From-Remote" => {
                    env.from = value.to_owned();
                    env.from_is_local = false;
                    saw_from = true;
                }
                "To-Local" => env.to_local.push(value.to_owned()),
                "To-Remote" => env.to_remote.push(value.to_owned()),
                "Authentication" => env.authentication = value.to_owned(),
                "Client" => env.client = value.to_owned(),
                "Client-Certificate" => env.client_certificate = Some(value.to_owned()),
                // MailFromAuthIn is the legacy spelling, honored on read
                "From-Authentication-In" | "MailFromAuthIn" => {
                    env.from_auth_in = value.to_owned()
                }
                "From-Authentication-Out" => env.from_auth_out = value.to_owned(),
                "Utf8-Mailboxes" => env.utf8_mailboxes = value.eq_ignore_ascii_case("yes"),
                "Body" => {
                    env.body = parse_body(value)
                        .ok_or_else(|| SpoolError::BadEnvelope(line.to_owned()))?
                }
                "Reason" => env.reason = Some(value.to_owned()),
                "End" => {
                    if !saw_from {
                        return Err(SpoolError::BadEnvelope("missing From line".to_owned()));
                    }
                    return Ok(env);
                }
                _ => return Err(SpoolError::BadEnvelope(line.to_owned())),
            }
        }
        Err(SpoolError::PartialEnvelope)
    }
}

fn body_name(body: BodyKind) -> &'static str {
    match body {
        BodyKind::SevenBit => "7bit",
        BodyKind::EightBitMime => "8bitmime",
        BodyKind::BinaryMime => "binarymime",
    }
}

fn parse_body(value: &str) -> Option<BodyKind> {
    if value.eq_ignore_ascii_case("7bit") {
        Some(BodyKind::SevenBit)
    } else if value.eq_ignore_ascii_case("8bitmime") {
        Some(BodyKind::EightBitMime)
    } else if value.eq_ignore_ascii_case("binarymime") {
        Some(BodyKind::BinaryMime)
    } else {
        None
    }
}

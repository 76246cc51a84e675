//! The `Received:` trace header added at message reception.

use chrono::{DateTime, Utc};

pub struct ReceivedInfo<'a> {
    /// The EHLO/HELO name the submitter presented.
    pub peer_host: &'a str,
    pub peer_ip: &'a str,
    pub our_domain: &'a str,
    pub is_esmtp: bool,
    pub is_tls: bool,
    /// Authentication id, empty when unauthenticated.
    pub auth_id: &'a str,
    pub msgid: &'a str,
    pub when: DateTime<Utc>,
}

/// `SMTP`, `ESMTP`, `ESMTPS`, `ESMTPA` or `ESMTPSA` per RFC 3848.
fn with_protocol(esmtp: bool, tls: bool, auth: bool) -> &'static str {
    match (esmtp, tls, auth) {
        (false, _, _) => "SMTP",
        (true, false, false) => "ESMTP",
        (true, true, false) => "ESMTPS",
        (true, false, true) => "ESMTPA",
        (true, true, true) => "ESMTPSA",
    }
}

pub fn received_line(info: &ReceivedInfo<'_>) -> String {
    let mut line = format!(
        "Received: from {} ([{}]) by {} with {}",
        info.peer_host,
        info.peer_ip,
        info.our_domain,
        with_protocol(info.is_esmtp, info.is_tls, !info.auth_id.is_empty()),
    );
    if info.is_tls {
        line.push_str("\r\n\t(encrypted)");
    }
    if !info.auth_id.is_empty() {
        line.push_str(&format!("\r\n\t(authenticated as {})", info.auth_id));
    }
    line.push_str(&format!(
        "\r\n\tid {}; {}",
        info.msgid,
        info.when.to_rfc2822()
    ));
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn protocol_names() {
        assert_eq!(with_protocol(false, false, false), "SMTP");
        assert_eq!(with_protocol(true, false, false), "ESMTP");
        assert_eq!(with_protocol(true, true, false), "ESMTPS");
        assert_eq!(with_protocol(true, false, true), "ESMTPA");
        assert_eq!(with_protocol(true, true, true), "ESMTPSA");
    }

    #[test]
    fn formats_the_header() {
        let when = Utc.ymd(2024, 5, 17).and_hms(10, 30, 0);
        let line = received_line(&ReceivedInfo {
            peer_host: "client.example.org",
            peer_ip: "192.0.2.7",
            our_domain: "relay.example.net",
            is_esmtp: true,
            is_tls: false,
            auth_id: "alice",
            msgid: "1700000000.42.1",
            when,
        });
        assert!(line.starts_with(
            "Received: from client.example.org ([192.0.2.7]) by relay.example.net with ESMTPA"
        ));
        assert!(line.contains("(authenticated as alice)"));
        assert!(line.contains("id 1700000000.42.1; "));
        assert!(line.contains("Fri, 17 May 2024 10:30:00 +0000"));
    }
}

//! SIP message parsing and response/request building.
//! Reference: RFC 3261 - SIP: Session Initiation Protocol

use rand::Rng;
use std::collections::HashMap;

/// RFC 3261 §7.3.3: implementations MUST accept both long and short forms
/// of each header name (§20 defines the mappings).
fn expand_compact(name: &str) -> &str {
    match name {
        "v" => "Via",
        "f" => "From",
        "t" => "To",
        "i" => "Call-ID",
        "m" => "Contact",
        "l" => "Content-Length",
        "c" => "Content-Type",
        other => other,
    }
}

/// A parsed SIP request or response.
///
/// For responses, `method` holds the SIP version and `uri` holds the
/// status code string — the start-line is parsed positionally without
/// knowing in advance whether it is a request or a response line, so
/// downstream code reads `uri == "200"` to recognize a 200 OK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl SipMessage {
    /// Case-insensitive header lookup (RFC 3261 §7.3.1), first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| key.to_ascii_lowercase() == lower)
            .map(|(_, value)| value.as_str())
    }

    /// All header values for `name`, in order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(|(key, _)| key.to_ascii_lowercase() == lower)
            .map(|(_, value)| value.as_str())
            .collect()
    }
}

/// Parse a SIP message (request or response) from raw datagram bytes.
pub fn parse(data: &[u8]) -> SipMessage {
    // RFC 3261 §7: SIP is UTF-8 text; messages use CRLF line endings.
    let text = String::from_utf8_lossy(data);
    // RFC 3261 §7: an empty line (CRLF CRLF) separates headers from body.
    let (head, body) = match text.split_once("\r\n\r\n") {
        Some((h, b)) => (h, b),
        None => (text.as_ref(), ""),
    };

    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or("");
    // RFC 3261 §7.1: Request-Line = Method SP Request-URI SP SIP-Version.
    let mut parts = start_line.splitn(3, ' ');
    let method = parts.next().unwrap_or("").to_string();
    let uri = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("SIP/2.0").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            let key = expand_compact(key.trim()).to_string();
            headers.push((key, value.trim().to_string()));
        }
    }

    SipMessage {
        method,
        uri,
        version,
        headers,
        body: body.to_string(),
    }
}

fn encode_message(mut lines: Vec<String>, body: &str, content_type: &str) -> Vec<u8> {
    let body_bytes = body.as_bytes();
    // RFC 3261 §7.4.1: Content-Type MUST indicate the media type of the body.
    if !body_bytes.is_empty() {
        lines.push(format!("Content-Type: {}", content_type));
    }
    // RFC 3261 §7.4.2: Content-Length is the body length in bytes, not chars.
    lines.push(format!("Content-Length: {}", body_bytes.len()));
    lines.push(String::new());
    let mut out = lines.join("\r\n").into_bytes();
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body_bytes);
    out
}

/// Build a SIP response mirroring the Via/From/Call-ID/CSeq/To of `request`.
pub fn build_response(
    request: &SipMessage,
    status_code: u16,
    reason: &str,
    body: &str,
    to_tag: Option<&str>,
    extra_headers: &[(&str, String)],
    content_type: &str,
) -> Vec<u8> {
    // RFC 3261 §7.2: Status-Line = SIP-Version SP Status-Code SP Reason-Phrase.
    let mut lines = vec![format!("SIP/2.0 {} {}", status_code, reason)];

    // RFC 3261 §8.2.6.2: Via values MUST equal the request's, same order.
    for (key, value) in &request.headers {
        if key.eq_ignore_ascii_case("via") {
            lines.push(format!("Via: {}", value));
        }
    }

    // RFC 3261 §8.2.6.2: From, Call-ID, CSeq MUST equal the request's.
    for hdr in ["From", "Call-ID", "CSeq"] {
        if let Some(value) = request.header(hdr) {
            lines.push(format!("{}: {}", hdr, value));
        }
    }

    // RFC 3261 §8.2.6.2: if the request's To has no tag, the UAS adds one
    // (except 100 Trying, where a tag SHOULD NOT be added); an existing tag
    // is echoed unchanged.
    if let Some(to_value) = request.header("To") {
        let to_value = match to_tag {
            Some(tag) if !to_value.contains(";tag=") => format!("{};tag={}", to_value, tag),
            _ => to_value.to_string(),
        };
        lines.push(format!("To: {}", to_value));
    }

    for (name, value) in extra_headers {
        lines.push(format!("{}: {}", name, value));
    }

    encode_message(lines, body, content_type)
}

/// Build a SIP request with the given headers, in order.
pub fn build_request(
    method: &str,
    uri: &str,
    headers: &[(&str, String)],
    body: &str,
    content_type: &str,
) -> Vec<u8> {
    // RFC 3261 §7.1: Request-Line = Method SP Request-URI SP SIP-Version.
    let mut lines = vec![format!("{} {} SIP/2.0", method, uri)];
    for (name, value) in headers {
        lines.push(format!("{}: {}", name, value));
    }
    encode_message(lines, body, content_type)
}

const TAG_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_tag_chars(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| TAG_CHARS[rng.gen_range(0..TAG_CHARS.len())] as char)
        .collect()
}

/// Generate a random From/To tag.
///
/// RFC 3261 §19.3: tags MUST be globally unique and cryptographically
/// random with at least 32 bits of randomness.
pub fn generate_tag() -> String {
    random_tag_chars(8)
}

/// Generate a random Via branch parameter.
///
/// RFC 3261 §8.1.1.7: the branch MUST be unique across space and time and
/// MUST begin with the magic cookie "z9hG4bK" so receivers can identify
/// RFC 3261-compliant transaction IDs (§17.1.3).
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", random_tag_chars(8))
}

/// Parse the semicolon-delimited parameters of a Via header value.
///
/// RFC 3261 §20.42: parameters follow the transport/sent-by segment
/// (excluded here). A bare parameter (no `=`) maps to the empty string —
/// this matters for `rport` request semantics per RFC 3581.
pub fn parse_via_params(via: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for part in via.split(';').skip(1) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => {
                params.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                params.insert(part.to_string(), String::new());
            }
        }
    }
    params
}

/// Extract the Via branch parameter for transaction matching.
///
/// RFC 3261 §17.1.3: a response is matched to its transaction by comparing
/// the topmost Via branch along with the CSeq method.
pub fn extract_branch(msg: &SipMessage) -> Option<String> {
    let via = msg.header("Via")?;
    parse_via_params(via).get("branch").cloned()
}

/// Extract the user-part of a `sip:user@host[:port]` URI, falling back to
/// the host when no user part is present.
pub fn extract_extension(uri: &str) -> String {
    let uri = uri.strip_prefix("sip:").unwrap_or(uri);
    let uri = uri.split(&[';', '?'][..]).next().unwrap_or(uri);
    let host_part = match uri.split_once('@') {
        Some((user, _host)) => return user.to_string(),
        None => uri,
    };
    host_part.split(':').next().unwrap_or(host_part).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(lines: &[&str], body: &str) -> SipMessage {
        let raw = format!("{}\r\n\r\n{}", lines.join("\r\n"), body);
        parse(raw.as_bytes())
    }

    #[test]
    fn parse_request_start_line() {
        let msg = req(
            &[
                "INVITE sip:1000@example.com SIP/2.0",
                "Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKabc",
            ],
            "",
        );
        assert_eq!(msg.method, "INVITE");
        assert_eq!(msg.uri, "sip:1000@example.com");
        assert_eq!(msg.version, "SIP/2.0");
    }

    #[test]
    fn parse_response_records_status_in_uri_slot() {
        let msg = req(&["SIP/2.0 200 OK", "Via: SIP/2.0/UDP 1.2.3.4:5060"], "");
        assert_eq!(msg.method, "SIP/2.0");
        assert_eq!(msg.uri, "200");
        assert_eq!(msg.version, "OK");
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_first_match() {
        let msg = req(&["INVITE sip:x SIP/2.0", "vIa: one", "Via: two"], "");
        assert_eq!(msg.header("VIA"), Some("one"));
        assert_eq!(msg.values("via"), vec!["one", "two"]);
    }

    #[test]
    fn compact_headers_are_expanded() {
        let msg = req(&["INVITE sip:x SIP/2.0", "t: <sip:a@b>", "f: <sip:c@d>"], "");
        assert_eq!(msg.header("To"), Some("<sip:a@b>"));
        assert_eq!(msg.header("From"), Some("<sip:c@d>"));
    }

    #[test]
    fn parse_handles_missing_body_separator() {
        let msg = parse(b"OPTIONS sip:x SIP/2.0\r\nVia: x");
        assert_eq!(msg.method, "OPTIONS");
        assert_eq!(msg.body, "");
    }

    #[test]
    fn build_response_mirrors_all_vias_in_order() {
        let request = req(
            &[
                "INVITE sip:x SIP/2.0",
                "Via: SIP/2.0/UDP 1.1.1.1:5060;branch=a",
                "Via: SIP/2.0/UDP 2.2.2.2:5060;branch=b",
                "From: <sip:c@d>;tag=ft",
                "Call-ID: abc",
                "CSeq: 1 INVITE",
                "To: <sip:e@f>",
            ],
            "",
        );
        let bytes = build_response(&request, 200, "OK", "", Some("tt"), &[], "application/sdp");
        let response = parse(&bytes);
        assert_eq!(
            response.values("Via"),
            vec![
                "SIP/2.0/UDP 1.1.1.1:5060;branch=a",
                "SIP/2.0/UDP 2.2.2.2:5060;branch=b"
            ]
        );
        assert_eq!(response.header("To"), Some("<sip:e@f>;tag=tt"));
    }

    #[test]
    fn build_response_does_not_double_tag() {
        let request = req(&["BYE sip:x SIP/2.0", "To: <sip:e@f>;tag=existing"], "");
        let bytes = build_response(&request, 200, "OK", "", Some("tt"), &[], "application/sdp");
        let response = parse(&bytes);
        assert_eq!(response.header("To"), Some("<sip:e@f>;tag=existing"));
    }

    #[test]
    fn build_response_omits_to_tag_for_100_trying() {
        let request = req(&["INVITE sip:x SIP/2.0", "To: <sip:e@f>"], "");
        let bytes = build_response(&request, 100, "Trying", "", None, &[], "application/sdp");
        let response = parse(&bytes);
        assert_eq!(response.header("To"), Some("<sip:e@f>"));
    }

    #[test]
    fn content_length_counts_bytes_not_chars() {
        // "café" is 4 chars but 5 UTF-8 bytes.
        let bytes = build_request("INVITE", "sip:x", &[], "café", "application/sdp");
        let response = parse(&bytes);
        assert_eq!(response.header("Content-Length"), Some("5"));
    }

    #[test]
    fn empty_body_omits_content_type() {
        let bytes = build_request("BYE", "sip:x", &[], "", "application/sdp");
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("Content-Type"));
        assert!(text.contains("Content-Length: 0"));
    }

    #[test]
    fn generate_branch_has_magic_cookie() {
        for _ in 0..10 {
            let branch = generate_branch();
            assert!(branch.starts_with("z9hG4bK"));
            assert_eq!(branch.len(), 7 + 8);
        }
    }

    #[test]
    fn generate_tag_is_lowercase_alphanumeric() {
        let tag = generate_tag();
        assert_eq!(tag.len(), 8);
        assert!(tag.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn parse_via_params_bare_param_is_empty_string() {
        let params = parse_via_params("SIP/2.0/UDP 1.2.3.4:5060;rport;branch=abc");
        assert_eq!(params.get("rport").map(String::as_str), Some(""));
        assert_eq!(params.get("branch").map(String::as_str), Some("abc"));
    }

    #[test]
    fn extract_branch_from_topmost_via() {
        let msg = req(
            &["INVITE sip:x SIP/2.0", "Via: SIP/2.0/UDP 1.1.1.1;branch=z9hG4bKfoo"],
            "",
        );
        assert_eq!(extract_branch(&msg), Some("z9hG4bKfoo".to_string()));
    }

    #[test]
    fn extract_extension_user_part() {
        assert_eq!(extract_extension("sip:1000@example.com"), "1000");
        assert_eq!(extract_extension("sip:1000@example.com:5060"), "1000");
    }

    #[test]
    fn extract_extension_falls_back_to_host() {
        assert_eq!(extract_extension("sip:example.com"), "example.com");
        assert_eq!(extract_extension("sip:example.com:5060"), "example.com");
    }
}


#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn parse_never_panics_on_bounded_input() {
        let data: [u8; 64] = kani::any();
        let _ = parse(&data);
    }

    #[kani::proof]
    fn extract_extension_never_panics_on_bounded_input() {
        let data: [u8; 32] = kani::any();
        if let Ok(s) = std::str::from_utf8(&data) {
            let _ = extract_extension(s);
        }
    }
}

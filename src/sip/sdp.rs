//! SDP offer parsing and answer generation for SIP INVITE exchanges.
//! Reference: RFC 4566 - Session Description Protocol (subset only).

/// Remote audio endpoint extracted from an SDP offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioOffer {
    pub address: String,
    pub port: u16,
}

/// Parse an SDP offer body for the audio `m=`/`c=` lines.
///
/// Tolerant of absent fields and extra whitespace: defaults to port 0 and
/// address `0.0.0.0` when a line is missing or malformed.
pub fn parse_offer(text: &str) -> AudioOffer {
    let mut port = 0u16;
    let mut address = "0.0.0.0".to_string();

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("m=audio ") {
            if let Some(port_str) = rest.split_whitespace().next() {
                if let Ok(parsed) = port_str.parse() {
                    port = parsed;
                }
            }
        } else if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            let addr = rest.split('/').next().unwrap_or(rest).trim();
            if !addr.is_empty() {
                address = addr.to_string();
            }
        }
    }

    AudioOffer { address, port }
}

/// Build a minimal SDP answer offering PCMU/8000 only.
pub fn build_answer(server_ip: &str, rtp_port: u16) -> String {
    let lines = [
        "v=0".to_string(),
        format!("o=frizzle 0 0 IN IP4 {}", server_ip),
        "s=frizzle-phone".to_string(),
        format!("c=IN IP4 {}", server_ip),
        "t=0 0".to_string(),
        format!("m=audio {} RTP/AVP 0", rtp_port),
        "a=rtpmap:0 PCMU/8000".to_string(),
        "a=ptime:20".to_string(),
        String::new(),
    ];
    lines.join("\r\n")
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// parse_offer never panics on arbitrary text.
        #[test]
        fn parse_offer_never_panics(input in ".*") {
            let _ = parse_offer(&input);
        }

        /// build_answer always round-trips its own port through parse_offer.
        #[test]
        fn build_answer_round_trips_port(port in 1u16..65535u16) {
            let answer = build_answer("9.9.9.9", port);
            let parsed = parse_offer(&answer);
            prop_assert_eq!(parsed.port, port);
            prop_assert_eq!(parsed.address, "9.9.9.9");
        }
    }
}

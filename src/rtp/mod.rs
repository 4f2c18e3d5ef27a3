mod sender;

pub use sender::{build_rtp_packet, RtpSender, RtpStreamDone, PAYLOAD_TYPE_PCMU, SAMPLES_PER_PACKET};

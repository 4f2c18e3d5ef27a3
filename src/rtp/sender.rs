//! RTP packet construction and the paced send loop.
//! Reference: RFC 3550 - RTP: A Transport Protocol for Real-Time Applications.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const RTP_VERSION: u8 = 2;
pub const PAYLOAD_TYPE_PCMU: u8 = 0;
pub const PTIME_MS: u64 = 20;
/// 8 kHz * 20 ms.
pub const SAMPLES_PER_PACKET: usize = 160;

/// Build a 12-byte RTP header followed by `payload`.
pub fn build_rtp_packet(seq: u16, timestamp: u32, ssrc: u32, payload: &[u8], marker: bool) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12 + payload.len());
    packet.push(RTP_VERSION << 6); // V=2, P=0, X=0, CC=0
    let second_byte = PAYLOAD_TYPE_PCMU | if marker { 0x80 } else { 0 };
    packet.push(second_byte);
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&timestamp.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Sent to the dispatcher's event loop when the send loop exhausts the
/// audio buffer on its own (never sent on a forced `stop()`).
#[derive(Debug, Clone)]
pub struct RtpStreamDone {
    pub call_id: String,
}

/// A per-call RTP sender: owns a UDP socket bound to a previously reserved
/// local port, connected to the remote RTP endpoint, and a background task
/// pacing packets at 20 ms intervals.
pub struct RtpSender {
    cancel: CancellationToken,
}

impl RtpSender {
    /// Bind the given local port (already reserved via the dispatcher's
    /// probe-bind, see `reserve_rtp_port`), connect to `remote_addr`, and
    /// spawn the paced send loop.
    pub async fn spawn(
        remote_addr: SocketAddr,
        local_port: u16,
        audio_buf: Arc<[u8]>,
        call_id: String,
        done_tx: UnboundedSender<RtpStreamDone>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
        socket.connect(remote_addr).await?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let packets_sent = run_send_loop(&socket, &audio_buf, &task_cancel).await;
            if task_cancel.is_cancelled() {
                info!(%call_id, packets_sent, "RTP stream stopped");
            } else {
                info!(%call_id, packets_sent, "RTP stream finished");
                let _ = done_tx.send(RtpStreamDone { call_id });
            }
        });

        Ok(Self { cancel })
    }

    /// Idempotent: cancels the send loop and drops the socket. Does NOT
    /// trigger the completion notification, so a forced stop during
    /// shutdown never races a BYE onto the wire after transport teardown.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run_send_loop(socket: &UdpSocket, audio_buf: &[u8], cancel: &CancellationToken) -> u32 {
    let (ssrc, mut seq, mut timestamp): (u32, u16, u32) = {
        let mut rng = rand::thread_rng();
        (rng.gen(), rng.gen(), rng.gen())
    };

    let start = Instant::now();
    let mut offset = 0usize;
    let mut packet_index: u32 = 0;
    let mut packets_sent: u32 = 0;

    while offset + SAMPLES_PER_PACKET <= audio_buf.len() {
        let payload = &audio_buf[offset..offset + SAMPLES_PER_PACKET];
        let packet = build_rtp_packet(seq, timestamp, ssrc, payload, packet_index == 0);

        tokio::select! {
            _ = cancel.cancelled() => return packets_sent,
            result = socket.send(&packet) => {
                if let Err(err) = result {
                    warn!(%err, "RTP send failed");
                    return packets_sent;
                }
            }
        }

        seq = seq.wrapping_add(1);
        timestamp = timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
        offset += SAMPLES_PER_PACKET;
        packet_index += 1;
        packets_sent += 1;

        // Deadline schedule: next_send_time = start + n*20ms. Suspending
        // until an absolute deadline (rather than a bare 20ms sleep each
        // iteration) avoids accumulating drift across a long stream.
        let deadline = start + Duration::from_millis(PTIME_MS * packet_index as u64);
        tokio::select! {
            _ = cancel.cancelled() => return packets_sent,
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }

    packets_sent
}



#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn build_rtp_packet_header_fields_never_panic() {
        let seq: u16 = kani::any();
        let timestamp: u32 = kani::any();
        let ssrc: u32 = kani::any();
        let marker: bool = kani::any();
        let packet = build_rtp_packet(seq, timestamp, ssrc, &[], marker);
        assert_eq!(packet.len(), 12);
        assert_eq!(packet[0] >> 6, 2);
    }
}

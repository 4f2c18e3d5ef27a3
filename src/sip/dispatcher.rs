//! SIP UDP dispatcher with call and transaction state.
//! Reference: RFC 3261 - SIP: Session Initiation Protocol.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::audio::AudioRouter;
use crate::rtp::{RtpSender, RtpStreamDone};

use super::message::{
    build_request, build_response, extract_branch, extract_extension, generate_branch,
    generate_tag, parse, parse_via_params, SipMessage,
};
use super::sdp::{build_answer, parse_offer};
use super::transaction::{InviteServerTxn, TimerConfig, TimerOutcome, TxnState, TxnTimer, TxnTimerEvent};

/// RFC 3261 §20.5: the Allow header lists every method this UAS supports.
const ALLOWED_METHODS: &str = "INVITE, ACK, BYE, CANCEL, REGISTER, OPTIONS, REFER, SUBSCRIBE, NOTIFY";

/// RFC 3581 §4: tag the topmost Via with the observed source address, and
/// with the observed source port when the client asked for `rport`.
fn add_via_received_params(msg: &mut SipMessage, addr: SocketAddr) {
    for (key, value) in msg.headers.iter_mut() {
        if key.eq_ignore_ascii_case("via") {
            let params = parse_via_params(value);
            let client_rport = params.contains_key("rport");
            let mut new_value = if client_rport {
                value
                    .split(';')
                    .filter(|part| !part.trim_start().starts_with("rport"))
                    .collect::<Vec<_>>()
                    .join(";")
            } else {
                value.clone()
            };
            new_value.push_str(&format!(";received={}", addr.ip()));
            if client_rport {
                new_value.push_str(&format!(";rport={}", addr.port()));
            }
            *value = new_value;
            return;
        }
    }
}

/// RFC 3261 §18.2.2 and RFC 3581 §4: where to send the response.
fn compute_response_addr(msg: &SipMessage, addr: SocketAddr) -> SocketAddr {
    let via = match msg.header("Via") {
        Some(v) => v,
        None => return addr,
    };
    let params = parse_via_params(via);

    if let Some(rport) = params.get("rport") {
        if let Ok(port) = rport.parse::<u16>() {
            return SocketAddr::new(addr.ip(), port);
        }
    }

    let sent_by = via.split(';').next().unwrap_or("").trim();
    let host_port = match sent_by.split_once(char::is_whitespace) {
        Some((_transport, rest)) => rest.trim(),
        None => return addr,
    };
    let port = match host_port.rfind(':') {
        Some(idx) => match host_port[idx + 1..].parse::<u16>() {
            Ok(p) => p,
            Err(_) => return addr,
        },
        None => 5060,
    };
    SocketAddr::new(addr.ip(), port)
}

/// Bind a UDP socket to get an OS-assigned port, then release it. The
/// RTP sender later binds the same port number once the 2xx naming it
/// has gone out.
async fn reserve_rtp_port() -> std::io::Result<u16> {
    let probe = UdpSocket::bind(("0.0.0.0", 0)).await?;
    probe.local_addr().map(|addr| addr.port())
}

/// An active call established by a prior INVITE.
pub struct Call {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    pub remote_addr: SocketAddr,
    pub remote_contact: String,
    pub remote_from: String,
    pub remote_rtp_addr: SocketAddr,
    pub audio_buf: Arc<[u8]>,
    pub rtp_port: u16,
    pub rtp_stream: Option<RtpSender>,
    pub invite_request: Option<SipMessage>,
    pub invite_branch: Option<String>,
    pub terminated: bool,
}

/// Owns all calls and INVITE server transactions, and drives them from a
/// single task. Timer and RTP-completion events arrive over channels
/// rather than through callbacks or shared state, so this struct is the
/// only mutator of `calls` and `txns` — no locking is needed.
pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    calls: HashMap<String, Call>,
    txns: HashMap<String, InviteServerTxn>,
    server_ip: String,
    audio_router: Arc<dyn AudioRouter>,
    timers: TimerConfig,
    timer_tx: mpsc::UnboundedSender<TxnTimerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TxnTimerEvent>,
    rtp_done_tx: mpsc::UnboundedSender<RtpStreamDone>,
    rtp_done_rx: mpsc::UnboundedReceiver<RtpStreamDone>,
}

impl Dispatcher {
    pub fn new(
        socket: Arc<UdpSocket>,
        server_ip: String,
        audio_router: Arc<dyn AudioRouter>,
        timers: TimerConfig,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (rtp_done_tx, rtp_done_rx) = mpsc::unbounded_channel();
        Self {
            socket,
            calls: HashMap::new(),
            txns: HashMap::new(),
            server_ip,
            audio_router,
            timers,
            timer_tx,
            timer_rx,
            rtp_done_tx,
            rtp_done_rx,
        }
    }

    /// Run the event loop until `shutdown` fires, then drain active calls
    /// with a BYE apiece before returning.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.graceful_shutdown().await;
                    return;
                }
                Some(event) = self.timer_rx.recv() => {
                    self.handle_timer_event(event).await;
                }
                Some(done) = self.rtp_done_rx.recv() => {
                    self.handle_rtp_done(done).await;
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, addr)) => self.handle_datagram(&buf[..n], addr).await,
                        Err(err) => warn!(%err, "recv_from failed"),
                    }
                }
            }
        }
    }

    /// Send a BYE to every active call. Must run before the socket is
    /// closed so the BYEs actually reach the wire.
    pub async fn graceful_shutdown(&mut self) {
        let call_ids: Vec<String> = self.calls.keys().cloned().collect();
        for call_id in call_ids {
            self.send_bye(&call_id).await;
        }
    }

    async fn send(&self, data: &[u8], addr: SocketAddr) {
        if let Err(err) = self.socket.send_to(data, addr).await {
            warn!(%addr, %err, "send failed");
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        // RFC 5626 §4.4.1: a bare CRLF is a keepalive ping, answered in kind.
        let stripped = trim_crlf_and_spaces(data);
        if stripped.is_empty() {
            debug!(%addr, "keepalive CRLF");
            self.send(b"\r\n", addr).await;
            return;
        }

        let mut msg = parse(data);
        info!(method = %msg.method, %addr, "received datagram");

        add_via_received_params(&mut msg, addr);
        let resp_addr = compute_response_addr(&msg, addr);

        // RFC 3261 §8.2.2.3: Require options this UAS doesn't support get
        // 420 with the options echoed back. ACK and CANCEL are exempt.
        if msg.method != "ACK" && msg.method != "CANCEL" {
            if let Some(require) = msg.header("Require").map(str::to_string) {
                let resp = build_response(&msg, 420, "Bad Extension", "", None, &[("Unsupported", require)], "");
                self.send(&resp, resp_addr).await;
                return;
            }
        }

        // RFC 3261 §17.2.1: a retransmitted INVITE matching an existing
        // server transaction gets the cached response resent, not reprocessed.
        if msg.method == "INVITE" {
            if let Some(branch) = extract_branch(&msg) {
                if let Some(txn) = self.txns.get_mut(&branch) {
                    txn.receive_retransmit().await;
                    return;
                }
            }
        }

        match msg.method.as_str() {
            "REGISTER" => self.handle_register(&msg, resp_addr).await,
            "INVITE" => self.handle_invite(&msg, addr, resp_addr).await,
            "ACK" => self.handle_ack(&msg).await,
            "BYE" => self.handle_bye(&msg, resp_addr).await,
            "CANCEL" => self.handle_cancel(&msg, resp_addr).await,
            "OPTIONS" => self.handle_options(&msg, resp_addr).await,
            "REFER" | "SUBSCRIBE" | "NOTIFY" => self.handle_stub_200(&msg, resp_addr).await,
            _ => {
                // RFC 3261 §8.2.1: unsupported methods get 405 with Allow.
                let resp = build_response(
                    &msg,
                    405,
                    "Method Not Allowed",
                    "",
                    None,
                    &[("Allow", ALLOWED_METHODS.to_string())],
                    "",
                );
                self.send(&resp, resp_addr).await;
            }
        }
    }

    async fn handle_register(&mut self, msg: &SipMessage, resp_addr: SocketAddr) {
        let mut extra: Vec<(&str, String)> = Vec::new();
        // RFC 3261 §10.3 step 8: 200 OK MUST contain the current bindings,
        // each with an expires parameter.
        if let Some(contact) = msg.header("Contact") {
            extra.push(("Contact", format!("{};expires=3600", contact)));
        }
        let expires = msg.header("Expires").unwrap_or("3600").to_string();
        extra.push(("Expires", expires));
        let response = build_response(msg, 200, "OK", "", Some(&generate_tag()), &extra, "");
        self.send(&response, resp_addr).await;
    }

    async fn handle_options(&mut self, msg: &SipMessage, resp_addr: SocketAddr) {
        let response = build_response(
            msg,
            200,
            "OK",
            "",
            Some(&generate_tag()),
            &[("Allow", ALLOWED_METHODS.to_string())],
            "",
        );
        self.send(&response, resp_addr).await;
    }

    async fn handle_stub_200(&mut self, msg: &SipMessage, resp_addr: SocketAddr) {
        let response = build_response(msg, 200, "OK", "", Some(&generate_tag()), &[], "");
        self.send(&response, resp_addr).await;
    }

    async fn handle_invite(&mut self, msg: &SipMessage, addr: SocketAddr, resp_addr: SocketAddr) {
        // RFC 3261 §8.2.2.1: a Request-URI the UAS doesn't serve gets 404.
        let extension = extract_extension(&msg.uri);
        let audio_buf = match self.audio_router.lookup(&extension) {
            Some(buf) => buf,
            None => {
                info!(extension, "unknown extension");
                let resp = build_response(msg, 404, "Not Found", "", Some(&generate_tag()), &[], "");
                self.send(&resp, resp_addr).await;
                return;
            }
        };

        let call_id = msg.header("Call-ID").unwrap_or("").to_string();
        let from_header = msg.header("From").unwrap_or("").to_string();
        let from_tag = from_header
            .split_once(";tag=")
            .map(|(_, rest)| rest.split(';').next().unwrap_or("").to_string())
            .unwrap_or_default();
        let remote_from = from_header.split(";tag=").next().unwrap_or("").trim().to_string();

        let remote_rtp_addr = if !msg.body.is_empty() {
            let offer = parse_offer(&msg.body);
            let ip: IpAddr = offer.address.parse().unwrap_or(Ipv4Addr::UNSPECIFIED.into());
            SocketAddr::new(ip, offer.port)
        } else {
            SocketAddr::new(addr.ip(), 0)
        };

        let contact_header = msg
            .header("Contact")
            .map(str::to_string)
            .unwrap_or_else(|| format!("<sip:{}:{}>", addr.ip(), addr.port()));
        let remote_contact = match (contact_header.find('<'), contact_header.find('>')) {
            (Some(start), Some(end)) if start < end => contact_header[start + 1..end].to_string(),
            _ => contact_header,
        };

        let to_tag = generate_tag();

        // Re-INVITE on an existing Call-ID tears down the old dialog wholesale.
        if let Some(mut existing) = self.calls.remove(&call_id) {
            self.terminate_call(&mut existing);
        }

        let rtp_port = match reserve_rtp_port().await {
            Ok(port) => port,
            Err(err) => {
                warn!(%err, "failed to reserve RTP port");
                return;
            }
        };

        let call = Call {
            call_id: call_id.clone(),
            from_tag,
            to_tag: to_tag.clone(),
            remote_addr: resp_addr,
            remote_contact,
            remote_from,
            remote_rtp_addr,
            audio_buf,
            rtp_port,
            rtp_stream: None,
            invite_request: Some(msg.clone()),
            invite_branch: None,
            terminated: false,
        };
        self.calls.insert(call_id.clone(), call);

        // RFC 3261 §17.2.1: 100 Trying quenches INVITE retransmissions
        // while the 200 OK is prepared.
        let trying = build_response(msg, 100, "Trying", "", None, &[], "");
        self.send(&trying, resp_addr).await;

        let answer = build_answer(&self.server_ip, rtp_port);
        let ok = build_response(
            msg,
            200,
            "OK",
            &answer,
            Some(&to_tag),
            &[
                ("Contact", format!("<sip:frizzle@{}:5060>", self.server_ip)),
                ("Allow", ALLOWED_METHODS.to_string()),
            ],
            "application/sdp",
        );

        match extract_branch(msg) {
            Some(branch) => self.setup_invite_txn(&call_id, ok, resp_addr, branch).await,
            None => self.send(&ok, resp_addr).await,
        }
    }

    /// RFC 3261 §13.3.1.4: 2xx responses are retransmitted by the TU at
    /// T1, 2*T1, 4*T1... up to T2, until an ACK arrives or 64*T1 elapses.
    async fn setup_invite_txn(&mut self, call_id: &str, response: Vec<u8>, resp_addr: SocketAddr, branch: String) {
        if let Some(mut old) = self.txns.remove(&branch) {
            old.terminate();
        }
        let mut txn = InviteServerTxn::new(branch.clone(), self.socket.clone(), self.timer_tx.clone(), self.timers);
        txn.send_2xx(response, resp_addr).await;
        self.txns.insert(branch.clone(), txn);
        if let Some(call) = self.calls.get_mut(call_id) {
            call.invite_branch = Some(branch);
        }
    }

    async fn handle_ack(&mut self, msg: &SipMessage) {
        // RFC 3261 §13.3.1.4: the ACK for a 2xx arrives as a brand new
        // request, matched to the dialog by Call-ID rather than a server
        // transaction lookup.
        let call_id = msg.header("Call-ID").unwrap_or("").to_string();
        let branch = match self.calls.get(&call_id) {
            Some(call) => call.invite_branch.clone(),
            None => {
                warn!(call_id, "ACK for unknown call");
                return;
            }
        };
        if let Some(branch) = branch {
            if let Some(txn) = self.txns.get_mut(&branch) {
                txn.receive_ack();
            }
        }

        let needs_rtp = self.calls.get(&call_id).map(|c| c.rtp_stream.is_none()).unwrap_or(false);
        if needs_rtp {
            self.start_rtp_for_call(&call_id).await;
        }
    }

    async fn start_rtp_for_call(&mut self, call_id: &str) {
        let (remote_addr, local_port, audio_buf) = match self.calls.get(call_id) {
            Some(call) => (call.remote_rtp_addr, call.rtp_port, call.audio_buf.clone()),
            None => return,
        };
        match RtpSender::spawn(remote_addr, local_port, audio_buf, call_id.to_string(), self.rtp_done_tx.clone()).await {
            Ok(sender) => {
                if let Some(call) = self.calls.get_mut(call_id) {
                    call.rtp_stream = Some(sender);
                }
            }
            Err(err) => warn!(%err, call_id, "failed to start RTP stream"),
        }
    }

    async fn handle_bye(&mut self, msg: &SipMessage, resp_addr: SocketAddr) {
        let call_id = msg.header("Call-ID").unwrap_or("").to_string();
        let mut call = match self.calls.remove(&call_id) {
            Some(call) => call,
            None => {
                // RFC 3261 §15.1.2: BYE outside any dialog gets 481.
                let resp = build_response(msg, 481, "Call/Transaction Does Not Exist", "", None, &[], "");
                self.send(&resp, resp_addr).await;
                return;
            }
        };
        self.terminate_call(&mut call);
        let resp = build_response(msg, 200, "OK", "", Some(&call.to_tag), &[], "");
        self.send(&resp, resp_addr).await;
    }

    async fn handle_cancel(&mut self, msg: &SipMessage, resp_addr: SocketAddr) {
        let call_id = msg.header("Call-ID").unwrap_or("").to_string();
        let to_tag = match self.calls.get(&call_id) {
            Some(call) => call.to_tag.clone(),
            None => {
                // RFC 3261 §9.2: no matching transaction, respond 481.
                let resp = build_response(msg, 481, "Call/Transaction Does Not Exist", "", None, &[], "");
                self.send(&resp, resp_addr).await;
                return;
            }
        };

        // RFC 3261 §9.2: once a final response has gone out, the CANCEL
        // has no effect on the original request beyond being acknowledged.
        let branch = self.calls.get(&call_id).and_then(|c| c.invite_branch.clone());
        if let Some(branch) = branch {
            if let Some(txn) = self.txns.get(&branch) {
                if txn.state() != TxnState::Proceeding {
                    let ok = build_response(msg, 200, "OK", "", Some(&to_tag), &[], "");
                    self.send(&ok, resp_addr).await;
                    return;
                }
            }
        }

        let ok = build_response(msg, 200, "OK", "", Some(&to_tag), &[], "");
        self.send(&ok, resp_addr).await;

        // RFC 3261 §9.2: the UAS SHOULD respond to the INVITE with 487
        // before tearing the transaction down.
        let invite_request = self.calls.get(&call_id).and_then(|c| c.invite_request.clone());
        if let Some(invite_request) = invite_request {
            let terminated = build_response(&invite_request, 487, "Request Terminated", "", Some(&to_tag), &[], "");
            self.send(&terminated, resp_addr).await;
        }

        if let Some(mut call) = self.calls.remove(&call_id) {
            self.terminate_call(&mut call);
        }
    }

    async fn handle_timer_event(&mut self, event: TxnTimerEvent) {
        let outcome = match self.txns.get_mut(&event.branch) {
            Some(txn) => txn.on_timer_fired(event.timer).await,
            None => return,
        };
        match outcome {
            TimerOutcome::NoOp => {}
            TimerOutcome::Terminated => {
                self.txns.remove(&event.branch);
            }
            TimerOutcome::TimedOut => {
                self.txns.remove(&event.branch);
                if let Some(call_id) = self.call_id_for_branch(&event.branch) {
                    self.send_bye(&call_id).await;
                }
            }
        }
    }

    fn call_id_for_branch(&self, branch: &str) -> Option<String> {
        self.calls
            .iter()
            .find(|(_, call)| call.invite_branch.as_deref() == Some(branch))
            .map(|(call_id, _)| call_id.clone())
    }

    async fn handle_rtp_done(&mut self, done: RtpStreamDone) {
        self.send_bye(&done.call_id).await;
    }

    /// Mark a call terminated, stop its RTP stream, and terminate its
    /// transaction, if any.
    fn terminate_call(&mut self, call: &mut Call) {
        call.terminated = true;
        if let Some(sender) = &call.rtp_stream {
            sender.stop();
        }
        if let Some(branch) = call.invite_branch.take() {
            if let Some(mut txn) = self.txns.remove(&branch) {
                txn.terminate();
            }
        }
    }

    /// Send a BYE to end a call after its audio has finished playing, or
    /// after its INVITE transaction timed out waiting for ACK. Guards
    /// against sending twice for the same call.
    async fn send_bye(&mut self, call_id: &str) {
        let mut call = match self.calls.remove(call_id) {
            Some(call) if !call.terminated => call,
            _ => return,
        };
        self.terminate_call(&mut call);

        // RFC 3261 §12.2.1.1: in-dialog requests target the remote
        // target URI; local tag/URI is From, remote tag/URI is To.
        let bye = build_request(
            "BYE",
            &call.remote_contact,
            &[
                ("Via", format!("SIP/2.0/UDP {}:5060;branch={}", self.server_ip, generate_branch())),
                ("From", format!("<sip:frizzle@{}>;tag={}", self.server_ip, call.to_tag)),
                ("To", format!("{};tag={}", call.remote_from, call.from_tag)),
                ("Call-ID", call.call_id.clone()),
                ("CSeq", "1 BYE".to_string()),
                ("Max-Forwards", "70".to_string()),
            ],
            "",
            "",
        );
        self.send(&bye, call.remote_addr).await;
        info!(call_id = %call.call_id, "sent BYE");
    }
}

fn trim_crlf_and_spaces(data: &[u8]) -> &[u8] {
    let is_trim_byte = |b: &u8| matches!(b, b'\r' | b'\n' | b' ');
    let start = data.iter().position(|b| !is_trim_byte(b)).unwrap_or(data.len());
    let end = data.iter().rposition(|b| !is_trim_byte(b)).map(|i| i + 1).unwrap_or(0);
    if start >= end {
        &[]
    } else {
        &data[start..end]
    }
}

//! INVITE server transaction state machine.
//! Reference: RFC 3261 §17.2.1, as revised by RFC 6026 §7.1.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// T1/T2/T4 base timer values (RFC 3261 §17.1.1.1).
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl TimerConfig {
    /// Timer H duration = 64 * T1 (RFC 3261 §17.1.1.2).
    fn timer_h_duration(&self) -> Duration {
        self.t1 * 64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Proceeding,
    Accepted,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnTimer {
    G,
    H,
    I,
}

/// Sent by a background timer task into the dispatcher's event loop when
/// a timer fires. The dispatcher looks the transaction up by branch and
/// drives it with [`InviteServerTxn::on_timer_fired`] — this is the
/// key-based back-reference from SPEC_FULL.md §9: no closure or owning
/// reference is held by the timer task, only a branch string.
#[derive(Debug, Clone)]
pub struct TxnTimerEvent {
    pub branch: String,
    pub timer: TxnTimer,
}

/// What happened as a result of a timer firing, for the dispatcher to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// No state change (e.g. Timer G fired outside Accepted).
    NoOp,
    /// The transaction reached Terminated; the dispatcher should drop it
    /// from its table (`on_terminated`).
    Terminated,
    /// Timer H fired with no ACK: the transaction terminated *and* the
    /// dispatcher must tear the dialog down with a UAC BYE (`on_timeout`).
    TimedOut,
}

fn spawn_timer(
    branch: String,
    timer: TxnTimer,
    delay: Duration,
    event_tx: UnboundedSender<TxnTimerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = event_tx.send(TxnTimerEvent { branch, timer });
    })
}

/// The INVITE server transaction state machine, keyed by Via branch.
///
/// Owns the last sent response (for retransmit), its destination, and the
/// three timer task handles. Invariant: once `state == Terminated`, no
/// timer handle is `Some` and no further send happens.
pub struct InviteServerTxn {
    branch: String,
    socket: Arc<UdpSocket>,
    timers: TimerConfig,
    event_tx: UnboundedSender<TxnTimerEvent>,
    state: TxnState,
    last_response: Vec<u8>,
    dest: SocketAddr,
    g_interval: Duration,
    g_handle: Option<JoinHandle<()>>,
    h_handle: Option<JoinHandle<()>>,
    i_handle: Option<JoinHandle<()>>,
}

impl InviteServerTxn {
    pub fn new(
        branch: String,
        socket: Arc<UdpSocket>,
        event_tx: UnboundedSender<TxnTimerEvent>,
        timers: TimerConfig,
    ) -> Self {
        Self {
            branch,
            socket,
            timers,
            event_tx,
            state: TxnState::Proceeding,
            last_response: Vec::new(),
            dest: "0.0.0.0:0".parse().unwrap(),
            g_interval: timers.t1,
            g_handle: None,
            h_handle: None,
            i_handle: None,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Hand the transaction its 2xx for retransmit-managed delivery.
    /// Sends immediately, starts Timer G at T1 and Timer H at 64*T1.
    pub async fn send_2xx(&mut self, response: Vec<u8>, dest: SocketAddr) {
        self.last_response = response;
        self.dest = dest;
        self.state = TxnState::Accepted;
        self.g_interval = self.timers.t1;

        if let Err(err) = self.socket.send_to(&self.last_response, self.dest).await {
            warn!(branch = %self.branch, %err, "failed to send 2xx");
        }

        self.g_handle = Some(spawn_timer(
            self.branch.clone(),
            TxnTimer::G,
            self.g_interval,
            self.event_tx.clone(),
        ));
        self.h_handle = Some(spawn_timer(
            self.branch.clone(),
            TxnTimer::H,
            self.timers.timer_h_duration(),
            self.event_tx.clone(),
        ));
    }

    /// A retransmitted INVITE arrived on this branch. While Proceeding or
    /// Accepted with a cached response, re-emit it; no state change.
    pub async fn receive_retransmit(&mut self) {
        if matches!(self.state, TxnState::Proceeding | TxnState::Accepted) && !self.last_response.is_empty() {
            if let Err(err) = self.socket.send_to(&self.last_response, self.dest).await {
                warn!(branch = %self.branch, %err, "failed to resend cached response");
            }
        }
    }

    /// ACK arrived on this dialog. No-op outside Accepted (absorbs
    /// retransmitted ACKs once Confirmed).
    pub fn receive_ack(&mut self) {
        if self.state != TxnState::Accepted {
            return;
        }
        self.state = TxnState::Confirmed;
        if let Some(handle) = self.g_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.h_handle.take() {
            handle.abort();
        }
        self.i_handle = Some(spawn_timer(
            self.branch.clone(),
            TxnTimer::I,
            self.timers.t4,
            self.event_tx.clone(),
        ));
    }

    /// Force transition to Terminated from any state. Idempotent; does
    /// NOT report a timeout to the dispatcher even if called in Accepted.
    pub fn terminate(&mut self) {
        self.do_terminate();
    }

    fn do_terminate(&mut self) {
        self.state = TxnState::Terminated;
        if let Some(handle) = self.g_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.h_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.i_handle.take() {
            handle.abort();
        }
    }

    /// Drive the transaction in response to a fired timer. Returns what the
    /// dispatcher should do as a result.
    pub async fn on_timer_fired(&mut self, timer: TxnTimer) -> TimerOutcome {
        match timer {
            TxnTimer::G => {
                if self.state != TxnState::Accepted {
                    return TimerOutcome::NoOp;
                }
                if let Err(err) = self.socket.send_to(&self.last_response, self.dest).await {
                    warn!(branch = %self.branch, %err, "failed to resend 2xx on timer G");
                }
                self.g_interval = std::cmp::min(self.g_interval * 2, self.timers.t2);
                self.g_handle = Some(spawn_timer(
                    self.branch.clone(),
                    TxnTimer::G,
                    self.g_interval,
                    self.event_tx.clone(),
                ));
                TimerOutcome::NoOp
            }
            TxnTimer::H => {
                if self.state != TxnState::Accepted {
                    return TimerOutcome::NoOp;
                }
                debug!(branch = %self.branch, "timer H fired, no ACK received");
                self.do_terminate();
                TimerOutcome::TimedOut
            }
            TxnTimer::I => {
                if self.state != TxnState::Confirmed {
                    return TimerOutcome::NoOp;
                }
                self.do_terminate();
                TimerOutcome::Terminated
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn make_txn() -> (InviteServerTxn, mpsc::UnboundedReceiver<TxnTimerEvent>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = TimerConfig {
            t1: Duration::from_millis(20),
            t2: Duration::from_millis(80),
            t4: Duration::from_millis(20),
        };
        (InviteServerTxn::new("z9hG4bKtest".into(), socket, tx, timers), rx)
    }

    #[tokio::test]
    async fn starts_in_proceeding() {
        let (txn, _rx) = make_txn().await;
        assert_eq!(txn.state(), TxnState::Proceeding);
    }

    #[tokio::test]
    async fn send_2xx_enters_accepted() {
        let (mut txn, _rx) = make_txn().await;
        let dest: SocketAddr = "127.0.0.1:1".parse().unwrap();
        txn.send_2xx(b"resp".to_vec(), dest).await;
        assert_eq!(txn.state(), TxnState::Accepted);
    }

    #[tokio::test]
    async fn ack_enters_confirmed_and_cancels_g_h() {
        let (mut txn, _rx) = make_txn().await;
        txn.send_2xx(b"resp".to_vec(), "127.0.0.1:1".parse().unwrap()).await;
        txn.receive_ack();
        assert_eq!(txn.state(), TxnState::Confirmed);
    }

    #[tokio::test]
    async fn ack_outside_accepted_is_noop() {
        let (mut txn, _rx) = make_txn().await;
        txn.receive_ack();
        assert_eq!(txn.state(), TxnState::Proceeding);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_skips_timeout() {
        let (mut txn, _rx) = make_txn().await;
        txn.send_2xx(b"resp".to_vec(), "127.0.0.1:1".parse().unwrap()).await;
        txn.terminate();
        txn.terminate();
        assert_eq!(txn.state(), TxnState::Terminated);
    }

    #[tokio::test]
    async fn timer_h_fires_and_reports_timed_out() {
        let (mut txn, mut rx) = make_txn().await;
        txn.send_2xx(b"resp".to_vec(), "127.0.0.1:1".parse().unwrap()).await;

        loop {
            let event = rx.recv().await.unwrap();
            if event.timer == TxnTimer::H {
                let outcome = txn.on_timer_fired(TxnTimer::H).await;
                assert_eq!(outcome, TimerOutcome::TimedOut);
                assert_eq!(txn.state(), TxnState::Terminated);
                break;
            }
        }
    }

    #[tokio::test]
    async fn timer_g_retransmits_then_reschedules() {
        let (mut txn, mut rx) = make_txn().await;
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = responder.local_addr().unwrap();
        txn.send_2xx(b"resp".to_vec(), dest).await;

        let mut buf = [0u8; 16];
        let (n, _) = responder.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"resp");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.timer, TxnTimer::G);
        let outcome = txn.on_timer_fired(TxnTimer::G).await;
        assert_eq!(outcome, TimerOutcome::NoOp);
        assert_eq!(txn.state(), TxnState::Accepted);

        let (n, _) = responder.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"resp");
    }

    #[tokio::test]
    async fn ack_during_confirmed_is_absorbed() {
        let (mut txn, mut rx) = make_txn().await;
        txn.send_2xx(b"resp".to_vec(), "127.0.0.1:1".parse().unwrap()).await;
        txn.receive_ack();
        assert_eq!(txn.state(), TxnState::Confirmed);
        txn.receive_ack();
        assert_eq!(txn.state(), TxnState::Confirmed);

        loop {
            let event = rx.recv().await.unwrap();
            if event.timer == TxnTimer::I {
                let outcome = txn.on_timer_fired(TxnTimer::I).await;
                assert_eq!(outcome, TimerOutcome::Terminated);
                break;
            }
        }
    }
}

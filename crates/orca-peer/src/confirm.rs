//! Operator confirmation for incoming transfers
//!
//! Every incoming send or store request opens a session with its own reply
//! channel. The request is published on the operator queue and the handler
//! waits, up to a deadline, for that session's answer. A timeout, a dropped
//! session or an explicit "no" all count as declined.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// What the remote peer wants to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Peer asks us to send a file
    Send,
    /// Peer asks us to store a file
    Store,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Send => write!(f, "send"),
            TransferKind::Store => write!(f, "store"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Declined,
}

/// A question for the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub id: u64,
    pub kind: TransferKind,
    pub filename: String,
}

impl fmt::Display for ConfirmationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Peer asks us to {} '{}'. Accept? (yes/no)",
            self.id, self.kind, self.filename
        )
    }
}

struct Session {
    request: ConfirmationRequest,
    reply: oneshot::Sender<bool>,
}

type Sessions = Mutex<HashMap<u64, Session>>;

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<u64, Session>> {
    sessions.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a session when its waiter goes away, answered or not
struct SessionGuard<'a> {
    sessions: &'a Sessions,
    id: u64,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        lock(self.sessions).remove(&self.id);
    }
}

/// Gate that holds incoming transfers until the operator answers
pub struct ConfirmationGate {
    sessions: Sessions,
    next_id: AtomicU64,
    operator: mpsc::UnboundedSender<ConfirmationRequest>,
    timeout: Duration,
}

impl ConfirmationGate {
    /// Create a gate and the queue the operator reads requests from
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ConfirmationRequest>) {
        let (operator, requests) = mpsc::unbounded_channel();
        let gate = Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            operator,
            timeout,
        };
        (gate, requests)
    }

    /// Ask the operator and wait for this session's answer
    pub async fn ask(&self, kind: TransferKind, filename: &str) -> Decision {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = ConfirmationRequest {
            id,
            kind,
            filename: filename.to_string(),
        };
        let (reply, answer) = oneshot::channel();

        lock(&self.sessions).insert(
            id,
            Session {
                request: request.clone(),
                reply,
            },
        );
        let _guard = SessionGuard {
            sessions: &self.sessions,
            id,
        };

        if self.operator.send(request).is_err() {
            tracing::warn!("No operator listening, declining {} of '{}'", kind, filename);
            return Decision::Declined;
        }

        let decision = match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(true)) => Decision::Accepted,
            Ok(Ok(false)) | Ok(Err(_)) => Decision::Declined,
            Err(_) => {
                tracing::info!("Confirmation {} timed out", id);
                Decision::Declined
            }
        };

        tracing::info!("Request to {} '{}': {:?}", kind, filename, decision);
        decision
    }

    /// Answer one pending session; returns false if it is no longer pending
    pub fn answer(&self, id: u64, accept: bool) -> bool {
        match lock(&self.sessions).remove(&id) {
            Some(session) => session.reply.send(accept).is_ok(),
            None => false,
        }
    }

    /// Sessions still waiting for an answer, oldest first
    pub fn pending(&self) -> Vec<ConfirmationRequest> {
        let mut pending: Vec<_> = lock(&self.sessions)
            .values()
            .map(|s| s.request.clone())
            .collect();
        pending.sort_by_key(|r| r.id);
        pending
    }

    /// Answer every request on `requests` with the same decision
    pub fn auto_answer(
        self: &Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<ConfirmationRequest>,
        accept: bool,
    ) -> JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                tracing::debug!("Auto-answering {}: {}", request.id, accept);
                gate.answer(request.id, accept);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accept_and_decline() {
        let (gate, mut requests) = ConfirmationGate::new(Duration::from_secs(5));
        let gate = Arc::new(gate);

        let asker = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(TransferKind::Send, "a.txt").await })
        };
        let request = requests.recv().await.unwrap();
        assert_eq!(request.filename, "a.txt");
        assert_eq!(gate.pending(), vec![request.clone()]);
        assert!(gate.answer(request.id, true));
        assert_eq!(asker.await.unwrap(), Decision::Accepted);

        let asker = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(TransferKind::Store, "b.txt").await })
        };
        let request = requests.recv().await.unwrap();
        gate.answer(request.id, false);
        assert_eq!(asker.await.unwrap(), Decision::Declined);
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_declines() {
        let (gate, _requests) = ConfirmationGate::new(Duration::from_millis(50));
        assert_eq!(gate.ask(TransferKind::Send, "slow.txt").await, Decision::Declined);
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_independent() {
        let (gate, mut requests) = ConfirmationGate::new(Duration::from_secs(5));
        let gate = Arc::new(gate);

        let first = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(TransferKind::Send, "one.txt").await })
        };
        let second = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(TransferKind::Send, "two.txt").await })
        };

        let mut ids = HashMap::new();
        for _ in 0..2 {
            let request = requests.recv().await.unwrap();
            ids.insert(request.filename.clone(), request.id);
        }
        // Answer in reverse order with opposite decisions
        gate.answer(ids["two.txt"], false);
        gate.answer(ids["one.txt"], true);

        assert_eq!(first.await.unwrap(), Decision::Accepted);
        assert_eq!(second.await.unwrap(), Decision::Declined);
    }

    #[tokio::test]
    async fn test_no_operator_declines() {
        let (gate, requests) = ConfirmationGate::new(Duration::from_secs(5));
        drop(requests);
        assert_eq!(gate.ask(TransferKind::Store, "x").await, Decision::Declined);
    }

    #[tokio::test]
    async fn test_answer_unknown_session() {
        let (gate, _requests) = ConfirmationGate::new(Duration::from_secs(5));
        assert!(!gate.answer(42, true));
    }

    #[tokio::test]
    async fn test_auto_answer() {
        let (gate, requests) = ConfirmationGate::new(Duration::from_secs(5));
        let gate = Arc::new(gate);
        let _task = gate.auto_answer(requests, true);
        assert_eq!(gate.ask(TransferKind::Send, "auto.txt").await, Decision::Accepted);
    }
}

//! [`Browser`] over the IPC bridge.
//!
//! Each call becomes a request [`Message`] with a fresh non-zero id,
//! queued to the connection task, and a oneshot waiter registered in
//! the shared [`ReplyRouter`]. The connection task hands every `reply`
//! frame to the router, which wakes the matching waiter. When the
//! connection ends the router is closed and every waiter fails with
//! [`BrowserError::Disconnected`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{Browser, BrowserError, Tab, TabId, TabQuery, WindowId};
use crate::ipc::protocol::{ErrorKind, Message, Reply, Status};

#[derive(Debug, Default)]
struct Waiters {
    pending: HashMap<u32, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Correlates replies with outstanding requests. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ReplyRouter {
    waiters: Arc<Mutex<Waiters>>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: u32) -> Result<oneshot::Receiver<Reply>, BrowserError> {
        let mut waiters = self.waiters.lock();
        if waiters.closed {
            return Err(BrowserError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        waiters.pending.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: u32) {
        self.waiters.lock().pending.remove(&id);
    }

    /// Deliver a reply. Returns `false` when no request is waiting on
    /// its id (late reply after a timeout, or a confused shim).
    pub fn complete(&self, reply: Reply) -> bool {
        let waiter = self.waiters.lock().pending.remove(&reply.id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Close the router. Every pending and future request fails with
    /// [`BrowserError::Disconnected`]. Returns how many were pending.
    pub fn fail_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        waiters.closed = true;
        let count = waiters.pending.len();
        // Dropping the senders wakes the receivers with an error.
        waiters.pending.clear();
        count
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().pending.len()
    }
}

/// Browser reached through a shim connection.
pub struct RemoteBrowser {
    outgoing: mpsc::UnboundedSender<Message>,
    router: ReplyRouter,
    next_id: AtomicU32,
    timeout: Duration,
}

impl RemoteBrowser {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Message>,
        router: ReplyRouter,
        timeout: Duration,
    ) -> Self {
        Self {
            outgoing,
            router,
            next_id: AtomicU32::new(1),
            timeout,
        }
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send one request and wait for its reply.
    ///
    /// `subject` is the tab the request is about; a `not_found` reply
    /// maps to [`BrowserError::NotFound`] for it.
    async fn call(
        &self,
        subject: Option<TabId>,
        request: impl FnOnce(u32) -> Message,
    ) -> Result<Reply, BrowserError> {
        let id = self.next_id();
        let rx = self.router.register(id)?;
        if self.outgoing.send(request(id)).is_err() {
            self.router.forget(id);
            return Err(BrowserError::Disconnected);
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(BrowserError::Disconnected),
            Err(_) => {
                self.router.forget(id);
                tracing::warn!(id, timeout = ?self.timeout, "bridge request timed out");
                return Err(BrowserError::Permanent(format!(
                    "no reply to request {id} within {:?}",
                    self.timeout
                )));
            }
        };
        check(reply, subject)
    }
}

fn check(reply: Reply, subject: Option<TabId>) -> Result<Reply, BrowserError> {
    if reply.status == Status::Ok {
        return Ok(reply);
    }
    let message = reply.error.unwrap_or_else(|| "unspecified error".into());
    Err(match (reply.error_kind, subject) {
        (Some(ErrorKind::Transient), _) => BrowserError::Transient(message),
        (Some(ErrorKind::NotFound), Some(tab)) => BrowserError::NotFound(tab),
        _ => BrowserError::Permanent(message),
    })
}

#[async_trait]
impl Browser for RemoteBrowser {
    async fn query_tabs(&self, query: &TabQuery) -> Result<Vec<Tab>, BrowserError> {
        let query = query.clone();
        let reply = self.call(None, |id| Message::Query { id, query }).await?;
        Ok(reply.tabs.unwrap_or_default())
    }

    async fn get_tab(&self, id: TabId) -> Result<Tab, BrowserError> {
        let reply = self
            .call(Some(id), |req| Message::Get { id: req, tab_id: id })
            .await?;
        reply.tab.ok_or(BrowserError::NotFound(id))
    }

    async fn remove_tab(&self, id: TabId) -> Result<(), BrowserError> {
        self.call(Some(id), |req| Message::Remove { id: req, tab_id: id })
            .await
            .map(drop)
    }

    async fn set_active(&self, id: TabId) -> Result<(), BrowserError> {
        self.call(Some(id), |req| Message::Activate { id: req, tab_id: id })
            .await
            .map(drop)
    }

    async fn focus_window(&self, id: WindowId) -> Result<(), BrowserError> {
        self.call(None, |req| Message::FocusWindow {
            id: req,
            window_id: id,
        })
        .await
        .map(drop)
    }

    async fn focused_window(&self) -> Result<Option<WindowId>, BrowserError> {
        let reply = self.call(None, |id| Message::FocusedWindow { id }).await?;
        Ok(reply.window_id)
    }
}

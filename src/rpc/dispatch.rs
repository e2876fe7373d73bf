/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Transport-independent request/response bookkeeping.
//!
//! An [`Endpoint`] owns the handler table, the table of in-flight outbound
//! requests and the table of in-flight inbound handler tasks. Concrete
//! connections only have to move [`Message`]s in and out of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::connection::RequestHandler;
use super::error::RpcError;
use super::protocol::{
    CANCEL_METHOD, CancelParams, METHOD_NOT_FOUND, Message, NotificationMessage,
    REQUEST_CANCELLED, RequestId, RequestMessage, ResponseMessage,
};

/// Default timeout for outbound requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Items queued for the transport's writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A message to deliver to the peer.
    Message(Message),
    /// Acknowledged once everything queued before it has been delivered.
    Flush(oneshot::Sender<()>),
}

struct Registration {
    generation: u64,
    handler: RequestHandler,
}

type PendingMap = tokio::sync::Mutex<HashMap<RequestId, oneshot::Sender<ResponseMessage>>>;

struct Shared {
    outgoing: mpsc::UnboundedSender<Outbound>,
    pending: PendingMap,
    handlers: Mutex<HashMap<String, Registration>>,
    inflight: Mutex<HashMap<RequestId, AbortHandle>>,
    idle: Notify,
    alive: AtomicBool,
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn send(&self, message: Message) -> Result<(), RpcError> {
        self.outgoing
            .send(Outbound::Message(message))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Sends the response of an inbound request unless it was cancelled first.
    fn finish(&self, id: &RequestId, response: ResponseMessage) {
        let mut inflight = lock(&self.inflight);
        // Sending under the lock keeps `drain` from observing an empty table
        // before the response is queued.
        if inflight.remove(id).is_some()
            && let Err(e) = self.send(Message::Response(response))
        {
            debug!("Dropping response for request {}: {}", id, e);
        }
        if inflight.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Handle returned by handler registration.
///
/// Disposing it removes the handler, unless a newer registration for the
/// same method has replaced it in the meantime. Dropping it without calling
/// [`Disposable::dispose`] leaves the handler installed.
#[must_use = "dropping a Disposable leaves the handler installed"]
#[derive(Debug)]
pub struct Disposable {
    shared: Weak<Shared>,
    method: String,
    generation: u64,
}

impl Disposable {
    /// Deregisters the handler. Returns `true` if a handler was removed.
    pub fn dispose(self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut handlers = lock(&shared.handlers);
        match handlers.get(&self.method) {
            Some(current) if current.generation == self.generation => {
                handlers.remove(&self.method);
                debug!("Disposed handler for {}", self.method);
                true
            }
            _ => {
                trace!("Stale disposable for {} ignored", self.method);
                false
            }
        }
    }

    /// Method this handle was registered for.
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Dispatch core shared by every connection kind.
pub(crate) struct Endpoint {
    shared: Arc<Shared>,
    next_id: AtomicI64,
    next_generation: AtomicU64,
    timeout: Option<Duration>,
    loop_handle: JoinHandle<()>,
}

impl Endpoint {
    /// Starts the dispatch loop over `incoming`, writing replies to `outgoing`.
    pub(crate) fn start(
        incoming: mpsc::UnboundedReceiver<Message>,
        outgoing: mpsc::UnboundedSender<Outbound>,
        timeout: Option<Duration>,
    ) -> Self {
        let shared = Arc::new(Shared {
            outgoing,
            pending: tokio::sync::Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            idle: Notify::new(),
            alive: AtomicBool::new(true),
            closed: CancellationToken::new(),
        });

        let loop_handle = tokio::spawn(Self::dispatch_loop(incoming, Arc::clone(&shared)));

        Self {
            shared,
            next_id: AtomicI64::new(1),
            next_generation: AtomicU64::new(1),
            timeout,
            loop_handle,
        }
    }

    /// Routes every inbound message until the peer goes away.
    async fn dispatch_loop(mut incoming: mpsc::UnboundedReceiver<Message>, shared: Arc<Shared>) {
        while let Some(message) = incoming.recv().await {
            match message {
                Message::Request(request) => Self::handle_request(&shared, request),
                Message::Response(response) => {
                    let Some(id) = response.id.clone() else {
                        warn!(
                            "Peer reported an error without request id: {:?}",
                            response.error
                        );
                        continue;
                    };
                    let sender = shared.pending.lock().await.remove(&id);
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(response);
                        }
                        None => warn!("Received response for unknown request id: {}", id),
                    }
                }
                Message::Notification(notification) => {
                    Self::handle_notification(&shared, &notification);
                }
            }
        }

        shared.alive.store(false, Ordering::SeqCst);
        warn!("Dispatch loop exiting - connection lost");

        // Dropping the senders rejects every waiting caller.
        shared.pending.lock().await.clear();
        {
            let mut inflight = lock(&shared.inflight);
            for (_, handle) in inflight.drain() {
                handle.abort();
            }
        }
        shared.idle.notify_waiters();
        shared.closed.cancel();
    }

    fn handle_request(shared: &Arc<Shared>, request: RequestMessage) {
        let handler = lock(&shared.handlers)
            .get(&request.method)
            .map(|registration| Arc::clone(&registration.handler));

        let Some(handler) = handler else {
            debug!("No handler registered for {}", request.method);
            let response = ResponseMessage::failure(
                Some(request.id),
                METHOD_NOT_FOUND,
                format!("No handler registered for '{}'", request.method),
            );
            if let Err(e) = shared.send(Message::Response(response)) {
                debug!("Could not report missing handler: {}", e);
            }
            return;
        };

        debug!("Dispatching {} (id: {})", request.method, request.id);

        let RequestMessage { id, params, .. } = request;
        let task_shared = Arc::clone(shared);
        let task_id = id.clone();

        let mut inflight = lock(&shared.inflight);
        let task = tokio::spawn(async move {
            let response = match handler(params).await {
                Ok(result) => ResponseMessage::success(task_id.clone(), result),
                Err(error) => ResponseMessage::with_error(Some(task_id.clone()), error),
            };
            task_shared.finish(&task_id, response);
        });
        inflight.insert(id, task.abort_handle());
    }

    fn handle_notification(shared: &Arc<Shared>, notification: &NotificationMessage) {
        if notification.method != CANCEL_METHOD {
            trace!(
                "Ignoring notification: {} params={}",
                notification.method, notification.params
            );
            return;
        }

        let params: CancelParams = match serde_json::from_value(notification.params.clone()) {
            Ok(params) => params,
            Err(e) => {
                warn!("Malformed cancel notification: {}", e);
                return;
            }
        };

        let mut inflight = lock(&shared.inflight);
        if let Some(handle) = inflight.remove(&params.id) {
            handle.abort();
            debug!("Cancelled inbound request {}", params.id);
            let response = ResponseMessage::failure(
                Some(params.id),
                REQUEST_CANCELLED,
                "Request cancelled",
            );
            if let Err(e) = shared.send(Message::Response(response)) {
                debug!("Could not report cancellation: {}", e);
            }
        } else {
            trace!("Cancel for finished request {}", params.id);
        }
        if inflight.is_empty() {
            shared.idle.notify_waiters();
        }
    }

    /// Installs `handler` for `method`, replacing any previous one.
    pub(crate) fn on_request(&self, method: &str, handler: RequestHandler) -> Disposable {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let previous = lock(&self.shared.handlers).insert(
            method.to_string(),
            Registration {
                generation,
                handler,
            },
        );
        if previous.is_some() {
            debug!("Replaced handler for {}", method);
        }

        Disposable {
            shared: Arc::downgrade(&self.shared),
            method: method.to_string(),
            generation,
        }
    }

    /// Sends a request and waits for its terminal outcome.
    pub(crate) async fn send_request(
        &self,
        method: &str,
        params: Value,
        token: Option<CancellationToken>,
    ) -> Result<Value, RpcError> {
        if !self.is_alive() {
            return Err(RpcError::ConnectionClosed);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        // The loop may have shut down between the check above and the insert.
        if !self.is_alive() {
            self.shared.pending.lock().await.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        trace!("Sending request {} (id: {})", method, id);
        if let Err(e) = self
            .shared
            .send(Message::Request(RequestMessage::new(id.clone(), method, params)))
        {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        let wait = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, rx).await.ok(),
                None => Some(rx.await),
            }
        };

        let outcome = tokio::select! {
            outcome = wait => outcome,
            () = cancelled(token.as_ref()) => {
                self.shared.pending.lock().await.remove(&id);
                debug!("Request {} (id: {}) cancelled by caller", method, id);
                let params = serde_json::to_value(CancelParams { id })?;
                if let Err(e) = self.notify(CANCEL_METHOD, params) {
                    debug!("Could not forward cancellation: {}", e);
                }
                return Err(RpcError::Cancelled { method: method.to_string() });
            }
        };

        let response = match outcome {
            Some(Ok(response)) => response,
            Some(Err(_)) => return Err(RpcError::ConnectionClosed),
            None => {
                self.shared.pending.lock().await.remove(&id);
                return Err(RpcError::Timeout {
                    method: method.to_string(),
                    after: self.timeout.unwrap_or_default(),
                });
            }
        };

        if let Some(error) = response.error {
            return Err(RpcError::from_response(method, error));
        }

        // A null result arrives as a missing field.
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Sends a notification; no response is expected.
    pub(crate) fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        self.shared
            .send(Message::Notification(NotificationMessage::new(method, params)))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Resolves once the dispatch loop has stopped.
    pub(crate) async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Waits for inbound handlers to finish and the writer to flush.
    pub(crate) async fn drain(&self, grace: Duration) {
        let settle = async {
            loop {
                let notified = self.shared.idle.notified();
                let idle = lock(&self.shared.inflight).is_empty();
                if idle {
                    break;
                }
                notified.await;
            }

            let (tx, rx) = oneshot::channel();
            if self.shared.outgoing.send(Outbound::Flush(tx)).is_ok() {
                let _ = rx.await;
            }
        };

        if tokio::time::timeout(grace, settle).await.is_err() {
            warn!("Connection did not drain within {:?}", grace);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.loop_handle.abort();
        self.shared.closed.cancel();
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

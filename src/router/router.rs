use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{NetError, NetResult};
use crate::ids::{ChannelId, PeerId, RequestId};
use crate::overlay::star_network::{NetworkEvent, StarOverlayNetwork, StarPhase};
use crate::router::router_messages::RouterMessage;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
    pub sender_id: PeerId,
    pub channel_id: ChannelId,
    pub body: Bytes,
}

/// A request as seen by its handler. The handler (or some other code) answers it through
///  [Router::respond], at most once.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IncomingRequest {
    pub sender_id: PeerId,
    pub channel_id: ChannelId,
    pub request_id: RequestId,
    pub body: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub ok: bool,
    pub body: Bytes,
}

/// Handlers are awaited one after the other, and message n+1 is not dispatched before all
///  handlers for message n completed. A handler must therefore never wait for a response to
///  a request sent through the same router: that response can not be dispatched until the
///  handler returns.
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn on_notification(&self, notification: Notification);
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn on_request(&self, request: IncomingRequest);
}

#[async_trait]
impl <F, Fut> NotificationHandler for F
where
    F: Fn(Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_notification(&self, notification: Notification) {
        self(notification).await
    }
}

#[async_trait]
impl <F, Fut> RequestHandler for F
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_request(&self, request: IncomingRequest) {
        self(request).await
    }
}

#[derive(Default)]
struct HandlerTable {
    notification_handlers: FxHashMap<ChannelId, Vec<(u64, Arc<dyn NotificationHandler>)>>,
    request_handlers: FxHashMap<ChannelId, Vec<(u64, Arc<dyn RequestHandler>)>>,
    next_handler_id: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum HandlerKind {
    Notification,
    Request,
}

/// Returned when a handler is registered. Dropping it keeps the handler registered; call
///  [HandlerRegistration::unregister] to remove it.
#[must_use]
pub struct HandlerRegistration {
    handlers: Weak<RwLock<HandlerTable>>,
    kind: HandlerKind,
    channel_id: ChannelId,
    handler_id: u64,
}

impl HandlerRegistration {
    pub fn unregister(self) {
        let handlers = match self.handlers.upgrade() {
            Some(handlers) => handlers,
            None => return,
        };
        let mut handlers = write(&handlers);

        match self.kind {
            HandlerKind::Notification => remove_handler(&mut handlers.notification_handlers, &self.channel_id, self.handler_id),
            HandlerKind::Request => remove_handler(&mut handlers.request_handlers, &self.channel_id, self.handler_id),
        }
    }
}

fn remove_handler<H: ?Sized>(handlers: &mut FxHashMap<ChannelId, Vec<(u64, Arc<H>)>>, channel_id: &ChannelId, handler_id: u64) {
    if let Some(channel_handlers) = handlers.get_mut(channel_id) {
        channel_handlers.retain(|(id, _)| *id != handler_id);
        if channel_handlers.is_empty() {
            handlers.remove(channel_id);
        }
    }
}

fn write(handlers: &RwLock<HandlerTable>) -> std::sync::RwLockWriteGuard<'_, HandlerTable> {
    handlers.write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read(handlers: &RwLock<HandlerTable>) -> std::sync::RwLockReadGuard<'_, HandlerTable> {
    handlers.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingRequest {
    recipient_id: PeerId,
    reply: oneshot::Sender<NetResult<Response>>,
}

/// Multiplexes any number of notification and request / response channels over a single
///  overlay network.
///
/// All incoming messages are dispatched by a single task, strictly in arrival order and
///  across all channels: the handlers for one message run to completion before the next
///  message is dispatched.
pub struct Router {
    network: Arc<StarOverlayNetwork>,
    handlers: Arc<RwLock<HandlerTable>>,
    pending_requests: Mutex<FxHashMap<RequestId, PendingRequest>>,
    /// requests received but not answered yet - request ids are only unique per requester
    pending_responses: Mutex<FxHashSet<(PeerId, RequestId)>>,
    next_request_id: AtomicU64,
    disposed: AtomicBool,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.receive_task).take() {
            task.abort();
        }
    }
}

impl Router {
    pub fn new(network: Arc<StarOverlayNetwork>) -> Arc<Router> {
        let network_events = network.subscribe();

        let router = Arc::new(Router {
            network,
            handlers: Default::default(),
            pending_requests: Default::default(),
            pending_responses: Default::default(),
            next_request_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            receive_task: Default::default(),
        });

        let receive_task = tokio::spawn(receive_loop(Arc::downgrade(&router), network_events));
        *lock(&router.receive_task) = Some(receive_task);
        router
    }

    pub fn network(&self) -> &Arc<StarOverlayNetwork> {
        &self.network
    }

    fn check_not_disposed(&self) -> NetResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(NetError::RouterDisposed);
        }
        Ok(())
    }

    pub fn on_notification(&self, channel_id: ChannelId, handler: impl NotificationHandler) -> HandlerRegistration {
        let mut handlers = write(&self.handlers);
        let handler_id = handlers.next_handler_id;
        handlers.next_handler_id += 1;
        let handler: Arc<dyn NotificationHandler> = Arc::new(handler);
        handlers.notification_handlers.entry(channel_id.clone())
            .or_default()
            .push((handler_id, handler));

        HandlerRegistration {
            handlers: Arc::downgrade(&self.handlers),
            kind: HandlerKind::Notification,
            channel_id,
            handler_id,
        }
    }

    pub fn on_request(&self, channel_id: ChannelId, handler: impl RequestHandler) -> HandlerRegistration {
        let mut handlers = write(&self.handlers);
        let handler_id = handlers.next_handler_id;
        handlers.next_handler_id += 1;
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        handlers.request_handlers.entry(channel_id.clone())
            .or_default()
            .push((handler_id, handler));

        HandlerRegistration {
            handlers: Arc::downgrade(&self.handlers),
            kind: HandlerKind::Request,
            channel_id,
            handler_id,
        }
    }

    /// Fire and forget: unicast if there is a recipient, broadcast to all other members
    ///  otherwise
    pub async fn notify(&self, recipient_id: Option<&PeerId>, channel_id: &ChannelId, body: Bytes) -> NetResult<()> {
        self.check_not_disposed()?;

        let message = RouterMessage::Notification {
            channel_id: channel_id.clone(),
            body,
        }.to_bytes();

        match recipient_id {
            Some(recipient_id) => self.network.unicast(recipient_id, message).await,
            None => self.network.broadcast(message).await,
        }
    }

    /// Fails with [NetError::ConnectionLost] when the recipient leaves the network before
    ///  responding. There is no built-in timeout otherwise: a recipient that is no member at
    ///  all, or never responds, is the caller's to guard against with a timeout of its own.
    pub async fn request(&self, recipient_id: &PeerId, channel_id: &ChannelId, body: Bytes) -> NetResult<Response> {
        self.check_not_disposed()?;

        let request_id = RequestId(self.next_request_id.fetch_add(1, Ordering::AcqRel));
        let (reply, reply_receiver) = oneshot::channel();
        lock(&self.pending_requests).insert(request_id, PendingRequest {
            recipient_id: recipient_id.clone(),
            reply,
        });
        if self.disposed.load(Ordering::Acquire) {
            // dispose() drained the table before the insert
            lock(&self.pending_requests).remove(&request_id);
            return Err(NetError::RouterDisposed);
        }

        let message = RouterMessage::Request {
            channel_id: channel_id.clone(),
            request_id,
            body,
        }.to_bytes();

        trace!("sending request #{} on {:?} to {:?}", request_id, channel_id, recipient_id);
        if let Err(e) = self.network.unicast(recipient_id, message).await {
            lock(&self.pending_requests).remove(&request_id);
            return Err(e);
        }

        match reply_receiver.await {
            Ok(result) => result,
            Err(_) => Err(NetError::RouterDisposed),
        }
    }

    /// Answers a request received through this router. Every request is answered at most
    ///  once.
    pub async fn respond(&self, requester_id: &PeerId, request_id: RequestId, ok: bool, body: Bytes) -> NetResult<()> {
        self.check_not_disposed()?;

        if !lock(&self.pending_responses).remove(&(requester_id.clone(), request_id)) {
            return Err(NetError::DuplicateResponse {
                requester_id: requester_id.clone(),
                request_id,
            });
        }

        let message = RouterMessage::Response {
            request_id,
            ok,
            body,
        }.to_bytes();
        self.network.unicast(requester_id, message).await
    }

    /// Stops dispatching, drops all handlers and fails all pending requests. Handlers often
    ///  reference the router, so this is what breaks those reference cycles.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("disposing router for network {:?}", self.network.network_id());
        if let Some(task) = lock(&self.receive_task).take() {
            task.abort();
        }

        let (notification_handlers, request_handlers) = {
            let mut handlers = write(&self.handlers);
            (std::mem::take(&mut handlers.notification_handlers), std::mem::take(&mut handlers.request_handlers))
        };
        drop(notification_handlers);
        drop(request_handlers);

        let pending = lock(&self.pending_requests).drain().collect::<Vec<_>>();
        for (_, request) in pending {
            let _ = request.reply.send(Err(NetError::RouterDisposed));
        }
        lock(&self.pending_responses).clear();
    }

    /// Requests to a member that left can never be answered, and neither are the requests it
    ///  sent. If this node itself dropped out of the network (its hub left), that holds for
    ///  all of them.
    async fn on_member_left(&self, peer_id: &PeerId) {
        let still_joined = self.network.phase().await == StarPhase::Joined;

        let failed = {
            let mut pending_requests = lock(&self.pending_requests);
            let request_ids = pending_requests.iter()
                .filter(|(_, pending)| !still_joined || &pending.recipient_id == peer_id)
                .map(|(request_id, _)| *request_id)
                .collect::<Vec<_>>();
            request_ids.iter()
                .filter_map(|request_id| pending_requests.remove(request_id))
                .collect::<Vec<_>>()
        };
        for pending in failed {
            debug!("failing request to {:?}: {:?} left", pending.recipient_id, peer_id);
            let _ = pending.reply.send(Err(NetError::ConnectionLost(pending.recipient_id)));
        }

        lock(&self.pending_responses)
            .retain(|(requester_id, _)| still_joined && requester_id != peer_id);
    }

    async fn on_message(&self, sender_id: PeerId, body: Bytes) {
        let message = match RouterMessage::deser(body) {
            Ok(message) => message,
            Err(e) => {
                warn!("received unparseable router message from {:?} - dropping: {}", sender_id, e);
                return;
            }
        };

        match message {
            RouterMessage::Notification { channel_id, body } => {
                let handlers = read(&self.handlers)
                    .notification_handlers.get(&channel_id)
                    .map(|h| h.iter().map(|(_, h)| h.clone()).collect::<Vec<_>>())
                    .unwrap_or_default();
                if handlers.is_empty() {
                    trace!("no notification handler for {:?} - dropping", channel_id);
                    return;
                }

                let notification = Notification { sender_id, channel_id, body };
                for handler in handlers {
                    handler.on_notification(notification.clone()).await;
                }
            }
            RouterMessage::Request { channel_id, request_id, body } => {
                lock(&self.pending_responses).insert((sender_id.clone(), request_id));

                let handlers = read(&self.handlers)
                    .request_handlers.get(&channel_id)
                    .map(|h| h.iter().map(|(_, h)| h.clone()).collect::<Vec<_>>())
                    .unwrap_or_default();

                if handlers.is_empty() {
                    debug!("no request handler for {:?} - rejecting request #{} from {:?}", channel_id, request_id, sender_id);
                    if let Err(e) = self.respond(&sender_id, request_id, false, Bytes::new()).await {
                        debug!("rejecting request #{} from {:?} failed: {}", request_id, sender_id, e);
                    }
                    return;
                }

                let request = IncomingRequest { sender_id, channel_id, request_id, body };
                for handler in handlers {
                    handler.on_request(request.clone()).await;
                }
            }
            RouterMessage::Response { request_id, ok, body } => {
                let mut pending_requests = lock(&self.pending_requests);
                match pending_requests.get(&request_id) {
                    Some(pending) if pending.recipient_id == sender_id => {}
                    Some(_) => {
                        warn!("response #{} from {:?}, which is not the recipient of the request - dropping", request_id, sender_id);
                        return;
                    }
                    None => {
                        debug!("response #{} from {:?} has no pending request - dropping", request_id, sender_id);
                        return;
                    }
                }
                if let Some(pending) = pending_requests.remove(&request_id) {
                    let _ = pending.reply.send(Ok(Response { ok, body }));
                }
            }
        }
    }
}

async fn receive_loop(router: Weak<Router>, mut network_events: mpsc::UnboundedReceiver<NetworkEvent>) {
    while let Some(evt) = network_events.recv().await {
        let router = match router.upgrade() {
            Some(router) => router,
            None => break,
        };

        match evt {
            NetworkEvent::Received { sender_id, body } => router.on_message(sender_id, body).await,
            NetworkEvent::MemberLeft { peer_id, .. } => router.on_member_left(&peer_id).await,
            NetworkEvent::MemberJoined { peer_id } => {
                trace!("{:?} joined", peer_id);
            }
        }
    }
}

//! Sending side of a data session: admission of a subscription, then the
//! feeder or notifier loop.

use std::fmt;
use std::time::Duration;

use feedline_codec::{Reply, Request, PROTOCOL_V6};
use feedline_core::{Product, ProductClass, Signature, Timestamp};
use feedline_transport::{LinkError, PeerId, PeerLink, RpcClient};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::acl::{AccessControl, DeliveryFilter};
use crate::cancel::{CancelFlag, CANCEL_POLL};
use crate::config::NodeConfig;
use crate::error::{DenyReason, SessionError};
use crate::registry::{RegistryError, SessionEntry, SessionRegistry};
use crate::store::{NextProduct, ProductReader, ProductStore};

/// What a downstream asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Products with their data.
    Feed,
    /// Metadata only.
    Notify,
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeedMode::Feed => "feed",
            FeedMode::Notify => "notification",
        })
    }
}

/// A FEEDME or NOTIFYME call as received.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub mode: FeedMode,
    pub class: ProductClass,
    pub primary: bool,
    pub version: u32,
}

/// An admitted and registered subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u32,
    pub mode: FeedMode,
    pub class: ProductClass,
    /// Product after which delivery resumes.
    pub resume: Option<Signature>,
    pub filter: DeliveryFilter,
    pub is_primary: bool,
    pub version: u32,
    /// Set by the registry when a newer session supersedes this one.
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone)]
pub enum Admission {
    Accepted(Box<Subscription>),
    /// The caller must ask again for this class.
    Reclassify(ProductClass),
    BadPattern,
    Denied,
}

fn register<R: SessionRegistry>(registry: &R, entry: SessionEntry) -> Result<ProductClass, SessionError> {
    match registry.add_session(entry.clone()) {
        Err(RegistryError::Exists(id)) => {
            warn!("Session {} already registered; replacing it", id);
            deregister(registry, id)?;
            Ok(registry.add_session(entry)?)
        }
        other => Ok(other?),
    }
}

/// Decides whether `peer` gets what it asked for. An accepted subscription
/// is left registered under `id`.
pub fn admit_subscription<R: SessionRegistry>(
    acl: &AccessControl,
    registry: &R,
    peer: &PeerId,
    id: u32,
    request: SubscriptionRequest,
) -> Result<Admission, SessionError> {
    if !acl.is_host_allowed(peer) {
        warn!("Denying {} request from unknown host {}", request.mode, peer);
        return Ok(Admission::Denied);
    }
    let mut wanted = request.class;
    let resume = wanted.take_resume_token();
    let Some(filter) = acl.build_delivery_filter(peer, &wanted) else {
        warn!("Denying {} of {} to {}: no allow rule applies", request.mode, wanted, peer);
        return Ok(Admission::Denied);
    };
    if let Some(pattern) = wanted.invalid_pattern() {
        warn!(
            "Bad pattern from {}: {:?}: {}",
            peer,
            pattern.as_str(),
            pattern.compile_error().unwrap_or_default()
        );
        return Ok(Admission::BadPattern);
    }
    let allowed = acl.reduce_subscription(peer, &wanted);
    if allowed.is_empty() {
        info!("Nothing in {} is allowed for {}", wanted, peer);
        return Ok(Admission::Reclassify(allowed));
    }

    let cancel = CancelFlag::new();
    let granted = register(
        registry,
        SessionEntry {
            id,
            version: request.version,
            peer_addr: peer.addr.clone(),
            class: allowed,
            is_notifier: request.mode == FeedMode::Notify,
            is_primary: request.primary,
            cancel: cancel.clone(),
        },
    )?;
    if granted != wanted {
        deregister(registry, id)?;
        info!("Reclassifying {} request from {}: {} -> {}", request.mode, peer, wanted, granted);
        return Ok(Admission::Reclassify(granted));
    }

    Ok(Admission::Accepted(Box::new(Subscription {
        id,
        mode: request.mode,
        class: granted,
        resume: resume.filter(|_| request.version >= PROTOCOL_V6),
        filter,
        is_primary: request.primary,
        version: request.version,
        cancel,
    })))
}

/// Outcome of delivering one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The receiver declined or the transfer was abandoned.
    Declined,
    /// The receiver narrowed the subscription.
    Reclassified(ProductClass),
}

/// Chooses an encoding for each product and drives the exchange.
#[derive(Debug, Clone)]
pub struct Deliverer {
    pub mode: FeedMode,
    /// Products up to this size go as a single message.
    pub max_hereis: u32,
    pub chunk_size: u32,
    pub max_restarts: u32,
    /// Whether the peer understands announce-then-chunks delivery.
    pub two_phase: bool,
    pub rpc_timeout: Duration,
}

impl Deliverer {
    pub fn for_subscription(sub: &Subscription, config: &NodeConfig) -> Self {
        Self {
            mode: sub.mode,
            max_hereis: if sub.is_primary { config.max_hereis_bytes } else { 0 },
            chunk_size: config.chunk_size.max(1),
            max_restarts: config.max_restarts,
            two_phase: sub.version >= PROTOCOL_V6,
            rpc_timeout: config.rpc_timeout(),
        }
    }

    async fn call<L: PeerLink>(
        &self,
        link: &mut L,
        rpc: &mut RpcClient,
        request: Request,
    ) -> Result<Reply, SessionError> {
        rpc.call(link, request)
            .await
            .map_err(|err| SessionError::from_link(link.peer(), err, self.rpc_timeout))
    }

    /// Sends `product` and reports how the receiver took it.
    pub async fn deliver<L: PeerLink>(
        &self,
        link: &mut L,
        rpc: &mut RpcClient,
        product: &Product,
    ) -> Result<Delivery, SessionError> {
        if self.mode == FeedMode::Notify {
            let request = Request::Notification {
                info: product.info.clone(),
            };
            let reply = self.call(link, rpc, request).await?;
            return steady_reply(link.peer(), reply);
        }
        if !self.two_phase || product.info.size <= self.max_hereis {
            let request = Request::HereIs {
                product: product.clone(),
            };
            let reply = self.call(link, rpc, request).await?;
            return steady_reply(link.peer(), reply);
        }

        let announce = Request::ComingSoon {
            info: product.info.clone(),
            chunk_size: self.chunk_size,
        };
        let reply = self.call(link, rpc, announce).await?;
        match steady_reply(link.peer(), reply)? {
            Delivery::Sent => {}
            other => return Ok(other),
        }
        let mut restarts = 0;
        'transfer: loop {
            for (index, chunk) in product.data.chunks(self.chunk_size as usize).enumerate() {
                let offset = u32::try_from(index * self.chunk_size as usize).unwrap_or(u32::MAX);
                let request = Request::BlkData {
                    signature: product.info.signature,
                    offset,
                    data: chunk.to_vec(),
                };
                match self.call(link, rpc, request).await? {
                    Reply::Restart if restarts < self.max_restarts => {
                        restarts += 1;
                        debug!("Restarting {} to {} ({})", product.info.ident, link.peer(), restarts);
                        continue 'transfer;
                    }
                    Reply::Restart => {
                        warn!(
                            "Giving up on {} to {} after {} restarts",
                            product.info, link.peer(), restarts
                        );
                        return Ok(Delivery::Declined);
                    }
                    reply => match steady_reply(link.peer(), reply)? {
                        Delivery::Sent => {}
                        other => return Ok(other),
                    },
                }
            }
            return Ok(Delivery::Sent);
        }
    }
}

/// Interprets a reply received while transferring.
fn steady_reply(peer: &PeerId, reply: Reply) -> Result<Delivery, SessionError> {
    match reply {
        Reply::Ok(_) => Ok(Delivery::Sent),
        Reply::DontSend => Ok(Delivery::Declined),
        Reply::Reclassify(class) => Ok(Delivery::Reclassified(class)),
        Reply::ShuttingDown => Err(SessionError::ConnectionClosed {
            peer: peer.to_string(),
        }),
        Reply::Denied => Err(SessionError::AdmissionDenied {
            peer: peer.to_string(),
            reason: DenyReason::Refused,
        }),
        Reply::VersionMismatch { low, high } => Err(SessionError::VersionMismatch {
            peer: peer.to_string(),
            low,
            high,
        }),
        Reply::Restart | Reply::BadPattern => Err(SessionError::ClientTransport {
            peer: peer.to_string(),
            source: LinkError::Unexpected("reply out of place during transfer"),
        }),
    }
}

/// Why a feeder stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The time window is over or the receiver wants nothing more.
    Finished,
    Cancelled,
}

fn position<Rd: ProductReader>(
    reader: &mut Rd,
    sub: &Subscription,
    peer: &PeerId,
) -> Result<(), SessionError> {
    if let Some(signature) = &sub.resume {
        if reader.set_cursor_from_signature(signature)? {
            info!("Resuming {} to {} after {}", sub.mode, peer, signature);
            return Ok(());
        }
        info!(
            "Product {} not found; starting {} to {} from {}",
            signature, sub.mode, peer, sub.class.from
        );
    }
    reader.set_cursor_from_class(&sub.class)?;
    Ok(())
}

fn deregister<R: SessionRegistry>(registry: &R, id: u32) -> Result<(), SessionError> {
    match registry.remove_session(id) {
        Ok(()) | Err(RegistryError::NotFound(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Moves a running subscription to the class the downstream switched to.
/// The new class stays within what was admitted and is registered again so
/// that later requests are narrowed against it. Returns `false` when
/// nothing is left to send.
fn reclassify<R: SessionRegistry>(
    acl: &AccessControl,
    registry: &R,
    peer: &PeerId,
    sub: &mut Subscription,
    class: &ProductClass,
) -> Result<bool, SessionError> {
    let reduced = acl.reduce_reclassification(peer, &sub.class, class);
    if reduced.is_empty() {
        info!("Nothing in {} remains for {}", class, peer);
        return Ok(false);
    }
    deregister(registry, sub.id)?;
    let granted = register(
        registry,
        SessionEntry {
            id: sub.id,
            version: sub.version,
            peer_addr: peer.addr.clone(),
            class: reduced,
            is_notifier: sub.mode == FeedMode::Notify,
            is_primary: sub.is_primary,
            cancel: sub.cancel.clone(),
        },
    )?;
    let filter = match acl.build_delivery_filter(peer, &granted) {
        Some(filter) if !granted.is_empty() => filter,
        _ => {
            info!("{} is already sent to {} by other sessions", class, peer);
            deregister(registry, sub.id)?;
            return Ok(false);
        }
    };
    info!("{} reclassified {} to {}", peer, sub.class, granted);
    sub.class = granted;
    sub.filter = filter;
    Ok(true)
}

/// Sends every matching product to the downstream until the window ends,
/// the peer goes away, or the session is cancelled.
pub async fn run_feeder<L, S, R>(
    link: &mut L,
    store: &S,
    acl: &AccessControl,
    registry: &R,
    sub: &mut Subscription,
    config: &NodeConfig,
    shutdown: &CancelFlag,
) -> Result<FeedOutcome, SessionError>
where
    L: PeerLink,
    S: ProductStore,
    R: SessionRegistry,
{
    let peer = link.peer().clone();
    let mut rpc = RpcClient::new(sub.version).with_timeout(config.rpc_timeout());
    let mut reader = store.open_reader()?;
    position(&mut reader, sub, &peer)?;
    let deliverer = Deliverer::for_subscription(sub, config);
    let keepalive = config.keepalive_interval();
    let mut last_send = Instant::now();
    let mut sent = 0_u64;
    info!("Starting {} of {} to {}", sub.mode, sub.class, peer);

    loop {
        if shutdown.is_cancelled() || sub.cancel.is_cancelled() {
            info!("Stopping {} to {} after {} products", sub.mode, peer, sent);
            return Ok(FeedOutcome::Cancelled);
        }
        match reader.next_matching(&sub.class)? {
            NextProduct::Product(product) => {
                if !sub.filter.matches(&product.info) {
                    debug!("Filtered {} for {}", product.info, peer);
                    continue;
                }
                match deliverer.deliver(link, &mut rpc, &product).await? {
                    Delivery::Sent => sent += 1,
                    Delivery::Declined => {}
                    Delivery::Reclassified(class) if class.is_empty() => {
                        info!("{} wants nothing more", peer);
                        return Ok(FeedOutcome::Finished);
                    }
                    Delivery::Reclassified(class) => {
                        if !reclassify(acl, registry, &peer, sub, &class)? {
                            return Ok(FeedOutcome::Finished);
                        }
                    }
                }
                last_send = Instant::now();
            }
            NextProduct::EndOfQueue => {
                if sub.class.to != Timestamp::END && Timestamp::now() >= sub.class.to {
                    info!("Window of {} to {} satisfied after {} products", sub.mode, peer, sent);
                    return Ok(FeedOutcome::Finished);
                }
                let idle = last_send.elapsed();
                if idle >= keepalive {
                    let reply = deliverer.call(link, &mut rpc, Request::NullProc).await?;
                    steady_reply(&peer, reply)?;
                    last_send = Instant::now();
                } else {
                    reader.suspend((keepalive - idle).min(CANCEL_POLL)).await;
                }
            }
        }
    }
}

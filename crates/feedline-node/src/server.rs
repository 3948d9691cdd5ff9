//! Per-connection dispatch for inbound links.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use feedline_codec::{Ack, FrameBody, Reply, Request};
use feedline_transport::rpc::send_reply;
use feedline_transport::PeerLink;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::acl::AccessControl;
use crate::activity::{next_frame, run_activity_loop, ActivityOutcome, NextFrame};
use crate::cancel::{sleep_unless_cancelled, CancelFlag};
use crate::config::NodeConfig;
use crate::downstream::{admit_offer, OfferAdmission, Receiver};
use crate::error::SessionError;
use crate::registry::{RegistryError, SessionRegistry};
use crate::store::ProductStore;
use crate::upstream::{
    admit_subscription, run_feeder, Admission, FeedMode, FeedOutcome, Subscription,
    SubscriptionRequest,
};

/// Everything a connection task shares with its siblings.
#[derive(Debug, Clone)]
pub struct ServerContext<S, R> {
    pub acl: Arc<AccessControl>,
    pub config: Arc<NodeConfig>,
    pub store: S,
    pub registry: R,
    pub shutdown: CancelFlag,
    next_id: Arc<AtomicU32>,
}

impl<S: ProductStore, R: SessionRegistry> ServerContext<S, R> {
    pub fn new(
        acl: Arc<AccessControl>,
        config: Arc<NodeConfig>,
        store: S,
        registry: R,
        shutdown: CancelFlag,
    ) -> Self {
        Self {
            acl,
            config,
            store,
            registry,
            shutdown,
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    fn next_session_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

/// How a served connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// This node fed a downstream.
    Fed(FeedOutcome),
    /// This node received products offered by the peer.
    Received(ActivityOutcome),
    /// The request or offer was refused.
    Denied,
    Closed,
    TimedOut,
    Cancelled,
}

/// Serves one inbound connection: answers liveness calls, negotiates a
/// subscription or an offer, then runs the resulting session.
pub async fn serve_connection<L, S, R>(mut link: L, ctx: ServerContext<S, R>) -> Result<ServeOutcome, SessionError>
where
    L: PeerLink,
    S: ProductStore,
    R: SessionRegistry,
{
    let config = Arc::clone(&ctx.config);
    let peer = link.peer().clone();
    let mut reclass_rounds = 0_u32;
    loop {
        let deadline = Instant::now() + config.inactive_timeout;
        let frame = match next_frame(&mut link, deadline, &[&ctx.shutdown], config.inactive_timeout).await? {
            NextFrame::Frame(frame) => frame,
            NextFrame::TimedOut => return Ok(ServeOutcome::TimedOut),
            NextFrame::Closed => return Ok(ServeOutcome::Closed),
            NextFrame::Cancelled => return Ok(ServeOutcome::Cancelled),
        };
        let FrameBody::Call(request) = frame.body else {
            warn!("Ignoring reply from {} before negotiation", peer);
            continue;
        };
        let (version, xid) = (frame.version, frame.xid);
        let reply_to = |reply: Reply| (version, xid, reply);

        if !config.supports_version(version) {
            let (low, high) = config.version_range();
            info!("{} asked for protocol version {}", peer, version);
            send(&mut link, reply_to(Reply::VersionMismatch { low, high }), &config).await?;
            continue;
        }

        let negotiating = matches!(
            request,
            Request::FeedMe { .. } | Request::NotifyMe { .. } | Request::Hiya { .. }
        );
        if negotiating && reclass_rounds >= config.max_reclass_rounds {
            warn!(
                "Denying {} from {} after {} reclassifications",
                request.name(),
                peer,
                reclass_rounds
            );
            send(&mut link, reply_to(Reply::Denied), &config).await?;
            return Ok(ServeOutcome::Denied);
        }

        match request {
            Request::NullProc => send(&mut link, reply_to(Reply::ok()), &config).await?,
            Request::IsAlive { id } => {
                let alive = ctx.registry.contains(id);
                send(&mut link, reply_to(Reply::Ok(Ack::Alive(alive))), &config).await?;
            }
            Request::FeedMe { class, primary } => {
                let request = SubscriptionRequest {
                    mode: FeedMode::Feed,
                    class,
                    primary,
                    version,
                };
                match subscribe(&mut link, &ctx, request, xid).await? {
                    Some(outcome) => return Ok(outcome),
                    None => reclass_rounds += 1,
                }
            }
            Request::NotifyMe { class } => {
                let request = SubscriptionRequest {
                    mode: FeedMode::Notify,
                    class,
                    primary: false,
                    version,
                };
                match subscribe(&mut link, &ctx, request, xid).await? {
                    Some(outcome) => return Ok(outcome),
                    None => reclass_rounds += 1,
                }
            }
            Request::Hiya { class } => match admit_offer(&ctx.acl, &peer, &class, &config) {
                OfferAdmission::Accepted { class, max_hereis } => {
                    send(&mut link, reply_to(Reply::Ok(Ack::MaxHereis(max_hereis))), &config).await?;
                    info!("Receiving {} from {}", class, peer);
                    let writer = ctx.store.open_writer()?;
                    let mut receiver = Receiver::new(peer.to_string(), writer, class, config.max_latency)
                        .with_feedtypes(Arc::clone(ctx.acl.feedtypes()));
                    let outcome = run_activity_loop(
                        &mut link,
                        config.inactive_timeout,
                        &[&ctx.shutdown],
                        &mut receiver,
                    )
                    .await?;
                    info!("Offer session with {} ended: {:?}", peer, receiver.stats());
                    return Ok(ServeOutcome::Received(outcome));
                }
                OfferAdmission::Reclassify(reduced) => {
                    send(&mut link, reply_to(Reply::Reclassify(reduced)), &config).await?;
                    reclass_rounds += 1;
                }
                OfferAdmission::BadPattern => {
                    send(&mut link, reply_to(Reply::BadPattern), &config).await?;
                    return Ok(ServeOutcome::Denied);
                }
                OfferAdmission::Denied => {
                    send(&mut link, reply_to(Reply::Denied), &config).await?;
                    return Ok(ServeOutcome::Denied);
                }
            },
            other => {
                warn!("{} from {} before negotiation", other.name(), peer);
                send(&mut link, reply_to(Reply::Denied), &config).await?;
                return Ok(ServeOutcome::Denied);
            }
        }
    }
}

async fn send<L: PeerLink>(
    link: &mut L,
    (version, xid, reply): (u32, u32, Reply),
    config: &NodeConfig,
) -> Result<(), SessionError> {
    send_reply(link, version, xid, reply)
        .await
        .map_err(|err| SessionError::from_link(link.peer(), err, config.inactive_timeout))
}

/// Admits a subscription and, when accepted, feeds it to completion.
/// `None` means the peer was asked to reclassify and may ask again.
async fn subscribe<L, S, R>(
    link: &mut L,
    ctx: &ServerContext<S, R>,
    request: SubscriptionRequest,
    xid: u32,
) -> Result<Option<ServeOutcome>, SessionError>
where
    L: PeerLink,
    S: ProductStore,
    R: SessionRegistry,
{
    let version = request.version;
    let id = ctx.next_session_id();
    let peer = link.peer().clone();
    let admission = admit_subscription(&ctx.acl, &ctx.registry, &peer, id, request)?;
    let mut sub = match admission {
        Admission::Accepted(sub) => sub,
        Admission::Reclassify(reduced) => {
            send(link, (version, xid, Reply::Reclassify(reduced)), &ctx.config).await?;
            return Ok(None);
        }
        Admission::BadPattern => {
            send(link, (version, xid, Reply::BadPattern), &ctx.config).await?;
            return Ok(Some(ServeOutcome::Denied));
        }
        Admission::Denied => {
            send(link, (version, xid, Reply::Denied), &ctx.config).await?;
            return Ok(Some(ServeOutcome::Denied));
        }
    };

    let result = feed(link, ctx, &mut sub, (version, xid)).await;
    match ctx.registry.remove_session(id) {
        Ok(()) | Err(RegistryError::NotFound(_)) => {}
        Err(err) => warn!("Couldn't deregister session {}: {}", id, err),
    }
    result.map(|outcome| Some(ServeOutcome::Fed(outcome)))
}

async fn feed<L, S, R>(
    link: &mut L,
    ctx: &ServerContext<S, R>,
    sub: &mut Subscription,
    (version, xid): (u32, u32),
) -> Result<FeedOutcome, SessionError>
where
    L: PeerLink,
    S: ProductStore,
    R: SessionRegistry,
{
    send(link, (version, xid, Reply::Ok(Ack::Session(sub.id))), &ctx.config).await?;
    if !sleep_unless_cancelled(ctx.config.upstream_startup_delay, &[&ctx.shutdown, &sub.cancel]).await {
        return Ok(FeedOutcome::Cancelled);
    }
    run_feeder(link, &ctx.store, &ctx.acl, &ctx.registry, sub, &ctx.config, &ctx.shutdown).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use feedline_codec::{Ack, Frame, FrameBody, Reply, Request, PROTOCOL_V6};
    use feedline_core::{Feedtype, Pattern, Product, ProductClass, ProductSpec, Timestamp};
    use feedline_transport::{InMemoryLink, PeerId, PeerLink};

    use super::{serve_connection, ServeOutcome, ServerContext};
    use crate::acl::{AcceptRule, AccessControl, AllowRule};
    use crate::activity::ActivityOutcome;
    use crate::cancel::CancelFlag;
    use crate::config::NodeConfig;
    use crate::host::HostMatcher;
    use crate::registry::{MemoryRegistry, SessionRegistry};
    use crate::store::{MemoryStore, StoreLimits};
    use crate::upstream::FeedOutcome;

    const FT: Feedtype = Feedtype(0b011);

    fn acl() -> AccessControl {
        let mut acl = AccessControl::new();
        acl.add_allow(AllowRule {
            feedtype: FT,
            host: HostMatcher::parse("down.example").expect("host"),
            ok_pattern: Pattern::any(),
            not_pattern: None,
        });
        acl.add_accept(AcceptRule {
            feedtype: FT,
            pattern: Pattern::any(),
            host: HostMatcher::parse("down.example").expect("host"),
            is_primary: true,
        });
        acl
    }

    fn context(store: MemoryStore) -> ServerContext<MemoryStore, MemoryRegistry> {
        context_with(
            store,
            NodeConfig {
                upstream_startup_delay: Duration::ZERO,
                ..NodeConfig::default()
            },
        )
    }

    fn context_with(store: MemoryStore, config: NodeConfig) -> ServerContext<MemoryStore, MemoryRegistry> {
        ServerContext::new(
            Arc::new(acl()),
            Arc::new(config),
            store,
            MemoryRegistry::new(true),
            CancelFlag::new(),
        )
    }

    fn links(name: &str) -> (InMemoryLink, InMemoryLink) {
        InMemoryLink::pair(PeerId::new(name, "10.0.0.2"), PeerId::new("up.example", "10.0.0.1"))
    }

    fn class() -> ProductClass {
        ProductClass::new(Timestamp::ZERO, Timestamp::END, vec![ProductSpec::any(FT)])
    }

    fn product(ident: &str) -> Product {
        Product::new(
            Feedtype(0b001),
            ident,
            "origin.example",
            1,
            Timestamp::now().saturating_sub(Duration::from_secs(10)),
            vec![7; 64],
        )
    }

    async fn call(link: &mut InMemoryLink, version: u32, xid: u32, request: Request) -> Reply {
        link.send(Frame::call(version, xid, request)).await.expect("send");
        let frame = link.recv().await.expect("recv").expect("reply");
        assert_eq!(frame.xid, xid);
        match frame.body {
            FrameBody::Reply(reply) => reply,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_calls_are_answered_until_close() {
        let (mut client, server) = links("down.example");
        let task = tokio::spawn(serve_connection(server, context(MemoryStore::default())));

        assert_eq!(call(&mut client, PROTOCOL_V6, 1, Request::NullProc).await, Reply::ok());
        assert_eq!(
            call(&mut client, PROTOCOL_V6, 2, Request::IsAlive { id: 9 }).await,
            Reply::Ok(Ack::Alive(false))
        );
        assert_eq!(
            call(&mut client, 4, 3, Request::NullProc).await,
            Reply::VersionMismatch { low: 5, high: 6 }
        );
        client.close();
        assert_eq!(task.await.expect("task").expect("serve"), ServeOutcome::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn feedme_is_fed_until_shutdown() {
        let store = MemoryStore::from_products(StoreLimits::default(), vec![product("A1")]);
        let ctx = context(store);
        let shutdown = ctx.shutdown.clone();
        let registry = ctx.registry.clone();
        let (mut client, server) = links("down.example");
        let task = tokio::spawn(serve_connection(server, ctx));

        let reply = call(
            &mut client,
            PROTOCOL_V6,
            1,
            Request::FeedMe {
                class: class(),
                primary: true,
            },
        )
        .await;
        let Reply::Ok(Ack::Session(id)) = reply else {
            panic!("expected a session, got {reply:?}");
        };
        assert!(registry.contains(id));

        let frame = client.recv().await.expect("recv").expect("product");
        match &frame.body {
            FrameBody::Call(Request::HereIs { product }) => assert_eq!(product.info.ident, "A1"),
            other => panic!("expected HEREIS, got {other:?}"),
        }
        client
            .send(Frame::reply(PROTOCOL_V6, frame.xid, Reply::ok()))
            .await
            .expect("ack");

        shutdown.cancel();
        assert_eq!(
            task.await.expect("task").expect("serve"),
            ServeOutcome::Fed(FeedOutcome::Cancelled)
        );
        assert!(!registry.contains(id));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_host_is_denied() {
        let (mut client, server) = links("stranger.example");
        let task = tokio::spawn(serve_connection(server, context(MemoryStore::default())));
        let reply = call(
            &mut client,
            PROTOCOL_V6,
            1,
            Request::FeedMe {
                class: class(),
                primary: false,
            },
        )
        .await;
        assert_eq!(reply, Reply::Denied);
        assert_eq!(task.await.expect("task").expect("serve"), ServeOutcome::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn broad_request_is_reclassified_then_served() {
        let (mut client, server) = links("down.example");
        let ctx = context(MemoryStore::default());
        let shutdown = ctx.shutdown.clone();
        let task = tokio::spawn(serve_connection(server, ctx));

        let reply = call(
            &mut client,
            PROTOCOL_V6,
            1,
            Request::NotifyMe {
                class: ProductClass::everything(),
            },
        )
        .await;
        let Reply::Reclassify(reduced) = reply else {
            panic!("expected reclassify, got {reply:?}");
        };
        assert_eq!(reduced.feedtype(), FT);

        let reply = call(&mut client, PROTOCOL_V6, 2, Request::NotifyMe { class: reduced }).await;
        assert!(matches!(reply, Reply::Ok(Ack::Session(_))));
        shutdown.cancel();
        assert!(matches!(
            task.await.expect("task").expect("serve"),
            ServeOutcome::Fed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn endless_reclassification_is_cut_off() {
        let config = NodeConfig {
            max_reclass_rounds: 2,
            ..NodeConfig::default()
        };
        let (mut client, server) = links("down.example");
        let task = tokio::spawn(serve_connection(server, context_with(MemoryStore::default(), config)));

        for xid in 1..=2 {
            let reply = call(
                &mut client,
                PROTOCOL_V6,
                xid,
                Request::NotifyMe {
                    class: ProductClass::everything(),
                },
            )
            .await;
            assert!(matches!(reply, Reply::Reclassify(_)), "round {xid}: {reply:?}");
        }
        let reply = call(
            &mut client,
            PROTOCOL_V6,
            3,
            Request::NotifyMe {
                class: ProductClass::everything(),
            },
        )
        .await;
        assert_eq!(reply, Reply::Denied);
        assert_eq!(task.await.expect("task").expect("serve"), ServeOutcome::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn offered_products_are_stored() {
        let store = MemoryStore::default();
        let (mut client, server) = links("down.example");
        let task = tokio::spawn(serve_connection(server, context(store.clone())));

        assert_eq!(
            call(&mut client, PROTOCOL_V6, 1, Request::Hiya { class: class() }).await,
            Reply::Ok(Ack::MaxHereis(u32::MAX))
        );
        let reply = call(
            &mut client,
            PROTOCOL_V6,
            2,
            Request::HereIs {
                product: product("B2"),
            },
        )
        .await;
        assert_eq!(reply, Reply::ok());
        client.close();
        assert_eq!(
            task.await.expect("task").expect("serve"),
            ServeOutcome::Received(ActivityOutcome::Reset)
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn data_before_negotiation_is_refused() {
        let (mut client, server) = links("down.example");
        let task = tokio::spawn(serve_connection(server, context(MemoryStore::default())));
        let reply = call(
            &mut client,
            PROTOCOL_V6,
            1,
            Request::HereIs {
                product: product("C3"),
            },
        )
        .await;
        assert_eq!(reply, Reply::Denied);
        assert_eq!(task.await.expect("task").expect("serve"), ServeOutcome::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (_client, server) = links("down.example");
        let outcome = serve_connection(server, context(MemoryStore::default()))
            .await
            .expect("serve");
        assert_eq!(outcome, ServeOutcome::TimedOut);
    }
}

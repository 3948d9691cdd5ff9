//! Downstream requester: asks an upstream for a subscription, receives
//! products, and reconnects until cancelled.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use feedline_codec::{Ack, Reply, Request, PROTOCOL_V6};
use feedline_core::{FeedtypeDb, ProductClass, ProductInfo, Timestamp};
use feedline_transport::{LinkError, PeerId, PeerLink, RpcClient, TcpLink};
use tracing::{debug, error, info, warn};

use crate::activity::{run_activity_loop, ActivityOutcome};
use crate::autoshift::AutoshiftController;
use crate::cancel::{sleep_unless_cancelled, CancelFlag};
use crate::config::NodeConfig;
use crate::downstream::Receiver;
use crate::error::{DenyReason, SessionError};
use crate::persistence::{load_product_info, save_product_info, saved_info_path};
use crate::requests::RequesterPlan;
use crate::store::ProductStore;
use crate::upstream::FeedMode;

/// Opens links to upstream servers.
pub trait Connector: Send + Sync {
    type Link: PeerLink + 'static;

    fn connect(&self, host: &str, port: u16) -> impl Future<Output = Result<Self::Link, LinkError>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    pub timeout: Duration,
}

impl Connector for TcpConnector {
    type Link = TcpLink;

    async fn connect(&self, host: &str, port: u16) -> Result<TcpLink, LinkError> {
        TcpLink::connect(host, port, self.timeout).await
    }
}

/// Checks a class the peer wants the caller to use instead.
pub(crate) fn check_reclass(peer: &PeerId, class: ProductClass) -> Result<ProductClass, SessionError> {
    if class.is_empty() {
        return Err(SessionError::AdmissionDenied {
            peer: peer.to_string(),
            reason: DenyReason::NotAllowed,
        });
    }
    if class.from.is_none() || class.to.is_none() {
        return Err(SessionError::AdmissionDenied {
            peer: peer.to_string(),
            reason: DenyReason::BadReclass,
        });
    }
    Ok(class)
}

/// Maps a refusal received during negotiation.
pub(crate) fn negotiation_error(peer: &PeerId, reply: Reply) -> SessionError {
    let peer = peer.to_string();
    match reply {
        Reply::BadPattern => SessionError::AdmissionDenied {
            peer,
            reason: DenyReason::BadPattern,
        },
        Reply::Denied => SessionError::AdmissionDenied {
            peer,
            reason: DenyReason::Refused,
        },
        Reply::VersionMismatch { low, high } => SessionError::VersionMismatch { peer, low, high },
        Reply::ShuttingDown => SessionError::ConnectionClosed { peer },
        _ => SessionError::ClientTransport {
            peer,
            source: LinkError::Unexpected("reply out of place during negotiation"),
        },
    }
}

/// Why one connection ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Autoshift asked for the other transfer mode.
    Switch,
    Cancelled,
}

/// One requester: a subscription to one upstream server.
pub struct Requester<C, S> {
    plan: RequesterPlan,
    mode: FeedMode,
    connector: C,
    store: S,
    config: NodeConfig,
    feedtypes: Arc<FeedtypeDb>,
    autoshift: AutoshiftController,
    is_primary: bool,
    last_info: Option<ProductInfo>,
    info_path: Option<PathBuf>,
}

impl<C: Connector, S: ProductStore> Requester<C, S> {
    pub fn new(plan: RequesterPlan, mode: FeedMode, connector: C, store: S, config: NodeConfig) -> Self {
        let autoshift = AutoshiftController::new(config.interval);
        let is_primary = plan.is_primary;
        Self {
            plan,
            mode,
            connector,
            store,
            config,
            feedtypes: Arc::new(FeedtypeDb::standard()),
            autoshift,
            is_primary,
            last_info: None,
            info_path: None,
        }
    }

    /// Vets received products against `feedtypes` instead of the standard table.
    pub fn with_feedtypes(mut self, feedtypes: Arc<FeedtypeDb>) -> Self {
        self.feedtypes = feedtypes;
        self
    }

    /// Resumes from, and records to, a per-subscription file in `dir`.
    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        let path = saved_info_path(dir, &self.plan.server, self.plan.port, &self.plan.class);
        match load_product_info(&path) {
            Ok(info) => self.last_info = info,
            Err(err) => warn!("Ignoring saved product info: {}", err),
        }
        self.info_path = Some(path);
        self
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn last_info(&self) -> Option<&ProductInfo> {
        self.last_info.as_ref()
    }

    fn remember(&mut self, info: ProductInfo) {
        if self.last_info.as_ref() == Some(&info) {
            return;
        }
        if let Some(path) = &self.info_path {
            if let Err(err) = save_product_info(path, &info) {
                warn!("Couldn't save product info: {}", err);
            }
        }
        self.last_info = Some(info);
    }

    /// Asks for `class`, following reclassifications, and returns the
    /// upstream session id with the class it accepted.
    async fn make_request<L: PeerLink>(
        &self,
        link: &mut L,
        rpc: &mut RpcClient,
        mut class: ProductClass,
        primary: bool,
    ) -> Result<(u32, ProductClass), SessionError> {
        let peer = link.peer().clone();
        for _ in 0..self.config.max_reclass_rounds.max(1) {
            let wanted = match (&self.last_info, rpc.version() >= PROTOCOL_V6) {
                (Some(info), true) => class.with_resume_token(&info.signature),
                _ => class.clone(),
            };
            let request = match self.mode {
                FeedMode::Feed => Request::FeedMe {
                    class: wanted,
                    primary,
                },
                FeedMode::Notify => Request::NotifyMe { class: wanted },
            };
            let reply = rpc
                .call(link, request)
                .await
                .map_err(|err| SessionError::from_link(&peer, err, self.config.rpc_timeout()))?;
            match reply {
                Reply::Ok(Ack::Session(id)) => return Ok((id, class)),
                Reply::Reclassify(reduced) => {
                    class = check_reclass(&peer, reduced)?;
                    info!("{} reclassified request to {}", peer, class);
                }
                other => return Err(negotiation_error(&peer, other)),
            }
        }
        Err(SessionError::AdmissionDenied {
            peer: peer.to_string(),
            reason: DenyReason::TooManyReclass,
        })
    }

    /// One connection: negotiate, then receive until it ends.
    pub async fn run_once(&mut self, shutdown: &CancelFlag) -> Result<SessionEnd, SessionError> {
        let label = format!("{}:{}", self.plan.server, self.plan.port);
        let mut link = self
            .connector
            .connect(&self.plan.server, self.plan.port)
            .await
            .map_err(|source| SessionError::ClientTransport {
                peer: label.clone(),
                source,
            })?;
        let peer = link.peer().clone();

        let mut class = self.plan.class.clone();
        class.vet_from(Timestamp::now(), self.config.max_latency);
        let versions = self.config.request_versions().to_vec();
        let mut negotiated = None;
        for (index, &version) in versions.iter().enumerate() {
            let mut rpc = RpcClient::new(version).with_timeout(self.config.rpc_timeout());
            match self.make_request(&mut link, &mut rpc, class.clone(), self.is_primary).await {
                Ok((id, accepted)) => {
                    negotiated = Some((version, id, accepted));
                    break;
                }
                Err(SessionError::VersionMismatch { .. }) if index + 1 < versions.len() => {
                    info!(
                        "{} doesn't speak protocol version {}; trying {}",
                        peer,
                        version,
                        versions[index + 1]
                    );
                }
                Err(err) => return Err(err),
            }
        }
        let Some((version, id, accepted)) = negotiated else {
            return Err(SessionError::System("no protocol versions configured".into()));
        };

        let primary = self.is_primary || version < PROTOCOL_V6;
        info!(
            "Connected to {} as {} (session {}, version {}): {}",
            peer,
            if primary { "primary" } else { "alternate" },
            id,
            version,
            accepted
        );
        let managed = version >= PROTOCOL_V6 && self.mode == FeedMode::Feed;
        if managed {
            self.autoshift.init(self.is_primary);
        }

        let inactive_timeout = self.config.inactive_timeout;
        let writer = self.store.open_writer()?;
        let mut receiver = Receiver::new(peer.to_string(), writer, accepted, self.config.max_latency)
            .with_feedtypes(Arc::clone(&self.feedtypes));
        if managed {
            receiver = receiver.with_autoshift(&mut self.autoshift);
        }
        let outcome = run_activity_loop(&mut link, inactive_timeout, &[shutdown], &mut receiver).await;
        let last = receiver.last_info().cloned();
        let stats = receiver.stats();
        drop(receiver);
        debug!("Session with {} ended: {:?}, link {:?}", peer, stats, link.health());
        if let Some(info) = last {
            self.remember(info);
        }

        match outcome? {
            ActivityOutcome::SwitchRequested => Ok(SessionEnd::Switch),
            ActivityOutcome::Cancelled => Ok(SessionEnd::Cancelled),
            ActivityOutcome::TimedOut => Err(SessionError::TimedOut {
                peer: peer.to_string(),
                after: inactive_timeout,
            }),
            ActivityOutcome::Reset => Err(SessionError::ConnectionClosed {
                peer: peer.to_string(),
            }),
        }
    }

    /// Reconnect loop. Returns `Ok` when cancelled and `Err` when the
    /// subscription was refused or the process must stop.
    pub async fn run(mut self, shutdown: CancelFlag) -> Result<(), SessionError> {
        self.autoshift
            .set_peer_count(self.plan.feed_count.max(1))
            .map_err(|err| SessionError::System(err.to_string()))?;
        let backoff = self.config.interval * 2;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match self.run_once(&shutdown).await {
                Ok(SessionEnd::Switch) => {
                    self.is_primary = !self.is_primary;
                    info!(
                        "Switching {}:{} to {} transfer mode",
                        self.plan.server,
                        self.plan.port,
                        if self.is_primary { "primary" } else { "alternate" }
                    );
                }
                Ok(SessionEnd::Cancelled) => return Ok(()),
                Err(err) if err.is_process_fatal() => {
                    error!("{}", err);
                    return Err(err);
                }
                Err(err @ SessionError::AdmissionDenied { .. }) => {
                    warn!("{}; does the request overlap another?", err);
                    return Err(err);
                }
                Err(err) => {
                    if err.is_routine() {
                        info!("{}", err);
                    } else {
                        warn!("{}", err);
                    }
                    if err.should_backoff() && !sleep_unless_cancelled(backoff, &[&shutdown]).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}

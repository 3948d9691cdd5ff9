//! Receiving side of a data session.

use std::sync::Arc;
use std::time::Duration;

use feedline_codec::{Reply, Request};
use feedline_core::{FeedtypeDb, Product, ProductClass, ProductInfo, Signature, Timestamp};
use feedline_transport::PeerId;
use tracing::{debug, info, warn};

use crate::acl::AccessControl;
use crate::activity::Dispatcher;
use crate::autoshift::AutoshiftController;
use crate::config::NodeConfig;
use crate::error::SessionError;
use crate::store::{InsertOutcome, ProductWriter};

/// Decision on a HIYA offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferAdmission {
    /// Send `class`; products up to `max_hereis` bytes as single messages.
    Accepted { class: ProductClass, max_hereis: u32 },
    Reclassify(ProductClass),
    BadPattern,
    Denied,
}

/// Reduces what `peer` offers to what the accept rules take.
pub fn admit_offer(
    acl: &AccessControl,
    peer: &PeerId,
    offered: &ProductClass,
    config: &NodeConfig,
) -> OfferAdmission {
    if !acl.is_host_allowed(peer) {
        warn!("Denying offer from unknown host {}", peer);
        return OfferAdmission::Denied;
    }
    if offered.invalid_pattern().is_some() {
        warn!("Bad pattern in offer from {}: {}", peer, offered);
        return OfferAdmission::BadPattern;
    }
    let accepted = acl.reduce_to_acceptable(peer, offered);
    if accepted.class.is_empty() {
        warn!("Denying offer from {}: nothing in {} is accepted", peer, offered);
        return OfferAdmission::Denied;
    }
    if accepted.class != *offered {
        info!("Reclassifying offer from {}: {} -> {}", peer, offered, accepted.class);
        return OfferAdmission::Reclassify(accepted.class);
    }
    let max_hereis = if accepted.is_primary {
        u32::MAX
    } else {
        config.max_hereis_bytes
    };
    OfferAdmission::Accepted {
        class: accepted.class,
        max_hereis,
    }
}

/// Running totals for one receiving session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub stored: u64,
    pub duplicates: u64,
    pub unwanted: u64,
    pub restarts: u64,
    pub notifications: u64,
}

#[derive(Debug)]
struct Pending {
    info: ProductInfo,
    data: Vec<u8>,
}

/// Vets, reassembles and stores products sent by an upstream.
pub struct Receiver<'a, W> {
    peer: String,
    writer: W,
    class: ProductClass,
    max_latency: Duration,
    feedtypes: Arc<FeedtypeDb>,
    autoshift: Option<&'a mut AutoshiftController>,
    pending: Option<Pending>,
    last_info: Option<ProductInfo>,
    stats: ReceiverStats,
}

impl<'a, W: ProductWriter> Receiver<'a, W> {
    pub fn new(peer: impl Into<String>, writer: W, class: ProductClass, max_latency: Duration) -> Self {
        Self {
            peer: peer.into(),
            writer,
            class,
            max_latency,
            feedtypes: Arc::new(FeedtypeDb::standard()),
            autoshift: None,
            pending: None,
            last_info: None,
            stats: ReceiverStats::default(),
        }
    }

    /// Vets feedtypes through `feedtypes` instead of the standard table.
    pub fn with_feedtypes(mut self, feedtypes: Arc<FeedtypeDb>) -> Self {
        self.feedtypes = feedtypes;
        self
    }

    /// Feeds accept/reject outcomes to `autoshift`.
    pub fn with_autoshift(mut self, autoshift: &'a mut AutoshiftController) -> Self {
        self.autoshift = Some(autoshift);
        self
    }

    /// Newest product received, stored or already present.
    pub fn last_info(&self) -> Option<&ProductInfo> {
        self.last_info.as_ref()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    fn vet(&self, info: &ProductInfo) -> Result<(), &'static str> {
        let earliest = Timestamp::now()
            .saturating_sub(self.max_latency)
            .max(self.class.from);
        if info.arrival < earliest {
            return Err("too-old");
        }
        if !self.class.matches_in(&self.feedtypes, info) {
            return Err("unrequested");
        }
        Ok(())
    }

    fn record(&mut self, accepted: bool) {
        if let Some(autoshift) = self.autoshift.as_deref_mut() {
            autoshift.record_outcome(accepted);
        }
    }

    fn store(&mut self, product: Product) -> Result<Reply, SessionError> {
        let info = product.info.clone();
        match self.writer.insert(product)? {
            InsertOutcome::Inserted => {
                debug!("Stored {}", info);
                self.record(true);
                self.stats.stored += 1;
                self.last_info = Some(info);
                Ok(Reply::ok())
            }
            InsertOutcome::Duplicate => {
                debug!("Duplicate {}", info);
                self.record(false);
                self.stats.duplicates += 1;
                self.last_info = Some(info);
                Ok(Reply::DontSend)
            }
            InsertOutcome::TooBig => {
                warn!("Product too big for store: {}", info);
                Ok(Reply::DontSend)
            }
        }
    }

    fn unwanted(&mut self, reason: &str, info: &ProductInfo) -> Reply {
        debug!("Ignoring {} product {}", reason, info);
        self.stats.unwanted += 1;
        Reply::DontSend
    }

    fn here_is(&mut self, product: Product) -> Result<Reply, SessionError> {
        if let Err(reason) = self.vet(&product.info) {
            return Ok(self.unwanted(reason, &product.info));
        }
        if !product.is_consistent() {
            warn!("Discarding corrupt product from {}: {}", self.peer, product.info);
            return Ok(Reply::DontSend);
        }
        self.store(product)
    }

    fn coming_soon(&mut self, info: ProductInfo) -> Result<Reply, SessionError> {
        if let Some(old) = self.pending.take() {
            warn!(
                "Discarding incomplete product from {} ({} of {} bytes): {}",
                self.peer,
                old.data.len(),
                old.info.size,
                old.info
            );
        }
        if let Err(reason) = self.vet(&info) {
            return Ok(self.unwanted(reason, &info));
        }
        if self.writer.contains(&info.signature)? {
            debug!("Duplicate {}", info);
            self.record(false);
            self.stats.duplicates += 1;
            self.last_info = Some(info);
            return Ok(Reply::DontSend);
        }
        if info.size > self.writer.max_product_size() {
            warn!("Product too big for store: {}", info);
            return Ok(Reply::DontSend);
        }
        if info.size == 0 {
            self.store(Product {
                info,
                data: Vec::new(),
            })?;
            return Ok(Reply::ok());
        }
        let capacity = info.size as usize;
        self.pending = Some(Pending {
            info,
            data: Vec::with_capacity(capacity),
        });
        Ok(Reply::ok())
    }

    fn block(&mut self, signature: Signature, offset: u32, data: Vec<u8>) -> Result<Reply, SessionError> {
        let Some(pending) = self.pending.as_mut() else {
            debug!("Unannounced chunk from {} for {}", self.peer, signature);
            return Ok(Reply::DontSend);
        };
        if pending.info.signature != signature {
            debug!("Chunk from {} for unannounced {}", self.peer, signature);
            return Ok(Reply::DontSend);
        }
        let received = pending.data.len();
        let remaining = pending.info.size as usize - received;
        if offset as usize != received || data.len() > remaining {
            warn!(
                "Bad chunk from {} at offset {} ({} bytes) for {}; restarting",
                self.peer,
                offset,
                data.len(),
                pending.info
            );
            pending.data.clear();
            self.stats.restarts += 1;
            return Ok(Reply::Restart);
        }
        pending.data.extend_from_slice(&data);
        if pending.data.len() < pending.info.size as usize {
            return Ok(Reply::ok());
        }
        if Signature::of(&pending.data) != pending.info.signature {
            warn!("Signature mismatch from {} for {}; restarting", self.peer, pending.info);
            pending.data.clear();
            self.stats.restarts += 1;
            return Ok(Reply::Restart);
        }
        let Some(Pending { info, data }) = self.pending.take() else {
            return Ok(Reply::ok());
        };
        self.store(Product { info, data })?;
        Ok(Reply::ok())
    }

    fn notification(&mut self, info: ProductInfo) -> Reply {
        if let Err(reason) = self.vet(&info) {
            return self.unwanted(reason, &info);
        }
        info!("{}", info);
        self.stats.notifications += 1;
        self.last_info = Some(info);
        Reply::ok()
    }

    /// Handles one call from the upstream.
    pub fn handle(&mut self, request: Request) -> Result<Reply, SessionError> {
        match request {
            Request::NullProc => Ok(Reply::ok()),
            Request::HereIs { product } => self.here_is(product),
            Request::ComingSoon { info, .. } => self.coming_soon(info),
            Request::BlkData {
                signature,
                offset,
                data,
            } => self.block(signature, offset, data),
            Request::Notification { info } => Ok(self.notification(info)),
            other => {
                warn!("Unexpected {} from upstream {}", other.name(), self.peer);
                Ok(Reply::Denied)
            }
        }
    }
}

impl<W: ProductWriter> Dispatcher for Receiver<'_, W> {
    fn dispatch(&mut self, request: Request) -> Result<Reply, SessionError> {
        self.handle(request)
    }

    fn should_switch(&self) -> bool {
        self.autoshift
            .as_deref()
            .is_some_and(AutoshiftController::should_switch)
    }
}

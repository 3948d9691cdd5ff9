//! Pushing side of a HIYA session: offer a class to a downstream node and
//! send what it accepts from the local store.

use feedline_codec::{Ack, Reply, Request, PROTOCOL_V6};
use feedline_core::ProductClass;
use feedline_transport::{PeerLink, RpcClient};
use tracing::info;

use crate::cancel::CancelFlag;
use crate::config::NodeConfig;
use crate::error::{DenyReason, SessionError};
use crate::requester::{check_reclass, negotiation_error};
use crate::store::{NextProduct, ProductReader, ProductStore};
use crate::upstream::{Deliverer, Delivery, FeedMode};

/// Totals for one offer session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferSummary {
    pub sent: u64,
    pub declined: u64,
}

/// Offers `class` and returns the class the peer accepted with its
/// single-message size limit.
pub async fn negotiate_offer<L: PeerLink>(
    link: &mut L,
    rpc: &mut RpcClient,
    mut class: ProductClass,
    config: &NodeConfig,
) -> Result<(ProductClass, u32), SessionError> {
    let peer = link.peer().clone();
    for _ in 0..config.max_reclass_rounds.max(1) {
        let reply = rpc
            .call(link, Request::Hiya { class: class.clone() })
            .await
            .map_err(|err| SessionError::from_link(&peer, err, config.rpc_timeout()))?;
        match reply {
            Reply::Ok(Ack::MaxHereis(max_hereis)) => return Ok((class, max_hereis)),
            Reply::Reclassify(reduced) => {
                class = check_reclass(&peer, reduced)?;
                info!("{} accepts only {}", peer, class);
            }
            other => return Err(negotiation_error(&peer, other)),
        }
    }
    Err(SessionError::AdmissionDenied {
        peer: peer.to_string(),
        reason: DenyReason::TooManyReclass,
    })
}

/// Offers `class` to the peer and sends every matching stored product
/// once. Stops at the end of the store.
pub async fn offer_products<L, S>(
    link: &mut L,
    store: &S,
    class: ProductClass,
    config: &NodeConfig,
    shutdown: &CancelFlag,
) -> Result<OfferSummary, SessionError>
where
    L: PeerLink,
    S: ProductStore,
{
    let version = config.request_versions().first().copied().unwrap_or(PROTOCOL_V6);
    let mut rpc = RpcClient::new(version).with_timeout(config.rpc_timeout());
    let (mut class, max_hereis) = negotiate_offer(link, &mut rpc, class, config).await?;
    let deliverer = Deliverer {
        mode: FeedMode::Feed,
        max_hereis,
        chunk_size: config.chunk_size.max(1),
        max_restarts: config.max_restarts,
        two_phase: version >= PROTOCOL_V6,
        rpc_timeout: config.rpc_timeout(),
    };

    let mut reader = store.open_reader()?;
    reader.set_cursor_from_class(&class)?;
    let mut summary = OfferSummary::default();
    while !shutdown.is_cancelled() {
        let NextProduct::Product(product) = reader.next_matching(&class)? else {
            break;
        };
        match deliverer.deliver(link, &mut rpc, &product).await? {
            Delivery::Sent => summary.sent += 1,
            Delivery::Declined => summary.declined += 1,
            Delivery::Reclassified(reduced) if reduced.is_empty() => break,
            Delivery::Reclassified(reduced) => class = reduced,
        }
    }
    info!(
        "Offered {} products to {}; {} declined",
        summary.sent + summary.declined,
        link.peer(),
        summary.declined
    );
    Ok(summary)
}

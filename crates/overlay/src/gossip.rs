use std::{collections::HashMap, sync::Arc};

use portal_api::{
    types::{
        distance::{Metric, XorMetric},
        enr::Enr,
        portal_wire::{PopulatedOffer, Request, MAX_CONTENT_KEYS_PER_OFFER},
    },
    utils::bytes::hex_encode_compact,
    OverlayContentKey, RawContentKey, RawContentValue,
};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::{
    overlay::{
        command::OverlayCommand,
        request::{OverlayRequest, RequestDirection},
    },
    stream::StreamController,
    types::{kbucket::SharedRoutingTable, node::Node},
};

/// The number of peers offered each piece of locally inserted content.
pub const NUM_GOSSIP_PEERS: usize = 4;

/// Offers content to the closest peers whose advertised radius covers it. Usable across
/// threads, without `&self`. Returns the number of peers any content was offered to.
pub fn propagate_gossip_cross_thread<TContentKey: OverlayContentKey>(
    content: Vec<(TContentKey, RawContentValue)>,
    kbuckets: &SharedRoutingTable,
    command_tx: mpsc::UnboundedSender<OverlayCommand<TContentKey>>,
    stream_controller: Option<Arc<StreamController>>,
) -> usize {
    // Precalculate content ids
    let content = content
        .into_iter()
        .map(|(content_key, content_value)| {
            (content_key.content_id(), (content_key, content_value))
        })
        .collect::<HashMap<_, _>>();

    debug!(
        ids = ?content.keys().map(hex_encode_compact).collect::<Vec<_>>(),
        "propagating content",
    );

    // Map from ENRs to the content they are interested in.
    let mut enrs_and_content: HashMap<Enr, Vec<&(TContentKey, RawContentValue)>> = HashMap::new();
    for (content_id, content_key_value) in &content {
        let interested = kbuckets.interested_in(content_id);
        if interested.is_empty() {
            debug!(
                content.id = %hex_encode_compact(content_id),
                "No peers eligible for neighborhood gossip"
            );
            continue;
        }

        // Select gossip recipients
        for enr in select_gossip_recipients(content_id, interested) {
            enrs_and_content
                .entry(enr)
                .or_default()
                .push(content_key_value);
        }
    }

    let num_propagated_peers = enrs_and_content.len();

    // Create and send OFFER overlay request to the interested nodes
    for (enr, mut interested_content) in enrs_and_content {
        let permit = match stream_controller {
            Some(ref stream_controller) => match stream_controller.get_outbound_semaphore() {
                Some(permit) => Some(permit),
                None => {
                    trace!("Permit for gossip not acquired! Skipping offering to enr: {enr}");
                    continue;
                }
            },
            None => None,
        };

        // offer messages are limited to 64 content keys
        if interested_content.len() > MAX_CONTENT_KEYS_PER_OFFER {
            warn!(
                enr = %enr,
                content.len = interested_content.len(),
                "Too many content items to offer to a single peer, dropping {}.",
                interested_content.len() - MAX_CONTENT_KEYS_PER_OFFER
            );
            // sort content keys by distance to the node
            interested_content.sort_by_cached_key(|(key, _)| {
                XorMetric::distance(&key.content_id(), &enr.node_id().raw())
            });
            // take the closest content keys
            interested_content.truncate(MAX_CONTENT_KEYS_PER_OFFER);
        }
        // change content keys to raw content keys
        let interested_content: Vec<(RawContentKey, RawContentValue)> = interested_content
            .into_iter()
            .map(|(key, value)| (key.to_bytes(), value.clone()))
            .collect();
        let offer_request = Request::PopulatedOffer(PopulatedOffer {
            content_items: interested_content,
        });

        let overlay_request = OverlayRequest::new(
            offer_request,
            RequestDirection::Outgoing { destination: enr },
            None,
            None,
            permit,
        );

        if let Err(err) = command_tx.send(OverlayCommand::Request(overlay_request)) {
            error!(error = %err, "Error sending OFFER message to service")
        }
    }

    num_propagated_peers
}

/// Selects gossip recipients from a vec of interested nodes: the `NUM_GOSSIP_PEERS` closest to
/// the content id.
fn select_gossip_recipients(content_id: &[u8; 32], mut interested: Vec<Node>) -> Vec<Enr> {
    interested.sort_by_cached_key(|node| {
        XorMetric::distance(content_id, &node.enr.node_id().raw())
    });
    interested
        .into_iter()
        .take(NUM_GOSSIP_PEERS)
        .map(|node| node.enr)
        .collect()
}

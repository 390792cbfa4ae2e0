use discv5::enr::NodeId;
use portal_api::{
    types::{
        distance::Distance,
        enr::Enr,
        portal_wire::{CustomPayload, FindNodes, Ping, Pong, Request},
    },
    OverlayContentKey,
};
use portal_storage::ContentStore;
use tracing::{trace, warn};

use super::OverlayService;
use crate::{
    overlay::{
        command::OverlayCommand,
        request::{OverlayRequest, RequestDirection},
    },
    types::node::Node,
};

impl<TContentKey, TStore> OverlayService<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
    TStore: ContentStore<Key = TContentKey> + Send + 'static,
{
    /// Builds a `Pong` response for a `Ping` request, advertising the local radius.
    pub(super) fn handle_ping(&self, request: Ping, source: &NodeId) -> Pong {
        trace!(
            request.source = %source,
            "Handling Ping message {request}",
        );

        Pong {
            enr_seq: self.local_enr().seq(),
            custom_payload: CustomPayload::from_radius(self.data_radius()),
        }
    }

    /// Processes a ping request from some source node, after the pong went out.
    ///
    /// The peer's advertised radius is recorded, and a higher advertised ENR sequence number
    /// triggers a request for its fresh record.
    pub(super) fn process_ping(&mut self, ping: Ping, source: NodeId) {
        // If the node is in the routing table, then check if we need to update the node.
        if let Some(node) = self.kbuckets.entry(source) {
            if node.enr().seq() < ping.enr_seq {
                self.request_node(&node.enr());
            }

            match Distance::try_from(&ping.custom_payload) {
                Ok(radius) => {
                    if node.data_radius() != radius {
                        self.kbuckets.update_radius(source, radius);
                    }
                }
                Err(_) => {
                    warn!(
                        request.source = %source,
                        "Failed to decode radius payload from ping",
                    );
                }
            }
        }
    }

    /// Processes a Pong response.
    ///
    /// Refreshes the node's advertised radius. If the ENR sequence number of the pong is
    /// greater than the sequence number for the routing table entry, then request the node.
    pub(super) fn process_pong(&mut self, pong: Pong, source: Enr) {
        let node_id = source.node_id();
        trace!(
            response.source = %node_id,
            "Processing Pong message {pong}"
        );

        if let Some(node) = self.kbuckets.entry(node_id) {
            if node.enr().seq() < pong.enr_seq {
                self.request_node(&node.enr());
            }

            match Distance::try_from(&pong.custom_payload) {
                Ok(radius) => {
                    if node.data_radius() != radius {
                        self.kbuckets.update_radius(node_id, radius);
                    }
                }
                Err(_) => {
                    warn!(
                        response.source = %node_id,
                        "Failed to decode radius payload from pong",
                    );
                }
            }
        }
    }

    /// Submits a request to ping a destination (target) node.
    ///
    /// At most one liveness ping per peer is in flight at a time.
    pub(super) fn ping_node(&mut self, node: Node) {
        let node_id = node.enr.node_id();
        if !self.inflight_pings.insert(node_id) {
            return;
        }
        trace!(
            request.dest = %node_id,
            "Sending Ping message",
        );

        let ping = Request::Ping(Ping {
            enr_seq: self.local_enr().seq(),
            custom_payload: CustomPayload::from_radius(self.data_radius()),
        });
        let request = OverlayRequest::new(
            ping,
            RequestDirection::Outgoing {
                destination: node.enr,
            },
            None,
            None,
            None,
        );
        let _ = self.command_tx.send(OverlayCommand::Request(request));
    }

    /// Submits a request for the node info of a destination (target) node.
    pub(super) fn request_node(&self, destination: &Enr) {
        let find_nodes = Request::FindNodes(FindNodes { distances: vec![0] });
        let request = OverlayRequest::new(
            find_nodes,
            RequestDirection::Outgoing {
                destination: destination.clone(),
            },
            None,
            None,
            None,
        );
        let _ = self.command_tx.send(OverlayCommand::Request(request));
    }
}

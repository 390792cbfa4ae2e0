use discv5::enr::NodeId;
use futures::channel::oneshot;
use portal_api::{
    types::{
        distance::{Metric, XorMetric},
        enr::Enr,
        portal_wire::{Content, FindContent, FindNodes, Request},
    },
    OverlayContentKey, RawContentValue,
};
use smallvec::SmallVec;

use crate::overlay::errors::OverlayRequestError;

/// Information about a query.
#[derive(Debug)]
pub struct QueryInfo<TContentKey> {
    /// What we are querying and why.
    pub query_type: QueryType<TContentKey>,

    /// Temporary ENRs used when trying to reach nodes.
    pub untrusted_enrs: SmallVec<[Enr; 16]>,
}

/// The result of a recursive content lookup: the value and whether it arrived over a stream.
/// An `OverlayRequestError` means the content wasn't found on the network.
pub type RecursiveFindContentResult = Result<(RawContentValue, bool), OverlayRequestError>;

/// The result of a single FINDCONTENT request: the response and whether its payload arrived
/// over a stream. `Content` rather than a bare value, to account for the possibility of
/// returning ENRs.
pub type FindContentResult = (Content, bool);

/// Additional information about the query.
#[derive(Debug)]
pub enum QueryType<TContentKey> {
    /// The user requested a `FIND_NODE` query to be performed.
    FindNode {
        /// The target node.
        target: NodeId,

        /// A callback channel for the result of the query.
        callback: Option<oneshot::Sender<Vec<Enr>>>,

        /// The number of distances we request for each peer.
        distances_to_request: usize,
    },
    /// The user requested a `FIND_CONTENT` query to be performed.
    FindContent {
        /// The target content.
        target: TContentKey,

        /// A callback channel for the result of the query.
        callback: oneshot::Sender<RecursiveFindContentResult>,
    },
}

impl<TContentKey: OverlayContentKey> QueryInfo<TContentKey> {
    /// Builds an RPC request for the given peer, given the QueryInfo.
    pub(crate) fn rpc_request(&self, peer: NodeId) -> Result<Request, &'static str> {
        let request = match self.query_type {
            QueryType::FindNode {
                target,
                distances_to_request,
                ..
            } => {
                let distances = findnode_log2distance(target, peer, distances_to_request)
                    .ok_or("Requested a node find itself")?;
                Request::FindNodes(FindNodes { distances })
            }
            QueryType::FindContent { ref target, .. } => Request::FindContent(FindContent {
                content_key: target.to_bytes(),
            }),
        };

        Ok(request)
    }

    /// The point in the key space the query iterates towards.
    pub fn target_node_id(&self) -> NodeId {
        match self.query_type {
            QueryType::FindNode { ref target, .. } => *target,
            QueryType::FindContent { ref target, .. } => NodeId::new(&target.content_id()),
        }
    }

    /// Returns true when the query issuer has gone away and the result has nowhere to go.
    pub fn is_cancelled(&self) -> bool {
        match &self.query_type {
            QueryType::FindNode { callback, .. } => callback
                .as_ref()
                .map(|callback| callback.is_canceled())
                .unwrap_or(false),
            QueryType::FindContent { callback, .. } => callback.is_canceled(),
        }
    }
}

/// Calculates the log2 distances for a FINDNODES request to a destination peer, given a target
/// and the number of distances to request.
///
/// The result straddles the exact peer-to-target distance. As an example, if the target has a
/// distance of 12 from the remote peer, the sequence of distances that are sent for increasing
/// sizes would be [12, 13, 11, 14, 10, ..].
fn findnode_log2distance(target: NodeId, peer: NodeId, size: usize) -> Option<Vec<u16>> {
    if size > 127 {
        // invoke and endless loop - coding error
        panic!("Iterations cannot be greater than 127");
    }

    let distance_u64 = XorMetric::distance(&target.raw(), &peer.raw()).log2()?;
    let distance: u16 = distance_u64 as u16;

    let mut result_list = vec![distance];
    let mut difference = 1;
    while result_list.len() < size {
        if distance + difference <= 256 {
            result_list.push(distance + difference);
        }
        if result_list.len() < size {
            if let Some(d) = distance.checked_sub(difference) {
                result_list.push(d);
            }
        }
        difference += 1;
    }
    Some(result_list[..size].to_vec())
}

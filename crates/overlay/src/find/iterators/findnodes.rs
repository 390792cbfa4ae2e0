// Copyright 2018 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

// This basis of this file has been taken from the rust-libp2p codebase:
// https://github.com/libp2p/rust-libp2p

use std::{
    collections::btree_map::{BTreeMap, Entry},
    time::Instant,
};

use discv5::enr::NodeId;
use portal_api::types::distance::{Distance, Metric, XorMetric};

use super::query::{Query, QueryConfig, QueryPeer, QueryPeerState, QueryProgress, QueryState};

/// An iterative query for the nodes closest to a target.
///
/// The result is the set of closest responsive peers, in ascending distance from the target.
#[derive(Debug, Clone)]
pub struct FindNodeQuery {
    /// The target key we are looking for.
    target: NodeId,

    /// The instant when the query started.
    started: Option<Instant>,

    /// The current state of progress of the query.
    progress: QueryProgress,

    /// The closest peers to the target, ordered by increasing distance.
    closest_peers: BTreeMap<Distance, QueryPeer>,

    /// The number of peers for which the query is currently waiting for results.
    num_waiting: usize,

    /// The configuration of the query.
    config: QueryConfig,
}

impl Query for FindNodeQuery {
    type Response = Vec<NodeId>;
    type Result = Vec<NodeId>;

    fn target(&self) -> NodeId {
        self.target
    }

    fn started(&self) -> Option<Instant> {
        self.started
    }

    fn start(&mut self, start: Instant) {
        self.started = Some(start);
    }

    fn on_success(&mut self, peer: &NodeId, closer_peers: Self::Response) {
        if let QueryProgress::Finished = self.progress {
            return;
        }

        let distance = self.distance_to(peer);

        // Mark the peer's progress.
        match self.closest_peers.entry(distance) {
            Entry::Vacant(..) => return,
            Entry::Occupied(mut entry) => match entry.get().state() {
                QueryPeerState::Waiting(..) => {
                    debug_assert!(
                        self.num_waiting > 0,
                        "Query (on success) reached invalid number of waiting peers"
                    );
                    self.num_waiting -= 1;
                    entry.get_mut().set_state(QueryPeerState::Succeeded);
                }
                QueryPeerState::Unresponsive => {
                    entry.get_mut().set_state(QueryPeerState::Succeeded);
                }
                QueryPeerState::NotContacted
                | QueryPeerState::Failed
                | QueryPeerState::Succeeded => return,
            },
        }

        // Incorporate the reported closer peers into the query.
        let mut progress = false;
        let num_closest = self.closest_peers.len();

        for closer_peer in closer_peers {
            let distance = self.distance_to(&closer_peer);
            let closer_peer = QueryPeer::new(closer_peer, QueryPeerState::NotContacted);
            self.closest_peers.entry(distance).or_insert(closer_peer);

            // The query makes progress if the new peer is either closer to the target than any
            // peer seen so far (i.e. is the first entry), or the query did not yet accumulate
            // enough closest peers.
            progress = self.closest_peers.keys().next() == Some(&distance)
                || num_closest < self.config.num_results;
        }

        self.progress = match self.progress {
            QueryProgress::Iterating { no_progress } => {
                let no_progress = if progress { 0 } else { no_progress + 1 };
                if no_progress >= self.config.parallelism {
                    QueryProgress::Stalled
                } else {
                    QueryProgress::Iterating { no_progress }
                }
            }
            QueryProgress::Stalled => {
                if progress {
                    QueryProgress::Iterating { no_progress: 0 }
                } else {
                    QueryProgress::Stalled
                }
            }
            QueryProgress::Finished => QueryProgress::Finished,
        };
    }

    fn on_failure(&mut self, peer: &NodeId) {
        if let QueryProgress::Finished = self.progress {
            return;
        }

        let distance = self.distance_to(peer);

        match self.closest_peers.entry(distance) {
            Entry::Vacant(_) => {}
            Entry::Occupied(mut entry) => match entry.get().state() {
                QueryPeerState::Waiting(..) => {
                    debug_assert!(
                        self.num_waiting > 0,
                        "Query (on failure) reached invalid number of waiting peers"
                    );
                    self.num_waiting -= 1;
                    entry.get_mut().set_state(QueryPeerState::Failed);
                }
                QueryPeerState::Unresponsive => entry.get_mut().set_state(QueryPeerState::Failed),
                _ => {}
            },
        }
    }

    fn poll(&mut self, now: Instant) -> QueryState {
        if let QueryProgress::Finished = self.progress {
            return QueryState::Finished;
        }

        // Count the number of peers that returned a result. If there is a request in progress
        // to one of the `num_results` closest peers, the counter is set to `None` as the query
        // can only finish once `num_results` closest peers have responded (or there are no more
        // peers to contact, see `num_waiting`).
        let mut result_counter = Some(0);

        // Check if the query is at capacity w.r.t. the allowed parallelism.
        let at_capacity = self.at_capacity();

        for peer in self.closest_peers.values_mut() {
            match peer.state() {
                QueryPeerState::NotContacted => {
                    // This peer is waiting to be reiterated.
                    if !at_capacity {
                        let timeout = now + self.config.peer_timeout;
                        peer.set_state(QueryPeerState::Waiting(timeout));
                        self.num_waiting += 1;
                        return QueryState::Waiting(Some(*peer.node_id()));
                    } else {
                        return QueryState::WaitingAtCapacity;
                    }
                }

                QueryPeerState::Waiting(timeout) => {
                    if now >= *timeout {
                        // Peers that don't respond within timeout are set to `Unresponsive`.
                        debug_assert!(
                            self.num_waiting > 0,
                            "Query (poll) reached invalid number of waiting peers"
                        );
                        self.num_waiting -= 1;
                        peer.set_state(QueryPeerState::Unresponsive);
                    } else if at_capacity {
                        // The query is still waiting for a result from a peer and is at
                        // capacity w.r.t. the maximum number of peers being waited on.
                        return QueryState::WaitingAtCapacity;
                    } else {
                        // The query is still waiting for a result from a peer and the
                        // `result_counter` did not yet reach `num_results`. Therefore the query
                        // is not yet done, regardless of already successful queries to peers
                        // farther from the target.
                        result_counter = None;
                    }
                }

                QueryPeerState::Succeeded => {
                    if let Some(ref mut count) = result_counter {
                        *count += 1;
                        // If `num_results` successful results have been delivered for the
                        // closest peers, the query is done.
                        if *count >= self.config.num_results {
                            self.progress = QueryProgress::Finished;
                            return QueryState::Finished;
                        }
                    }
                }

                QueryPeerState::Failed | QueryPeerState::Unresponsive => {
                    // Skip over unresponsive or failed peers.
                }
            }
        }

        if self.num_waiting > 0 {
            // The query is still waiting for results and not at capacity w.r.t. the allowed
            // parallelism, but there are no new peers to contact at the moment.
            QueryState::Waiting(None)
        } else {
            // The query is finished because all available peers have been contacted and the
            // query is not waiting for any more results.
            self.progress = QueryProgress::Finished;
            QueryState::Finished
        }
    }

    fn into_result(self) -> Self::Result {
        self.closest_peers
            .into_values()
            .filter_map(|peer| {
                if let QueryPeerState::Succeeded = peer.state() {
                    Some(*peer.node_id())
                } else {
                    None
                }
            })
            .take(self.config.num_results)
            .collect()
    }
}

impl FindNodeQuery {
    /// Creates a new query with the given configuration.
    pub fn with_config<I>(config: QueryConfig, target: NodeId, known_closest_peers: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        // Initialise the closest peers to begin the query with.
        let closest_peers = known_closest_peers
            .into_iter()
            .map(|node_id| {
                let distance = XorMetric::distance(&target.raw(), &node_id.raw());
                let state = QueryPeerState::NotContacted;
                (distance, QueryPeer::new(node_id, state))
            })
            .take(config.num_results)
            .collect();

        // The query initially makes progress by iterating towards the target.
        let progress = QueryProgress::Iterating { no_progress: 0 };

        Self {
            target,
            started: None,
            progress,
            closest_peers,
            num_waiting: 0,
            config,
        }
    }

    fn distance_to(&self, peer: &NodeId) -> Distance {
        XorMetric::distance(&self.target.raw(), &peer.raw())
    }

    /// Checks if the query is at capacity w.r.t. the permitted parallelism.
    ///
    /// While the query is stalled, up to `num_results` parallel requests are allowed. This is a
    /// slightly more permissive variant of the requirement that the initiator "resends the
    /// FIND_NODE to all of the k closest nodes it has not already queried".
    fn at_capacity(&self) -> bool {
        match self.progress {
            QueryProgress::Stalled => self.num_waiting >= self.config.num_results,
            QueryProgress::Iterating { .. } => self.num_waiting >= self.config.parallelism,
            QueryProgress::Finished => true,
        }
    }
}

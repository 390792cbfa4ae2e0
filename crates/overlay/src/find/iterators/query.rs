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

// The query/peer state machine derives from the rust-libp2p codebase:
// https://github.com/libp2p/rust-libp2p

use std::time::{Duration, Instant};

use discv5::enr::NodeId;

/// Parameters shared by every iterative query.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// The `α` parameter from the Kademlia paper: the number of peers a query may be waiting
    /// on in parallel while it iterates towards the target.
    pub parallelism: usize,

    /// How many of the closest peers must deliver a result before the query terminates. The
    /// Kademlia paper sets this to K, the bucket capacity.
    pub num_results: usize,

    /// How long a contacted peer may stay silent before it is treated as unresponsive. An
    /// unresponsive peer stops counting towards termination, unless it answers after all.
    pub peer_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            parallelism: 3,
            num_results: 16,
            peer_timeout: Duration::from_secs(2),
        }
    }
}

/// An iterative query over peers ordered by XOR distance to a target.
///
/// The concrete iterator decides what a peer's response contributes and what the query
/// ultimately produces. The pool only drives `poll` and feeds request outcomes back in through
/// `on_success` and `on_failure`; reply arrival order carries no meaning, results must merge
/// commutatively.
pub trait Query {
    /// The type of the response to a request issued for the query.
    type Response;

    /// The type of the result produced by the query.
    type Result;

    /// Returns the target of the query.
    fn target(&self) -> NodeId;

    /// Returns the instant when the query started, or `None` if it has not started.
    fn started(&self) -> Option<Instant>;

    /// Marks the query as started as of the instant `start`.
    fn start(&mut self, start: Instant);

    /// Records a failed request to a peer the query is waiting on.
    ///
    /// Has no effect if the query already finished, is not waiting on `peer`, or has already
    /// recorded an outcome for `peer`. Eventually follow up with `poll` to advance the query.
    fn on_failure(&mut self, peer: &NodeId);

    /// Delivers the response from a peer the query is waiting on.
    ///
    /// Has no effect if the query already finished, is not waiting on `peer`, or has already
    /// recorded an outcome for `peer`. Eventually follow up with `poll` to advance the query.
    fn on_success(&mut self, peer: &NodeId, peer_response: Self::Response);

    /// Advances the state of the query, potentially yielding a new peer to contact.
    fn poll(&mut self, now: Instant) -> QueryState;

    /// Consumes the query, returning the result.
    fn into_result(self) -> Self::Result;
}

/// What a single [`Query::poll`] asks of its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    /// The query is waiting for results. `Some(peer)` names a peer to contact next, on top of
    /// any peers already being waited on; `None` means no new peer is available even though
    /// the parallelism limit is not yet reached.
    Waiting(Option<NodeId>),

    /// The query is waiting for results with as many requests in flight as the parallelism
    /// permits.
    WaitingAtCapacity,

    /// The query finished.
    Finished,
}

/// Overall progress of a query.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum QueryProgress {
    /// The query is iterating towards the `num_results` peers closest to the target, waiting
    /// on at most `parallelism` of them at a time.
    ///
    /// > **Note**: When the query switches back to `Iterating` after being `Stalled`, it may
    /// > temporarily be waiting for more than `parallelism` results from peers, with new peers
    /// > only being considered once the number of pending results drops below `parallelism`.
    Iterating {
        /// The number of consecutive results that did not yield a peer closer to the target.
        /// When this number reaches `parallelism` and no new peer was discovered or at least
        /// `num_results` peers are known to the query, it is considered `Stalled`.
        no_progress: usize,
    },

    /// `parallelism` consecutive results arrived without bringing the query closer to the
    /// target.
    ///
    /// While stalled, the parallelism cap is raised to `num_results` in an attempt to finish
    /// the query: every known unqueried peer may be contacted. A result that makes progress
    /// again returns the query to `Iterating`; otherwise it runs out and finishes.
    Stalled,

    /// The query is finished: either `num_results` of the closest peers delivered results
    /// (failed and unresponsive peers not counting), or no contactable peers remain.
    Finished,
}

/// One peer as seen by a query.
#[derive(Debug, Clone)]
pub struct QueryPeer {
    /// The node id used to identify the peer.
    node_id: NodeId,

    /// The current query state of this peer.
    state: QueryPeerState,
}

impl QueryPeer {
    /// Constructs a new `QueryPeer` whose initial state is `state`.
    pub fn new(node_id: NodeId, state: QueryPeerState) -> Self {
        QueryPeer { node_id, state }
    }

    /// Returns the node id associated with the query peer.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Returns the state of the query peer.
    pub fn state(&self) -> &QueryPeerState {
        &self.state
    }

    /// Sets the state of the query peer to `state`.
    pub fn set_state(&mut self, state: QueryPeerState) {
        self.state = state;
    }
}

/// The state of a [`QueryPeer`] in the context of a query.
#[derive(Debug, Copy, Clone)]
pub enum QueryPeerState {
    /// The starting state of every peer known to, or discovered by, a query.
    NotContacted,

    /// The query is waiting for a result from the peer, until the recorded deadline.
    Waiting(Instant),

    /// The peer did not answer within `peer_timeout`. It no longer holds up the termination
    /// conditions of the query, but a late result is still taken.
    Unresponsive,

    /// Obtaining a result from the peer has failed. Final, reached through `on_failure`.
    Failed,

    /// The peer delivered a result. Final, reached through `on_success`.
    Succeeded,
}

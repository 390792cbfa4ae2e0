// Copyright 2019 Parity Technologies (UK) Ltd.
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

// The pool/query split derives from the rust-libp2p codebase:
// https://github.com/libp2p/rust-libp2p

use std::time::{Duration, Instant};

use discv5::enr::NodeId;
use fnv::FnvHashMap;
use portal_api::OverlayContentKey;

use super::{
    iterators::query::{Query, QueryState},
    query_info::QueryInfo,
};

/// Unique identifier for an active query.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct QueryId(pub usize);

impl std::ops::Deref for QueryId {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Drives a set of queries and surfaces, one at a time, whatever they need next: a request to
/// send, a finished result, or an expired deadline.
///
/// Queries leave the pool when they finish or time out, taking all of their per-peer state
/// with them; afterwards a late response for the query simply finds nothing to advance.
pub struct QueryPool<TQuery, TContentKey> {
    next_id: QueryId,
    query_timeout: Duration,
    queries: FnvHashMap<QueryId, (QueryInfo<TContentKey>, TQuery)>,
}

/// The observable states emitted by [`QueryPool::poll`].
#[allow(clippy::type_complexity)]
pub enum QueryPoolState<'a, TQuery, TContentKey> {
    /// There are no queries to process.
    Idle,
    /// At least one query is waiting for results. `Some(request)` names a peer some query
    /// wants contacted on its behalf.
    Waiting(
        Option<(
            QueryId,
            &'a mut QueryInfo<TContentKey>,
            &'a mut TQuery,
            NodeId,
        )>,
    ),
    /// A query has finished.
    Finished(QueryId, QueryInfo<TContentKey>, TQuery),
    /// A query has exceeded the pool deadline.
    Timeout(QueryId, QueryInfo<TContentKey>, TQuery),
}

/// What `poll` decided to do with a query, recorded by id so the borrow on the pool can be
/// re-taken in the shape the variant needs.
enum PollDecision {
    Waiting(QueryId, NodeId),
    Finished(QueryId),
    Timeout(QueryId),
}

impl<TQuery, TContentKey> QueryPool<TQuery, TContentKey>
where
    TQuery: Query,
    TContentKey: OverlayContentKey,
{
    /// Creates a new `QueryPool` with the given per-query deadline.
    pub fn new(query_timeout: Duration) -> Self {
        QueryPool {
            next_id: QueryId(0),
            query_timeout,
            queries: Default::default(),
        }
    }

    /// Returns an iterator over the queries in the pool.
    pub fn iter(&self) -> impl Iterator<Item = &(QueryInfo<TContentKey>, TQuery)> {
        self.queries.values()
    }

    /// Adds a query to the pool.
    pub fn add_query(&mut self, query_info: QueryInfo<TContentKey>, query: TQuery) -> QueryId {
        let id = self.next_id;
        self.next_id = QueryId(self.next_id.wrapping_add(1));
        self.queries.insert(id, (query_info, query));
        id
    }

    /// Returns a mutable reference to a query with the given ID, if it is in the pool.
    pub fn get_mut(&mut self, id: QueryId) -> Option<&mut (QueryInfo<TContentKey>, TQuery)> {
        self.queries.get_mut(&id)
    }

    /// Removes a query from the pool, dropping all of its per-peer state.
    pub fn remove(&mut self, id: QueryId) -> Option<(QueryInfo<TContentKey>, TQuery)> {
        self.queries.remove(&id)
    }

    /// Polls the pool to advance the queries.
    pub fn poll(&mut self) -> QueryPoolState<'_, TQuery, TContentKey> {
        let now = Instant::now();
        let mut decision = None;

        for (&query_id, (_, query)) in self.queries.iter_mut() {
            if query.started().is_none() {
                query.start(now);
            }
            match query.poll(now) {
                QueryState::Finished => {
                    decision = Some(PollDecision::Finished(query_id));
                    break;
                }
                QueryState::Waiting(Some(return_peer)) => {
                    decision = Some(PollDecision::Waiting(query_id, return_peer));
                    break;
                }
                QueryState::Waiting(None) | QueryState::WaitingAtCapacity => {
                    let elapsed = now - query.started().unwrap_or(now);
                    if elapsed >= self.query_timeout {
                        decision = Some(PollDecision::Timeout(query_id));
                        break;
                    }
                }
            }
        }

        match decision {
            Some(PollDecision::Waiting(query_id, return_peer)) => {
                let (query_info, query) = self
                    .queries
                    .get_mut(&query_id)
                    .expect("decided query is in the pool");
                QueryPoolState::Waiting(Some((query_id, query_info, query, return_peer)))
            }
            Some(PollDecision::Finished(query_id)) => {
                let (query_info, query) = self
                    .queries
                    .remove(&query_id)
                    .expect("decided query is in the pool");
                QueryPoolState::Finished(query_id, query_info, query)
            }
            Some(PollDecision::Timeout(query_id)) => {
                let (query_info, query) = self
                    .queries
                    .remove(&query_id)
                    .expect("decided query is in the pool");
                QueryPoolState::Timeout(query_id, query_info, query)
            }
            None if self.queries.is_empty() => QueryPoolState::Idle,
            None => QueryPoolState::Waiting(None),
        }
    }
}

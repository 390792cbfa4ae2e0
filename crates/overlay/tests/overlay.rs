use std::{collections::HashMap, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use discv5::enr::{CombinedKey, NodeId};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use portal_api::{
    types::{
        distance::Distance,
        enr::Enr,
        portal_wire::{Content, Message, OfferTrace},
        protocol_versions::{ProtocolVersion, ProtocolVersionList, ENR_PROTOCOL_VERSION_KEY},
    },
    IdentityContentKey, OverlayContentKey,
};
use portal_overlay::{
    overlay::{config::OverlayConfig, protocol::OverlayProtocol},
    transport::{ConnectionId, ContentStream, RequestTransport, StreamTransport, TransportError},
};
use portal_storage::{ContentStore, MemoryContentStore};
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};

type TestStore = MemoryContentStore<IdentityContentKey>;
type TestOverlay = OverlayProtocol<IdentityContentKey, TestStore>;

type RequestHandler =
    Arc<dyn Fn(NodeId, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, TransportError>> + Send + Sync>;

/// An in-memory network: request frames are routed to the destination's overlay, streams are
/// matched up by connection id.
#[derive(Default)]
struct Network {
    handlers: RwLock<HashMap<NodeId, RequestHandler>>,
    enrs: RwLock<HashMap<NodeId, Enr>>,
    latencies: RwLock<HashMap<NodeId, Duration>>,
    pending_streams: Mutex<HashMap<(NodeId, u16), ChannelStream>>,
}

impl Network {
    fn register_enr(&self, enr: Enr) {
        self.enrs.write().insert(enr.node_id(), enr);
    }

    fn register_handler(&self, node_id: NodeId, handler: RequestHandler) {
        self.handlers.write().insert(node_id, handler);
    }

    /// Delays every request served by the given node.
    fn set_latency(&self, node_id: NodeId, latency: Duration) {
        self.latencies.write().insert(node_id, latency);
    }
}

struct ChannelStream {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

fn stream_pair() -> (ChannelStream, ChannelStream) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        ChannelStream {
            tx: Some(a_tx),
            rx: a_rx,
        },
        ChannelStream {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

#[async_trait]
impl ContentStream for ChannelStream {
    async fn read_to_eof(&mut self) -> io::Result<Vec<u8>> {
        let mut data = vec![];
        while let Some(chunk) = self.rx.recv().await {
            data.extend(chunk);
        }
        Ok(data)
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"))?;
        tx.send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// One node's view of the in-memory network.
struct NodeTransport {
    enr: Enr,
    network: Arc<Network>,
}

#[async_trait]
impl RequestTransport for NodeTransport {
    fn local_enr(&self) -> Enr {
        self.enr.clone()
    }

    fn cached_enr(&self, node_id: &NodeId) -> Option<Enr> {
        self.network.enrs.read().get(node_id).cloned()
    }

    async fn send_request(
        &self,
        destination: &Enr,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let destination_id = destination.node_id();
        let handler = self
            .network
            .handlers
            .read()
            .get(&destination_id)
            .cloned()
            .ok_or_else(|| TransportError::Failure("unknown destination".to_string()))?;
        let latency = self.network.latencies.read().get(&destination_id).copied();
        if let Some(latency) = latency {
            sleep(latency).await;
        }
        handler(self.enr.node_id(), payload).await
    }
}

#[async_trait]
impl StreamTransport for NodeTransport {
    async fn connect_with_cid(
        &self,
        cid: ConnectionId,
        peer: Enr,
    ) -> io::Result<Box<dyn ContentStream>> {
        // The acceptor registers under its own recv id, which equals our send id.
        let key = (peer.node_id(), cid.send);
        for _ in 0..200 {
            if let Some(stream) = self.network.pending_streams.lock().remove(&key) {
                return Ok(Box::new(stream));
            }
            sleep(Duration::from_millis(10)).await;
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "no stream acceptor appeared",
        ))
    }

    async fn accept_with_cid(
        &self,
        cid: ConnectionId,
        _peer: Enr,
    ) -> io::Result<Box<dyn ContentStream>> {
        let (ours, theirs) = stream_pair();
        self.network
            .pending_streams
            .lock()
            .insert((self.enr.node_id(), cid.recv), theirs);
        Ok(Box::new(ours))
    }
}

fn build_enr() -> (CombinedKey, Enr) {
    let key = CombinedKey::generate_secp256k1();
    let mut builder = Enr::builder();
    builder.add_value(
        ENR_PROTOCOL_VERSION_KEY,
        &ProtocolVersionList::new(vec![ProtocolVersion::V0, ProtocolVersion::V1]),
    );
    let enr = builder.build(&key).expect("valid test record");
    (key, enr)
}

struct TestNode {
    overlay: Arc<TestOverlay>,
    enr: Enr,
}

fn spawn_node(network: &Arc<Network>) -> TestNode {
    let (_key, enr) = build_enr();
    network.register_enr(enr.clone());

    let transport = Arc::new(NodeTransport {
        enr: enr.clone(),
        network: Arc::clone(network),
    });
    let store = Arc::new(Mutex::new(TestStore::new(enr.node_id())));

    let overlay: Arc<TestOverlay> = Arc::new(OverlayProtocol::new(
        OverlayConfig::default(),
        transport.clone(),
        transport,
        store,
    ));

    // Route inbound request frames into the overlay.
    let handler_overlay = Arc::clone(&overlay);
    let handler: RequestHandler = Arc::new(move |source, payload| {
        let overlay = Arc::clone(&handler_overlay);
        Box::pin(async move {
            match overlay.process_one_request(source, payload).await {
                Ok(response) => Ok(Message::from(response).into()),
                Err(err) => Err(TransportError::Failure(err.to_string())),
            }
        })
    });
    network.register_handler(enr.node_id(), handler);

    TestNode { overlay, enr }
}

/// Polls `predicate` until it holds or the deadline passes.
async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached before deadline");
}

// Basic routing table management according to messages exchanged between multiple nodes.
//
// Polls between steps to give time to background routing table processes.
#[test_log::test(tokio::test)]
async fn overlay() {
    let network = Arc::new(Network::default());

    let node_one = spawn_node(&network);
    let node_two = spawn_node(&network);
    let node_three = spawn_node(&network);

    // All routing tables are empty.
    assert!(node_one.overlay.table_entries_enr().is_empty());
    assert!(node_two.overlay.table_entries_enr().is_empty());
    assert!(node_three.overlay.table_entries_enr().is_empty());

    // Ping node two from node one.
    // Node two should be in node one's routing table.
    match node_one.overlay.send_ping(node_two.enr.clone()).await {
        Ok(pong) => {
            assert_eq!(node_two.enr.seq(), pong.enr_seq);
            let radius = Distance::try_from(&pong.custom_payload).unwrap();
            assert_eq!(radius, Distance::MAX);
        }
        Err(err) => panic!("Unable to respond to ping: {err}"),
    }
    wait_until(|| node_one.overlay.table_entries_enr().contains(&node_two.enr)).await;

    // Send find nodes from node one to node three for node three's ENR.
    match node_one
        .overlay
        .send_find_nodes(node_three.enr.clone(), vec![0])
        .await
    {
        Ok(nodes) => {
            assert_eq!(1, nodes.total);
            assert_eq!(1, nodes.enrs.len());
            assert_eq!(node_three.enr, nodes.enrs[0].0);
        }
        Err(err) => panic!("Unable to respond to find nodes: {err}"),
    }
    wait_until(|| node_one.overlay.table_entries_enr().contains(&node_three.enr)).await;

    // Send find nodes from node three to node one for all distances.
    // The response should contain node two. Node one should be added to node three's table
    // because it is the destination of the request, and node two because it was discovered.
    let distances = (1..257).collect();
    match node_three
        .overlay
        .send_find_nodes(node_one.enr.clone(), distances)
        .await
    {
        Ok(nodes) => {
            assert_eq!(1, nodes.total);
            // The requester itself is filtered out of the response.
            assert_eq!(1, nodes.enrs.len());
            assert!(nodes.enrs.iter().any(|enr| enr.0 == node_two.enr));
        }
        Err(err) => panic!("Unable to respond to find nodes: {err}"),
    }
    wait_until(|| {
        let peers = node_three.overlay.table_entries_enr();
        peers.contains(&node_one.enr) && peers.contains(&node_two.enr)
    })
    .await;

    // Send find content from node two to node one for an absent content id.
    // The response should be a list of closer ENRs, excluding the requester.
    let content_key = IdentityContentKey::new([0u8; 32]);
    match node_two
        .overlay
        .send_find_content(node_one.enr.clone(), content_key.to_bytes())
        .await
    {
        Ok((content, utp_transfer)) => match content {
            Content::Enrs(enrs) => {
                assert!(!utp_transfer);
                assert!(!enrs.is_empty());
                assert!(enrs.iter().all(|enr| enr.0 != node_two.enr));
            }
            other => panic!("Unexpected response to find content: {other:?}"),
        },
        Err(err) => panic!("Unable to respond to find content: {err}"),
    }
    wait_until(|| node_two.overlay.table_entries_enr().contains(&node_one.enr)).await;
}

#[test_log::test(tokio::test)]
async fn recursive_content_lookup() {
    let network = Arc::new(Network::default());

    let node_one = spawn_node(&network);
    let node_two = spawn_node(&network);
    let node_three = spawn_node(&network);

    // Wire the topology: node one knows node two, node two knows node three.
    node_one
        .overlay
        .send_ping(node_two.enr.clone())
        .await
        .unwrap();
    node_two
        .overlay
        .send_ping(node_three.enr.clone())
        .await
        .unwrap();
    wait_until(|| node_one.overlay.table_entries_enr().contains(&node_two.enr)).await;
    wait_until(|| node_two.overlay.table_entries_enr().contains(&node_three.enr)).await;

    // Only node three holds the content. Node one has to traverse node two to find it.
    let content_key = IdentityContentKey::new([0xef; 32]);
    let content = vec![0xef; 32];
    node_three
        .overlay
        .store
        .lock()
        .put(content_key.clone(), &content)
        .expect("Unable to store content");

    let (found_content, utp_transfer) = node_one
        .overlay
        .lookup_content(content_key)
        .await
        .expect("content lookup should succeed");
    assert_eq!(found_content, content);
    assert!(!utp_transfer);
}

#[test_log::test(tokio::test)]
async fn offer_accept_and_transfer() {
    let network = Arc::new(Network::default());

    let node_one = spawn_node(&network);
    let node_two = spawn_node(&network);

    // Node one learns about node two.
    node_one
        .overlay
        .send_ping(node_two.enr.clone())
        .await
        .unwrap();

    let content_key = IdentityContentKey::random();
    let content = vec![0xab; 4000];

    let trace = node_one
        .overlay
        .send_offer_with_result(node_two.enr.clone(), content_key.to_bytes(), content.clone())
        .await
        .expect("offer should produce a result");
    match trace {
        OfferTrace::Success(codes) => {
            assert_eq!(codes.accepted_indices(), vec![0]);
        }
        other => panic!("Unexpected offer outcome: {other:?}"),
    }

    // The accepted value lands in node two's store once the stream completes.
    let overlay_two = Arc::clone(&node_two.overlay);
    let key = content_key.clone();
    wait_until(move || overlay_two.store.lock().get(&key).unwrap().is_some()).await;

    // A repeated offer of the same key is declined as already stored.
    let trace = node_one
        .overlay
        .send_offer_with_result(node_two.enr.clone(), content_key.to_bytes(), content)
        .await
        .expect("offer should produce a result");
    assert!(matches!(trace, OfferTrace::Declined));
}

#[test_log::test(tokio::test)]
async fn lookup_pokes_closest_peer_that_missed_the_content() {
    let network = Arc::new(Network::default());

    let node_one = spawn_node(&network);
    let node_two = spawn_node(&network);
    let node_three = spawn_node(&network);

    // Node one knows both peers; only node three holds the content. Node two answers the
    // lookup with ENRs, marking it as a peer that went looking without the content.
    node_one
        .overlay
        .send_ping(node_two.enr.clone())
        .await
        .unwrap();
    node_one
        .overlay
        .send_ping(node_three.enr.clone())
        .await
        .unwrap();
    node_two
        .overlay
        .send_ping(node_three.enr.clone())
        .await
        .unwrap();

    let content_key = IdentityContentKey::random();
    let content = vec![0xcd; 64];
    node_three
        .overlay
        .store
        .lock()
        .put(content_key.clone(), &content)
        .expect("Unable to store content");

    // Slow down the content holder so node two's ENR answer is recorded before the content
    // response ends the query.
    network.set_latency(node_three.enr.node_id(), Duration::from_millis(200));

    let (found_content, _) = node_one
        .overlay
        .lookup_content(content_key.clone())
        .await
        .expect("content lookup should succeed");
    assert_eq!(found_content, content);

    // Node two is the closest peer that missed the content; the lookup re-advertises to it.
    let overlay_two = Arc::clone(&node_two.overlay);
    wait_until(move || overlay_two.store.lock().get(&content_key).unwrap().is_some()).await;
}

#[test_log::test(tokio::test)]
async fn large_content_moves_over_a_stream() {
    let network = Arc::new(Network::default());

    let node_one = spawn_node(&network);
    let node_two = spawn_node(&network);

    node_one
        .overlay
        .send_ping(node_two.enr.clone())
        .await
        .unwrap();

    // Larger than a single response frame: served via connection id + stream.
    let content_key = IdentityContentKey::random();
    let content = vec![0x5a; 64 * 1024];
    node_two
        .overlay
        .store
        .lock()
        .put(content_key.clone(), &content)
        .expect("Unable to store content");

    let (response, utp_transfer) = node_one
        .overlay
        .send_find_content(node_two.enr.clone(), content_key.to_bytes())
        .await
        .expect("find content should succeed");
    assert!(utp_transfer);
    match response {
        Content::Content(found) => assert_eq!(found, content),
        other => panic!("Unexpected find content response: {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn put_content_gossips_to_neighborhood() {
    let network = Arc::new(Network::default());

    let node_one = spawn_node(&network);
    let node_two = spawn_node(&network);

    node_one
        .overlay
        .send_ping(node_two.enr.clone())
        .await
        .unwrap();
    wait_until(|| node_one.overlay.table_entries_enr().contains(&node_two.enr)).await;

    let content_key = IdentityContentKey::random();
    let content = vec![0x11; 256];

    let info = node_one
        .overlay
        .put_content(content_key.clone(), content.clone());
    assert!(info.stored_locally);
    assert_eq!(info.peer_count, 1);

    // The offered value arrives in node two's store via OFFER/ACCEPT and the stream.
    let overlay_two = Arc::clone(&node_two.overlay);
    wait_until(move || overlay_two.store.lock().get(&content_key).unwrap().is_some()).await;
}

#[test_log::test(tokio::test)]
async fn lookup_of_missing_content_reports_not_found() {
    let network = Arc::new(Network::default());

    let node_one = spawn_node(&network);
    let node_two = spawn_node(&network);

    node_one
        .overlay
        .send_ping(node_two.enr.clone())
        .await
        .unwrap();

    let result = timeout(
        Duration::from_secs(15),
        node_one.overlay.lookup_content(IdentityContentKey::random()),
    )
    .await
    .expect("lookup should resolve before the deadline");
    assert!(result.is_err());
}

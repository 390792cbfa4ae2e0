use std::sync::Arc;

use anyhow::anyhow;
use discv5::enr::NodeId;
use parking_lot::{Mutex, RwLock};
use portal_api::{
    types::{
        accept_code::{AcceptCode, AcceptCodeList},
        enr::Enr,
        portal_wire::{Accept, Offer, OfferTrace, Request},
        protocol_versions::ProtocolVersion,
    },
    OverlayContentKey, RawContentKey, RawContentValue,
};
use portal_storage::{ContentStore, ShouldWeStoreContent};
use tokio::sync::{mpsc::UnboundedSender, OwnedSemaphorePermit};
use tracing::{debug, error, trace, warn};

use super::OverlayService;
use crate::{
    accept_queue::TransferringKeys,
    gossip::propagate_gossip_cross_thread,
    overlay::{command::OverlayCommand, errors::OverlayRequestError},
    stream::StreamController,
    transport::ConnectionId,
    types::kbucket::SharedRoutingTable,
    utils::portal_wire::{decode_content_payload, encode_content_payload},
    versions::VersionsCache,
};

/// The pieces of the service that spawned transfer tasks need, without `&self`.
pub(crate) struct TransferProcessing<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
{
    pub store: Arc<Mutex<TStore>>,
    pub kbuckets: SharedRoutingTable,
    pub command_tx: UnboundedSender<OverlayCommand<TContentKey>>,
    pub stream_controller: Arc<StreamController>,
    pub transferring_keys: Arc<RwLock<TransferringKeys<TContentKey>>>,
    pub versions: Arc<VersionsCache>,
    pub disable_poke: bool,
}

impl<TContentKey, TStore> Clone for TransferProcessing<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            kbuckets: self.kbuckets.clone(),
            command_tx: self.command_tx.clone(),
            stream_controller: Arc::clone(&self.stream_controller),
            transferring_keys: Arc::clone(&self.transferring_keys),
            versions: Arc::clone(&self.versions),
            disable_poke: self.disable_poke,
        }
    }
}

impl<TContentKey, TStore> From<&OverlayService<TContentKey, TStore>>
    for TransferProcessing<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
{
    fn from(service: &OverlayService<TContentKey, TStore>) -> Self {
        Self {
            store: Arc::clone(&service.store),
            kbuckets: service.kbuckets.clone(),
            command_tx: service.command_tx.clone(),
            stream_controller: Arc::clone(&service.stream_controller),
            transferring_keys: Arc::clone(&service.transferring_keys),
            versions: Arc::clone(&service.versions),
            disable_poke: service.disable_poke,
        }
    }
}

/// Decides the fate of each offered key, in offer order and independently.
///
/// The first matching condition wins: outside the local radius, already present in the store,
/// already inbound on another stream, otherwise accepted. Accepted keys are claimed in the
/// transferring set before the decision list is returned, so an ACCEPT never advertises a key
/// the node is not prepared to receive.
pub(crate) fn filter_content_keys<TContentKey, TStore>(
    store: &Mutex<TStore>,
    transferring_keys: &RwLock<TransferringKeys<TContentKey>>,
    content_keys: &[TContentKey],
    source: &Enr,
) -> Result<(AcceptCodeList, Vec<TContentKey>), OverlayRequestError>
where
    TContentKey: OverlayContentKey,
    TStore: ContentStore<Key = TContentKey>,
{
    let mut accept_codes = AcceptCodeList::new(content_keys.len()).map_err(|err| {
        OverlayRequestError::AcceptError(format!("Unable to initialize accept code list: {err:?}"))
    })?;
    let mut accepted_keys = Vec::new();

    for (index, content_key) in content_keys.iter().enumerate() {
        let decision = store.lock().should_we_store(content_key).map_err(|err| {
            OverlayRequestError::AcceptError(format!("Unable to check content availability {err}"))
        })?;
        let code = match decision {
            ShouldWeStoreContent::NotWithinRadius => AcceptCode::NotWithinRadius,
            ShouldWeStoreContent::AlreadyStored => AcceptCode::AlreadyStored,
            ShouldWeStoreContent::Store => {
                if transferring_keys.write().try_claim(content_key, source) {
                    accepted_keys.push(content_key.clone());
                    AcceptCode::Accepted
                } else {
                    AcceptCode::InboundTransferInProgress
                }
            }
        };
        accept_codes.set(index, code);
    }

    Ok((accept_codes, accepted_keys))
}

impl<TContentKey, TStore> OverlayService<TContentKey, TStore>
where
    TContentKey: OverlayContentKey,
    TStore: ContentStore<Key = TContentKey> + Send + 'static,
{
    /// Attempts to build an `Accept` response for an `Offer` request.
    pub(super) fn handle_offer(
        &mut self,
        request: Offer,
        source: &NodeId,
    ) -> Result<Accept, OverlayRequestError> {
        trace!(
            request.source = %source,
            "Handling Offer message",
        );

        // The ENR is required for version negotiation and for the transfer bookkeeping.
        let enr = self.find_enr(source).ok_or_else(|| {
            OverlayRequestError::AcceptError(
                "handle_offer: unable to find ENR for NodeId".to_string(),
            )
        })?;
        let version = self.versions.highest_common(&enr)?;

        // Rate limits come before any key inspection. The whole offer is turned down when the
        // peer's token bucket or the global transfer cap is exhausted; at protocol version 0
        // this is indistinguishable on the wire from plain disinterest.
        let permit = if self.offer_rate_limiter.try_acquire(*source) {
            self.stream_controller.get_inbound_semaphore()
        } else {
            None
        };
        let Some(permit) = permit else {
            let mut accept_codes =
                AcceptCodeList::new(request.content_keys.len()).map_err(|err| {
                    OverlayRequestError::AcceptError(format!(
                        "Unable to initialize accept code list: {err:?}"
                    ))
                })?;
            for index in 0..request.content_keys.len() {
                accept_codes.set(index, AcceptCode::RateLimited);
            }
            return Ok(Accept {
                connection_id: 0,
                content_keys: encode_accept_codes(&accept_codes, version)?,
            });
        };

        // A single malformed key rejects the whole offer.
        let content_keys: Vec<TContentKey> = request
            .content_keys
            .iter()
            .map(TContentKey::try_from_bytes)
            .collect::<anyhow::Result<Vec<TContentKey>>>()
            .map_err(|_| {
                OverlayRequestError::AcceptError(
                    "Unable to build content key from OFFER request".to_owned(),
                )
            })?;

        let (accept_codes, accepted_keys) = filter_content_keys(
            &self.store,
            &self.transferring_keys,
            &content_keys,
            &enr,
        )?;

        // Do not set up a stream if nothing was accepted.
        if accept_codes.all_declined() {
            drop(permit);
            return Ok(Accept {
                connection_id: 0,
                content_keys: encode_accept_codes(&accept_codes, version)?,
            });
        }

        let cid = self.stream_controller.cid();
        let cid_send = cid.send;

        trace!(
            request.source = %source,
            cid.send = cid.send,
            cid.recv = cid.recv,
            accepted = accepted_keys.len(),
            "Content keys handled by offer",
        );

        let processing = TransferProcessing::from(&*self);
        tokio::spawn(async move {
            Self::receive_offered_content(processing, cid, enr, accepted_keys, permit).await;
        });

        Ok(Accept {
            connection_id: cid_send.to_be(),
            content_keys: encode_accept_codes(&accept_codes, version)?,
        })
    }

    /// Reads the payload of an accepted offer off its stream and stores the values.
    ///
    /// On any transfer or framing failure, each accepted key falls back to a FINDCONTENT
    /// request towards a peer that also offered it, if one is known.
    async fn receive_offered_content(
        processing: TransferProcessing<TContentKey, TStore>,
        cid: ConnectionId,
        enr: Enr,
        accepted_keys: Vec<TContentKey>,
        permit: OwnedSemaphorePermit,
    ) {
        let data = match processing
            .stream_controller
            .accept_inbound_stream(cid, enr)
            .await
        {
            Ok(data) => data,
            Err(err) => {
                debug!(%err, cid.send, cid.recv, "unable to complete offered content transfer");
                Self::fallback_accepted_keys(&processing, accepted_keys).await;
                drop(permit);
                return;
            }
        };

        // Each value carries a varint length prefix; the accepted key count bounds the payload.
        let content_values = match decode_content_payload(data) {
            Ok(values) if values.len() == accepted_keys.len() => values,
            Ok(values) => {
                debug!(
                    expected = accepted_keys.len(),
                    got = values.len(),
                    "Offered content payload item count mismatch"
                );
                Self::fallback_accepted_keys(&processing, accepted_keys).await;
                drop(permit);
                return;
            }
            Err(err) => {
                debug!(%err, "Unable to decode offered content payload");
                Self::fallback_accepted_keys(&processing, accepted_keys).await;
                drop(permit);
                return;
            }
        };

        let mut stored: Vec<(TContentKey, RawContentValue)> = Vec::new();
        for (content_key, value) in accepted_keys.iter().zip(content_values) {
            let should_store = matches!(
                processing.store.lock().should_we_store(content_key),
                Ok(ShouldWeStoreContent::Store)
            );
            if should_store {
                match processing.store.lock().put(content_key.clone(), &value) {
                    Ok(dropped_content) => {
                        stored.push((content_key.clone(), value.to_vec()));
                        if !dropped_content.is_empty() {
                            debug!(
                                count = dropped_content.len(),
                                "Dropped content while storing, propagating it back into the network",
                            );
                            stored.extend(dropped_content);
                        }
                    }
                    Err(err) => warn!(
                        error = %err,
                        content.key = %content_key,
                        "Error storing accepted content"
                    ),
                }
            }
            // The transfer of this key is complete either way.
            processing.transferring_keys.write().remove_key(content_key);
        }

        if !stored.is_empty() {
            propagate_gossip_cross_thread(
                stored,
                &processing.kbuckets,
                processing.command_tx.clone(),
                Some(Arc::clone(&processing.stream_controller)),
            );
        }
        drop(permit);
    }

    async fn fallback_accepted_keys(
        processing: &TransferProcessing<TContentKey, TStore>,
        accepted_keys: Vec<TContentKey>,
    ) {
        for content_key in accepted_keys {
            if let Err(err) =
                Self::fallback_find_content(content_key, processing.clone()).await
            {
                debug!(%err, "Fallback content fetch failed");
            }
        }
    }

    /// Processes an ACCEPT response to one of our offers: opens the stream and pushes the
    /// accepted values.
    pub(super) fn process_accept(
        &mut self,
        response: Accept,
        enr: Enr,
        offer: Request,
        request_permit: Option<OwnedSemaphorePermit>,
    ) -> anyhow::Result<()> {
        // Check that a valid triggering request was sent.
        let mut offer_result_tx = None;
        match &offer {
            Request::Offer(_) | Request::PopulatedOffer(_) => {}
            Request::PopulatedOfferWithResult(req) => {
                offer_result_tx = Some(req.result_tx.clone())
            }
            _ => {
                return Err(anyhow!("Invalid request message paired with ACCEPT"));
            }
        };
        let offered_key_count = match &offer {
            Request::Offer(offer) => offer.content_keys.len(),
            Request::PopulatedOffer(offer) => offer.content_items.len(),
            Request::PopulatedOfferWithResult(_) => 1,
            _ => 0,
        };

        let version = self.versions.highest_common(&enr)?;
        let accept_codes = AcceptCodeList::decode(version, &response.content_keys)
            .map_err(|err| anyhow!("Unable to decode accept codes: {err}"))?;
        if accept_codes.len() != offered_key_count {
            return Err(anyhow!(
                "ACCEPT answered {} keys for an offer of {}",
                accept_codes.len(),
                offered_key_count,
            ));
        }

        // Do not initialize a stream if the remote has no interest in the offered content keys.
        if accept_codes.all_declined() {
            if let Some(tx) = offer_result_tx {
                let _ = tx.send(OfferTrace::Declined);
            }
            return Ok(());
        }

        // Build a connection id based on the response.
        let conn_id = u16::from_be(response.connection_id);
        let cid = ConnectionId::from_wire(conn_id);
        let store = Arc::clone(&self.store);
        let stream_controller = Arc::clone(&self.stream_controller);

        tokio::spawn(async move {
            let content_items = match offer {
                Request::Offer(offer) => {
                    Self::provide_requested_content(store, &accept_codes, offer.content_keys)
                }
                Request::PopulatedOffer(offer) => Ok(accept_codes
                    .iter()
                    .zip(offer.content_items)
                    .filter(|(code, _item)| **code == AcceptCode::Accepted)
                    .map(|(_code, (_key, value))| value)
                    .collect()),
                Request::PopulatedOfferWithResult(offer) => Ok(accept_codes
                    .iter()
                    .zip(vec![offer.content_item])
                    .filter(|(code, _item)| **code == AcceptCode::Accepted)
                    .map(|(_code, (_key, value))| value)
                    .collect()),
                // Unreachable because of early return at top of method:
                _ => Err(anyhow!("Invalid request message paired with ACCEPT")),
            };

            let content_items: Vec<RawContentValue> = match content_items {
                Ok(items) => items,
                Err(err) => {
                    error!(
                        %err,
                        cid.send,
                        cid.recv,
                        "Error gathering previously offered content items"
                    );
                    if let Some(tx) = offer_result_tx {
                        let _ = tx.send(OfferTrace::Failed);
                    }
                    return;
                }
            };

            let content_payload = match encode_content_payload(&content_items) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(%err, "Unable to build content payload");
                    if let Some(tx) = offer_result_tx {
                        let _ = tx.send(OfferTrace::Failed);
                    }
                    return;
                }
            };
            let result = stream_controller
                .connect_outbound_stream(cid, enr, &content_payload)
                .await;
            if let Some(tx) = offer_result_tx {
                if result {
                    let _ = tx.send(OfferTrace::Success(accept_codes));
                } else {
                    let _ = tx.send(OfferTrace::Failed);
                }
            }
            // The permit is released only after the transfer is done.
            drop(request_permit);
        });

        Ok(())
    }

    /// Provides the requested content values for the acceptor, in offer order.
    fn provide_requested_content(
        store: Arc<Mutex<TStore>>,
        accept_codes: &AcceptCodeList,
        content_keys_offered: Vec<RawContentKey>,
    ) -> anyhow::Result<Vec<RawContentValue>> {
        let content_keys_offered = content_keys_offered
            .iter()
            .map(TContentKey::try_from_bytes)
            .collect::<anyhow::Result<Vec<TContentKey>>>()
            .map_err(|_| anyhow!("Unable to decode our own offered content keys"))?;

        let mut content_items: Vec<RawContentValue> = Vec::new();

        for (code, key) in accept_codes.iter().zip(content_keys_offered.iter()) {
            if *code == AcceptCode::Accepted {
                match store.lock().get(key) {
                    Ok(Some(content)) => content_items.push(content),
                    Ok(None) => return Err(anyhow!("Unable to read offered content!")),
                    Err(err) => {
                        return Err(anyhow!("Unable to get offered content from store: {err}"))
                    }
                }
            }
        }
        Ok(content_items)
    }
}

fn encode_accept_codes(
    accept_codes: &AcceptCodeList,
    version: ProtocolVersion,
) -> Result<Vec<u8>, OverlayRequestError> {
    accept_codes.encode(version).map_err(|err| {
        OverlayRequestError::AcceptError(format!("Unable to encode accept codes: {err}"))
    })
}

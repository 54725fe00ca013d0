use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Ignored, InFlight, Lane, Outcome, SignalingManager, negotiation_error};
use crate::error::SignalingError;
use crate::ids::{ConnectionId, PeerId, Role, StreamKind};
use crate::media::MediaHandle;
use crate::message::{AnswerSignal, OfferSignal, SignalMessage, StreamRequest};
use crate::registry::{Draft, Link, Ticket};
use crate::state::ConnectionState;

impl SignalingManager {
    /// Asks `remote` to start sending `kind`. Leaves a placeholder in
    /// `requesting` that the remote's offer will take over.
    pub async fn request_stream(
        &self,
        remote: &PeerId,
        kind: StreamKind,
    ) -> Result<Outcome, SignalingError> {
        let local = &self.inner.local;
        if remote == local {
            return Ok(Outcome::Ignored(Ignored::SelfAddressed));
        }
        let id = ConnectionId::incoming(local, remote, kind);
        let admitted = {
            let mut shared = self.lock();
            let draft = Draft {
                id: id.clone(),
                remote_name: None,
                role: Role::Receiver,
            };
            match shared.admit(draft, ConnectionState::Requesting, Link::Placeholder, Instant::now()) {
                Ok(admitted) => admitted,
                Err(reason) => {
                    debug!(connection_id = %id, ?reason, "stream already requested");
                    return Ok(Outcome::Ignored(reason));
                }
            }
        };
        if let Some(evicted) = admitted.evicted {
            self.teardown(evicted.into_teardown()).await;
        }

        let request = SignalMessage::RequestStream(StreamRequest {
            from_id: local.clone(),
            from_name: self.inner.display_name.clone(),
            kind,
        });
        if let Err(err) = self.send(remote, request).await {
            self.mark_failed(&admitted.ticket, &err.to_string());
            return Err(err);
        }
        info!(connection_id = %id, "requested remote stream");
        Ok(Outcome::Applied)
    }

    /// Starts sending `media` to `remote`. Concurrent calls for the same id
    /// collapse into one negotiation.
    pub async fn create_offer(
        &self,
        remote: &PeerId,
        remote_name: Option<String>,
        kind: StreamKind,
        media: MediaHandle,
    ) -> Result<Outcome, SignalingError> {
        let local = &self.inner.local;
        if remote == local {
            return Ok(Outcome::Ignored(Ignored::SelfAddressed));
        }
        let id = ConnectionId::outgoing(local, remote, kind);
        let admitted = {
            let mut shared = self.lock();
            if shared.offers_in_flight.contains_key(&id) {
                debug!(connection_id = %id, "offer already in flight");
                return Ok(Outcome::Ignored(Ignored::InFlight));
            }
            let draft = Draft {
                id: id.clone(),
                remote_name,
                role: Role::Sender,
            };
            match shared.admit(draft, ConnectionState::Creating, Link::Pending, Instant::now()) {
                Ok(admitted) => {
                    shared
                        .offers_in_flight
                        .insert(id.clone(), admitted.ticket.generation());
                    admitted
                }
                Err(reason) => {
                    debug!(connection_id = %id, ?reason, "offer not started");
                    return Ok(Outcome::Ignored(reason));
                }
            }
        };
        let ticket = admitted.ticket;
        let _in_flight = InFlight::new(&self.inner, Lane::Offer, ticket.clone());
        if let Some(evicted) = admitted.evicted {
            self.teardown(evicted.into_teardown()).await;
        }

        match self.run_offer(&ticket, remote, kind, &media).await {
            Ok(true) => {
                info!(connection_id = %id, "offer sent");
                Ok(Outcome::Applied)
            }
            Ok(false) => {
                debug!(connection_id = %id, "offer abandoned, record retired");
                Ok(Outcome::Ignored(Ignored::Superseded))
            }
            Err(err) => self.settle_failure(&ticket, err),
        }
    }

    async fn run_offer(
        &self,
        ticket: &Ticket,
        remote: &PeerId,
        kind: StreamKind,
        media: &MediaHandle,
    ) -> Result<bool, SignalingError> {
        let Some(transport) = self.build_transport(ticket).await? else {
            return Ok(false);
        };
        let negotiation = negotiation_error(ticket.id());
        transport.attach_media(media).await.map_err(&negotiation)?;
        if !self.advance(ticket, ConnectionState::Offering) {
            return Ok(false);
        }
        let offer = transport.create_offer().await.map_err(&negotiation)?;
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(&negotiation)?;
        if !self.is_current(ticket) {
            return Ok(false);
        }
        let message = SignalMessage::Offer(OfferSignal {
            from_id: self.inner.local.clone(),
            from_name: self.inner.display_name.clone(),
            kind,
            sdp_offer: offer,
        });
        self.send(remote, message).await?;
        Ok(true)
    }

    /// Answers a remote offer. `local_media` is attached when this side also
    /// publishes `kind`.
    pub async fn handle_offer(
        &self,
        offer: OfferSignal,
        local_media: Option<MediaHandle>,
    ) -> Result<Outcome, SignalingError> {
        let local = &self.inner.local;
        if &offer.from_id == local {
            return Ok(Outcome::Ignored(Ignored::SelfAddressed));
        }
        let id = ConnectionId::incoming(local, &offer.from_id, offer.kind);
        let role = if local_media.is_some() {
            Role::Sender
        } else {
            Role::Receiver
        };
        let (ticket, evicted) = {
            let mut shared = self.lock();
            let now = Instant::now();
            let awaiting = shared.registry.get(&id).is_some_and(|record| {
                record.is_placeholder() && record.state() == ConnectionState::Requesting
            });
            if awaiting {
                match shared
                    .registry
                    .promote_placeholder(&id, offer.from_name.clone(), role, now)
                {
                    Ok(ticket) => {
                        debug!(connection_id = %id, "offer answers our stream request");
                        (ticket, None)
                    }
                    Err(err) => {
                        warn!(connection_id = %id, error = %err, "placeholder promotion failed");
                        return Ok(Outcome::Ignored(Ignored::UnexpectedState(
                            ConnectionState::Requesting,
                        )));
                    }
                }
            } else {
                let draft = Draft {
                    id: id.clone(),
                    remote_name: offer.from_name.clone(),
                    role,
                };
                match shared.admit(draft, ConnectionState::Creating, Link::Pending, now) {
                    Ok(admitted) => (admitted.ticket, admitted.evicted),
                    Err(reason) => {
                        debug!(connection_id = %id, ?reason, "duplicate offer rejected");
                        return Ok(Outcome::Ignored(reason));
                    }
                }
            }
        };
        if let Some(evicted) = evicted {
            self.teardown(evicted.into_teardown()).await;
        }

        match self.run_answer(&ticket, &offer, local_media.as_ref()).await {
            Ok(true) => {
                info!(connection_id = %id, "answer sent");
                Ok(Outcome::Applied)
            }
            Ok(false) => {
                debug!(connection_id = %id, "answer abandoned, record retired");
                Ok(Outcome::Ignored(Ignored::Superseded))
            }
            Err(err) => self.settle_failure(&ticket, err),
        }
    }

    async fn run_answer(
        &self,
        ticket: &Ticket,
        offer: &OfferSignal,
        media: Option<&MediaHandle>,
    ) -> Result<bool, SignalingError> {
        let Some(transport) = self.build_transport(ticket).await? else {
            return Ok(false);
        };
        let negotiation = negotiation_error(ticket.id());
        if let Some(media) = media {
            transport.attach_media(media).await.map_err(&negotiation)?;
        }
        if !self.advance(ticket, ConnectionState::Answering) {
            return Ok(false);
        }
        transport
            .set_remote_description(offer.sdp_offer.clone())
            .await
            .map_err(&negotiation)?;
        let answer = transport.create_answer().await.map_err(&negotiation)?;
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(&negotiation)?;
        if !self.is_current(ticket) {
            return Ok(false);
        }
        let message = SignalMessage::Answer(AnswerSignal {
            from_id: self.inner.local.clone(),
            kind: offer.kind,
            sdp_answer: answer,
        });
        self.send(&offer.from_id, message).await?;
        self.drain_candidates(ticket, &transport).await;
        Ok(true)
    }

    /// A viewer asked for one of our streams: offer it if we publish it.
    pub async fn handle_request_stream(
        &self,
        request: StreamRequest,
    ) -> Result<Outcome, SignalingError> {
        if request.from_id == self.inner.local {
            return Ok(Outcome::Ignored(Ignored::SelfAddressed));
        }
        let Some(media) = self.inner.media.tracks_for(request.kind) else {
            debug!(peer = %request.from_id, kind = %request.kind, "nothing published for stream request");
            return Ok(Outcome::Ignored(Ignored::NoLocalMedia));
        };
        self.create_offer(&request.from_id, request.from_name, request.kind, media)
            .await
    }
}

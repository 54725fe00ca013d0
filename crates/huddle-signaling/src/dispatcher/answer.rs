use tokio::time::Instant;
use tracing::{debug, info};

use super::{Ignored, InFlight, Lane, Outcome, SignalingManager, negotiation_error};
use crate::error::SignalingError;
use crate::ids::ConnectionId;
use crate::message::AnswerSignal;
use crate::state::ConnectionState;
use crate::transport::NegotiationState;

impl SignalingManager {
    /// Completes an outgoing negotiation. Only an `offering` record whose
    /// transport still holds the local offer accepts an answer, and only once.
    pub async fn handle_answer(&self, answer: AnswerSignal) -> Result<Outcome, SignalingError> {
        let local = &self.inner.local;
        if &answer.from_id == local {
            return Ok(Outcome::Ignored(Ignored::SelfAddressed));
        }
        let id = ConnectionId::outgoing(local, &answer.from_id, answer.kind);
        let (ticket, transport) = {
            let mut shared = self.lock();
            if shared.answers_in_flight.contains_key(&id) {
                debug!(connection_id = %id, "answer already being applied");
                return Ok(Outcome::Ignored(Ignored::InFlight));
            }
            let Some(record) = shared.registry.get(&id) else {
                debug!(connection_id = %id, "answer without an offer");
                return Ok(Outcome::Ignored(Ignored::NoRecord));
            };
            if record.state() != ConnectionState::Offering {
                return Ok(Outcome::Ignored(Ignored::UnexpectedState(record.state())));
            }
            let Some(transport) = record.transport() else {
                return Ok(Outcome::Ignored(Ignored::NotAwaitingAnswer));
            };
            if transport.negotiation_state() != NegotiationState::HaveLocalOffer {
                debug!(
                    connection_id = %id,
                    negotiation = ?transport.negotiation_state(),
                    "transport not waiting for an answer"
                );
                return Ok(Outcome::Ignored(Ignored::NotAwaitingAnswer));
            }
            let ticket = record.ticket();
            shared.registry.touch(&id, Instant::now());
            shared
                .answers_in_flight
                .insert(id.clone(), ticket.generation());
            (ticket, transport)
        };
        let _in_flight = InFlight::new(&self.inner, Lane::Answer, ticket.clone());

        let applied = transport
            .set_remote_description(answer.sdp_answer)
            .await
            .map_err(negotiation_error(&id));
        if let Err(err) = applied {
            return self.settle_failure(&ticket, err);
        }
        if !self.advance(&ticket, ConnectionState::Connected) {
            return Ok(Outcome::Ignored(Ignored::Superseded));
        }
        info!(connection_id = %id, "answer applied");
        self.drain_candidates(&ticket, &transport).await;
        Ok(Outcome::Applied)
    }
}

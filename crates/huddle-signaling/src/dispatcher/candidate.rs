use tokio::time::Instant;
use tracing::{trace, warn};

use super::{CandidateOutcome, SignalingManager};
use crate::error::SignalingError;
use crate::ids::ConnectionId;
use crate::message::CandidateSignal;

impl SignalingManager {
    /// Applies a remote candidate, or queues it until the matching record has
    /// its remote description. Queued candidates keep arrival order.
    pub async fn handle_ice_candidate(
        &self,
        signal: CandidateSignal,
    ) -> Result<CandidateOutcome, SignalingError> {
        let local = &self.inner.local;
        let outgoing = ConnectionId::outgoing(local, &signal.from_id, signal.kind);
        let incoming = ConnectionId::incoming(local, &signal.from_id, signal.kind);
        let (id, transport) = {
            let mut shared = self.lock();
            let now = Instant::now();
            let ready = [&outgoing, &incoming].into_iter().find_map(|id| {
                let record = shared.registry.get(id)?;
                if !record.remote_applied() || record.state().is_terminal() {
                    return None;
                }
                record.transport().map(|transport| (id.clone(), transport))
            });
            match ready {
                Some((id, transport)) => {
                    shared.registry.touch(&id, now);
                    (id, transport)
                }
                None => {
                    // With no record yet the offer is still on its way, and
                    // offers always arrive on the incoming side.
                    let target = [&outgoing, &incoming]
                        .into_iter()
                        .find(|id| shared.registry.get(id).is_some())
                        .unwrap_or(&incoming)
                        .clone();
                    shared.registry.touch(&target, now);
                    let evicted = shared.candidates.enqueue(&target, signal.candidate, now);
                    if let Some(dropped) = evicted {
                        warn!(
                            connection_id = %target,
                            dropped = %dropped.candidate,
                            "candidate queue full, dropped oldest"
                        );
                    }
                    trace!(
                        connection_id = %target,
                        pending = shared.candidates.pending(&target),
                        "buffered remote candidate"
                    );
                    return Ok(CandidateOutcome::Buffered(target));
                }
            }
        };
        match transport.add_ice_candidate(signal.candidate).await {
            Ok(()) => Ok(CandidateOutcome::Applied(id)),
            Err(err) => {
                warn!(connection_id = %id, error = %err, "remote candidate rejected");
                Ok(CandidateOutcome::Rejected(id))
            }
        }
    }
}

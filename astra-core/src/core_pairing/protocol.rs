/*
    Pairing protocol over an established Noise session

    Requester                          Responder
    ---------                          ---------
    PairRequest {id, name}   ------>
                             <------   PairChallenge {id, name}
    (both show the short code derived from the handshake hash)
    PairConfirm {accepted}   <----->   PairConfirm {accepted}

    Trust is established only when both sides accepted. A peer's
    rejection that arrives while we still wait for our own user ends the
    attempt immediately.
*/

use super::code::ShortCode;
use super::manager::PairingManager;
use super::PairingError;
use crate::core_identity::TrustKey;
use crate::core_router::frame::{Frame, Hello};
use crate::core_router::session::Session;
use crate::core_store::model::ReplicaId;
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::debug;

/// Who we are, as told to the peer
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pub replica_id: ReplicaId,
    pub display_name: String,
}

/// A successful pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingOutcome {
    pub replica_id: ReplicaId,
    pub display_name: String,
    pub trust_key: TrustKey,
    pub code: ShortCode,
}

fn unexpected(expected: &'static str, frame: &Frame) -> PairingError {
    PairingError::UnexpectedFrame { expected, actual: frame.kind() }
}

fn check_identity(hello: &Hello, claimed: &ReplicaId) -> Result<(), PairingError> {
    if &hello.replica_id != claimed {
        return Err(PairingError::IdentityMismatch {
            expected: hello.replica_id.clone(),
            actual: claimed.clone(),
        });
    }
    Ok(())
}

/// Drive the requester side. `hello` is the peer's Hello for this session.
pub async fn run_requester(
    session: &mut Session,
    local: &LocalPeer,
    hello: &Hello,
    address: Option<SocketAddr>,
    rekey: bool,
    manager: &PairingManager,
) -> Result<PairingOutcome, PairingError> {
    manager.begin(&hello.replica_id, &hello.display_name, address)?;

    let result: Result<PairingOutcome, PairingError> = async {
        session
            .send(Frame::PairRequest {
                replica_id: local.replica_id.clone(),
                display_name: local.display_name.clone(),
            })
            .await?;

        let display_name = match session.receive().await? {
            Frame::PairChallenge { replica_id, display_name } => {
                check_identity(hello, &replica_id)?;
                display_name
            }
            other => return Err(unexpected("PairChallenge", &other)),
        };
        confirm_and_exchange(session, &hello.replica_id, display_name, rekey, manager).await
    }
    .await;

    finish(manager, &hello.replica_id, result)
}

/// Drive the responder side after the peer's Hello announced a pairing session
pub async fn run_responder(
    session: &mut Session,
    local: &LocalPeer,
    hello: &Hello,
    address: Option<SocketAddr>,
    rekey: bool,
    manager: &PairingManager,
) -> Result<PairingOutcome, PairingError> {
    let display_name = match session.receive().await? {
        Frame::PairRequest { replica_id, display_name } => {
            check_identity(hello, &replica_id)?;
            display_name
        }
        other => return Err(unexpected("PairRequest", &other)),
    };
    manager.begin(&hello.replica_id, &display_name, address)?;

    let result: Result<PairingOutcome, PairingError> = async {
        session
            .send(Frame::PairChallenge {
                replica_id: local.replica_id.clone(),
                display_name: local.display_name.clone(),
            })
            .await?;
        confirm_and_exchange(session, &hello.replica_id, display_name, rekey, manager).await
    }
    .await;

    finish(manager, &hello.replica_id, result)
}

fn finish(
    manager: &PairingManager,
    replica_id: &ReplicaId,
    result: Result<PairingOutcome, PairingError>,
) -> Result<PairingOutcome, PairingError> {
    match &result {
        Ok(_) => manager.complete(replica_id, true, "")?,
        Err(e) => {
            // The candidate may already be terminal (expired); nothing to record then
            let _ = manager.complete(replica_id, false, &e.to_string());
        }
    }
    result
}

fn expect_confirm(frame: Frame) -> Result<bool, PairingError> {
    match frame {
        Frame::PairConfirm { accepted } => Ok(accepted),
        other => Err(unexpected("PairConfirm", &other)),
    }
}

async fn confirm_and_exchange(
    session: &mut Session,
    peer: &ReplicaId,
    display_name: String,
    rekey: bool,
    manager: &PairingManager,
) -> Result<PairingOutcome, PairingError> {
    let code = ShortCode::from_handshake_hash(session.handshake_hash());
    let mut answer = manager.challenge(peer, code, rekey)?;
    let deadline = Instant::now() + manager.timeout();

    let mut local: Option<bool> = None;
    let mut remote: Option<bool> = None;
    while local.is_none() {
        tokio::select! {
            decision = &mut answer => {
                local = Some(decision.unwrap_or(false));
            }
            frame = session.receive(), if remote.is_none() => {
                let accepted = expect_confirm(frame?)?;
                remote = Some(accepted);
                if !accepted {
                    debug!(replica_id = %peer, "peer rejected before local confirmation");
                    return Err(PairingError::Rejected("peer rejected the pairing".to_string()));
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = session.send(Frame::PairConfirm { accepted: false }).await;
                return Err(PairingError::Timeout);
            }
        }
    }

    let accepted = local.unwrap_or(false);
    session.send(Frame::PairConfirm { accepted }).await?;
    if !accepted {
        return Err(PairingError::Rejected("pairing declined locally".to_string()));
    }

    let remote = match remote {
        Some(remote) => remote,
        None => {
            let frame = tokio::time::timeout_at(deadline, session.receive())
                .await
                .map_err(|_| PairingError::Timeout)??;
            expect_confirm(frame)?
        }
    };
    if !remote {
        return Err(PairingError::Rejected("peer rejected the pairing".to_string()));
    }

    Ok(PairingOutcome {
        replica_id: peer.clone(),
        display_name,
        trust_key: *session.remote_static(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::StaticKeypair;
    use crate::core_pairing::manager::PairingEvent;
    use crate::core_pairing::state::PairingState;
    use crate::core_router::frame::SessionPurpose;
    use crate::core_router::memory::session_pair;
    use std::time::Duration;

    fn local(id: &str) -> LocalPeer {
        LocalPeer { replica_id: ReplicaId::from(id), display_name: id.to_string() }
    }

    fn hello(id: &str) -> Hello {
        Hello::new(ReplicaId::from(id), id, SessionPurpose::Pair)
    }

    /// Answer every confirmation request on `manager` with `accept`
    fn auto_answer(manager: &std::sync::Arc<PairingManager>, accept: bool) {
        let mut events = manager.subscribe();
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let PairingEvent::ConfirmationRequired { replica_id, .. } = event {
                    let _ = manager.confirm(&replica_id, accept);
                }
            }
        });
    }

    async fn pair(
        accept_x: bool,
        accept_y: bool,
    ) -> (Result<PairingOutcome, PairingError>, Result<PairingOutcome, PairingError>) {
        let kx = StaticKeypair::generate();
        let ky = StaticKeypair::generate();
        let (mut sx, mut sy) = session_pair(&kx, &ky).await.unwrap();

        let mx = std::sync::Arc::new(PairingManager::new(Duration::from_secs(5)));
        let my = std::sync::Arc::new(PairingManager::new(Duration::from_secs(5)));
        auto_answer(&mx, accept_x);
        auto_answer(&my, accept_y);

        let (lx, ly, hx, hy) = (local("x"), local("y"), hello("x"), hello("y"));
        tokio::join!(
            run_requester(&mut sx, &lx, &hy, None, false, &mx),
            run_responder(&mut sy, &ly, &hx, None, false, &my),
        )
    }

    #[tokio::test]
    async fn test_both_accept_trusts_static_keys() {
        let (x, y) = pair(true, true).await;
        let x = x.unwrap();
        let y = y.unwrap();

        assert_eq!(x.replica_id, ReplicaId::from("y"));
        assert_eq!(y.replica_id, ReplicaId::from("x"));
        assert_eq!(x.code, y.code);
    }

    #[tokio::test]
    async fn test_one_side_rejects() {
        let (x, y) = pair(true, false).await;
        assert!(matches!(x, Err(PairingError::Rejected(_))));
        assert!(matches!(y, Err(PairingError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_unanswered_confirmation_times_out() {
        let (mut sx, mut sy) =
            session_pair(&StaticKeypair::generate(), &StaticKeypair::generate()).await.unwrap();
        let mx = PairingManager::new(Duration::from_millis(100));
        let my = std::sync::Arc::new(PairingManager::new(Duration::from_secs(5)));
        auto_answer(&my, true);

        let (lx, ly, hx, hy) = (local("x"), local("y"), hello("x"), hello("y"));
        let (x, y) = tokio::join!(
            run_requester(&mut sx, &lx, &hy, None, false, &mx),
            run_responder(&mut sy, &ly, &hx, None, false, &my),
        );

        assert!(matches!(x, Err(PairingError::Timeout)));
        assert!(matches!(y, Err(PairingError::Rejected(_))));
        assert_eq!(mx.state(&ReplicaId::from("y")), Some(PairingState::Rejected));
    }

    #[tokio::test]
    async fn test_claimed_identity_must_match_hello() {
        let (mut sx, mut sy) =
            session_pair(&StaticKeypair::generate(), &StaticKeypair::generate()).await.unwrap();
        let manager = PairingManager::new(Duration::from_secs(5));

        sx.send(Frame::PairRequest { replica_id: ReplicaId::from("mallory"), display_name: "m".into() })
            .await
            .unwrap();
        let result = run_responder(&mut sy, &local("y"), &hello("x"), None, false, &manager).await;

        assert!(matches!(result, Err(PairingError::IdentityMismatch { .. })));
    }
}

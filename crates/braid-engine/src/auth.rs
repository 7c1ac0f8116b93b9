//! Authentication negotiation
//!
//! The client walks the server's offered mechanism list: pick one through
//! the selection policy, run challenge/response rounds, and on a
//! per-mechanism failure record the cause and move to the next candidate
//! rather than aborting. The connection only fails once every mechanism
//! has failed (or the server offered none). The server enforces a retry
//! budget across attempts.
//!
//! Round evaluation is cryptographic and potentially slow, so every call
//! into a mechanism happens on the blocking worker pool; the read path
//! simply suspends until the round completes.

use bytes::Bytes;
use tokio_util::codec::Framed;

use braid_core::{
    AuthError, BoxTransport, ClientMechanism, ConnectionError, FrameTransform, Identity,
    MechanismCatalog, MechanismError, MechanismSelector, ServerMechanism, ServerStep,
};
use braid_protocol::{Frame, LengthCodec};

use crate::handshake::{recv_frame, send_frame};

/// What the authentication phase established.
pub(crate) struct AuthOutcome {
    /// The authenticated peer identity (server side only)
    pub identity: Option<Identity>,
    /// The mechanism that succeeded
    pub mechanism: String,
    /// Wrap/unwrap transform to install, when the mechanism negotiated
    /// integrity or confidentiality
    pub transform: Option<Box<dyn FrameTransform>>,
    /// Mechanisms that failed along the way, with their causes
    pub failures: Vec<(String, MechanismError)>,
}

enum ClientRound {
    Initial,
    Challenge(Bytes),
    Verify(Bytes),
}

async fn client_round(
    mech: Box<dyn ClientMechanism>,
    input: ClientRound,
) -> Result<(Box<dyn ClientMechanism>, Result<Vec<u8>, MechanismError>), ConnectionError> {
    tokio::task::spawn_blocking(move || {
        let mut mech = mech;
        let result = match input {
            ClientRound::Initial => mech.initial_response(),
            ClientRound::Challenge(challenge) => mech.evaluate_challenge(&challenge),
            ClientRound::Verify(data) => mech.verify_complete(&data).map(|()| Vec::new()),
        };
        (mech, result)
    })
    .await
    .map_err(|e| ConnectionError::Io(std::io::Error::other(e)))
}

async fn server_round(
    mech: Box<dyn ServerMechanism>,
    response: Bytes,
) -> Result<(Box<dyn ServerMechanism>, Result<ServerStep, MechanismError>), ConnectionError> {
    tokio::task::spawn_blocking(move || {
        let mut mech = mech;
        let result = mech.evaluate_response(&response);
        (mech, result)
    })
    .await
    .map_err(|e| ConnectionError::Io(std::io::Error::other(e)))
}

fn take_transform<M>(mech: Box<M>) -> Option<Box<dyn FrameTransform>>
where
    M: ?Sized,
    Box<M>: IntoTransform,
{
    mech.take()
}

/// Object-safe access to `into_transform` across both mechanism traits.
trait IntoTransform {
    fn take(self) -> Option<Box<dyn FrameTransform>>;
}

impl IntoTransform for Box<dyn ClientMechanism> {
    fn take(self) -> Option<Box<dyn FrameTransform>> {
        if self.security_layer().wraps_frames() {
            self.into_transform()
        } else {
            None
        }
    }
}

impl IntoTransform for Box<dyn ServerMechanism> {
    fn take(self) -> Option<Box<dyn FrameTransform>> {
        if self.security_layer().wraps_frames() {
            self.into_transform()
        } else {
            None
        }
    }
}

async fn recv_auth_frame(
    framed: &mut Framed<BoxTransport, LengthCodec>,
) -> Result<Frame, ConnectionError> {
    recv_frame(framed)
        .await?
        .ok_or(ConnectionError::Auth(AuthError::PeerClosed))
}

/// Run the client side of authentication against the server's offered
/// mechanism list.
pub(crate) async fn authenticate_client(
    framed: &mut Framed<BoxTransport, LengthCodec>,
    catalog: &MechanismCatalog,
    selector: Option<&MechanismSelector>,
    offered: &[String],
) -> Result<AuthOutcome, ConnectionError> {
    if offered.is_empty() {
        return Err(AuthError::NoMechanisms.into());
    }

    let mut failures: Vec<(String, MechanismError)> = Vec::new();

    'mechanisms: loop {
        let candidates: Vec<String> = offered
            .iter()
            .filter(|name| catalog.create_client(name).is_some())
            .filter(|name| !failures.iter().any(|(failed, _)| failed == *name))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(AuthError::Exhausted { failures }.into());
        }

        let name = match selector {
            Some(select) => match select(&candidates) {
                Some(name) if candidates.contains(&name) => name,
                Some(name) => return Err(AuthError::UnknownMechanism(name).into()),
                None => return Err(AuthError::Exhausted { failures }.into()),
            },
            None => candidates[0].clone(),
        };

        let Some(mech) = catalog.create_client(&name) else {
            return Err(AuthError::UnknownMechanism(name).into());
        };
        tracing::debug!("Trying mechanism {}", name);

        let (mech, initial) = client_round(mech, ClientRound::Initial).await?;
        let mut mech = mech;
        let initial = match initial {
            Ok(initial) => initial,
            Err(e) => {
                tracing::debug!("Mechanism {} failed locally: {}", name, e);
                failures.push((name, e));
                continue 'mechanisms;
            }
        };

        send_frame(
            framed,
            Frame::AuthRequest {
                mechanism: name.clone(),
                initial: initial.into(),
            },
        )
        .await?;

        loop {
            match recv_auth_frame(framed).await? {
                Frame::AuthChallenge { payload } => {
                    let (m, result) = client_round(mech, ClientRound::Challenge(payload)).await?;
                    mech = m;
                    match result {
                        Ok(response) => {
                            send_frame(
                                framed,
                                Frame::AuthResponse {
                                    payload: response.into(),
                                },
                            )
                            .await?;
                        }
                        Err(e) => {
                            tracing::debug!("Mechanism {} failed mid-round: {}", name, e);
                            failures.push((name, e));
                            continue 'mechanisms;
                        }
                    }
                }
                Frame::AuthComplete { payload } => {
                    let (m, result) = client_round(mech, ClientRound::Verify(payload)).await?;
                    mech = m;
                    match result {
                        Ok(_) => {
                            tracing::info!("Authenticated with mechanism {}", name);
                            let transform = take_transform(mech);
                            return Ok(AuthOutcome {
                                identity: None,
                                mechanism: name,
                                transform,
                                failures,
                            });
                        }
                        Err(e) => {
                            tracing::debug!("Completion verify failed for {}: {}", name, e);
                            failures.push((name, e));
                            continue 'mechanisms;
                        }
                    }
                }
                Frame::AuthRejected { reason } => {
                    tracing::debug!("Mechanism {} rejected by peer: {}", name, reason);
                    failures.push((name, MechanismError::Rejected(reason)));
                    continue 'mechanisms;
                }
                other => {
                    return Err(AuthError::UnexpectedFrame(other.kind_byte()).into());
                }
            }
        }
    }
}

/// Run the server side of authentication.
///
/// `pending` carries a frame the handshake already consumed. The retry
/// budget counts every failed attempt, whether the mechanism was unknown,
/// failed a round, or was abandoned by the client mid-exchange.
pub(crate) async fn authenticate_server(
    framed: &mut Framed<BoxTransport, LengthCodec>,
    catalog: &MechanismCatalog,
    max_retries: u32,
    mut pending: Option<Frame>,
) -> Result<AuthOutcome, ConnectionError> {
    let mut retries = 0u32;
    let mut failures: Vec<(String, MechanismError)> = Vec::new();
    let mut next_request: Option<(String, Bytes)> = None;

    loop {
        let (name, initial) = match next_request.take() {
            Some(request) => request,
            None => {
                let frame = match pending.take() {
                    Some(frame) => frame,
                    None => recv_auth_frame(framed).await?,
                };
                match frame {
                    Frame::AuthRequest { mechanism, initial } => (mechanism, initial),
                    other => {
                        return Err(AuthError::UnexpectedFrame(other.kind_byte()).into());
                    }
                }
            }
        };

        let Some(mech) = catalog.create_server(&name) else {
            tracing::debug!("Peer requested unavailable mechanism {}", name);
            send_frame(
                framed,
                Frame::AuthRejected {
                    reason: format!("unknown mechanism: {name}"),
                },
            )
            .await?;
            failures.push((
                name.clone(),
                MechanismError::Unavailable(format!("not offered: {name}")),
            ));
            retries += 1;
            if retries >= max_retries {
                return Err(AuthError::RetriesExceeded { limit: max_retries }.into());
            }
            continue;
        };

        let mut mech = mech;
        let mut response = initial;
        tracing::debug!("Running mechanism {}", name);

        'rounds: loop {
            let (m, step) = server_round(mech, response.clone()).await?;
            mech = m;
            match step {
                Ok(ServerStep::Challenge(challenge)) => {
                    send_frame(
                        framed,
                        Frame::AuthChallenge {
                            payload: challenge.into(),
                        },
                    )
                    .await?;
                    match recv_auth_frame(framed).await? {
                        Frame::AuthResponse { payload } => response = payload,
                        Frame::AuthRequest { mechanism, initial } => {
                            // Client abandoned this mechanism mid-round
                            tracing::debug!("Peer abandoned {} for {}", name, mechanism);
                            failures.push((
                                name.clone(),
                                MechanismError::Rejected("abandoned by peer".to_string()),
                            ));
                            retries += 1;
                            if retries >= max_retries {
                                return Err(
                                    AuthError::RetriesExceeded { limit: max_retries }.into()
                                );
                            }
                            next_request = Some((mechanism, initial));
                            break 'rounds;
                        }
                        other => {
                            return Err(AuthError::UnexpectedFrame(other.kind_byte()).into());
                        }
                    }
                }
                Ok(ServerStep::Complete {
                    identity,
                    final_data,
                }) => {
                    send_frame(
                        framed,
                        Frame::AuthComplete {
                            payload: final_data.into(),
                        },
                    )
                    .await?;
                    tracing::info!("Authenticated {} via {}", identity, name);
                    let transform = take_transform(mech);
                    return Ok(AuthOutcome {
                        identity: Some(identity),
                        mechanism: name,
                        transform,
                        failures,
                    });
                }
                Err(e) => {
                    tracing::debug!("Mechanism {} failed: {}", name, e);
                    send_frame(
                        framed,
                        Frame::AuthRejected {
                            reason: e.to_string(),
                        },
                    )
                    .await?;
                    failures.push((name.clone(), e));
                    retries += 1;
                    if retries >= max_retries {
                        return Err(AuthError::RetriesExceeded { limit: max_retries }.into());
                    }
                    break 'rounds;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::mechanisms::{Anonymous, HmacSha256Client, HmacSha256Server};
    use braid_core::{MechanismCatalog, ServerMechanism};
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio_util::codec::Framed;

    /// A mechanism whose server side always refuses.
    struct AlwaysFail;

    impl braid_core::ClientMechanism for AlwaysFail {
        fn name(&self) -> &str {
            "ALWAYS-FAIL"
        }
        fn initial_response(&mut self) -> Result<Vec<u8>, MechanismError> {
            Ok(Vec::new())
        }
        fn evaluate_challenge(&mut self, _: &[u8]) -> Result<Vec<u8>, MechanismError> {
            Ok(Vec::new())
        }
    }

    impl ServerMechanism for AlwaysFail {
        fn name(&self) -> &str {
            "ALWAYS-FAIL"
        }
        fn evaluate_response(&mut self, _: &[u8]) -> Result<ServerStep, MechanismError> {
            Err(MechanismError::BadCredentials("always fails".to_string()))
        }
    }

    fn framed_pair() -> (
        Framed<BoxTransport, LengthCodec>,
        Framed<BoxTransport, LengthCodec>,
    ) {
        let (a, b) = duplex(64 * 1024);
        (
            Framed::new(Box::new(a) as BoxTransport, LengthCodec::new()),
            Framed::new(Box::new(b) as BoxTransport, LengthCodec::new()),
        )
    }

    fn secrets() -> braid_core::mechanisms::SecretProvider {
        Arc::new(|user: &str| (user == "joe").then(|| "secret".to_string()))
    }

    #[tokio::test]
    async fn test_anonymous_succeeds() {
        let (mut client_io, mut server_io) = framed_pair();

        let mut catalog = MechanismCatalog::new();
        catalog.register_client("ANONYMOUS", || Box::new(Anonymous::client()));
        catalog.register_server("ANONYMOUS", || Box::new(Anonymous::server()));
        let offered = catalog.offered();

        let (client, server) = tokio::join!(
            authenticate_client(&mut client_io, &catalog, None, &offered),
            authenticate_server(&mut server_io, &catalog, 8, None),
        );
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(client.mechanism, "ANONYMOUS");
        assert_eq!(server.identity.unwrap().name(), "anonymous");
        assert!(client.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failed_mechanism_retries_with_next() {
        let (mut client_io, mut server_io) = framed_pair();

        let mut catalog = MechanismCatalog::new();
        catalog.register_client("ALWAYS-FAIL", || Box::new(AlwaysFail));
        catalog.register_server("ALWAYS-FAIL", || Box::new(AlwaysFail));
        catalog.register_client("HMAC-SHA256", || {
            Box::new(HmacSha256Client::new("joe", "secret"))
        });
        let secrets = secrets();
        catalog.register_server("HMAC-SHA256", move || {
            Box::new(HmacSha256Server::new(Arc::clone(&secrets)))
        });
        let offered = catalog.offered();

        let (client, server) = tokio::join!(
            authenticate_client(&mut client_io, &catalog, None, &offered),
            authenticate_server(&mut server_io, &catalog, 8, None),
        );
        let client = client.unwrap();
        let server = server.unwrap();

        // A failed on the first round; the negotiator moved on to B
        assert_eq!(client.mechanism, "HMAC-SHA256");
        assert_eq!(client.failures.len(), 1);
        assert_eq!(client.failures[0].0, "ALWAYS-FAIL");
        assert_eq!(server.identity.unwrap().name(), "joe");
        assert_eq!(server.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_lists_every_cause() {
        let (mut client_io, mut server_io) = framed_pair();

        let mut catalog = MechanismCatalog::new();
        catalog.register_client("ALWAYS-FAIL", || Box::new(AlwaysFail));
        catalog.register_server("ALWAYS-FAIL", || Box::new(AlwaysFail));
        let offered = catalog.offered();

        let (client, server) = tokio::join!(
            authenticate_client(&mut client_io, &catalog, None, &offered),
            authenticate_server(&mut server_io, &catalog, 1, None),
        );

        match client {
            Err(ConnectionError::Auth(AuthError::Exhausted { failures })) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "ALWAYS-FAIL");
            }
            Err(other) => panic!("Expected exhaustion, got {other}"),
            Ok(_) => panic!("Expected exhaustion, got success"),
        }
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_empty_offer_is_terminal() {
        let (mut client_io, _server_io) = framed_pair();
        let catalog = MechanismCatalog::new();
        let result = authenticate_client(&mut client_io, &catalog, None, &[]).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Auth(AuthError::NoMechanisms))
        ));
    }

    #[tokio::test]
    async fn test_selector_policy_drives_choice() {
        let (mut client_io, mut server_io) = framed_pair();

        let mut catalog = MechanismCatalog::new();
        catalog.register_client("ANONYMOUS", || Box::new(Anonymous::client()));
        catalog.register_server("ANONYMOUS", || Box::new(Anonymous::server()));
        catalog.register_client("HMAC-SHA256", || {
            Box::new(HmacSha256Client::new("joe", "secret"))
        });
        let secrets = secrets();
        catalog.register_server("HMAC-SHA256", move || {
            Box::new(HmacSha256Server::new(Arc::clone(&secrets)))
        });
        let offered = catalog.offered();

        // Prefer the strongest offered mechanism regardless of order
        let selector: MechanismSelector = Arc::new(|candidates: &[String]| {
            candidates
                .iter()
                .find(|name| name.as_str() == "HMAC-SHA256")
                .cloned()
        });

        let (client, server) = tokio::join!(
            authenticate_client(&mut client_io, &catalog, Some(&selector), &offered),
            authenticate_server(&mut server_io, &catalog, 8, None),
        );
        assert_eq!(client.unwrap().mechanism, "HMAC-SHA256");
        assert_eq!(server.unwrap().mechanism, "HMAC-SHA256");
    }

    #[tokio::test]
    async fn test_server_retry_limit() {
        let (mut client_io, mut server_io) = framed_pair();

        let mut server_catalog = MechanismCatalog::new();
        server_catalog.register_server("ALWAYS-FAIL", || Box::new(AlwaysFail));

        let mut client_catalog = MechanismCatalog::new();
        client_catalog.register_client("ALWAYS-FAIL", || Box::new(AlwaysFail));

        let offered = server_catalog.offered();
        let (client, server) = tokio::join!(
            authenticate_client(&mut client_io, &client_catalog, None, &offered),
            authenticate_server(&mut server_io, &server_catalog, 1, None),
        );

        assert!(matches!(
            server,
            Err(ConnectionError::Auth(AuthError::RetriesExceeded { limit: 1 }))
        ));
        assert!(client.is_err());
    }
}

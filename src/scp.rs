//! Association acceptor: listener loop, negotiation and pool handoff
//!
//! The accept loop is single-threaded and strictly sequential: it takes
//! one transport connection, negotiates it, hands the resulting session to
//! the worker pool, and immediately returns to accepting. Negotiation and
//! protocol failures are contained to the one connection; the loop itself
//! never unwinds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::AssocConfig;
use crate::error::{AssocError, Result};
use crate::negotiate::{ContextOutcome, NegotiationOptions};
use crate::pool::WorkerPool;
use crate::session::{AcceptedContext, HandlerRegistry, MessageHandler, PeerIdentity, Session};
use crate::store::ProfileStore;
use crate::transport::{AssociationChannel, AssociationResponse, FramedChannel, Pdu};
use crate::types::{CommandType, RefusalReason};

type AeVerifier = dyn Fn(&str) -> bool + Send + Sync;

/// Handle for requesting a graceful stop of a running acceptor.
///
/// The flag is checked between accept iterations, so in timeout-bounded
/// mode the loop notices a stop within one accept timeout; sessions in
/// flight are drained, never dropped.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the acceptor to stop after the current iteration
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested
    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Association Service Class Provider: accepts, negotiates and serves
/// associations on a bounded worker pool
pub struct AssocScp {
    config: AssocConfig,
    store: Arc<ProfileStore>,
    handlers: HandlerRegistry,
    calling_ae_verifier: Option<Box<AeVerifier>>,
    called_ae_verifier: Option<Box<AeVerifier>>,
    stop: Arc<AtomicBool>,
}

impl AssocScp {
    /// Create a new SCP with the given configuration and profile store
    pub fn new(config: AssocConfig, store: Arc<ProfileStore>) -> Self {
        Self {
            config,
            store,
            handlers: HandlerRegistry::new(),
            calling_ae_verifier: None,
            called_ae_verifier: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a handler for one command type
    pub fn with_handler(mut self, command: CommandType, handler: impl MessageHandler + 'static) -> Self {
        self.handlers.register(command, handler);
        self
    }

    /// Override the calling-AE check; the default accepts any peer
    pub fn with_calling_ae_verifier(
        mut self,
        verifier: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.calling_ae_verifier = Some(Box::new(verifier));
        self
    }

    /// Override the called-AE check; the default requires an exact match
    /// with the configured local AE title (or accepts anything when
    /// `echo_called_aet` is set)
    pub fn with_called_ae_verifier(
        mut self,
        verifier: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.called_ae_verifier = Some(Box::new(verifier));
        self
    }

    /// Obtain a stop handle; keep it before calling [`run`](Self::run)
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
        }
    }

    /// Bind the listener and serve associations until stopped
    pub async fn run(self) -> Result<()> {
        self.config.validate()?;
        if !self.store.is_known_profile(&self.config.profile) {
            return Err(AssocError::unresolved("profile", &self.config.profile));
        }
        if !self.store.is_server_profile(&self.config.profile) {
            return Err(AssocError::config(format!(
                "Profile {} repeats an abstract syntax and cannot be used by an acceptor",
                self.config.profile
            )));
        }

        let addr = std::net::SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        info!(
            "Starting association SCP on {} (AET: {})",
            addr, self.config.local_aet
        );

        let acceptor = Acceptor {
            config: self.config,
            store: self.store,
            handlers: Arc::new(self.handlers),
            calling_ae_verifier: self
                .calling_ae_verifier
                .unwrap_or_else(|| Box::new(|_: &str| true)),
            called_ae_verifier: self.called_ae_verifier,
        };
        let pool = WorkerPool::new(acceptor.config.max_workers);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested, no longer accepting associations");
                break;
            }

            let accepted = match acceptor.config.accept_timeout() {
                Some(limit) => match timeout(limit, listener.accept()).await {
                    // An elapsed accept wait is a normal outcome; go around
                    // and re-check the stop flag
                    Err(_) => continue,
                    Ok(result) => result,
                },
                None => listener.accept().await,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    let channel = FramedChannel::new(
                        stream,
                        peer_addr.to_string(),
                        acceptor.config.max_message_size as usize,
                    );
                    match acceptor.negotiate(Box::new(channel)).await {
                        Ok(Some(session)) => {
                            if let Err(rejected) = pool.submit(session) {
                                warn!(
                                    "Worker pool full, refusing association from {}",
                                    peer_addr
                                );
                                rejected.job.refuse(RefusalReason::TooManyConnections).await;
                            }
                        }
                        Ok(None) => {} // refused with a reason, already answered
                        Err(e) => {
                            warn!("Negotiation with {} failed: {}", peer_addr, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }

        pool.drain().await;
        info!("Association SCP stopped");
        Ok(())
    }
}

struct Acceptor {
    config: AssocConfig,
    store: Arc<ProfileStore>,
    handlers: Arc<HandlerRegistry>,
    calling_ae_verifier: Box<AeVerifier>,
    called_ae_verifier: Option<Box<AeVerifier>>,
}

impl Acceptor {
    /// Read and evaluate one association request. Returns the negotiated
    /// session, or `None` when the request was refused (the refusal has
    /// been sent).
    async fn negotiate(
        &self,
        mut channel: Box<dyn AssociationChannel>,
    ) -> Result<Option<Session>> {
        let peer_addr = channel.peer_addr().to_string();

        let received = timeout(self.config.association_timeout(), channel.recv())
            .await
            .map_err(|_| AssocError::timeout("association request"))??;
        let request = match received {
            Some(Pdu::Request(request)) => request,
            Some(other) => {
                return Err(AssocError::protocol(format!(
                    "expected A-ASSOCIATE-RQ, got {}",
                    other.name()
                )))
            }
            None => {
                return Err(AssocError::protocol(
                    "transport closed before association request",
                ))
            }
        };

        if self.config.forced_refuse {
            return self
                .refuse(channel, &request.calling_ae, RefusalReason::ServiceRefused)
                .await;
        }

        if request.application_context != crate::APPLICATION_CONTEXT_NAME {
            return self
                .refuse(
                    channel,
                    &request.calling_ae,
                    RefusalReason::ApplicationContextNotSupported,
                )
                .await;
        }

        if !(self.calling_ae_verifier)(&request.calling_ae) {
            return self
                .refuse(
                    channel,
                    &request.calling_ae,
                    RefusalReason::CallingAeNotRecognized,
                )
                .await;
        }

        if !self.called_ae_accepted(&request.called_ae) {
            return self
                .refuse(
                    channel,
                    &request.calling_ae,
                    RefusalReason::CalledAeNotRecognized,
                )
                .await;
        }

        let decision = self.store.evaluate(
            &self.config.profile,
            &request.contexts,
            NegotiationOptions {
                lenient_role_negotiation: self.config.lenient_role_negotiation,
            },
        )?;

        if decision.accepted_count() == 0 {
            return self
                .refuse(
                    channel,
                    &request.calling_ae,
                    RefusalReason::NoAcceptablePresentationContexts,
                )
                .await;
        }

        let accepted: Vec<AcceptedContext> = decision
            .contexts
            .iter()
            .filter_map(|d| match &d.outcome {
                ContextOutcome::Accepted {
                    transfer_syntax,
                    role,
                } => Some(AcceptedContext {
                    id: d.id,
                    abstract_syntax: d.abstract_syntax.clone(),
                    transfer_syntax: transfer_syntax.clone(),
                    role: *role,
                }),
                ContextOutcome::Rejected { .. } => None,
            })
            .collect();

        let called_ae = if self.config.echo_called_aet {
            request.called_ae.clone()
        } else {
            self.config.local_aet.clone()
        };
        let response = AssociationResponse {
            called_ae,
            max_message_size: self.config.max_message_size,
            contexts: decision.contexts,
            extended: decision.extended,
        };

        info!(
            "Negotiated association with {} ({}): {} of {} contexts accepted",
            request.calling_ae,
            peer_addr,
            accepted.len(),
            request.contexts.len()
        );

        let peer = PeerIdentity {
            calling_ae: request.calling_ae,
            called_ae: request.called_ae,
            address: peer_addr,
        };
        Ok(Some(Session::new(
            channel,
            peer,
            accepted,
            Some(response),
            Arc::clone(&self.handlers),
            self.config.receive_timeout(),
        )))
    }

    fn called_ae_accepted(&self, called_ae: &str) -> bool {
        match &self.called_ae_verifier {
            Some(verifier) => verifier(called_ae),
            None => self.config.echo_called_aet || called_ae == self.config.local_aet,
        }
    }

    async fn refuse(
        &self,
        mut channel: Box<dyn AssociationChannel>,
        calling_ae: &str,
        reason: RefusalReason,
    ) -> Result<Option<Session>> {
        info!(
            "Refusing association from {} ({}): {}",
            calling_ae,
            channel.peer_addr(),
            reason
        );
        channel.send(Pdu::Reject { reason }).await?;
        channel.close().await?;
        Ok(None)
    }
}

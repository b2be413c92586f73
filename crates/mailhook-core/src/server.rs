//! Server assembly and accept loop
//!
//! [`Mailhook`] wires the configuration and registered capabilities into a
//! running SMTP listener. Construction is cheap and infallible; `start`
//! binds the socket and is the only place a startup failure surfaces.

use crate::observer::{AddressPolicy, MessageObserver, SessionObserver};
use crate::pipeline::Pipeline;
use crate::smtp::{create_tls_acceptor, SessionHost, SmtpSession};
use crate::spam::SpamScorer;
use crate::validate::AddressValidator;
use crate::verify::{DkimVerifier, SpfVerifier};
use anyhow::{anyhow, Context, Result};
use mailhook_common::config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// The inbound mail endpoint
pub struct Mailhook {
    config: Config,
    policy: Option<Arc<dyn AddressPolicy>>,
    session_observers: Vec<Arc<dyn SessionObserver>>,
    message_observers: Vec<Arc<dyn MessageObserver>>,
    dkim: Option<Arc<dyn DkimVerifier>>,
    spf: Option<Arc<dyn SpfVerifier>>,
    scorer: Option<Arc<dyn SpamScorer>>,
}

impl Mailhook {
    /// Create a server from an immutable configuration value
    pub fn new(config: Config) -> Self {
        Self {
            config,
            policy: None,
            session_observers: Vec::new(),
            message_observers: Vec::new(),
            dkim: None,
            spf: None,
            scorer: None,
        }
    }

    /// Register the address/authentication policy
    pub fn policy(mut self, policy: Arc<dyn AddressPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Register a session lifecycle observer
    pub fn session_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.session_observers.push(observer);
        self
    }

    /// Register a finalized-report observer
    pub fn message_observer(mut self, observer: Arc<dyn MessageObserver>) -> Self {
        self.message_observers.push(observer);
        self
    }

    /// Override the DKIM verifier built from the configuration
    pub fn dkim_verifier(mut self, verifier: Arc<dyn DkimVerifier>) -> Self {
        self.dkim = Some(verifier);
        self
    }

    /// Override the SPF verifier built from the configuration
    pub fn spf_verifier(mut self, verifier: Arc<dyn SpfVerifier>) -> Self {
        self.spf = Some(verifier);
        self
    }

    /// Override the spam scorer built from the configuration
    pub fn spam_scorer(mut self, scorer: Arc<dyn SpamScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Bind the listener and start serving.
    ///
    /// A bind failure is fatal and propagates; everything after the bind
    /// runs in background tasks.
    pub async fn start(self) -> Result<Server> {
        let config = self.config;

        let store = Arc::new(mailhook_storage::TempStore::new(&config.storage.tmp_dir)?);

        let mut pipeline = Pipeline::new(store.clone(), &config)?;
        if let Some(dkim) = self.dkim {
            pipeline = pipeline.with_dkim_verifier(dkim);
        }
        if let Some(spf) = self.spf {
            pipeline = pipeline.with_spf_verifier(spf);
        }
        if let Some(scorer) = self.scorer {
            pipeline = pipeline.with_spam_scorer(scorer);
        }
        for observer in &self.session_observers {
            pipeline.add_session_observer(observer.clone());
        }
        for observer in &self.message_observers {
            pipeline.add_message_observer(observer.clone());
        }

        // Reachability probe; never blocks startup
        if let Some(webhook) = pipeline.webhook() {
            let webhook = webhook.clone();
            tokio::spawn(async move { webhook.probe().await });
        }

        let validator = AddressValidator::new(
            !config.validation.disable_dns_validation,
            self.policy.clone(),
        );

        let tls_acceptor = if config.smtp.secure {
            let tls_config = config
                .tls
                .as_ref()
                .ok_or_else(|| anyhow!("smtp.secure requires a [tls] section"))?;
            Some(create_tls_acceptor(tls_config)?)
        } else {
            None
        };

        let host = Arc::new(SessionHost {
            config: config.smtp.clone(),
            store,
            validator,
            policy: self.policy,
            observers: self.session_observers,
            pipeline: Arc::new(pipeline),
        });

        let addr = format!("{}:{}", config.smtp.host, config.smtp.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Could not start server on {}", addr))?;
        let local_addr = listener.local_addr()?;

        info!("SMTP server listening on {}", local_addr);

        let max_connections = config.smtp.max_connections.unwrap_or(100);
        let semaphore = Arc::new(Semaphore::new(max_connections));

        let handle = tokio::spawn(accept_loop(listener, host, semaphore, tls_acceptor));

        Ok(Server { local_addr, handle })
    }
}

async fn accept_loop(
    listener: TcpListener,
    host: Arc<SessionHost>,
    semaphore: Arc<Semaphore>,
    tls_acceptor: Option<TlsAcceptor>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Max connections reached, rejecting {}", peer_addr);
                        continue;
                    }
                };

                let host = host.clone();
                let tls_acceptor = tls_acceptor.clone();

                tokio::spawn(async move {
                    let session = SmtpSession::new(host.clone(), peer_addr);
                    let session_id = session.id().to_string();

                    let result = match tls_acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => session.handle(tls_stream).await,
                            Err(e) => Err(anyhow!("TLS accept failed: {}", e)),
                        },
                        None => session.handle(stream).await,
                    };

                    if let Err(e) = result {
                        error!("Session error from {}: {}", peer_addr, e);
                        for observer in &host.observers {
                            observer.on_error(&session_id, &e.to_string()).await;
                        }
                    }
                    for observer in &host.observers {
                        observer.on_close(&session_id).await;
                    }
                    drop(permit);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// A running server
pub struct Server {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Server {
    /// The bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

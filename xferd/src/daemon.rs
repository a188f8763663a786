use crate::agent::{Agent, Collaborators};
use crate::config::Config;
use crate::protocol::*;
use anyhow::{Context, Result};
use std::future::Future;
use std::time::Instant;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

type Envelope = (Request, oneshot::Sender<Response>);

pub struct Daemon {
    config: Config,
    agent: Agent,
    start_time: Instant,
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self> {
        // Ensure required directories exist
        config.ensure_directories().await?;

        let collaborators = Collaborators::system(&config)?;
        let agent = Agent::new(config.clone(), collaborators).await?;
        Ok(Self::with_agent(config, agent))
    }

    pub fn with_agent(config: Config, agent: Agent) -> Self {
        Self {
            config,
            agent,
            start_time: Instant::now(),
        }
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serves the socket until `shutdown` resolves. Jobs still in flight at
    /// that point are dropped without a notification.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting xferd daemon on socket: {:?}", self.config.socket_path);

        // A result left by a config apply goes out before any new work.
        match self.agent.deliver_pending_apply().await {
            Ok(true) => info!("Delivered result of the config applied before restart"),
            Ok(false) => {}
            Err(e) => warn!("Pending config result not delivered: {:#}", e),
        }

        // Remove existing socket if it exists
        if self.config.socket_path.exists() {
            tokio::fs::remove_file(&self.config.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .with_context(|| format!("Failed to bind to socket: {:?}", self.config.socket_path))?;

        info!("Daemon listening on socket: {:?}", self.config.socket_path);

        let (tx, mut rx) = mpsc::channel::<Envelope>(64);
        let acceptor = tokio::spawn(accept_loop(listener, tx));

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some((request, reply)) = rx.recv() => {
                    let response = self.process_request(request).await;
                    if reply.send(response).is_err() {
                        debug!("Client went away before the response was ready");
                    }
                }
                _ = ticker.tick() => self.agent.poll().await,
                _ = &mut shutdown => {
                    info!("Shutting down with {} job(s) in flight", self.agent.active_jobs());
                    break;
                }
            }
        }

        acceptor.abort();
        if let Err(e) = tokio::fs::remove_file(&self.config.socket_path).await {
            debug!("Socket cleanup: {}", e);
        }
        Ok(())
    }

    async fn process_request(&mut self, request: Request) -> Response {
        match request {
            Request::Submit(command) => match self.agent.submit(command).await {
                Ok(async_key) => Response::InProgress { async_key },
                Err(e) => Response::Rejected {
                    error: format!("{:#}", e),
                },
            },
            Request::Results { limit } => Response::Results {
                notifications: self.agent.recent_results(limit),
            },
            Request::Stats => match self.agent.metrics().export() {
                Ok(metrics) => Response::Stats {
                    active_jobs: self.agent.active_jobs(),
                    metrics,
                },
                Err(e) => Response::Rejected {
                    error: format!("Failed to export metrics: {:#}", e),
                },
            },
            Request::Health => Response::Health {
                healthy: true,
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
            },
        }
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<Envelope>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, tx).await {
                        error!("Client handler error: {:#}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(mut stream: UnixStream, tx: mpsc::Sender<Envelope>) -> Result<()> {
    debug!("New client connected");

    loop {
        let request = match receive_request(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                debug!("Client disconnected or error reading request: {:#}", e);
                break;
            }
        };

        debug!("Received request: {:?}", request);

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((request, reply_tx))
            .await
            .context("Daemon loop has stopped")?;
        let response = reply_rx.await.context("Daemon loop dropped the request")?;

        send_response(&mut stream, &response).await?;
    }

    Ok(())
}

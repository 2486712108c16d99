//! TCP listener and connection lifecycle.
//!
//! Every accepted socket gets a fresh `ConnectionId` and its own task in a
//! `JoinSet`. The router decides between plain HTTP and a WebSocket upgrade.
//! Promoted connections are tracked in `live` so shutdown can close them
//! with 1000 before the tasks are drained.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use agentscope_protocol::ConnectionId;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, ConnectionObserver, LifecycleState};
use crate::http;
use crate::registry_actor::RegistryHandle;
use crate::router::{self, RouteError, Routed};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

struct ServerContext {
    config: ServerConfig,
    registry: RegistryHandle,
    observer: Arc<dyn ConnectionObserver>,
    live: DashMap<ConnectionId, ConnectionHandle>,
    draining: AtomicBool,
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    pub async fn bind(config: ServerConfig, registry: RegistryHandle) -> std::io::Result<Server> {
        let listener = TcpListener::bind(config.bind).await?;
        let observer: Arc<dyn ConnectionObserver> = Arc::new(registry.clone());
        Ok(Server {
            listener,
            ctx: Arc::new(ServerContext {
                config,
                registry,
                observer,
                live: DashMap::new(),
                draining: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then close every live
    /// WebSocket with 1000 and wait (bounded) for the tasks to finish.
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server { listener, ctx } = self;
        info!(
            component = "server",
            event = "server.listening",
            addr = %listener.local_addr()?,
            ws_path = %ctx.config.ws_path,
            "Listening"
        );

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = next_connection_id();
                        debug!(
                            component = "server",
                            event = "server.accepted",
                            connection_id = %id,
                            peer = %peer,
                            "Accepted connection"
                        );
                        tasks.spawn(handle_connection(ctx.clone(), stream, id));
                    }
                    Err(e) => {
                        warn!(
                            component = "server",
                            event = "server.accept_failed",
                            error = %e,
                            "Accept failed"
                        );
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        shutdown_connections(&ctx, &mut tasks).await;
        Ok(())
    }
}

async fn shutdown_connections(ctx: &ServerContext, tasks: &mut JoinSet<()>) {
    ctx.draining.store(true, Ordering::SeqCst);
    let handles: Vec<ConnectionHandle> = ctx.live.iter().map(|e| e.value().clone()).collect();
    info!(
        component = "server",
        event = "server.shutdown.started",
        live_connections = handles.len(),
        pending_tasks = tasks.len(),
        "Shutting down"
    );

    let drain = async {
        futures::future::join_all(handles.iter().map(|h| async move {
            if h.state().await == LifecycleState::Open {
                debug!(
                    component = "server",
                    event = "server.shutdown.closing",
                    connection_id = %h.id(),
                    "Closing connection"
                );
                h.close().await;
            }
        }))
        .await;
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(ctx.config.shutdown_timeout, drain)
        .await
        .is_err()
    {
        warn!(
            component = "server",
            event = "server.shutdown.timeout",
            remaining = tasks.len(),
            "Connections did not finish in time, aborting"
        );
        tasks.shutdown().await;
    }
    info!(
        component = "server",
        event = "server.shutdown.completed",
        "Server stopped"
    );
}

async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream, id: ConnectionId) {
    let _ = stream.set_nodelay(true);
    match router::route(stream, id, &ctx.config, ctx.observer.clone()).await {
        Ok(Routed::WebSocket(connection)) => {
            let handle = connection.handle();
            ctx.live.insert(id, handle.clone());
            // Shutdown may have snapshotted `live` before this insert.
            if ctx.draining.load(Ordering::SeqCst) {
                handle.close().await;
            }
            connection.run().await;
            ctx.live.remove(&id);
        }
        Ok(Routed::Http {
            mut stream,
            request,
        }) => {
            if let Err(e) = http::respond(&mut stream, request, &ctx.config, &ctx.registry).await {
                debug!(
                    component = "server",
                    event = "http.write_failed",
                    connection_id = %id,
                    error = %e,
                    "HTTP response failed"
                );
            }
        }
        Err(RouteError::ClosedEarly) => {}
        Err(e) => {
            debug!(
                component = "server",
                event = "router.rejected",
                connection_id = %id,
                error = %e,
                "Connection dropped before routing"
            );
        }
    }
}

use std::{collections::HashMap, net::SocketAddr};

use empath_tracing::traced;
use serde::Deserialize;
use tokio::{net::TcpListener, sync::broadcast::Receiver};

use crate::{
    Signal, internal,
    error::ListenerError,
    traits::{Protocol, protocol::SessionHandler},
};

/// A single bound address serving one [`Protocol`].
///
/// A [`Controller`](crate::controller::Controller) owns a `Vec` of these;
/// each runs its own accept loop and spawns one task per connection.
#[derive(Deserialize)]
pub struct Listener<Proto: Protocol> {
    socket: SocketAddr,
    #[serde(default)]
    args: Proto::Args,
    /// Read a HAProxy protocol v1 preamble before handing the connection to
    /// `Proto` (`haproxy_incoming`, spec §6), recovering the real peer
    /// address from behind a proxy. Off by default: this bypasses normal
    /// peer discovery, so it's only trusted on listeners explicitly fronted
    /// by such a proxy.
    #[serde(default, alias = "haproxy_incoming")]
    haproxy: bool,
    #[serde(skip)]
    handler: Proto,
}

impl<Proto: Protocol> Listener<Proto> {
    /// Validate this listener's protocol arguments.
    ///
    /// # Errors
    /// Propagates any [`ProtocolError`](crate::error::ProtocolError) raised
    /// by `Proto::validate`.
    pub fn init(&mut self) -> anyhow::Result<()> {
        internal!("Initialising {} listener on {}", Proto::ty(), self.socket);
        self.handler.validate(&mut self.args)?;
        Ok(())
    }

    /// Replace this listener's arguments, e.g. to inject a shared resource
    /// (spool handle, alias resolver) constructed after deserialization.
    pub fn map_args(&mut self, f: &impl Fn(Proto::Args) -> Proto::Args) {
        let args = std::mem::take(&mut self.args);
        self.args = f(args);
    }

    /// Accept connections until a shutdown signal arrives, spawning one
    /// task per connection that runs that protocol's session to completion.
    ///
    /// # Errors
    /// Returns a [`ListenerError`] if the socket cannot be bound, or if
    /// accepting a connection fails in a way that is not itself recoverable
    /// (individual per-connection failures are logged, not propagated).
    #[traced(instrument(level = tracing::Level::TRACE, skip(self, shutdown)), timing(precision = "s"))]
    pub async fn serve(&self, mut shutdown: Receiver<Signal>) -> anyhow::Result<()> {
        let listener =
            TcpListener::bind(self.socket)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: self.socket.to_string(),
                    source,
                })?;

        internal!("{} listener bound on {}", Proto::ty(), self.socket);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((mut stream, mut peer)) => {
                            if self.haproxy {
                                match crate::haproxy::read_v1_preamble(&mut stream).await {
                                    Ok(real_peer) => peer = real_peer,
                                    Err(err) => {
                                        tracing::warn!(%peer, %err, "rejecting connection with invalid HAProxy preamble");
                                        continue;
                                    }
                                }
                            }

                            let session = self.handler.handle(
                                stream,
                                peer,
                                HashMap::new(),
                                self.args.clone(),
                            );
                            let session_shutdown = shutdown.resubscribe();
                            tokio::spawn(async move {
                                if let Err(err) = session.run(session_shutdown).await {
                                    tracing::warn!(error = %err, "session ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to accept connection");
                        }
                    }
                }
                signal = shutdown.recv() => {
                    match signal {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("{} listener on {} shutting down", Proto::ty(), self.socket);
                            break;
                        }
                        Ok(Signal::Reload) => continue,
                        Err(err) => {
                            tracing::error!(error = %err, "listener shutdown channel error");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

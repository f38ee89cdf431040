use std::{collections::HashMap, fmt::Debug, net::SocketAddr};

use serde::Deserialize;
use tokio::net::TcpStream;

use crate::{
    Signal,
    error::{ProtocolError, SessionError},
};

/// A protocol session: the thing a [`Listener`](crate::listener::Listener)
/// spawns a task around for each accepted connection.
pub trait SessionHandler {
    fn run(
        self,
        signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;
}

/// A wire protocol servable by [`Controller`](crate::controller::Controller).
///
/// Implementors describe how to turn an accepted [`TcpStream`] into a
/// [`Self::Session`], and how to validate/fix up their configuration once at
/// startup (e.g. checking that a configured TLS certificate exists).
pub trait Protocol: Default + Send + Sync {
    type Session: SessionHandler + Send + Sync + 'static;
    type Args: Default + Clone + Debug + Send + Sync + for<'a> Deserialize<'a>;

    /// A short human-readable name for this protocol, used in logs.
    fn ty() -> &'static str;

    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        init_context: HashMap<String, String>,
        args: Self::Args,
    ) -> Self::Session;

    /// Validate (and possibly normalise) this protocol's arguments once,
    /// before any listener is bound.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the configuration is invalid.
    fn validate(&mut self, args: &mut Self::Args) -> Result<(), ProtocolError>;
}

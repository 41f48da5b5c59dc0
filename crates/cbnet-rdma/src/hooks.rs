//! Application callbacks.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use cbnet_logging::{LogHandler, LogLevel};
use cbnet_types::NetworkDescriptor;

/// Opaque per-connection or per-server application data.
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Connection notification: descriptor plus the connection's user context.
pub type ConnCallback = Arc<dyn Fn(NetworkDescriptor, Option<UserContext>) + Send + Sync>;

/// Invoked when an accepted connection becomes usable, with the server's
/// context. The returned value becomes the connection's user context.
pub type AcceptCallback =
    Arc<dyn Fn(NetworkDescriptor, Option<UserContext>) -> Option<UserContext> + Send + Sync>;

pub fn accept_callback<F>(f: F) -> AcceptCallback
where
    F: Fn(NetworkDescriptor, Option<UserContext>) -> Option<UserContext> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Process-wide hooks registered at `Environment::init`.
#[derive(Clone, Default)]
pub struct Hooks {
    disconnected: Option<ConnCallback>,
    error: Option<ConnCallback>,
    closed: Option<ConnCallback>,
    log: Option<LogHandler>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires at most once per connection, when its link goes down.
    pub fn on_disconnected<F>(mut self, f: F) -> Self
    where
        F: Fn(NetworkDescriptor, Option<UserContext>) + Send + Sync + 'static,
    {
        self.disconnected = Some(Arc::new(f));
        self
    }

    /// Fires when the data path reports an error through
    /// `Environment::report_error`.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(NetworkDescriptor, Option<UserContext>) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    /// Fires once when a connection is finalized.
    pub fn on_closed<F>(mut self, f: F) -> Self
    where
        F: Fn(NetworkDescriptor, Option<UserContext>) + Send + Sync + 'static,
    {
        self.closed = Some(Arc::new(f));
        self
    }

    pub fn log_sink<F>(mut self, f: F) -> Self
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.log = Some(Arc::new(f));
        self
    }

    pub(crate) fn log_handler(&self) -> Option<LogHandler> {
        self.log.clone()
    }

    pub(crate) fn disconnected(&self, nd: NetworkDescriptor, ctx: Option<UserContext>) {
        if let Some(f) = &self.disconnected {
            f(nd, ctx);
        }
    }

    pub(crate) fn error(&self, nd: NetworkDescriptor, ctx: Option<UserContext>) {
        if let Some(f) = &self.error {
            f(nd, ctx);
        }
    }

    pub(crate) fn closed(&self, nd: NetworkDescriptor, ctx: Option<UserContext>) {
        if let Some(f) = &self.closed {
            f(nd, ctx);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("disconnected", &self.disconnected.is_some())
            .field("error", &self.error.is_some())
            .field("closed", &self.closed.is_some())
            .field("log", &self.log.is_some())
            .finish()
    }
}

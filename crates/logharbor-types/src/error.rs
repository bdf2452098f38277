use thiserror::Error;

/// Error kinds that cross a public API boundary. Transient failures
/// handled entirely inside a stream (backoff-and-reconnect, lock loss,
/// shared-cache write failures) never become one of these — they are
/// logged via `tracing` and retried instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The requested app could not be resolved to a selector. Surfaced to
    /// the caller only on the *initial* reconciliation; later occurrences
    /// become an `error` marker instead.
    #[error("app '{app}' not found in namespace '{namespace}'")]
    AppNotFound { namespace: String, app: String },

    /// A subscribe request was missing a required option (e.g. no log
    /// options supplied to the app-stream pool).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Wraps a transient failure from a resource-inventory call that is
    /// being reported upward rather than retried locally (e.g. during the
    /// initial reconciliation, before there is a stream to attach markers
    /// to).
    #[error("resource inventory error: {0}")]
    ResourceInventory(#[source] anyhow::Error),
}

use async_trait::async_trait;

pub mod default;
pub mod pubsub;
pub mod stats;

/// A pluggable bundle of commands. Backends register their handlers at
/// construction; the server calls `load` when the backend is attached and
/// `unload` during shutdown, in registration order.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn load(&self) -> crate::Result<()>;
    async fn unload(&self) -> crate::Result<()>;
}

/// Adapts an async backend method into a registrable [`crate::command::Handler`].
macro_rules! handler {
    ($backend:expr, $method:ident) => {{
        let backend = $backend.clone();
        std::sync::Arc::new(
            move |args: Vec<$crate::value::Value>,
                  client: $crate::connection::ConnectionHandle|
                  -> $crate::command::HandlerFuture {
                let backend = backend.clone();
                Box::pin(async move { backend.$method(args, client).await })
            },
        ) as $crate::command::Handler
    }};
}
pub(crate) use handler;

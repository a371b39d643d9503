use clap::Parser;
use tracing::{error, info};

use fanout::backends::default::DefaultBackend;
use fanout::backends::pubsub::PubSubBackend;
use fanout::backends::stats::StatsBackend;
use fanout::codec::CodecKind;
use fanout::event::{Event, Level};
use fanout::server::{Server, ServerConfig};
use fanout::Error;

const PORT: u16 = 7331;

#[derive(Parser, Debug)]
struct Args {
    /// The host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// The port to listen on
    #[arg(short, long, default_value_t = PORT)]
    port: u16,

    /// The request framing spoken on this listener
    #[arg(long, value_enum, default_value_t = CodecKind::Bulk)]
    codec: CodecKind,

    /// Enable the stats backend (counters, values, sets)
    #[arg(long)]
    stats: bool,

    /// Enable the pub/sub backend (SUBSCRIBE, UNSUBSCRIBE, PUBLISH)
    #[arg(long)]
    pubsub: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    tracing_subscriber::fmt().init();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        codec: args.codec,
    };
    let (server, mut events) = Server::bind(config).await?;

    // The core pushes events synchronously; keep a consumer running for the
    // whole process lifetime.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(event);
        }
    });

    server
        .load_backend(DefaultBackend::register(&server))
        .await?;
    if args.stats {
        server.load_backend(StatsBackend::register(&server)).await?;
    }
    if args.pubsub {
        server
            .load_backend(PubSubBackend::register(&server))
            .await?;
    }

    info!(
        "fanout server listening on {} ({} codec)",
        server.addr(),
        args.codec
    );

    tokio::spawn(server.clone().accept_connections());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.close().await;
    server.wait_quit().cancelled().await;

    Ok(())
}

fn log_event(event: Event) {
    match event.level {
        Level::Info | Level::Close => info!("{}", event),
        Level::Error => error!("{}", event),
        Level::Fatal => {
            error!("{}", event);
            if let Some(stack) = &event.stack {
                error!("{}", stack);
            }
        }
    }
}

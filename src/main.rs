//! Snapdelta: changed-block delta tracking service.
//!
//! Serves the delta record API and proxies changed-block enrichment to
//! registered storage driver backends.

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use snapdelta::{Args, Config, DeltaServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Parse command-line arguments
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug {
        Level::DEBUG
    } else if args.silent {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Create configuration from arguments
    let config = Config::from(args);

    // Create and run the server
    let server = DeltaServer::new(config);

    println!(
        r#"
Delta tracking service is starting at {}

API prefix: {}/apis/snapdelta/v1

Press Ctrl+C to stop the server.
"#,
        server.bind_address(),
        server.base_url()
    );

    server.run().await
}

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tube_grab=info,tower_http=info")),
        )
        .init();

    if let Err(error) = tube_grab::server::run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

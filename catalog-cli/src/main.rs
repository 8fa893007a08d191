use catalog_cli::cmd;
use tracing::info;

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    match cmd::Cli::run().await {
        Ok(()) => info!("done"),
        Err(e) => {
            eprintln!("Error: {e}");

            let mut causes = e.chain().skip(1).peekable();
            if causes.peek().is_some() {
                eprintln!("\nCaused by:");
                for (index, cause) in causes.enumerate() {
                    eprintln!("    {index}: {cause}");
                }
            }
            std::process::exit(1);
        }
    }
}

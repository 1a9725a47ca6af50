use tracing::error;
use upstream_guard_cli::run_cli;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!(error = %e, "CLI error");
        eprintln!("error: {}", e);

        std::process::exit(e.exit_code());
    }
}

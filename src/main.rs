//! Conciliar CLI — declarative reconciliation engine.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "conciliar",
    version,
    about = "Declarative reconciliation engine — dependency-aware planning, BLAKE3 fingerprints, resumable applies"
)]
struct Cli {
    #[command(subcommand)]
    command: conciliar::cli::Commands,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conciliar=info")),
        )
        .init();

    let cli = Cli::parse();
    match conciliar::cli::dispatch(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

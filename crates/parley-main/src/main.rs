use std::io::Read;
use std::path::PathBuf;

use clap::Parser;
use parley_main::config::{default_config_path, load_config};
use parley_main::logging::init_tracing;
use parley_main::{AppError, run_prompt};

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "stream a tool-using chat from the terminal")]
struct Cli {
    /// Path to parley.toml (defaults to ~/.parley/parley.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Prompt text; read from stdin when omitted.
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&path)?;
    init_tracing(&config.log);

    let prompt = if cli.prompt.is_empty() {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input)?;
        input.trim().to_string()
    } else {
        cli.prompt.join(" ")
    };
    run_prompt(config, prompt).await
}

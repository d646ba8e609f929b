use clap::Parser;
use slack_export::{Cli, Commands, commands};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slack_export=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    // Ignored when another provider was installed first.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    let settings = cli.settings.as_str();

    let result = match cli.command {
        Commands::Export { channels } => commands::run_export(settings, channels).await,
        Commands::ExportChannel { channel } => commands::run_export_channel(settings, &channel).await,
        Commands::Channels => commands::run_channels(settings).await,
        Commands::State => commands::run_state(settings).await,
        Commands::ResetState => commands::run_reset_state(settings).await,
        Commands::MdToHtml { input, output } => commands::run_md_to_html(&input, output.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

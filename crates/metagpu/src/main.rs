use anyhow::Result;
use clap::Parser;
use metagpu::app::ApplicationBuilder;
use metagpu::config::Cli;
use metagpu::config::Commands;
use metagpu::config::StartArgs;
use utils::logging;
use utils::logging::LogOptions;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_plugin(*args).await,
        Commands::Version => {
            println!("metagpu-device-plugin {}", &**version::VERSION);
            println!("build sha: {}", version::BUILD_SHA);
            Ok(())
        }
    }
}

async fn run_plugin(args: StartArgs) -> Result<()> {
    logging::init(LogOptions {
        json: args.json_log,
        verbose: args.verbose,
    });

    tracing::info!("Starting metagpu device plugin {}", &**version::VERSION);

    let app = ApplicationBuilder::new(args).build().await?;

    let result = app.run().await;
    app.shutdown().await?;

    result
}

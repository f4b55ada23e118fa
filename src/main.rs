use clap::Parser;
use redub::cli;
use redub::config::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "redub",
    version,
    about = "Offline media dubbing: translate speech while preserving the speaker's voice"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the operation server (daemon mode)
    Serve {
        /// Unix socket path to listen on
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Translate one media file and wait for the result
    Translate {
        /// Input video or audio file
        input: PathBuf,
        /// Source language code, or "auto" to detect
        #[arg(long, default_value = "auto")]
        source_lang: String,
        /// Target language code
        #[arg(long)]
        target_lang: String,
        /// Skip speaker diarization
        #[arg(long)]
        single_speaker: bool,
        /// Pause for editing after a checkpoint (step4 or step5)
        #[arg(long)]
        pause_after: Option<String>,
    },
    /// List known tasks and their states
    Tasks,
    /// Print one task's status manifest
    Status {
        /// Task id (directory name under the tasks root)
        task_id: String,
    },
}

#[tokio::main]
async fn main() {
    redub::logging::init();

    let args = Cli::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("redub.toml"));
    let config = Config::load_or_default(&config_path).with_env_overrides();

    let result = match args.command {
        Commands::Serve { socket } => cli::serve(config, socket).await,
        Commands::Translate {
            input,
            source_lang,
            target_lang,
            single_speaker,
            pause_after,
        } => {
            let pause_after = match pause_after.as_deref().map(cli::parse_pause_after) {
                Some(Ok(p)) => Some(p),
                Some(Err(e)) => {
                    eprintln!("redub: {e}");
                    std::process::exit(2);
                }
                None => None,
            };
            cli::translate(
                config,
                input,
                source_lang,
                target_lang,
                single_speaker,
                pause_after,
            )
            .await
        }
        Commands::Tasks => cli::tasks(config),
        Commands::Status { task_id } => cli::status(config, &task_id),
    };

    if let Err(e) = result {
        eprintln!("redub: {e}");
        std::process::exit(1);
    }
}

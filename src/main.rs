use clap::{Parser, ValueEnum};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use tfrc::inspect::{self, Hidden};
use tfrc::{ProcManager, TelegramFramer, TfrcConfig, TfrcDriver};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Action {
    /// Display each block and how its lines were parsed
    ShowPackets,
    /// Display a running count of the detected sensors
    ShowDetected,
    /// List the supported packet types
    ListSupported,
    /// Print mapped records as JSON lines
    Run,
}

#[derive(Parser, Debug)]
#[command(version, about = "Collect data from tfrec")]
struct Args {
    /// Config file, defaults to config/tfrc.yaml or tfrc.yaml
    #[arg(long)]
    config: Option<PathBuf>,
    /// Display diagnostic information while running
    #[arg(long)]
    debug: bool,
    /// tfrec command with options
    #[arg(long)]
    cmd: Option<String>,
    /// Prepended to PATH
    #[arg(long)]
    path: Option<String>,
    /// Value for LD_LIBRARY_PATH
    #[arg(long)]
    ld_library_path: Option<String>,
    /// Output to be hidden: out, parsed, unparsed, empty
    #[arg(long, default_value = "empty")]
    hide: String,
    #[arg(long, value_enum, default_value_t = Action::ShowPackets)]
    action: Action,
}

fn load_config(args: &Args) -> Result<TfrcConfig, tfrc::config::ConfigError> {
    let mut config = match &args.config {
        Some(p) => TfrcConfig::load(Some(p.as_path()))?,
        None => TfrcConfig::load(None).unwrap_or_else(|e| {
            info!("{e}, using defaults");
            TfrcConfig::default()
        }),
    };

    if let Some(cmd) = &args.cmd {
        config.cmd = cmd.clone();
    }
    if args.path.is_some() {
        config.path = args.path.clone();
    }
    if args.ld_library_path.is_some() {
        config.ld_library_path = args.ld_library_path.clone();
    }
    Ok(config)
}

async fn run(config: &TfrcConfig) -> Result<(), tfrc::DriverError> {
    let mut driver = TfrcDriver::start(config).await?;
    loop {
        tokio::select! {
            record = driver.next_record() => match record {
                Ok(record) => println!("{record}"),
                Err(e) => {
                    driver.close_port().await;
                    return Err(e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, {:?}", driver.stats());
                driver.close_port().await;
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let default_filter = match args.debug {
        true => "debug".to_string(),
        false => std::env::var("TFRC_LOG_LEVEL").unwrap_or("info".to_string()),
    };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Action::ListSupported = args.action {
        if let Err(e) = inspect::list_supported(&mut std::io::stdout()) {
            error!("{e}");
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    if let Action::Run = args.action {
        return match run(&config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    let mut mgr = match ProcManager::startup(&config.cmd, config.path.as_deref(), config.ld_library_path.as_deref()).await {
        Ok(m) => m,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let mut framer = TelegramFramer::new(config.poll_timeout(), config.cycle_limit());
    let mut out = std::io::stdout();

    let res = match args.action {
        Action::ShowDetected => inspect::show_detected(&mut mgr, &mut framer, &mut out).await.map(|_| ()),
        _ => inspect::show_packets(&mut mgr, &mut framer, &Hidden::from_list(&args.hide), &mut out).await,
    };
    mgr.shutdown().await;

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

use std::{error::Error, path::PathBuf, sync::Arc};

use tracing::info;
use tracing_subscriber::EnvFilter;

use warden::{
    cli::{Cli, Commands, parse_args},
    daemon::{Daemon, DaemonOptions},
    store::PlanStore,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run { dir } => {
            let daemon = Daemon::new(DaemonOptions {
                dir: PathBuf::from(dir),
                sink: None,
                reaper: None,
            });

            let signal_target = Arc::clone(&daemon);
            ctrlc::set_handler(move || {
                info!("received termination signal");
                signal_target.shutdown();
            })?;

            daemon.run()?;
            Ok(())
        }
        Commands::Validate { dir } => {
            let store = PlanStore::new();
            let plan = store.load(&PathBuf::from(dir))?;
            print!("{}", plan.to_yaml()?);
            Ok(())
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = match args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

mod child;
mod config;
mod error_relay;
mod reactor;
mod shutdown;
mod signals;
mod watchdog;
mod window;

#[cfg(test)]
mod test_support;

use child::{ChildCommand, ChildSpec, SpawnError};
use clap::Parser;
use config::{ConfigError, HostConfig, APP_NAME};
use reactor::{EventLoop, Reactor};
use std::path::PathBuf;
use std::process::ExitCode;
use window::{ConsoleSurface, HostError, HostWindow, WindowIdentity};

/// Terminal host launcher: starts the shell (or a given command), then keeps
/// a window alive for exactly as long as the child runs.
#[derive(Parser, Debug)]
#[command(name = "termhost", version, about)]
pub struct Cli {
    /// Set the name part of the window class
    #[arg(long, default_value = APP_NAME)]
    name: String,

    /// Set the class part of the window class
    #[arg(long = "class", default_value = APP_NAME)]
    class: String,

    /// Config file path (default: $XDG_CONFIG_HOME/termhost/termhost.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the specified command instead of the shell
    #[arg(short = 'e', long = "exec", value_name = "COMMAND")]
    exec: Option<String>,

    /// Change to the specified directory when launching
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// Resolve config and child command, print them, don't launch
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (signal drains, teardown steps)
    #[arg(short, long)]
    verbose: bool,
}

/// Fatal startup errors.
#[derive(Debug)]
enum StartupError {
    Config(ConfigError),
    Spawn(SpawnError),
    Runtime(std::io::Error),
    Host(HostError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{e}"),
            StartupError::Spawn(e) => write!(f, "{e}"),
            StartupError::Runtime(e) => write!(f, "failed to start event loop: {e}"),
            StartupError::Host(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Config(e) => Some(e),
            StartupError::Spawn(e) => Some(e),
            StartupError::Runtime(e) => Some(e),
            StartupError::Host(e) => Some(e),
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// `--exec` wins, then the configured shell, then the login shell.
fn child_command(cli: &Cli, config: &HostConfig) -> ChildCommand {
    match &cli.exec {
        Some(command) => ChildCommand::parse(command),
        None => {
            let shell = config
                .child
                .shell
                .clone()
                .unwrap_or_else(child::login_shell);
            ChildCommand::Program(shell.to_string_lossy().into_owned())
        }
    }
}

fn run(cli: Cli) -> Result<(), StartupError> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let config = config::load(&config_path).map_err(StartupError::Config)?;
    let spec = ChildSpec {
        command: child_command(&cli, &config),
        directory: cli.directory.clone(),
        env: config.child.env.policy(),
    };
    let identity = WindowIdentity {
        name: cli.name.clone(),
        class: cli.class.clone(),
    };

    if cli.dry_run {
        let resolved = serde_json::json!({
            "config_file": config_path,
            "window": identity,
            "child": {
                "argv": spec.command.argv(),
                "directory": spec.directory,
            },
            "config": config,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&resolved).unwrap_or_else(|e| e.to_string())
        );
        return Ok(());
    }

    // The child must exist before the runtime (and its threads, descriptors
    // and window state) does.
    let child = child::spawn(&spec).map_err(StartupError::Spawn)?;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            child.hang_up();
            return Err(StartupError::Runtime(e));
        }
    };

    runtime.block_on(async move {
        let mut event_loop = EventLoop::new();
        let surface = Box::new(ConsoleSurface::new(identity));
        let mut host = HostWindow::new(config, child, surface, &mut event_loop)
            .map_err(StartupError::Host)?;

        if let Some(watchdog) = host.child_watchdog() {
            tokio::spawn(watchdog.monitor(event_loop.dispatcher()));
        }

        host.present();
        event_loop.run(&mut host).await;
        tracing::debug!(state = ?host.state(), "host finished");
        Ok::<(), StartupError>(())
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("{APP_NAME}: {e}");
            ExitCode::FAILURE
        }
    }
}

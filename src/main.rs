use human_bytes::human_bytes;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nzb_fetch::{
    cli::{messages, Cli, Commands},
    config::Config,
    download::{is_par2, Nzb},
    error::{ConfigError, Result},
    nntp::{tls_connector, NntpConnection, NntpSession},
    progress::{ProgressDisplay, Severity, Snapshot, Stage},
    Referential,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_and_validate();

    // Load configuration (auto-creates if it doesn't exist)
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_overrides(cli.get_config_overrides());
    config.validate()?;

    init_logging(&cli, &config)?;

    if let Some(command) = &cli.command {
        return handle_command(command, &config).await;
    }

    if cli.list {
        return handle_list_mode(&cli);
    }

    if cli.files.is_empty() {
        eprintln!("{}", messages::NO_FILES);
        return Ok(());
    }

    handle_download_mode(&cli, config).await
}

/// Initialize logging from the CLI flags, falling back to the configured level
fn init_logging(cli: &Cli, config: &Config) -> Result<()> {
    let level = if cli.quiet || cli.verbose > 0 || cli.log_level.is_some() {
        cli.get_log_level()
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if let Some(log_file) = cli.log_file.as_ref().or(config.logging.file.as_ref()) {
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        subscriber.with_ansi(false).with_writer(file).init();
    } else if cli.quiet {
        subscriber.without_time().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Handle subcommands
async fn handle_command(command: &Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Test => {
            config.validate_for_download()?;
            println!("Testing connection to {}...", config.usenet.server);

            let connector = if config.usenet.ssl {
                Some(Arc::new(tls_connector(&config.usenet)?))
            } else {
                None
            };
            let mut conn = NntpConnection::new(Arc::new(config.usenet.clone()), connector);

            match conn.connect().await {
                Ok(()) => {
                    println!("✓ Successfully connected to {}", config.usenet.server);
                    if !config.usenet.username.is_empty() {
                        println!("   Authentication: OK");
                    }
                    let _ = conn.end().await;
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Connection failed: {}", e);
                    Err(e)
                }
            }
        }

        Commands::Config => {
            let config_path = Config::config_path()?;
            println!("Configuration file location:");
            println!("  {}", config_path.display());
            println!();

            println!("Effective configuration:");
            println!("{}", "─".repeat(60));
            let mut shown = config.clone();
            if !shown.usenet.password.is_empty() {
                shown.usenet.password = "<REDACTED>".to_string();
            }
            let toml = toml::to_string_pretty(&shown).map_err(|e| {
                ConfigError::ParseError(format!("Failed to serialize config: {}", e))
            })?;
            println!("{}", toml);
            println!("{}", "─".repeat(60));
            Ok(())
        }
    }
}

/// Handle list mode
fn handle_list_mode(cli: &Cli) -> Result<()> {
    for nzb_path in &cli.files {
        println!("\n{}", nzb_path.display());
        println!("{}", "─".repeat(50));

        let nzb = Nzb::from_file(nzb_path)?;
        println!("Total files: {}", nzb.files().len());
        println!("Total size: {}", human_bytes(nzb.total_size() as f64));
        println!("Total segments: {}", nzb.total_segments());

        println!("\nFiles:");
        for file in nzb.files() {
            let filename = file.filename();
            let file_type = if is_par2(Path::new(&filename)) {
                "PAR2"
            } else {
                "DATA"
            };
            println!(
                "  [{:4}] {} ({})",
                file_type,
                filename,
                human_bytes(file.total_size() as f64)
            );
        }
    }

    Ok(())
}

/// Register every NZB, follow progress until all groups settle or Ctrl-C, then shut down
async fn handle_download_mode(cli: &Cli, config: Config) -> Result<()> {
    config.validate_for_download()?;
    config.ensure_dirs()?;

    let referential = Referential::from_config(&config)?;
    if referential.add_files(&cli.files) == 0 {
        eprintln!("Nothing to download.");
        referential.shutdown().await;
        return Ok(());
    }

    let mut display = (!cli.quiet && !cli.json).then(ProgressDisplay::new);
    let mut changes = referential.subscribe();

    let idle = referential.wait_idle();
    tokio::pin!(idle);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut idle => break,
            _ = &mut ctrl_c => {
                eprintln!("Interrupted, stopping downloads...");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(display) = display.as_mut() {
                    display.render(&referential.snapshot());
                }
            }
        }
    }

    referential.shutdown().await;

    let snapshot = referential.snapshot();
    if let Some(display) = display.as_mut() {
        display.render(&snapshot);
        display.finish(&snapshot);
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&snapshot).map_err(std::io::Error::other)?;
        println!("{}", json);
    }

    print_final_summary(&snapshot, &config.download.dir);
    if snapshot.groups.iter().any(|g| g.progress.stage != Stage::Done) {
        std::process::exit(1);
    }
    Ok(())
}

/// Print a final summary after all processing is complete
fn print_final_summary(snapshot: &Snapshot, download_root: &Path) {
    let done: Vec<_> = snapshot
        .groups
        .iter()
        .filter(|g| g.progress.stage == Stage::Done)
        .collect();
    let total_size: u64 = done.iter().map(|g| g.total_bytes).sum();
    let with_errors = done
        .iter()
        .filter(|g| g.files.iter().any(|f| f.progress.severity == Severity::Error))
        .count();

    eprintln!();
    if done.len() == snapshot.groups.len() && with_errors == 0 {
        eprintln!("\x1b[1;32m✓ Complete:\x1b[0m {} NZB(s)", done.len());
    } else {
        eprintln!(
            "\x1b[1;33m! {} of {} NZB(s) complete, {} with errors\x1b[0m",
            done.len(),
            snapshot.groups.len(),
            with_errors
        );
    }
    eprintln!("  \x1b[90m└─\x1b[0m \x1b[34m{}\x1b[0m", download_root.display());
    eprintln!(
        "  \x1b[90m└─\x1b[0m \x1b[36m{}\x1b[0m",
        human_bytes(total_size as f64)
    );
}

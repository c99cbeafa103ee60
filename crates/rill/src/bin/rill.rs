use clap::{Arg, ArgMatches, Command};
use rill::config::{Mode, RenderConfig};
use rill::error::RillError;
use rill::render::{PostponedState, RenderOptions};
use rill::streaming::{render_to_stream, resume_to_stream};
use rill::tree::TreeDef;
use rill::wire_format::apply_patches;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let matches = Command::new("rill")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Stream a render tree as HTML with out-of-order boundaries")
        .arg(
            Arg::new("tree")
                .value_name("TREE")
                .help("Render tree file (.json or .toml)")
                .required(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Render config TOML file"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Render mode: development or production")
                .value_parser(["development", "dev", "production", "prod"]),
        )
        .arg(
            Arg::new("identifier-prefix")
                .long("identifier-prefix")
                .value_name("PREFIX")
                .help("Prefix for emitted boundary and segment ids"),
        )
        .arg(
            Arg::new("abort-after-ms")
                .long("abort-after-ms")
                .value_name("MS")
                .help("Abort the render after this many milliseconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("resume")
                .long("resume")
                .value_name("FILE")
                .help("Resume from a postponed state written by --postponed-out"),
        )
        .arg(
            Arg::new("postponed-out")
                .long("postponed-out")
                .value_name("FILE")
                .help("Write the postponed state here if anything was postponed"),
        )
        .arg(
            Arg::new("patched")
                .long("patched")
                .help("Print the document with every patch applied instead of the raw stream")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Reduce log output")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    init_logging(&matches)?;

    let config = load_configuration(&matches)?;
    let tree_path = matches
        .get_one::<String>("tree")
        .ok_or_else(|| RillError::configuration("Tree argument is required"))?;
    let node = TreeDef::load(tree_path)?.into_node();
    let options = RenderOptions::new(config);

    let mut stream = match matches.get_one::<String>("resume") {
        Some(path) => {
            let state = PostponedState::from_json(&std::fs::read_to_string(path)?)?;
            info!("Resuming request {} from {}", state.request_id, path);
            resume_to_stream(state, node, options).await?
        }
        None => render_to_stream(node, options).await.map_err(|e| {
            error!("Shell failed: {}", e);
            e
        })?,
    };
    let handle = stream.handle().clone();

    if let Some(&ms) = matches.get_one::<u64>("abort-after-ms") {
        let abort_handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if let Err(e) = abort_handle.abort(RillError::aborted(format!("Render aborted after {ms}ms"))).await {
                debug!("Abort skipped: {}", e);
            }
        });
    }

    let patched = matches.get_flag("patched");
    let mut document = String::new();
    let mut stdout = std::io::stdout();

    while let Some(chunk) = stream.next_chunk().await {
        let chunk = chunk?;
        if patched {
            document.push_str(&String::from_utf8_lossy(&chunk));
        } else {
            stdout.write_all(&chunk)?;
            stdout.flush()?;
        }
    }

    if patched {
        stdout.write_all(apply_patches(&document)?.as_bytes())?;
    }
    stdout.write_all(b"\n")?;
    stdout.flush()?;

    if let Some(path) = matches.get_one::<String>("postponed-out") {
        match handle.snapshot_for_resume().await? {
            Some(state) => {
                std::fs::write(path, state.to_json()?)?;
                info!("Wrote postponed state for {} boundaries to {}", state.unresolved_boundaries.len(), path);
            }
            None => info!("Nothing was postponed"),
        }
    }

    let progress = handle.finished().await;
    info!("Request {} finished: {}", handle.request_id(), progress.status);

    Ok(())
}

fn init_logging(matches: &ArgMatches) -> Result<(), RillError> {
    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("rill={default_level}")))
        .map_err(|e| RillError::configuration(format!("Failed to create log filter: {e}")))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(verbose)
                .with_line_number(verbose)
                .compact(),
        )
        .init();

    Ok(())
}

fn load_configuration(matches: &ArgMatches) -> Result<RenderConfig, RillError> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => RenderConfig::from_file(path)?,
        None => match RenderConfig::from_env() {
            Ok(config) => config,
            Err(e) => {
                error!("Invalid environment config, using defaults: {}", e);
                RenderConfig::default()
            }
        },
    };

    if let Some(mode) = matches.get_one::<String>("mode") {
        config.mode = mode.parse::<Mode>()?;
        if config.mode == Mode::Production && config.work_budget.is_none() {
            config.work_budget = RenderConfig::production().work_budget;
        }
    }

    if let Some(prefix) = matches.get_one::<String>("identifier-prefix") {
        config.identifier_prefix.clone_from(prefix);
    }

    config.validate()?;
    Ok(config)
}

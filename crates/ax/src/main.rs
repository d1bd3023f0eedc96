//! ax - accessibility automation CLI
//!
//! Query, discover, act on and observe UI elements of running applications.
//! Every command prints the same `{success, data, error}` JSON wrapper.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axkit_core::error::Error;
use axkit_core::ids::parse_id;
use axkit_core::observer::ObserveRequest;
use axkit_core::orchestrator::NEW_SESSION;
use axkit_core::platform::memory::{Fixture, MemoryTree};
use axkit_core::platform::{self, AccessibilityEngine};
use axkit_core::prelude::*;
use axkit_core::{Notification, Point, Response};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ax")]
#[command(about = "ax - query, act on and observe macOS UI elements")]
#[command(version)]
struct Cli {
    /// Serve a recorded tree from a JSON fixture instead of the live desktop
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session store directory
    #[arg(long, global = true)]
    session_root: Option<PathBuf>,

    /// More logging on stderr (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List running applications
    Apps,

    /// Check/request accessibility permission
    Permissions {
        /// Request if not granted
        #[arg(long)]
        request: bool,
    },

    /// Find all elements matching a locator
    Query {
        /// Locator (e.g., "role:AXButton AND title~:save")
        locator: String,

        /// Application: name, bundle id, PID:<n> or "focused"
        #[arg(long, default_value = "focused")]
        app: String,

        /// Path hint to narrow the search root (e.g., "role:AXWindow@2"), repeatable
        #[arg(long)]
        path: Vec<String>,

        /// Extra attributes to return, repeatable
        #[arg(long = "attr")]
        attributes: Vec<String>,

        /// Maximum search depth
        #[arg(long)]
        depth: Option<usize>,

        /// Time budget in milliseconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Include subrole, description and actions
        #[arg(long)]
        full: bool,
    },

    /// Discover elements and assign short ids (B1, T2, ...)
    Collect {
        /// Optional locator to filter discovered elements
        locator: Option<String>,

        /// Application: name, bundle id, PID:<n> or "focused"
        #[arg(long, default_value = "focused")]
        app: String,

        /// Store the batch in a session ("new" to create one)
        #[arg(long)]
        session: Option<String>,

        /// Screenshot to keep with the session
        #[arg(long)]
        screenshot: Option<PathBuf>,

        #[arg(long)]
        depth: Option<usize>,

        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        full: bool,
    },

    /// Perform an action on one element
    Action {
        /// Action name (press, confirm, showMenu, setValue, or any AX action)
        action: String,

        /// Locator of the target element
        #[arg(long, conflicts_with = "id")]
        locator: Option<String>,

        /// Element id from a discovery batch (e.g., B1)
        #[arg(long)]
        id: Option<String>,

        /// Session holding the element id (most recent when omitted)
        #[arg(long)]
        session: Option<String>,

        #[arg(long, default_value = "focused")]
        app: String,

        /// Value for setValue
        #[arg(long)]
        value: Option<String>,
    },

    /// Show the focused element
    Focused {
        #[arg(long)]
        full: bool,
    },

    /// Hit-test a screen point
    At {
        x: f64,
        y: f64,

        #[arg(long)]
        full: bool,
    },

    /// Stream notifications as JSON lines until Ctrl+C
    Observe {
        /// Notifications (e.g., AXValueChanged, focusChanged)
        #[arg(required = true)]
        notifications: Vec<String>,

        #[arg(long, default_value = "focused")]
        app: String,

        /// Only events whose element matches this locator
        #[arg(long)]
        filter: Option<String>,

        /// With --filter, also pass events from descendants of a match
        #[arg(long)]
        children: bool,

        /// Include element details in each event
        #[arg(long)]
        details: bool,
    },

    /// Wait for an element to appear
    Wait {
        locator: String,

        #[arg(long, default_value = "focused")]
        app: String,

        /// Timeout in milliseconds
        #[arg(long, default_value = "10000")]
        timeout: u64,
    },

    /// Record application trees into a fixture for --fixture replay
    Capture {
        /// Applications to record (name, bundle id, PID:<n> or "focused")
        #[arg(required = true)]
        apps: Vec<String>,

        /// Levels below each application root
        #[arg(long, default_value = "15")]
        depth: usize,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Run a JSON command envelope from a file or stdin ("-")
    Exec {
        #[arg(default_value = "-")]
        file: String,
    },

    /// Manage stored discovery sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Decode an element id
    ParseId { id: String },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions, newest first
    List,

    /// Show a session's latest batch
    Show {
        id: String,

        /// Only elements whose text matches
        #[arg(long)]
        find: Option<String>,
    },

    /// Remove sessions
    Clean {
        /// One session
        #[arg(long)]
        id: Option<String>,

        /// Sessions not used for this many days
        #[arg(long)]
        older_than: Option<u32>,

        /// Keep only the newest N sessions
        #[arg(long)]
        keep: Option<usize>,

        /// Everything
        #[arg(long)]
        all: bool,

        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Serialize)]
struct Output<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Error>,
}

impl<T: Serialize> Output<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(e: Error) -> Output<()> {
        Output {
            success: false,
            data: None,
            error: Some(e),
        }
    }
}

fn print_json<T: Serialize>(output: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(output)?);
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("AXKIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli);

    if let Err(e) = result {
        match e.downcast_ref::<Error>() {
            Some(err) => {
                let _ = print_json(&Output::<()>::err(err.clone()));
            }
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let base = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let mut config = base.with_env(|key| std::env::var(key).ok());
    if let Some(root) = &cli.session_root {
        config.session_root = Some(root.clone());
    }
    Ok(config)
}

fn engine(cli: &Cli) -> Result<Arc<dyn AccessibilityEngine>> {
    match &cli.fixture {
        Some(path) => {
            info!(fixture = %path.display(), "using recorded tree");
            Ok(Arc::new(MemoryTree::load(path)?))
        }
        None => Ok(platform::default_engine()?),
    }
}

fn orchestrator(cli: &Cli, config: Config) -> Result<Orchestrator> {
    let store = SessionStore::new(config.session_root(), config.max_snapshots)?;
    Ok(Orchestrator::new(engine(cli)?, config).with_session_store(store))
}

fn detail(full: bool) -> DetailLevel {
    if full {
        DetailLevel::Full
    } else {
        DetailLevel::Essential
    }
}

/// Print a dispatcher response and turn a failure into a non-zero exit.
fn finish(response: Response) -> Result<()> {
    print_json(&response)?;
    if response.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    debug!(?config, "configuration");

    match &cli.command {
        Commands::Apps => {
            let orch = orchestrator(&cli, config)?;
            print_json(&Output::ok(orch.applications()?))
        }
        Commands::Permissions { request } => permissions(&cli, *request),
        Commands::Query {
            locator,
            app,
            path,
            attributes,
            depth,
            timeout,
            full,
        } => {
            let locator = Locator::parse(locator)?.with_path(path.as_slice())?;
            let mut env = CommandEnvelope::new(CommandKind::Query);
            env.application = Some(app.clone());
            env.locator = Some(locator);
            env.attributes = attributes.clone();
            env.max_depth_for_search = *depth;
            env.timeout_ms = *timeout;
            env.detail_level = Some(detail(*full));
            finish(orchestrator(&cli, config)?.execute(&env))
        }
        Commands::Collect {
            locator,
            app,
            session,
            screenshot,
            depth,
            timeout,
            full,
        } => {
            let mut env = CommandEnvelope::new(CommandKind::CollectAll);
            env.application = Some(app.clone());
            env.locator = locator.as_deref().map(Locator::parse).transpose()?;
            env.session_id = session.clone();
            env.screenshot_path = screenshot.clone();
            env.max_depth_for_search = *depth;
            env.timeout_ms = *timeout;
            env.detail_level = Some(detail(*full));
            finish(orchestrator(&cli, config)?.execute(&env))
        }
        Commands::Action {
            action,
            locator,
            id,
            session,
            app,
            value,
        } => {
            let mut env = CommandEnvelope::new(CommandKind::PerformAction);
            env.application = Some(app.clone());
            env.action = Some(action.clone());
            env.action_value = value.clone();
            env.locator = locator.as_deref().map(Locator::parse).transpose()?;
            env.element_id = id.clone();
            env.session_id = session.clone().filter(|s| s != NEW_SESSION);
            finish(orchestrator(&cli, config)?.execute(&env))
        }
        Commands::Focused { full } => {
            let mut env = CommandEnvelope::new(CommandKind::GetFocusedElement);
            env.detail_level = Some(detail(*full));
            finish(orchestrator(&cli, config)?.execute(&env))
        }
        Commands::At { x, y, full } => {
            let mut env = CommandEnvelope::new(CommandKind::GetElementAtPoint);
            env.point = Some(Point::new(*x, *y));
            env.detail_level = Some(detail(*full));
            finish(orchestrator(&cli, config)?.execute(&env))
        }
        Commands::Observe {
            notifications,
            app,
            filter,
            children,
            details,
        } => {
            let orch = orchestrator(&cli, config)?;
            let mut request = ObserveRequest::new(
                AppTarget::parse(app)?,
                notifications.iter().map(|n| Notification::parse(n)).collect(),
            )
            .watch_children(*children);
            if let Some(filter) = filter {
                request = request.filter(Locator::parse(filter)?);
            }
            observe(&orch, request, *details)
        }
        Commands::Wait {
            locator,
            app,
            timeout,
        } => {
            let mut env = CommandEnvelope::new(CommandKind::WaitFor);
            env.application = Some(app.clone());
            env.locator = Some(Locator::parse(locator)?);
            env.timeout_ms = Some(*timeout);
            finish(orchestrator(&cli, config)?.execute(&env))
        }
        Commands::Capture { apps, depth, out } => {
            let engine = engine(&cli)?;
            if !engine.has_permission() {
                return Err(Error::permission_denied(
                    "Accessibility permission is not granted to this process",
                )
                .into());
            }
            let targets = apps
                .iter()
                .map(|a| AppTarget::parse(a.as_str()))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let fixture = Fixture::capture(engine.as_ref(), &targets, *depth)?;
            let json = serde_json::to_string_pretty(&fixture)?;
            match out {
                Some(path) => {
                    std::fs::write(path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(path = %path.display(), apps = fixture.apps.len(), "fixture written");
                    print_json(&Output::ok(serde_json::json!({
                        "path": path,
                        "apps": fixture.apps.len(),
                    })))
                }
                None => {
                    println!("{}", json);
                    Ok(())
                }
            }
        }
        Commands::Exec { file } => {
            let json = if file == "-" {
                let mut buf = String::new();
                io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read envelope from stdin")?;
                buf
            } else {
                std::fs::read_to_string(file)
                    .with_context(|| format!("Failed to read envelope from {}", file))?
            };
            finish(orchestrator(&cli, config)?.execute_json(&json))
        }
        Commands::Sessions { command } => {
            let store = SessionStore::new(config.session_root(), config.max_snapshots)?;
            sessions(&store, command)
        }
        Commands::ParseId { id } => {
            let parsed = parse_id(id)
                .ok_or_else(|| Error::invalid_command(format!("'{}' is not an element id", id)))?;
            print_json(&Output::ok(serde_json::json!({
                "category": parsed.category,
                "index": parsed.index,
            })))
        }
    }
}

fn permissions(cli: &Cli, request: bool) -> Result<()> {
    let engine = engine(cli)?;
    let granted = if request {
        engine.request_permission()
    } else {
        engine.has_permission()
    };

    println!("Accessibility: {}", if granted { "OK" } else { "DENIED" });
    if !granted && !request {
        println!("\nRun with --request to request permissions");
    }
    Ok(())
}

fn observe(orch: &Orchestrator, request: ObserveRequest, details: bool) -> Result<()> {
    let subscription = orch.observe(request)?;
    eprintln!(
        "Observing PID {} for {} notification(s) (Ctrl+C to stop)",
        subscription.pid(),
        subscription.notifications().len()
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let stdout = io::stdout();
    let mut count = 0u64;
    while running.load(Ordering::SeqCst) {
        if let Some(event) = subscription.recv_timeout(Duration::from_millis(100))? {
            let mut out = stdout.lock();
            serde_json::to_writer(&mut out, &event.payload(details))?;
            writeln!(out)?;
            out.flush()?;
            count += 1;
        }
    }

    let dropped = subscription.dropped();
    drop(subscription);
    eprintln!("{} events, {} dropped", count, dropped);
    Ok(())
}

fn sessions(store: &SessionStore, command: &SessionCommands) -> Result<()> {
    match command {
        SessionCommands::List => print_json(&Output::ok(store.list_sessions()?)),
        SessionCommands::Show { id, find } => {
            let batch = store
                .get_detection_result(id)?
                .ok_or_else(|| Error::session_not_found(id))?;
            match find {
                Some(query) => {
                    let elements: Vec<_> = batch.find(query).into_iter().cloned().collect();
                    print_json(&Output::ok(elements))
                }
                None => print_json(&Output::ok(batch)),
            }
        }
        SessionCommands::Clean {
            id,
            older_than,
            keep,
            all,
            dry_run,
        } => {
            let report = if let Some(id) = id {
                store.clean_session(id, *dry_run)?
            } else if let Some(days) = older_than {
                store.clean_sessions_older_than(*days, *dry_run)?
            } else if let Some(max) = keep {
                store.enforce_session_limit(*max, *dry_run)?
            } else if *all {
                store.clean_all_sessions(*dry_run)?
            } else {
                return Err(Error::invalid_command(
                    "choose one of --id, --older-than, --keep or --all",
                )
                .into());
            };
            print_json(&Output::ok(report))
        }
    }
}

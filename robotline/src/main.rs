//! robotline - console for remote robot instances
//!
//! Sends messages to hosted robot instances, follows their conversation
//! timelines live, and manages their plans.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/robotline/config.toml (~/.config/robotline/config.toml)
//! - Logs: $XDG_STATE_HOME/robotline/robotline.log (~/.local/state/robotline/robotline.log)

mod render;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use robotline_core::backend::{Collaborators, RestBackend};
use robotline_core::session::{
    SessionContext, SessionCoordinator, SessionSignal, SessionSnapshot,
};
use robotline_core::{Config, InstanceIdentity, SendOutcome};
use tokio::sync::broadcast::error::RecvError;

use crate::render::TimelinePrinter;

#[derive(Parser)]
#[command(name = "robotline")]
#[command(about = "Console for remote robot instances")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Which console session to act in
#[derive(Args, Clone)]
struct Target {
    /// Site the instance works on
    #[arg(long)]
    site: String,

    /// Acting user id
    #[arg(long)]
    user: Option<String>,

    /// Extra page context sent with messages (JSON)
    #[arg(long)]
    context: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and file locations
    Config,

    /// Send a message, starting a new instance when none is given
    Send {
        #[command(flatten)]
        target: Target,

        /// Existing instance to talk to
        #[arg(short, long)]
        instance: Option<String>,

        /// Give up waiting for the robot after this many seconds
        #[arg(long, default_value = "120")]
        wait: u64,

        message: String,
    },

    /// Follow an instance timeline until interrupted
    Watch {
        #[command(flatten)]
        target: Target,

        #[arg(short, long)]
        instance: String,
    },

    /// Show or change the plans of an instance
    Plans {
        #[command(flatten)]
        target: Target,

        #[arg(short, long)]
        instance: String,

        #[command(subcommand)]
        action: Option<PlanAction>,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Pause an in-progress plan
    Pause { plan_id: String },
    /// Resume a paused plan
    Resume { plan_id: String },
    /// Remove a step from its plan
    DeleteStep { step_id: String },
    /// Change a step's title and description
    EditStep {
        step_id: String,
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard =
        robotline_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("robotline starting");

    match cli.command {
        Command::Config => cmd_config(&config),
        Command::Send {
            target,
            instance,
            wait,
            message,
        } => cmd_send(&config, &target, instance, Duration::from_secs(wait), &message).await,
        Command::Watch { target, instance } => cmd_watch(&config, &target, instance).await,
        Command::Plans {
            target,
            instance,
            action,
        } => cmd_plans(&config, &target, instance, action).await,
    }
}

fn cmd_config(config: &Config) -> Result<()> {
    fn or_unset(value: Option<&str>) -> &str {
        value.unwrap_or("<not set>")
    }

    let config_path = Config::config_path();
    println!("robotline configuration");
    println!("=======================");
    println!();
    println!(
        "Config file:      {}{}",
        config_path.display(),
        if config_path.exists() { "" } else { " (not found)" }
    );
    println!(
        "Log file:         {}",
        robotline_core::logging::log_file_path(&config.logging).display()
    );
    println!();
    println!("Backend URL:      {}", or_unset(config.backend.url.as_deref()));
    println!(
        "API key:          {}",
        if config.backend.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Actions URL:      {}",
        or_unset(config.backend.actions_base().as_deref())
    );
    println!("Feed interval:    {}ms", config.backend.feed_poll_interval_ms);
    println!();

    let session = &config.session;
    println!("Thinking timeout: {}s", session.thinking_timeout_secs);
    println!(
        "Instance polling: every {}ms, up to {} attempts",
        session.poll_interval_ms, session.max_poll_attempts
    );
    println!("Instance name:    {}", session.instance_name);
    println!("Activity:         {}", session.activity);

    if !config.backend.is_ready() {
        println!();
        println!("Backend is not configured. Add to config.toml:");
        println!();
        println!("  [backend]");
        println!("  url = \"https://your-project.example.co/rest/v1\"");
        println!("  api_key = \"your-api-key\"");
    }
    Ok(())
}

fn connect(config: &Config, target: &Target) -> Result<SessionCoordinator> {
    let backend = RestBackend::new(&config.backend).context("backend is not configured")?;

    let mut context = SessionContext::new(target.site.clone(), config.session.activity.clone());
    if let Some(user) = &target.user {
        context = context.with_user(user.clone());
    }
    if let Some(raw) = &target.context {
        let value = serde_json::from_str(raw).context("--context is not valid JSON")?;
        context = context.with_context(value);
    }

    Ok(SessionCoordinator::new(
        config.session.clone(),
        Collaborators::from_backend(Arc::new(backend)),
        context,
    ))
}

async fn open(session: &SessionCoordinator, instance: String) -> Result<()> {
    session
        .open_instance(InstanceIdentity::assigned(instance.clone()))
        .await
        .with_context(|| format!("failed to open instance {}", instance))
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

/// True once nothing is in flight and any announced instance has been opened.
fn is_settled(snapshot: &SessionSnapshot, announced: Option<&str>) -> bool {
    if let Some(id) = announced {
        if snapshot.identity.instance_id() != Some(id) {
            return false;
        }
    }
    !(snapshot.sending
        || snapshot.starting
        || snapshot.thinking
        || snapshot.bootstrapping
        || snapshot.loading)
}

async fn cmd_send(
    config: &Config,
    target: &Target,
    instance: Option<String>,
    wait: Duration,
    message: &str,
) -> Result<()> {
    let session = connect(config, target)?;
    let mut printer = TimelinePrinter::new();
    if let Some(instance) = instance {
        open(&session, instance).await?;
        printer.mark_seen(&session.snapshot());
    }

    let mut signals = session.subscribe_signals();
    match session.send_message(message).await {
        SendOutcome::Sent => println!("Sent."),
        SendOutcome::Starting => println!("Waiting for the robot to start..."),
        SendOutcome::Ignored(reason) => bail!("message not sent ({:?})", reason),
        SendOutcome::Failed(reason) => bail!("message not sent: {}", reason),
    }

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    let mut announced: Option<String> = None;

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Ok(SessionSignal::Notice(notice)) => eprintln!("{}", render::notice_line(&notice)),
                Ok(SessionSignal::Navigate { instance_id }) => {
                    println!("Instance {} is ready", instance_id);
                    announced = Some(instance_id);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Signal receiver lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tick.tick() => {
                let snapshot = session.snapshot();
                print_lines(printer.new_lines(&snapshot, chrono::Utc::now()));
                if is_settled(&snapshot, announced.as_deref()) {
                    break;
                }
            }
            _ = &mut deadline => {
                eprintln!("Stopped waiting after {}s", wait.as_secs());
                break;
            }
            _ = &mut ctrl_c => break,
        }
    }

    let snapshot = session.snapshot();
    print_lines(printer.new_lines(&snapshot, chrono::Utc::now()));
    if snapshot.unconfirmed > 0 {
        eprintln!(
            "{} message(s) not confirmed by the backend yet",
            snapshot.unconfirmed
        );
    }
    if let Some(id) = snapshot.identity.instance_id() {
        println!("Instance: {}", id);
    }
    session.close();
    Ok(())
}

async fn cmd_watch(config: &Config, target: &Target, instance: String) -> Result<()> {
    let session = connect(config, target)?;
    open(&session, instance.clone()).await?;

    let snapshot = session.snapshot();
    println!("Watching {} (ctrl-c to stop)", instance);
    print_lines(render::history_lines(&snapshot, chrono::Utc::now()));
    let mut printer = TimelinePrinter::new();
    printer.mark_seen(&snapshot);

    let mut signals = session.subscribe_signals();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Ok(SessionSignal::TimelineChanged) => {
                    print_lines(printer.new_lines(&session.snapshot(), chrono::Utc::now()));
                }
                Ok(SessionSignal::Notice(notice)) => eprintln!("{}", render::notice_line(&notice)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Signal receiver lagged");
                    print_lines(printer.new_lines(&session.snapshot(), chrono::Utc::now()));
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => break,
        }
    }

    session.close();
    tracing::info!(instance = %instance, "Watch stopped");
    Ok(())
}

async fn cmd_plans(
    config: &Config,
    target: &Target,
    instance: String,
    action: Option<PlanAction>,
) -> Result<()> {
    let session = connect(config, target)?;
    open(&session, instance).await?;

    let result = match action {
        None => Ok(()),
        Some(PlanAction::Pause { plan_id }) => session.pause_plan(&plan_id).await,
        Some(PlanAction::Resume { plan_id }) => session.resume_plan(&plan_id).await,
        Some(PlanAction::DeleteStep { step_id }) => session.delete_step(&step_id).await,
        Some(PlanAction::EditStep {
            step_id,
            title,
            description,
        }) => {
            session
                .edit_step(&step_id, &title, description.as_deref())
                .await
        }
    };
    result.context("plan update failed")?;

    let snapshot = session.snapshot();
    if snapshot.plans.is_empty() {
        println!("No plans");
    } else {
        print_lines(render::plan_lines(
            &snapshot.buckets,
            &snapshot.steps,
            &snapshot.collapsed_steps,
        ));
    }
    session.close();
    Ok(())
}

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{ControllerEvent, SessionController};
use remote_store::HttpBackend;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, DEFAULT_SETTINGS_FILE};

#[derive(Parser, Debug)]
#[command(name = "motivity", about = "Track personal events against the hosted backend")]
struct Cli {
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long, env = "MOTIVITY_EMAIL")]
    email: String,
    #[arg(long, env = "MOTIVITY_PASSWORD", hide_env_values = true)]
    password: String,
    /// Print results as JSON.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and report the user id.
    SignIn,
    /// Submit the create-account form.
    SignUp,
    CreateEvent {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        start_time: String,
        #[arg(long, default_value = "")]
        end_time: String,
    },
    ListEvents,
    /// Show the flattened post list.
    Posts,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    if cli.email.is_empty() || cli.password.is_empty() {
        bail!("email and password must not be empty");
    }

    let settings = load_settings(&cli.config);
    let backend = Arc::new(
        HttpBackend::new(settings.backend_config()).context("failed to configure backend")?,
    );
    let controller = SessionController::with_backend(backend, settings.controller_settings());

    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ControllerEvent::Error(failure) => warn!(%failure, "controller error"),
                other => debug!(event = ?other, "controller event"),
            }
        }
    });

    let user_id = match cli.command {
        Command::SignUp => controller.submit_sign_up_form(&cli.email, &cli.password).await,
        _ => controller.sign_in(&cli.email, &cli.password).await,
    }
    .context("authentication failed")?;

    let outcome = run(&controller, cli.command, cli.json, &user_id).await;
    controller.sign_out().await;
    outcome
}

async fn run(
    controller: &SessionController,
    command: Command,
    json: bool,
    user_id: &shared::domain::UserId,
) -> Result<()> {
    match command {
        Command::SignIn | Command::SignUp => {
            println!("signed in as user_id={user_id}");
        }
        Command::CreateEvent {
            name,
            description,
            start_time,
            end_time,
        } => {
            controller
                .create_event(&name, &description, &start_time, &end_time)
                .await
                .with_context(|| format!("failed to save event '{name}'"))?;
            println!("saved event '{name}'");
        }
        Command::ListEvents => {
            let events = controller.list_events().await.context("failed to list events")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                for event in events {
                    println!(
                        "{}: {} ({} - {})",
                        event.name, event.description, event.start_time, event.end_time
                    );
                }
            }
        }
        Command::Posts => {
            let posts = controller.display_posts().await.context("failed to load posts")?;
            if json {
                println!("{}", serde_json::to_string(&posts)?);
            } else {
                println!("{}", posts.join(", "));
            }
        }
    }
    Ok(())
}

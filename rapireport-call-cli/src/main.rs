//! RapiReport consultation call CLI

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rapireport_call_core::prelude::*;
use rapireport_call_core::types::AppointmentContext;
use std::sync::Arc;
use std::time::Duration;
use terminal_ui::{CliDisplayMode, DisplayMode, TerminalRinger, TerminalTarget, TerminalUI, UiCommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod terminal_ui;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Portal user id of the signed-in user
    #[arg(short, long, env = "RAPIREPORT_USER_ID")]
    user_id: i64,

    /// Role of the signed-in user
    #[arg(short, long, value_enum, env = "RAPIREPORT_ROLE", default_value = "patient")]
    role: CliRole,

    /// Display name of the signed-in user
    #[arg(long, env = "RAPIREPORT_USER_NAME", default_value = "")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliRole {
    Doctor,
    Patient,
}

impl From<CliRole> for UserRole {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::Doctor => UserRole::Doctor,
            CliRole::Patient => UserRole::Patient,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start a call for an appointment (doctors)
    Call {
        /// Appointment id
        appointment: i64,

        /// Audio only
        #[arg(long)]
        audio_only: bool,

        /// Display mode
        #[arg(long, value_enum, default_value = "tui")]
        display: CliDisplayMode,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept incoming calls automatically
        #[arg(long)]
        auto_accept: bool,

        /// Audio only
        #[arg(long)]
        audio_only: bool,

        /// Display mode
        #[arg(long, value_enum, default_value = "tui")]
        display: CliDisplayMode,
    },

    /// List the doctor's appointments
    Appointments,

    /// Show configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rapireport=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CallConfig::from_env();

    let role = UserRole::from(cli.role);
    let user = Arc::new(SharedUserSession::signed_in(CurrentUser {
        id: UserId(cli.user_id),
        role,
        display_name: cli.name,
    }));
    let ringer = Arc::new(TerminalRinger::new(config.ringtones.clone()));

    if let Commands::Status = cli.command {
        return handle_status(&config);
    }

    let service = Arc::new(
        ConsultationCallService::builder(config)
            .with_user_session(user)
            .with_ringer(ringer)
            .build()?,
    );

    match cli.command {
        Commands::Call {
            appointment,
            audio_only,
            display,
        } => {
            if role != UserRole::Doctor {
                bail!("only doctors can start consultation calls");
            }
            handle_call(service, AppointmentId(appointment), constraints(audio_only), display.into())
                .await?;
        }
        Commands::Listen {
            auto_accept,
            audio_only,
            display,
        } => {
            handle_listen(service, role, auto_accept, constraints(audio_only), display.into())
                .await?;
        }
        Commands::Appointments => handle_appointments(&service).await?,
        Commands::Status => {}
    }

    Ok(())
}

fn constraints(audio_only: bool) -> MediaConstraints {
    if audio_only {
        MediaConstraints::audio_only()
    } else {
        MediaConstraints::video_call()
    }
}

async fn handle_call(
    service: Arc<ConsultationCallService>,
    appointment: AppointmentId,
    constraints: MediaConstraints,
    display: DisplayMode,
) -> Result<()> {
    service.start();
    let session = service.start_call(appointment, constraints).await?;
    tracing::info!(call_id = %session.call_id, room = %session.room_id, "Calling");

    run_session(&service, UserRole::Doctor, display, None, true, constraints).await?;
    service.stop().await;
    Ok(())
}

async fn handle_listen(
    service: Arc<ConsultationCallService>,
    role: UserRole,
    auto_accept: bool,
    constraints: MediaConstraints,
    display: DisplayMode,
) -> Result<()> {
    service.start();
    if display == DisplayMode::Plain {
        println!("Listening for incoming calls, (q) to quit");
    }
    let auto = auto_accept.then_some(constraints);
    run_session(&service, role, display, auto, false, constraints).await?;
    service.stop().await;
    Ok(())
}

async fn handle_appointments(service: &ConsultationCallService) -> Result<()> {
    let appointments = service.appointments().await?;
    if appointments.is_empty() {
        println!("No appointments");
    }
    for apt in &appointments {
        println!("{}", describe_appointment(apt));
    }
    Ok(())
}

fn describe_appointment(apt: &AppointmentContext) -> String {
    format!(
        "{:>6}  {}",
        apt.appointment_id,
        apt.other_party_name(UserRole::Doctor)
    )
}

fn handle_status(config: &CallConfig) -> Result<()> {
    let status = serde_json::json!({
        "base_url": config.base_url,
        "configured": config.is_configured(),
        "session_cookie": config.session_cookie.is_some(),
        "incoming_poll_ms": config.incoming_poll_interval.as_millis() as u64,
        "signal_poll_ms": config.signal_poll_interval.as_millis() as u64,
        "answer_timeout_ms": config.answer_timeout.as_millis() as u64,
        "ice_servers": config.ice_servers,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Drive the overlay until quit, or until the call ends when `exit_when_idle`
async fn run_session(
    service: &ConsultationCallService,
    role: UserRole,
    display: DisplayMode,
    auto_accept: Option<MediaConstraints>,
    exit_when_idle: bool,
    constraints: MediaConstraints,
) -> Result<()> {
    let mut presenter = CallOverlayPresenter::new(role, TerminalTarget::new(display));
    let mut snapshots = service.watch();
    let mut events = service.subscribe_events();
    let mut ui = match display {
        DisplayMode::Tui => Some(TerminalUI::new()?),
        DisplayMode::Plain => None,
    };
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut seen_active = service.status().is_active();

    presenter.present(&service.snapshot());

    loop {
        let command = tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                presenter.present(&snapshot);
                if snapshot.status.is_active() {
                    seen_active = true;
                } else if exit_when_idle && seen_active {
                    break;
                }
                None
            }
            event = events.recv() => {
                match event {
                    Ok(ConsultationEvent::Call(CallEvent::Notice(notice))) => {
                        presenter.target_mut().push_notice(notice.to_string());
                        None
                    }
                    Ok(ConsultationEvent::Call(CallEvent::IncomingCall { .. })) => {
                        auto_accept.map(|_| UiCommand::Accept)
                    }
                    Ok(other) => {
                        tracing::debug!("Received event: {:?}", other);
                        None
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => None,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            line = stdin.next_line(), if ui.is_none() => {
                match line? {
                    Some(line) => UiCommand::from_line(&line),
                    None => Some(UiCommand::Quit),
                }
            }
            _ = ticker.tick() => {
                presenter.present(&service.snapshot());
                match ui.as_mut() {
                    Some(ui) => {
                        ui.draw(presenter.target())?;
                        ui.poll_command()?
                    }
                    None => None,
                }
            }
        };

        if let Some(command) = command {
            if command == UiCommand::Quit {
                break;
            }
            if let Err(e) = apply_command(service, command, auto_accept.unwrap_or(constraints)).await {
                presenter.target_mut().push_notice(e.to_string());
            }
        }
    }

    Ok(())
}

async fn apply_command(
    service: &ConsultationCallService,
    command: UiCommand,
    constraints: MediaConstraints,
) -> Result<(), ServiceError> {
    let calls = service.calls();
    match command {
        UiCommand::Accept => service.accept_call(constraints).await?,
        UiCommand::Decline => service.decline_call().await?,
        UiCommand::HangUp => {
            service.end_call().await;
        }
        UiCommand::ToggleMic => {
            calls.toggle_mic().await;
        }
        UiCommand::ToggleCamera => {
            calls.toggle_camera().await;
        }
        UiCommand::Minimize => calls.minimize().await?,
        UiCommand::Restore => calls.restore().await?,
        UiCommand::Quit => {}
    }
    Ok(())
}

use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::channel::mpsc::{channel, Receiver};
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use walkstim::config::io::ConfigIO;
use walkstim::config::types::Config;
use walkstim::device::scan::ScanController;
use walkstim::device::session::ConnectionSession;
use walkstim::device::types::{DeviceEvent, ParameterField, PeripheralHandle};
use walkstim::error::{AppRunError, ConfigError, PushError};
use walkstim::exercise::{ExerciseSession, RunState, SharedParameters};
use walkstim::init_logging;

#[derive(Parser)]
#[command(name = "walkstim", version, about = "Timed walking-exercise stimulation over BLE")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Scan for stimulation peripherals and list them
    Scan {
        /// How long to keep the scan window open
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        window: Duration,
    },
    /// Connect to a peripheral and run a timed exercise
    Run {
        /// Identity or name fragment of the peripheral to use; defaults to
        /// the first one discovered
        #[arg(long)]
        device: Option<String>,

        /// How long to wait for a matching peripheral
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        scan_window: Duration,

        /// Total exercise time; on expiry the exercise is paused once,
        /// mirroring a manual pause
        #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
        total_time: Duration,

        #[arg(long)]
        initial_delay_ms: Option<u32>,

        #[arg(long)]
        stimulation_time_ms: Option<u32>,

        #[arg(long)]
        rest_time_ms: Option<u32>,

        /// Stimulation strength in percent, at most 100
        #[arg(long)]
        stimulation_strength_pct: Option<u32>,

        /// Persist the effective settings to the config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    init_logging();
    info!(concat!("walkstim ", env!("CARGO_PKG_VERSION")));

    let cli = Cli::parse();

    match run(cli).await {
        Err(AppRunError::Config { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another walkstim instance is already running");
            std::process::exit(1);
        },
        Err(err) => {
            error!("{}", err);
            Err(err)
        },
        Ok(()) => Ok(()),
    }
}

async fn run(cli: Cli) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::new_sync()?;
    let mut locker = config_io.locker()?;
    let _lock_guard = locker.lock()?;

    let config = config_io.read().await?;

    match cli.command {
        CliCommand::Scan { window } => scan_command(config, window).await,
        CliCommand::Run {
            device,
            scan_window,
            total_time,
            initial_delay_ms,
            stimulation_time_ms,
            rest_time_ms,
            stimulation_strength_pct,
            save,
        } => {
            run_command(
                config_io,
                config,
                device,
                scan_window,
                total_time,
                [
                    (ParameterField::InitialDelay, initial_delay_ms),
                    (ParameterField::StimulationTime, stimulation_time_ms),
                    (ParameterField::RestTime, rest_time_ms),
                    (ParameterField::StimulationStrength, stimulation_strength_pct),
                ],
                save,
            )
            .await
        },
    }
}

async fn scan_command(config: Config, window: Duration) -> Result<(), AppRunError> {
    let (event_sender, mut event_receiver) = channel::<DeviceEvent>(128);
    let scan = ScanController::new(config.device_name_token, event_sender).await?;

    scan.start_scan().await?;

    let deadline = sleep(window);
    tokio::pin!(deadline);
    'scanloop: loop {
        tokio::select! {
            _ = &mut deadline => break 'scanloop,
            Some(event) = event_receiver.next() => {
                if let DeviceEvent::Discovered { identity, name } = event {
                    info!("Discovered {} ({})", name, identity);
                }
            },
        }
    }
    scan.stop_scan().await;

    let registry = scan.registry();
    let registry = registry.lock().expect("registry mutex poisoned");
    if registry.is_empty() {
        info!("No matching peripherals found");
    } else {
        info!("{} matching peripheral(s) found", registry.len());
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    config_io: ConfigIO,
    config: Config,
    device: Option<String>,
    scan_window: Duration,
    total_time: Duration,
    overrides: [(ParameterField, Option<u32>); 4],
    save: bool,
) -> Result<(), AppRunError> {
    let (event_sender, mut event_receiver) = channel::<DeviceEvent>(128);

    let params = SharedParameters::new(config.parameters);
    let mut exercise = ExerciseSession::new(params.clone(), event_sender.clone());

    // flags go through the same validation as interactive edits
    for (field, value) in overrides {
        if let Some(value) = value {
            exercise
                .request_parameter_change(field, value)
                .map_err(PushError::from)?;
        }
    }

    if save {
        let effective = Config {
            device_name_token: config.device_name_token.clone(),
            parameters: exercise.parameters(),
        };
        config_io.save(&effective).await?;
    }

    let scan = ScanController::new(config.device_name_token, event_sender.clone()).await?;
    let session = ConnectionSession::new(params, event_sender);

    scan.start_scan().await?;
    let handle = wait_for_device(&scan, &mut event_receiver, device.as_deref(), scan_window).await;
    let handle = match handle {
        Ok(handle) => handle,
        Err(err) => {
            scan.stop_scan().await;
            return Err(err);
        },
    };

    if let Err(err) = session.connect(handle, &scan).await {
        scan.stop_scan().await;
        return Err(err.into());
    }

    let result = drive_exercise(&session, &mut exercise, &mut event_receiver, total_time).await;

    session.disconnect().await;
    exercise.reset_for_disconnect();

    result
}

async fn drive_exercise(
    session: &ConnectionSession,
    exercise: &mut ExerciseSession,
    event_receiver: &mut Receiver<DeviceEvent>,
    total_time: Duration,
) -> Result<(), AppRunError> {
    exercise.push_settings(session).await?;
    exercise.toggle_run(session).await.map_err(PushError::from)?;
    info!("Exercise running for {}", humantime::format_duration(total_time));

    let deadline = sleep(total_time);
    tokio::pin!(deadline);
    'exercise: loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Exercise time is up");
                break 'exercise;
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break 'exercise;
            },
            Some(event) = event_receiver.next() => report_event(event),
        }
    }

    // the countdown completion pauses exactly once, mirroring a manual pause
    if exercise.run_state() == RunState::Running {
        exercise.toggle_run(session).await.map_err(PushError::from)?;
    }

    Ok(())
}

async fn wait_for_device(
    scan: &ScanController,
    event_receiver: &mut Receiver<DeviceEvent>,
    wanted: Option<&str>,
    scan_window: Duration,
) -> Result<PeripheralHandle, AppRunError> {
    let deadline = sleep(scan_window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Err(AppRunError::NoDeviceFound),
            Some(event) = event_receiver.next() => {
                let DeviceEvent::Discovered { identity, name } = event else {
                    continue;
                };

                let matches = wanted
                    .map(|wanted| identity == wanted || name.contains(wanted))
                    .unwrap_or(true);
                if !matches {
                    debug!("Skipping {} ({})", name, identity);
                    continue;
                }

                if let Some(handle) = scan.lookup(&identity) {
                    info!("Selecting {} ({})", name, identity);
                    return Ok(handle);
                }
            },
        }
    }
}

fn report_event(event: DeviceEvent) {
    match event {
        DeviceEvent::Tick => info!("tick"),
        DeviceEvent::SettingsReplaced(params) => info!(
            "Peripheral pushed settings: delay {}ms, stimulation {}ms, rest {}ms, strength {}%",
            params.initial_delay_ms,
            params.stimulation_time_ms,
            params.rest_time_ms,
            params.stimulation_strength_pct,
        ),
        DeviceEvent::DecodeFault(err) => warn!("Ignored malformed notification: {}", err),
        DeviceEvent::RunState(state) => info!("Run state: {:?}", state),
        DeviceEvent::Phase(phase) => debug!("Session phase: {:?}", phase),
        DeviceEvent::Discovered { identity, name } => debug!("Discovered {} ({})", name, identity),
    }
}

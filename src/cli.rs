//! Greenhouse CLI
//!
//! Command-line front end for the greenhouse client: sign in, pick a
//! greenhouse and field, watch live readings and drive the fan, LED and pump.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use greenhouse_client::{
    error_codes, ClientConfig, DeviceKind, DeviceMode, DeviceSave, DeviceSettingsService,
    ErrorResponse, FieldSnapshot, FileStore, GardenStore, GreenhouseApi, HistoryQuery,
    HttpAuthApi, HttpClient, HttpGreenhouseApi, ListQuery, ModeSettings, RandomIdGenerator,
    RepeatRule, ReqwestHttpClient, SecureStore, Series, SessionStore, SocketEvent, SocketSession,
    SystemClock, DEFAULT_FRESHNESS_SECS,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "greenhouse")]
#[command(about = "Monitor and control a greenhouse")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the session token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account (does not sign in)
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Forget the stored session token
    Logout,
    /// Mark onboarding as done
    Onboarded,
    /// List greenhouses
    List {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Select a greenhouse by id
    Select { greenhouse_id: String },
    /// Select a field of the selected greenhouse
    Field { index: usize },
    /// Forget the saved selection
    Clear,
    /// Poll the selected greenhouse and print the selected field
    Watch {
        /// Stop after this many refreshes (0 runs until interrupted)
        #[arg(long, default_value_t = 0)]
        ticks: u32,
    },
    /// Show device settings of the selected field
    Settings,
    /// Set a device's intensity (0-100)
    Control { device: DeviceKind, value: u8 },
    /// Switch a device between off and full intensity
    Toggle { device: DeviceKind },
    /// Save a device's mode and intensity
    Save {
        device: DeviceKind,
        #[arg(long, value_enum)]
        mode: ModeArg,
        #[arg(long, default_value_t = 100)]
        intensity: u8,
        /// Minutes until the device turns off (0 keeps it on)
        #[arg(long, default_value_t = 0)]
        turn_off_after: u32,
        /// Start time (HH:MM), scheduled mode
        #[arg(long)]
        turn_on_at: Option<String>,
        /// today, everyday or custom
        #[arg(long, default_value = "today")]
        repeat: RepeatRule,
        /// Dates (YYYY-MM-DD) for a custom repeat
        #[arg(long, value_delimiter = ',')]
        dates: Vec<String>,
    },
    /// Print a series of the selected field over the last hours
    History {
        #[arg(long, default_value = "temperature_sensor")]
        series: Series,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Print the analytics document of the selected greenhouse
    Analyze,
    /// Listen for pushed sensor updates
    Listen,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Manual,
    Scheduled,
    Automatic,
}

struct App {
    config: ClientConfig,
    session: SessionStore,
    garden: GardenStore,
    api: Arc<dyn GreenhouseApi>,
    settings: DeviceSettingsService,
    clock: Arc<SystemClock>,
}

impl App {
    async fn build(config: ClientConfig) -> anyhow::Result<Self> {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(config.request_timeout)?);
        let storage: Arc<dyn SecureStore> = Arc::new(FileStore::new(config.storage_path.clone()));
        let clock = Arc::new(SystemClock::new());
        let api: Arc<dyn GreenhouseApi> = Arc::new(HttpGreenhouseApi::new(http.clone(), &config));
        let auth = Arc::new(HttpAuthApi::new(http.clone(), &config));

        let session = SessionStore::new(auth, http, storage.clone(), clock.clone());
        if let Err(e) = session.restore().await {
            tracing::warn!(error = %e, "Could not restore the session");
        }

        Ok(Self {
            garden: GardenStore::new(api.clone(), storage, config.poll_interval),
            settings: DeviceSettingsService::new(api.clone()),
            config,
            session,
            api,
            clock,
        })
    }

    async fn require_login(&self) -> Result<(), ErrorResponse> {
        if self.session.state().await.authenticated == Some(true) {
            Ok(())
        } else {
            Err(ErrorResponse::new(
                error_codes::NOT_AUTHENTICATED,
                "Not signed in; run `greenhouse login` first",
            ))
        }
    }

    /// Fetch the list and restore the saved selection without background polling
    async fn load_selection(&self) -> Result<(), ErrorResponse> {
        self.require_login().await?;
        self.garden.fetch_greenhouses().await?;
        self.garden.restore_selection().await?;
        self.garden.stop_polling();
        Ok(())
    }

    async fn selected_greenhouse(&self) -> Result<String, ErrorResponse> {
        self.load_selection().await?;
        self.garden
            .state()
            .await
            .selected_greenhouse
            .map(|g| g.greenhouse_id)
            .ok_or_else(no_selection)
    }

    async fn selected_field(&self) -> Result<(String, usize), ErrorResponse> {
        let greenhouse_id = self.selected_greenhouse().await?;
        let index = self
            .garden
            .state()
            .await
            .selected_field_index
            .ok_or_else(|| {
                ErrorResponse::new(
                    error_codes::NO_SELECTION,
                    "No field selected; run `greenhouse field <index>` first",
                )
            })?;
        Ok((greenhouse_id, index))
    }

    async fn run(&self, command: Command) -> Result<(), ErrorResponse> {
        match command {
            Command::Login { email, password } => {
                let message = self.session.login(&email, &password).await?;
                println!("{}", message);
            }
            Command::Register { email, password } => {
                let message = self.session.register(&email, &password).await?;
                println!("{}", message);
            }
            Command::Logout => {
                self.session.logout().await?;
                self.garden.clear_selected_options().await?;
                println!("Signed out");
            }
            Command::Onboarded => {
                self.session.complete_onboarding().await?;
                println!("Onboarding complete");
            }
            Command::List {
                owner,
                location,
                offset,
                limit,
            } => {
                self.require_login().await?;
                let query = ListQuery {
                    owner,
                    location,
                    offset,
                    limit,
                };
                for greenhouse in self.garden.fetch_greenhouses_with(&query).await? {
                    println!(
                        "{}\t{}\t{}\t{} field(s)",
                        greenhouse.greenhouse_id,
                        greenhouse.name,
                        greenhouse.location,
                        greenhouse.fields.len()
                    );
                }
            }
            Command::Select { greenhouse_id } => {
                self.require_login().await?;
                let greenhouses = self.garden.fetch_greenhouses().await?;
                let greenhouse = greenhouses
                    .into_iter()
                    .find(|g| g.greenhouse_id == greenhouse_id)
                    .ok_or_else(|| {
                        ErrorResponse::new(
                            error_codes::NOT_FOUND,
                            format!("Greenhouse {} not found", greenhouse_id),
                        )
                    })?;
                let name = greenhouse.name.clone();
                self.garden.select_greenhouse(Some(greenhouse)).await?;
                self.garden.stop_polling();
                println!("Selected {} ({})", greenhouse_id, name);
            }
            Command::Field { index } => {
                self.load_selection().await?;
                let field = self.garden.select_field(index).await?;
                println!("Selected field {}", index);
                print_snapshot(&FieldSnapshot::build(
                    &field,
                    self.clock.as_ref(),
                    DEFAULT_FRESHNESS_SECS,
                ));
            }
            Command::Clear => {
                self.garden.clear_selected_options().await?;
                println!("Selection cleared");
            }
            Command::Watch { ticks } => self.watch(ticks).await?,
            Command::Settings => {
                let (greenhouse_id, index) = self.selected_field().await?;
                let settings = self.settings.load(&greenhouse_id, index).await?;
                for device in DeviceKind::ALL {
                    let view = DeviceSettingsService::device_view(&settings, device);
                    println!(
                        "{}\t{}\t{}\tintensity={}",
                        device,
                        mode_label(view.mode),
                        if view.is_on { "on" } else { "off" },
                        view.intensity
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            Command::Control { device, value } => {
                let (greenhouse_id, index) = self.selected_field().await?;
                self.api
                    .control_device(&greenhouse_id, index, device, value)
                    .await?;
                println!("{} set to {}", device, value);
            }
            Command::Toggle { device } => {
                let (greenhouse_id, index) = self.selected_field().await?;
                let settings = self.settings.load(&greenhouse_id, index).await?;
                let view = DeviceSettingsService::device_view(&settings, device);
                let value = self
                    .settings
                    .toggle(&greenhouse_id, index, device, view.is_on)
                    .await?;
                println!("{} set to {}", device, value);
            }
            Command::Save {
                device,
                mode,
                intensity,
                turn_off_after,
                turn_on_at,
                repeat,
                dates,
            } => {
                let (greenhouse_id, index) = self.selected_field().await?;
                let mode = match mode {
                    ModeArg::Manual => ModeSettings::Manual { turn_off_after },
                    ModeArg::Automatic => ModeSettings::Automatic,
                    ModeArg::Scheduled => match ModeSettings::default_schedule(self.clock.as_ref())
                    {
                        ModeSettings::Scheduled {
                            turn_on_at: default_at,
                            ..
                        } => ModeSettings::Scheduled {
                            turn_on_at: turn_on_at.unwrap_or(default_at),
                            turn_off_after,
                            repeat,
                            dates,
                        },
                        other => other,
                    },
                };
                let report = self
                    .settings
                    .save(&greenhouse_id, index, device, &DeviceSave { intensity, mode })
                    .await?;
                println!(
                    "Saved {}: mode={} intensity={}",
                    report.device,
                    report
                        .config
                        .mode
                        .map(mode_label)
                        .unwrap_or("unknown"),
                    report.intensity
                );
            }
            Command::History { series, hours } => {
                let (greenhouse_id, index) = self.selected_field().await?;
                let query = HistoryQuery::last_hours(series, self.clock.as_ref(), hours);
                let readings = self
                    .api
                    .field_history(&greenhouse_id, index, &query)
                    .await?;
                for reading in readings {
                    println!("{}\t{}{}", reading.timestamp, reading.value, reading.unit);
                }
            }
            Command::Analyze => {
                let greenhouse_id = self.selected_greenhouse().await?;
                let analytics = self.api.analyze_greenhouse(&greenhouse_id).await?;
                let pretty = serde_json::to_string_pretty(&analytics).map_err(|e| {
                    ErrorResponse::new(error_codes::INVALID_RESPONSE, e.to_string())
                })?;
                println!("{}", pretty);
            }
            Command::Listen => self.listen().await?,
        }
        Ok(())
    }

    async fn watch(&self, ticks: u32) -> Result<(), ErrorResponse> {
        self.load_selection().await?;
        if self.garden.state().await.selected_greenhouse.is_none() {
            return Err(no_selection());
        }
        let mut tick_rx = self.garden.subscribe_ticks();
        self.garden.start_polling().await;

        let mut seen = 0u32;
        loop {
            tokio::select! {
                changed = tick_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
            let state = self.garden.state().await;
            match (&state.selected_field, state.selected_field_index) {
                (Some(field), Some(index)) => {
                    println!("-- field {} --", index);
                    print_snapshot(&FieldSnapshot::build(
                        field,
                        self.clock.as_ref(),
                        DEFAULT_FRESHNESS_SECS,
                    ));
                }
                _ => println!("-- no field selected --"),
            }
            seen += 1;
            if ticks > 0 && seen >= ticks {
                break;
            }
        }
        self.garden.stop_polling();
        Ok(())
    }

    async fn listen(&self) -> Result<(), ErrorResponse> {
        self.load_selection().await?;
        let (token, claims) = match (self.session.state().await.token, self.session.claims().await)
        {
            (Some(token), Some(claims)) => (token, claims),
            _ => {
                return Err(ErrorResponse::new(
                    error_codes::NOT_AUTHENTICATED,
                    "Session token carries no user id",
                ))
            }
        };

        let mut socket = SocketSession::connect(
            &self.config.socket_url,
            &token,
            &claims.user_id,
            &RandomIdGenerator::new(),
        )
        .await?;
        let ids: Vec<String> = self
            .garden
            .state()
            .await
            .greenhouses
            .into_iter()
            .map(|g| g.greenhouse_id)
            .collect();
        socket.subscribe_greenhouses(&ids).await?;
        println!("Listening for updates on {} greenhouse(s)", ids.len());

        loop {
            let event = tokio::select! {
                event = socket.next_event() => event,
                _ = tokio::signal::ctrl_c() => break,
            };
            match event {
                Some(SocketEvent::Update(update)) => {
                    let applied = self.garden.apply_sensor_update(&update).await;
                    println!(
                        "update field={} {} ({} reading(s)){}",
                        update.field_index,
                        update.sensor_type,
                        update.sensor_data.len(),
                        if applied { "" } else { " [not selected]" }
                    );
                }
                Some(SocketEvent::Message(value)) => println!("message {}", value),
                Some(SocketEvent::Error(message)) => eprintln!("server error: {}", message),
                Some(SocketEvent::Closed) | None => {
                    println!("Connection closed");
                    return Ok(());
                }
            }
        }

        if let Err(e) = socket.unsubscribe_greenhouses(&ids).await {
            tracing::warn!(error = %e, "Unsubscribe failed");
        }
        socket.disconnect().await?;
        Ok(())
    }
}

fn no_selection() -> ErrorResponse {
    ErrorResponse::new(
        error_codes::NO_SELECTION,
        "No greenhouse selected; run `greenhouse select <id>` first",
    )
}

fn mode_label(mode: DeviceMode) -> &'static str {
    match mode {
        DeviceMode::Manual => "manual",
        DeviceMode::Scheduled => "scheduled",
        DeviceMode::Automatic => "automatic",
    }
}

fn print_snapshot(snapshot: &FieldSnapshot) {
    for entry in &snapshot.series {
        match &entry.latest {
            Some(reading) => println!(
                "{:<22}{:>10.1} {:<4} {:<12} {}",
                entry.series.key(),
                reading.value,
                reading.unit,
                entry.status,
                reading.timestamp
            ),
            None => println!("{:<22}{:>10} {:<4} {}", entry.series.key(), "-", "", entry.status),
        }
    }
    let devices: Vec<String> = DeviceKind::ALL
        .iter()
        .map(|d| format!("{}={}", d, if snapshot.is_on(*d) { "on" } else { "off" }))
        .collect();
    println!("{}", devices.join(" "));
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::from_env()?;
    tracing::debug!(
        "Configuration: api_base_url={}, api_greenhouse_url={}, auth_url={}, storage_path={:?}",
        config.api_base_url,
        config.api_greenhouse_url,
        config.auth_url,
        config.storage_path
    );

    let app = App::build(config).await?;
    match app.run(args.command).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("error: {}: {}", e.error, e.message);
            Ok(ExitCode::FAILURE)
        }
    }
}

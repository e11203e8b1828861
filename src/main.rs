use clap::{Parser, Subcommand};
use ovpnctl::platform::{self, TunnelPlatform, get_platform};
use ovpnctl::profile::EngineOptions;
use ovpnctl::session::credentials::{KIND_AUTH, KIND_PRIVATE_KEY};
use ovpnctl::session::{
    EnvProxy, KeyringStore, LayeredCredentials, MemoryCredentials, NoProxy, ProxyResolver,
    TracingStatus,
};
use ovpnctl::{
    AddressRange, Profile, RouteSpace, Session, SessionContext, Settings, device, dialog,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Engine log verbosity relayed with `--verbose`
const VERBOSE_ENGINE_LOG: u8 = 11;
const DEFAULT_ENGINE_LOG: u8 = 3;
/// Keyring kind for the saved username
const KIND_USERNAME: &str = "Username";

#[derive(Parser)]
#[command(name = "ovpnctl")]
#[command(about = "Session control for an OpenVPN-compatible tunneling engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a profile and show what it converts to
    Parse {
        file: PathBuf,
        /// Print the converted profile as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reconcile included and excluded networks into positive routes
    Routes {
        #[arg(long = "include", value_name = "CIDR")]
        include: Vec<String>,
        #[arg(long = "exclude", value_name = "CIDR")]
        exclude: Vec<String>,
    },
    /// Print the engine configuration for a profile
    Render {
        file: PathBuf,
        /// Management socket path written into the configuration
        #[arg(long)]
        socket: PathBuf,
    },
    /// Run a session until Ctrl+C (SIGUSR1 toggles pause, SIGHUP reconnects)
    Connect {
        file: PathBuf,
        /// Settings file (defaults to the user config directory)
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Store prompted passwords in the OS keyring
        #[arg(long)]
        save_credentials: bool,
    },
    /// Remove a profile's saved credentials from the OS keyring
    Forget { file: PathBuf },
    /// Generate default settings file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Parse { file, json } => {
            let profile = Profile::load(&file)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                print_summary(&profile);
            }
        }
        Commands::Routes { include, exclude } => {
            let mut space = RouteSpace::new();
            for cidr in &include {
                space.add_include(AddressRange::parse_cidr(cidr, true)?);
            }
            for cidr in &exclude {
                space.add_exclude(AddressRange::parse_cidr(cidr, false)?);
            }
            for route in space.positive_routes() {
                println!("{}", route);
            }
        }
        Commands::Render { file, socket } => {
            let profile = Profile::load(&file)?;
            let options = EngineOptions {
                management_socket: socket,
                query_proxy: false,
                verbosity: 1,
            };
            print!("{}", profile.engine_config(&options));
        }
        Commands::Connect {
            file,
            settings,
            save_credentials,
        } => {
            let settings_path = match settings {
                Some(path) => path,
                None => Settings::default_path()?,
            };
            let engine_log = if cli.verbose {
                VERBOSE_ENGINE_LOG
            } else {
                DEFAULT_ENGINE_LOG
            };
            connect(&file, &settings_path, save_credentials, engine_log).await?;
        }
        Commands::Forget { file } => {
            let profile = Profile::load(&file)?;
            let keyring = KeyringStore::new(&profile.name);
            for kind in [KIND_AUTH, KIND_PRIVATE_KEY, KIND_USERNAME] {
                keyring.delete(kind)?;
            }
            println!("Removed saved credentials for '{}'", profile.name);
        }
        Commands::Init { force } => {
            let path = Settings::default_path()?;
            if path.exists() && !force {
                println!("Settings already exist: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }
            Settings::default().save(&path)?;
            println!("Created default settings: {}", path.display());
        }
    }

    Ok(())
}

fn print_summary(profile: &Profile) {
    println!("Profile: {}", profile.name);
    println!("  Auth: {:?}", profile.auth_kind);
    for connection in profile.enabled_connections() {
        println!(
            "  Remote: {} {} {}",
            connection.server_name,
            connection.server_port,
            connection.proto_name()
        );
    }
    if let Some(username) = &profile.username {
        println!("  Username: {}", username);
    }
    println!("  Routes: {}", profile.routes_v4.len() + profile.routes_v6.len());
    for route in profile.routes_v4.iter().chain(&profile.routes_v6) {
        let via = if route.included() { "vpn" } else { "net" };
        println!("    {} ({})", route, via);
    }
    if !profile.dns.is_empty() {
        println!("  DNS: {}", profile.dns.join(", "));
    }
    if !profile.custom_options.is_empty() {
        println!("  Passthrough options present");
    }
}

/// Fill the session store from the profile, then the keyring, then a prompt
fn gather_credentials(
    profile: &Profile,
    session: &MemoryCredentials,
    keyring: &KeyringStore,
    save: bool,
) -> std::io::Result<()> {
    if profile.is_user_pass_auth() {
        let username = match profile.username.clone().or_else(|| keyring.get(KIND_USERNAME)) {
            Some(username) => Some(username),
            None => dialog::prompt_username(&profile.name)?,
        };
        if let Some(username) = &username {
            session.set_username(username);
        }

        if let Some(password) = &profile.password {
            session.set_password(KIND_AUTH, password);
        } else if keyring.get(KIND_AUTH).is_none() {
            if let Some(password) = dialog::prompt_password(KIND_AUTH, &profile.name)? {
                session.set_password(KIND_AUTH, &password);
                if save {
                    save_secret(keyring, KIND_AUTH, &password);
                    if let Some(username) = &username {
                        save_secret(keyring, KIND_USERNAME, username);
                    }
                }
            }
        }
    }

    if profile.requires_key_password() && keyring.get(KIND_PRIVATE_KEY).is_none() {
        if let Some(password) = dialog::prompt_password(KIND_PRIVATE_KEY, &profile.name)? {
            session.set_password(KIND_PRIVATE_KEY, &password);
            if save {
                save_secret(keyring, KIND_PRIVATE_KEY, &password);
            }
        }
    }
    Ok(())
}

fn save_secret(keyring: &KeyringStore, kind: &str, value: &str) {
    match keyring.store(kind, value) {
        Ok(()) => info!("Saved {} to keyring", kind),
        Err(e) => warn!("Failed to save {} to keyring: {}", kind, e),
    }
}

async fn connect(
    file: &Path,
    settings_path: &Path,
    save_credentials: bool,
    engine_log: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load_or_default(settings_path)?;
    settings.validate_headless()?;
    let profile = Profile::load(file)?;
    info!("Loaded profile '{}'", profile.name);

    let keyring = KeyringStore::new(&profile.name);
    let session_store = MemoryCredentials::new();
    gather_credentials(&profile, &session_store, &keyring, save_credentials)?;

    let platform: Arc<dyn TunnelPlatform> = Arc::from(get_platform()?);
    let proxy: Arc<dyn ProxyResolver> = if settings.proxy.use_system_proxy {
        Arc::new(EnvProxy::new())
    } else {
        Arc::new(NoProxy)
    };
    let context = SessionContext {
        status: Arc::new(TracingStatus::new(engine_log)),
        credentials: Arc::new(LayeredCredentials::new(session_store, Some(keyring))),
        platform,
        proxy,
    };

    let (session, handle) = Session::new(profile, context, settings.session_options());
    let mut task = tokio::spawn(session.run());
    let watcher = {
        let handle = handle.clone();
        tokio::spawn(device::watch_network(
            platform::current_network,
            settings.network_poll_interval(),
            move |event| handle.device_event(event),
        ))
    };
    let mut user_signal = signal(SignalKind::user_defined1())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut paused = false;

    info!("Press Ctrl+C to disconnect, send SIGUSR1 to pause or resume, SIGHUP to reconnect");
    loop {
        tokio::select! {
            result = &mut task => {
                result??;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Disconnecting...");
                handle.stop(false);
            }
            Some(()) = user_signal.recv() => {
                paused = !paused;
                info!("{} session", if paused { "Pausing" } else { "Resuming" });
                handle.set_user_pause(paused);
            }
            Some(()) = hangup.recv() => {
                info!("Reconnecting...");
                handle.reconnect();
            }
        }
    }
    watcher.abort();

    info!("Session ended");
    Ok(())
}

use std::env;
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use devicedash::config::BrokerConfig;
use devicedash::dashboard::{ConfigUpdate, Dashboard, DashboardSnapshot};
use devicedash::endpoint::normalize_wss_url;
use devicedash::mqtt::MqttSession;
use devicedash::persistence::{FileSettingsStore, SettingsGateway};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = setup_settings();
    let dashboard = Dashboard::new(MqttSession::rumqtt(), settings, None);
    info!("Client id {}", dashboard.session().client_id());

    if let Some(next) = env_overrides(&dashboard.config()) {
        info!("Applying broker settings from environment: {}", next);
        dashboard
            .set_config(
                next,
                ConfigUpdate {
                    persist: true,
                    reconnect: false,
                },
            )
            .await;
    }
    if !dashboard.config().has_url() {
        warn!("No broker URL configured, set DEVICEDASH_URL");
    }

    let presenter = {
        let observed = dashboard.clone();
        let last_line = Arc::new(Mutex::new(String::new()));
        dashboard.subscribe(move || {
            let line = summary(&observed.snapshot());
            let Ok(mut last) = last_line.lock() else {
                return;
            };
            if *last != line {
                info!("{}", line);
                *last = line;
            }
        })
    };

    let resumed = {
        let dashboard = dashboard.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard.resume().await {
                warn!("Broker not reachable yet: {}", e);
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    resumed.abort();
    presenter.unsubscribe();
    dashboard.disconnect();
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = log_level(env::var("RUST_LOG").ok().as_deref());
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Maximum log level named by `RUST_LOG` (any case, or 1-5); info otherwise.
fn log_level(raw: Option<&str>) -> Level {
    raw.and_then(|value| value.trim().parse::<Level>().ok())
        .unwrap_or(Level::INFO)
}

fn setup_settings() -> SettingsGateway {
    match FileSettingsStore::in_config_dir() {
        Ok(store) => {
            debug!("Settings directory {}", store.dir().display());
            SettingsGateway::new(Arc::new(store))
        }
        Err(e) => {
            warn!("Settings will not be saved: {}", e);
            SettingsGateway::in_memory()
        }
    }
}

/// Broker settings from `DEVICEDASH_*` variables layered over `current`.
fn env_overrides(current: &BrokerConfig) -> Option<BrokerConfig> {
    let mut next = current.clone();
    let mut touched = false;
    let mut take = |key: &str, field: &mut String| {
        if let Ok(value) = env::var(key) {
            *field = value;
            touched = true;
        }
    };
    take("DEVICEDASH_URL", &mut next.url);
    take("DEVICEDASH_ROOT", &mut next.root);
    take("DEVICEDASH_USERNAME", &mut next.username);
    take("DEVICEDASH_PASSWORD", &mut next.password);

    if !touched {
        return None;
    }
    next.url = normalize_wss_url(&next.url);
    Some(next)
}

fn summary(snapshot: &DashboardSnapshot) -> String {
    let latest = |points: &[devicedash::dashboard::TelemetryPoint]| {
        points
            .last()
            .and_then(|p| p.value)
            .map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
    };
    format!(
        "[{:?}] {} wifi={:?} rssi={} temp={} hum={} out1={} out2={}{}",
        snapshot.connection,
        snapshot.device.device_id,
        snapshot.device.wifi,
        snapshot
            .device
            .rssi
            .map_or_else(|| "-".to_string(), |r| r.to_string()),
        latest(&snapshot.temperature),
        latest(&snapshot.humidity),
        snapshot.outputs.out1,
        snapshot.outputs.out2,
        if snapshot.busy { " (busy)" } else { "" },
    )
}

use anyhow::Result;
use colored::Colorize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{Config, LogFormat};

/// Initialize logging and tracing subsystem
pub fn init(config: &Config) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => {
            // JSON formatting for structured logs
            let json_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_thread_ids(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true);

            Registry::default().with(env_filter).with(json_layer).try_init()?;
        }
        LogFormat::Pretty => {
            let pretty_layer = fmt::layer().with_target(false).compact();

            Registry::default().with(env_filter).with(pretty_layer).try_init()?;
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "DevRoom service starting"
    );

    Ok(())
}

/// Log configuration
pub fn log_config(config: &Config) {
    tracing::info!(
        http_bind = %config.http_bind,
        allowed_origin = %config.allowed_origin,
        trust_proxy = config.trust_proxy,
        max_total_rooms = config.max_total_rooms,
        max_users_per_room = config.max_users_per_room,
        max_history = config.max_history,
        room_grace_secs = config.room_grace_period.as_secs(),
        ghost_room_max_age_secs = config.ghost_room_max_age.as_secs(),
        "Service configuration loaded"
    );
}

/// Startup banner for interactive terminals
pub fn print_banner(config: &Config) {
    let rule = "━".repeat(60);
    println!("\n{}", rule.bright_black());
    println!(
        "  {} {}",
        "DevRoom".bright_cyan().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_black()
    );
    println!("  {}", "Real-time collaborative rooms".white());
    println!("{}", rule.bright_black());
    println!("  {:<18} {}", "HTTP + WebSocket".bright_black(), config.http_bind.to_string().bright_white());
    println!("  {:<18} {}", "Allowed origin".bright_black(), config.allowed_origin.bright_white());
    println!(
        "  {:<18} {}",
        "Room ceiling".bright_black(),
        format!("{} rooms x {} users", config.max_total_rooms, config.max_users_per_room).bright_white()
    );
    println!("{}\n", rule.bright_black());
}

/// One status line per service
pub fn log_status(icon: &str, service: &str, status: &str, ok: bool) {
    let status = if ok {
        status.bright_green().bold()
    } else {
        status.bright_red().bold()
    };
    println!("  {} {:<20} {}", icon, service.white(), status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_settings() {
        let config = Config::default();
        // Subscriber init is process-global, so only the inputs are checked here
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(EnvFilter::try_new(&config.log_level).is_ok());
    }

    #[test]
    fn test_banner_and_status_do_not_panic() {
        colored::control::set_override(false);
        print_banner(&Config::default());
        log_status("🧹", "Ghost sweeper", "RUNNING", true);
        log_status("🌐", "HTTP Server", "FAILED", false);
    }
}

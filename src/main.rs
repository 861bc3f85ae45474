use std::process;

use gemini_relay::config::Settings;
use gemini_relay::relay::context::AppContext;
use gemini_relay::{logger, server};

#[tokio::main]
async fn main() {
    // Log panics before they take the process down.
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "Unknown location".to_string());
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Failed to load configuration: {}", err);
            process::exit(1);
        }
    };

    let level = logger::LogLevel::from_str(&settings.log_level).unwrap_or(logger::LogLevel::Info);
    logger::init(level);
    logger::info("app", "gemini-relay starting");

    if settings.api_keys.is_empty() {
        logger::warn("app", "No API keys configured; upstream calls will fail");
    }

    let ctx = match AppContext::new(settings) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("Failed to initialize application context: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = server::serve(ctx).await {
        eprintln!("Server error: {}", err);
        process::exit(1);
    }
}

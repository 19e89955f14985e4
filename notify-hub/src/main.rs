use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify_hub::{
    Callback, Dispatcher, HubConfig, Message, NotifyError, Platform, PlatformReceipt, Target,
    logging::{self, LoggingOptions},
    panic_hook,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Platform that writes deliveries to the log.
struct ConsolePlatform;

#[async_trait]
impl Platform for ConsolePlatform {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, message: &Message, target: &Target) -> Result<PlatformReceipt, NotifyError> {
        info!(
            message_id = %message.id,
            target = %target.value,
            title = %message.title,
            "{}",
            message.body
        );
        Ok(PlatformReceipt::with_external_id(uuid::Uuid::new_v4().to_string()))
    }
}

fn load_config() -> anyhow::Result<HubConfig> {
    let mut config = match std::env::var("NOTIFY_HUB_CONFIG") {
        Ok(path) if !path.trim().is_empty() => HubConfig::from_file(path)?,
        _ => HubConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _logging = logging::init_logging(LoggingOptions {
        log_dir: std::env::var("NOTIFY_HUB_LOG_DIR").ok().map(PathBuf::from),
        ..Default::default()
    })?;
    panic_hook::install();

    let config = load_config()?;
    let dispatcher = Dispatcher::new(config)?;
    dispatcher.register_platform(Arc::new(ConsolePlatform));
    dispatcher.callback_registry().register_global([Callback::on_result(
        |result: notify_hub::SendResult| async move {
            info!(
                message_id = %result.message_id,
                platform = %result.platform,
                success = result.success,
                attempts = result.attempts,
                "Delivery result"
            );
            Ok(())
        },
    )]);
    dispatcher.start();

    let message = Message::builder()
        .title("notify-hub")
        .body("Hello from notify-hub")
        .target(Target::channel("console", "stdout"))
        .build()?;

    let cancel = CancellationToken::new();
    let handle = dispatcher.send_async(message, &cancel).await?;
    let report = handle.wait().await;
    info!(message_id = %report.message_id, status = ?report.status, "Dispatch completed");

    println!("{}", dispatcher.snapshot().to_json()?);

    dispatcher.shutdown(SHUTDOWN_TIMEOUT).await;
    Ok(())
}

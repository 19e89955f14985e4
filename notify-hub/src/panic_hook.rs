use std::panic::{PanicHookInfo, take_hook};
use std::thread;

use crate::taxonomy::panic_message;

/// Installs a global panic hook that also reports panics through `tracing`.
///
/// Panics raised by platforms, callbacks or dispatch workers are recovered by
/// the engine; this makes sure their location still ends up in the log files
/// next to the recovery record. The previous hook still runs afterwards.
pub fn install() {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracing::error!(
                target: "notify_hub::panic",
                thread = %thread_name(),
                location = %location(panic_info),
                payload = %panic_message(panic_info.payload()),
                "Panic"
            );
        }));

        previous_hook(panic_info);
    }));
}

fn location(panic_info: &PanicHookInfo<'_>) -> String {
    panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string())
}

fn thread_name() -> String {
    thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string())
}

//! Optional spoken notifications for noteworthy reconciler events.
//!
//! Fire-and-forget: the TTS subprocess runs on its own task and failures are
//! only logged. Disabled entirely with `ENABLE_VOICE_NOTIFICATIONS=false`.

use tokio::process::Command;
use tracing::{info, warn};

pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn speak(&self, message: &str) {
        if !self.enabled {
            return;
        }
        info!("Speaking: {}", message);

        let message = message.to_string();
        tokio::spawn(async move {
            let mut command = if cfg!(target_os = "macos") {
                let mut c = Command::new("say");
                c.arg(&message);
                c
            } else if cfg!(target_os = "linux") {
                let mut c = Command::new("espeak-ng");
                c.arg("-s").arg("175").arg(&message);
                c
            } else {
                warn!("Voice notifications unsupported on this platform");
                return;
            };

            match command.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("TTS command exited with {}", status),
                Err(err) => warn!("TTS command failed: {}", err),
            }
        });
    }
}

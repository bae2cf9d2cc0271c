//! Colored destination status sampling for an external dashboard.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::services::EngineServices;
use crate::status::StatusColor;

/// Samples destination statuses and pushes colors to the monitor sink.
///
/// A destination that went non-green keeps reporting that color for the
/// configured hold window, so short blips stay visible on the dashboard.
pub struct StatusMonitor {
    config: SchedulerConfig,
    services: EngineServices,
    held: Mutex<HashMap<String, (StatusColor, Instant)>>,
    token: CancellationToken,
}

impl StatusMonitor {
    pub fn new(services: EngineServices, config: SchedulerConfig) -> Self {
        Self {
            config,
            services,
            held: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// One sampling pass over all monitored destinations.
    pub async fn sample(&self) -> Result<()> {
        for destination in self.services.store.destinations().await? {
            if !destination.monitor {
                continue;
            }
            let color = self.resolve(&destination.name, destination.status.into());
            debug!(destination = %destination.name, color = %color, "monitor sample");
            self.services
                .monitor
                .destination_color(&destination.name, color)
                .await;
        }
        Ok(())
    }

    fn resolve(&self, destination: &str, color: StatusColor) -> StatusColor {
        let mut held = self.held.lock();
        if color != StatusColor::Green {
            held.insert(destination.to_owned(), (color, Instant::now()));
            return color;
        }
        if let Some((previous, since)) = held.get(destination) {
            if since.elapsed() < self.config.monitor_hold {
                return *previous;
            }
            held.remove(destination);
        }
        color
    }

    pub async fn run(&self) {
        loop {
            if self.token.is_cancelled() {
                break;
            }
            if let Err(e) = self.sample().await {
                warn!(error = %e, "monitor sampling failed");
            }
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.config.monitor_tick) => {}
            }
        }
    }
}

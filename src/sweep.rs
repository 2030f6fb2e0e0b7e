use std::{io::ErrorKind, path::PathBuf, sync::Arc, time::SystemTime};

use chrono::Utc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::rate_limit::RateLimiter;

/// Deletes entries of `dir` whose mtime is at least `max_age` old. Returns the
/// number removed. Safe to run concurrently; vanished entries are ignored.
pub async fn sweep_stale_files(dir: &std::path::Path, max_age: Duration) -> usize {
    if max_age.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open {:?} for sweeping: {error}", dir);
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not iterate {:?} for sweeping: {error}", dir);
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not read metadata of {:?}: {error}", path);
                }
                continue;
            }
        };

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not read modification time of {:?}: {error}", path);
                continue;
            }
        };

        let age = now.duration_since(modified_at).unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match result {
            Ok(()) => {
                debug!("Swept {:?} (age {}s)", path, age.as_secs());
                removed += 1;
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove {:?}: {error}", path),
        }
    }

    removed
}

/// Runs one sweep immediately and then every `every`, for the lifetime of the
/// process.
pub fn spawn_periodic_sweep(
    dir: PathBuf,
    max_age: Duration,
    every: Duration,
    rate_limiter: Arc<RateLimiter>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let removed = sweep_stale_files(&dir, max_age).await;
            let clients = rate_limiter.prune(Utc::now()).await;
            if removed > 0 {
                info!("Sweep removed {removed} stale file(s) from {:?}", dir);
            }
            debug!("Rate limiter tracking {clients} client(s)");
        }
    })
}

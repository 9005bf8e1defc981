use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fireworks_store::Store;
use fireworks_workflow::LaunchId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Periodic liveness update of a RUNNING launch, on its own tokio task.
///
/// The first ping happens one interval after start. The loop ends when
/// [`Heartbeat::stop`] is called or when the launch is no longer RUNNING.
#[derive(Debug)]
pub struct Heartbeat {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

impl Heartbeat {
  pub fn start(store: Arc<dyn Store>, launch_id: LaunchId, interval: Duration) -> Self {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let period = interval.max(Duration::from_millis(1));

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await;

      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = ticker.tick() => {
            match store.touch_launch(launch_id, Utc::now()).await {
              Ok(true) => debug!(launch_id, "heartbeat"),
              Ok(false) => {
                warn!(launch_id, "heartbeat_launch_not_running");
                break;
              }
              Err(e) => warn!(launch_id, error = %e, "heartbeat_failed"),
            }
          }
        }
      }
    });

    Self { cancel, handle }
  }

  /// Stop pinging and wait for the loop to exit.
  pub async fn stop(self) {
    self.cancel.cancel();
    if let Err(e) = self.handle.await {
      warn!(error = %e, "heartbeat_join_failed");
    }
  }
}

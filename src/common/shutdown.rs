//! Termination signal handling for the binaries.

use futures::{Future, StreamExt};
use signal_hook_tokio::Signals;
use tracing::info;

/// Wait for `SIGTERM`, `SIGQUIT` or `SIGINT`.
///
/// Returns a future that resolves once one of the termination signals
/// has been raised, after which the caller is expected to stop its
/// servers and background tasks.
#[inline]
pub fn wait_for_shutdown() -> anyhow::Result<impl Future<Output = ()> + Send> {
    use signal_hook::consts::TERM_SIGNALS;

    let mut signals = Signals::new(TERM_SIGNALS)?;
    let handle = signals.handle();

    let future = async move {
        if let Some(signal) = signals.next().await {
            info!("Signal {signal} raised, start to shutdown.");
        } else {
            info!("The signal stream is closed.");
        }

        handle.close();
    };

    Ok(future)
}

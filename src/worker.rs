//! Worker thread helpers shared by the server and client cores.

use std::io;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Spawns a named worker thread.
pub(crate) fn spawn<F>(name: &str, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name.to_string()).spawn(f)
}

/// Waits up to `timeout` for a worker to finish, then abandons it.
///
/// Returns whether the worker was actually joined. Abandoned workers are
/// expected to observe their stop flag and exit on their own; resources are
/// released regardless.
pub(crate) fn join_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.join().is_ok()
}

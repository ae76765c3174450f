use crate::runtime::EngineConfig;
use crate::sqe::errors::EngineError;
use std::thread::{self, JoinHandle};

/// Spawns one of the engine's background threads, named by the configured
/// name fn and using the configured stack size.
pub(crate) fn spawn_engine_thread<F>(
    cfg: &EngineConfig,
    role: &str,
    f: F,
) -> Result<JoinHandle<()>, EngineError>
where
    F: FnOnce() + Send + 'static,
{
    let mut builder = thread::Builder::new().name((cfg.thread_name.0)());

    if let Some(stack_size) = cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let handle = builder.spawn(f).map_err(|e| {
        tracing::error!(role, error = %e, "failed to spawn engine thread");
        EngineError::Io(e)
    })?;

    tracing::trace!(role, name = ?handle.thread().name(), "spawned engine thread");
    Ok(handle)
}

/// Joins every handle, reporting how many threads panicked.
pub(crate) fn join_all(handles: impl IntoIterator<Item = JoinHandle<()>>) -> anyhow::Result<()> {
    let panicked = handles
        .into_iter()
        .filter_map(|handle| {
            let name = handle.thread().name().map(str::to_owned);
            handle.join().err().map(|_| name)
        })
        .collect::<Vec<_>>();

    if panicked.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("{} thread(s) panicked: {:?}", panicked.len(), panicked))
    }
}

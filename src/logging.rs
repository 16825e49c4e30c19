use common::Result;
use once_cell::sync::OnceCell;
use rma::Rank;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::MakeWriter;

pub const LOG_DIR_ENV: &str = "RMA_STACK_LOG_DIR";
const DEFAULT_LOG_DIR: &str = "/tmp";
const DEFAULT_FILTER: &str = "info,rma_stack=trace,rma=debug";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// `Rank_<rank>_<info>_<unix seconds>.log`
pub fn logging_filename(rank: Rank, info: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("Rank_{rank}_{info}_{timestamp}.log")
}

/// Routes each event to the file of the rank whose thread emitted it.
///
/// Rank threads are named `rank-<n>`; everything else goes to the file of
/// rank 0.
#[derive(Clone)]
struct RankWriter {
    writers: Vec<NonBlocking>,
}

impl RankWriter {
    fn current(&self) -> NonBlocking {
        let rank = thread::current()
            .name()
            .and_then(|name| name.strip_prefix("rank-"))
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|rank| *rank < self.writers.len())
            .unwrap_or(0);
        self.writers[rank].clone()
    }
}

impl<'a> MakeWriter<'a> for RankWriter {
    type Writer = NonBlocking;

    fn make_writer(&'a self) -> Self::Writer {
        self.current()
    }
}

/// Install a global subscriber writing one log file per rank.
///
/// Returns the log directory, or `None` if logging was already set up.
pub fn init_file_logger(ranks: usize, info: &str) -> Result<Option<PathBuf>> {
    if GUARDS.get().is_some() {
        return Ok(None);
    }
    let dir = PathBuf::from(
        std::env::var(LOG_DIR_ENV).unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string()),
    );
    fs::create_dir_all(&dir).map_err(anyhow::Error::from)?;

    let mut writers = Vec::with_capacity(ranks.max(1));
    let mut guards = Vec::with_capacity(ranks.max(1));
    for rank in 0..ranks.max(1) {
        let appender = tracing_appender::rolling::never(&dir, logging_filename(rank, info));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        writers.push(writer);
        guards.push(guard);
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(RankWriter { writers })
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return Ok(None);
    }
    // Losing this race only means another caller keeps its own guards.
    let _ = GUARDS.set(guards);
    Ok(Some(dir))
}

/// Plain stderr logging for tests and short runs.
pub fn init_stderr_logger() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_carries_rank_and_info() {
        let name = logging_filename(3, "push_only");
        assert!(name.starts_with("Rank_3_push_only_"));
        assert!(name.ends_with(".log"));
        let timestamp = &name["Rank_3_push_only_".len()..name.len() - 4];
        assert!(timestamp.parse::<u64>().is_ok());
    }
}

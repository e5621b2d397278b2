//! Process-wide runtime configuration.

use std::env;

use lazy_static::lazy_static;
use parking_lot::RwLock;

/// How the lock attached to a `syn` object behaves on re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockDiscipline
{
    /// Reader/writer lock. Shared acquisition is recursive; any exclusive
    /// re-entry by the current holder is a fatal reentrancy violation.
    #[default]
    ReaderWriter,
    /// Exclusive lock that its holder may re-enter freely. Reader scopes
    /// still hand out `box(1)` aliases.
    Recursive,
}

impl LockDiscipline
{
    pub(crate) fn parse(it: &str) -> Option<Self>
    {
        match it.trim().to_ascii_lowercase().as_str() {
            "rw" | "reader-writer" | "readerwriter" => Some(Self::ReaderWriter),
            "recursive" | "reentrant" => Some(Self::Recursive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config
{
    /// Discipline given to objects consumed into `syn`.
    pub lock_discipline: LockDiscipline,

    /// Thread name prefix of actor workers.
    pub worker_name: String,

    /// Stack size of actor workers; platform default when `None`.
    pub worker_stack_size: Option<usize>,
}

impl Default for Config
{
    fn default() -> Self
    {
        Self {
            lock_discipline: LockDiscipline::default(),
            worker_name: "refcap-actor".to_owned(),
            worker_stack_size: None,
        }
    }
}

impl Config
{
    /// Defaults, overridden by `REFCAP_LOCK_DISCIPLINE` (`rw` or
    /// `recursive`) and `REFCAP_WORKER_STACK` (bytes).
    pub fn from_env() -> Self
    {
        let mut res = Self::default();
        if let Ok(it) = env::var("REFCAP_LOCK_DISCIPLINE") {
            match LockDiscipline::parse(&it) {
                Some(d) => res.lock_discipline = d,
                None => tracing::warn!(value = %it, "ignoring unknown REFCAP_LOCK_DISCIPLINE"),
            }
        }
        if let Ok(it) = env::var("REFCAP_WORKER_STACK") {
            match it.trim().parse() {
                Ok(n) => res.worker_stack_size = Some(n),
                Err(_) => tracing::warn!(value = %it, "ignoring malformed REFCAP_WORKER_STACK"),
            }
        }
        res
    }
}

lazy_static! {
    static ref CONFIG: RwLock<Config> = RwLock::new(Config::from_env());
}

/// Replace the process-wide configuration. Objects already consumed into
/// `syn` or `asy` keep the settings they were created with.
pub fn configure(config: Config) { *CONFIG.write() = config; }

/// Snapshot of the process-wide configuration.
pub fn config() -> Config { CONFIG.read().clone() }

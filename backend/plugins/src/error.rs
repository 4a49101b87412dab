use thiserror::Error;

/// Errors raised by the mod host.
///
/// Unloading a mod that is not loaded is deliberately absent: it is reported as
/// [`crate::UnloadOutcome::NotLoaded`], not as a failure.
#[derive(Debug, Error)]
pub enum ModError {
    /// The mod's init entry point returned an error or panicked. The partial
    /// registry entry has already been removed.
    #[error("failed to load mod '{name}': {source}")]
    LoadFailure {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The teardown hook failed. Timers and listeners were already released
    /// and the instance was still removed from the registry.
    #[error("mod '{name}' teardown failed: {source}")]
    UnloadFailure {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("mod '{0}' is already being loaded")]
    AlreadyLoading(String),

    #[error("mod '{0}' is already loaded; use reload to refresh it")]
    AlreadyLoaded(String),

    #[error("cannot resolve module '{0}'")]
    Unresolved(String),

    #[error("failed to compile module '{id}': {source}")]
    Compile {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{0}' is a mod entry point, not a library")]
    NotALibrary(String),

    #[error("library '{name}' does not export a value of type {expected}")]
    LibraryType { name: String, expected: &'static str },

    /// New timers were requested after the owning mod started unloading.
    #[error("mod '{0}' is unloading; new timers are rejected")]
    ResourcesClosed(String),

    #[error("timers require a running tokio runtime")]
    NoRuntime,

    #[error("mod discovery failed: {0}")]
    Discovery(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModError {
    /// The mod or module name the error refers to, when there is one.
    pub fn mod_name(&self) -> Option<&str> {
        match self {
            ModError::LoadFailure { name, .. }
            | ModError::UnloadFailure { name, .. }
            | ModError::LibraryType { name, .. } => Some(name),
            ModError::AlreadyLoading(name)
            | ModError::AlreadyLoaded(name)
            | ModError::Unresolved(name)
            | ModError::NotALibrary(name)
            | ModError::ResourcesClosed(name) => Some(name),
            ModError::Compile { id, .. } => Some(id),
            ModError::NoRuntime | ModError::Discovery(_) | ModError::Other(_) => None,
        }
    }
}

pub type ModResult<T> = Result<T, ModError>;

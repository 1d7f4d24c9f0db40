//! Process-wide handle for the outermost entry point.
//!
//! Library code should take an [`Uptrace`] value explicitly. These helpers let
//! a `main` function install one handle and tear it down on exit; until then
//! [`handle`] returns a disabled handle.

use crate::processor::ProcessorError;
use crate::uptrace::Uptrace;
use std::sync::{Arc, OnceLock, RwLock};

static INSTALLED: RwLock<Option<Arc<Uptrace>>> = RwLock::new(None);

fn disabled() -> Arc<Uptrace> {
    static DISABLED: OnceLock<Arc<Uptrace>> = OnceLock::new();
    Arc::clone(DISABLED.get_or_init(|| Arc::new(Uptrace::disabled())))
}

/// Installs `uptrace` as the process-wide handle, returning the previous one.
pub fn install(uptrace: Uptrace) -> Option<Arc<Uptrace>> {
    INSTALLED
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .replace(Arc::new(uptrace))
}

/// The installed handle, or a disabled one.
pub fn handle() -> Arc<Uptrace> {
    INSTALLED
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
        .unwrap_or_else(disabled)
}

/// Uninstalls the process-wide handle and shuts it down.
pub async fn shutdown() -> Result<(), ProcessorError> {
    let installed = INSTALLED
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    match installed {
        Some(uptrace) => uptrace.shutdown().await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_and_shutdown() {
        assert!(!handle().is_enabled());

        let previous = install(Uptrace::disabled());
        assert!(previous.is_none());
        assert!(!handle().is_enabled());

        shutdown().await.unwrap();
        shutdown().await.unwrap();
        assert!(!handle().is_enabled());
    }
}

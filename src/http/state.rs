use crate::supervisor::SessionManager;
use std::path::PathBuf;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle, registry and event bus
    pub manager: SessionManager,
    /// Directory served under `public_path`
    pub output_root: PathBuf,
    /// URL prefix for published output
    pub public_path: String,
}

impl AppState {
    pub fn new(manager: SessionManager) -> Self {
        let output_root = manager.publisher().root().to_path_buf();
        let public_path = manager.publisher().public_path().to_string();
        Self {
            manager,
            output_root,
            public_path,
        }
    }
}

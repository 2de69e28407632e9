use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlickError {
    #[error("no target device selected")]
    NoDevice,

    #[error("adb {action} failed: {detail}")]
    Transport { action: String, detail: String },

    #[error("no template images found under {}", .0.display())]
    NoTemplates(PathBuf),

    #[error("invalid profile file: {0}")]
    Profile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FlickError {
    pub fn transport(action: &str, detail: impl ToString) -> Self {
        FlickError::Transport {
            action: action.to_string(),
            detail: detail.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlickError>;

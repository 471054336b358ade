use thiserror::Error;

pub type SequencerResult<T> = Result<T, SequencerError>;

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Campaign catalog error: {0}")]
    Catalog(String),

    #[error("Unknown campaign kind: {0}")]
    UnknownCampaign(String),

    #[error("Sequence store error: {0}")]
    Store(String),

    #[error("Duplicate active sequence for subject {subject_id}")]
    DuplicateActive { subject_id: String },

    #[error("Sequence instance not found: {0}")]
    InstanceNotFound(uuid::Uuid),

    #[error("Content rendering error for key '{content_key}': {message}")]
    Render {
        content_key: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

//! Error handling for the scenario runner

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("party error: {0}")]
    Party(#[from] partyline_core::PartyError),

    #[error("descriptor error: {0}")]
    Descriptor(#[from] partyline_core::DescriptorError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("scenario step '{step}' failed: {reason}")]
    Step { step: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML encoding error: {0}")]
    TomlEncoding(#[from] toml::ser::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;

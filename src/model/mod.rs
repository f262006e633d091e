use thiserror::Error;

pub mod hosted;
pub mod manifest;
pub mod spec;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error reading package descriptor: {0}")]
    IO(#[from] std::io::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Empty package specifier")]
    EmptySpecifier,
    #[error("Invalid package name `{0}`")]
    InvalidName(String),
    #[error("Invalid url `{0}`: {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("Invalid version range `{0}`: {1}")]
    InvalidRange(String, semver::Error),
    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),
    #[error("Invalid integrity string `{0}`")]
    InvalidIntegrity(String),
}

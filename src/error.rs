//! Defines the custom error types for the storefront-sleuth application.

use std::io;
use std::time::Duration;
use thiserror::Error;
use url::ParseError as UrlParseError;

use crate::models::StorefrontId;

/// The primary error type for the harvesting pipeline.
#[derive(Error, Debug)]
pub(crate) enum AppError {
    /// Error occurring during configuration loading or validation.
    #[error("Configuration Error: {0}")]
    Config(String),

    /// Error related to file input/output operations.
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    /// Error during JSON serialization or deserialization.
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error parsing a URL.
    #[error("URL Parsing Error: {0}")]
    UrlParse(#[from] UrlParseError),

    /// Error making HTTP requests via reqwest.
    #[error("HTTP Request Error: {0}")]
    Request(#[from] reqwest::Error),

    /// The relevance classifier answered with something we could not use.
    #[error("Classifier Error: {0}")]
    Classifier(String),

    /// The relevance classifier did not answer within the configured bound.
    #[error("Classifier timed out after {0:?}")]
    ClassifierTimeout(Duration),

    /// The store has no storefront with this id.
    #[error("Storefront {0} not found")]
    StorefrontNotFound(StorefrontId),

    /// Indicates unusable input data (e.g., empty store URL).
    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    /// An underlying error that doesn't fit other categories, using anyhow.
    #[error("Generic Error: {0}")]
    Generic(#[from] anyhow::Error),
}

pub(crate) type Result<T> = std::result::Result<T, AppError>;

use thiserror::Error;

/// Problems with the matrix, the image table or the environment.
///
/// These abort the whole run; they are never retried or counted as a
/// case-local failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed test matrix: {0}")]
    Matrix(String),

    #[error("case is missing required attribute {attribute}")]
    MissingAttribute { attribute: &'static str },

    #[error("could not find image for case {case_id}")]
    NoImage { case_id: String },

    #[error("case {case_id} matches more than one image: {images:?}")]
    AmbiguousImage { case_id: String, images: Vec<String> },

    #[error("invalid value {value:?} for {variable}")]
    InvalidSetting { variable: &'static str, value: String },
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "API key not configured. Set DEEPSEEK_API_KEY in the environment or in a local .env file."
    )]
    MissingApiKey,
    #[error("Invalid LLM type: '{0}'")]
    InvalidLlmType(String),
    #[error("Failed to read persona file '{path}': {source}")]
    PersonaRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse persona file '{path}': {source}")]
    PersonaParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned status {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("Stream error: {0}")]
    Stream(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("A response is already being generated for this session")]
    Busy,
}

#[derive(Debug, Error, PartialEq)]
pub enum AutoMlError {
    #[error("Dataset is empty")]
    EmptyDataset,
    #[error("Got {features} feature rows but {labels} labels")]
    LengthMismatch {
        features: usize,
        labels: usize,
    },
    #[error("Row {row} has {found} features, expected {expected}")]
    RaggedFeatures {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("Need at least 2 samples to split, got {0}")]
    TooFewSamples(usize),
    #[error("Unknown task '{0}'")]
    UnknownTask(String),
    #[error("No estimator available for candidate '{0}'")]
    UnknownCandidate(String),
    #[error("Estimator '{name}' failed: {message}")]
    Estimator {
        name: String,
        message: String,
    },
    #[error("No candidate produced a comparable score")]
    NoScore,
}

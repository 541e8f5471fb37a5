use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Rule {rule} has interval {interval_seconds}s which is not a positive multiple of the base interval {base_seconds}s")]
    InvalidInterval {
        rule: String,
        interval_seconds: i64,
        base_seconds: i64,
    },
}

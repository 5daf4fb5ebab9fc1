use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuleError>;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{file}:{line}: {msg}")]
    Parse {
        file: String,
        line: usize,
        msg: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuleError {
    pub(crate) fn parse(file: &str, line: usize, msg: impl Into<String>) -> Self {
        RuleError::Parse {
            file: file.to_string(),
            line,
            msg: msg.into(),
        }
    }
}

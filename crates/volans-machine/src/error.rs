use thiserror::Error;

pub type Result<T> = std::result::Result<T, MachineError>;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("no binary loaded")]
    NoBinary,

    #[error("host arena exhausted: need {needed} bytes, {available} available")]
    CapacityExhausted { needed: usize, available: usize },

    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Persist(#[from] volans_persist::PersistError),

    #[error(transparent)]
    Rules(#[from] volans_rules::RuleError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

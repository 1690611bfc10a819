#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Producer(#[from] courier_engine::ProducerError),

    #[error("input line {line}: {detail}")]
    Input { line: usize, detail: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

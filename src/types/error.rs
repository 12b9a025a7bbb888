use thiserror::Error;

/// Structured domain errors. Inconsistent-state variants terminate the
/// workload runner; the supervisor restarts it against persisted state.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("invalid pair notation: [{0}]")]
    InvalidPair(String),

    #[error("unknown position type: [{0}]")]
    UnknownPositionType(String),

    #[error("unknown position status: [{0}]")]
    UnknownPositionStatus(String),

    #[error("unknown order side: [{0}]")]
    UnknownOrderSide(String),

    #[error("unknown candle interval: [{0}]")]
    UnknownInterval(String),

    #[error("entry order has wrong side")]
    EntryOrderWrongSide,

    #[error("exit order has wrong side")]
    ExitOrderWrongSide,

    #[error("exit order exists despite entry order not executed yet")]
    ExitBeforeEntryExecuted,

    #[error("wrong orders count: [{0}]")]
    WrongOrdersCount(usize),

    #[error("candle window is empty")]
    EmptyCandleWindow,
}

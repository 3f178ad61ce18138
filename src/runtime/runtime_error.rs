/// Errors that halt a run. None of them is recoverable inside a contract:
/// the failing instruction aborts the whole call chain.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("dividing by zero")]
    DivideByZero,

    #[error("index out of range index:{index} len:{len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("key {0} doesn't exist")]
    KeyNotFound(String),

    #[error("unknown command {0}")]
    UnknownOpcode(u16),

    #[error("unsupported type of result value in {0}")]
    InvalidReturnType(String),

    #[error("the byte value {0} is out of 0..255")]
    ByteValueOverflow(i64),

    #[error("environment variable {0} is undefined")]
    UndefinedEnvironmentVariable(String),

    #[error("gas is over")]
    OutOfGas,

    #[error("stack size limit exceeded ({0})")]
    StackOverflow(usize),

    #[error("call depth limit exceeded ({0})")]
    CallDepthExceeded(usize),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("bytecode ends inside an instruction at {0}")]
    TruncatedCode(usize),

    #[error("jump from {0} leaves the code")]
    InvalidJump(usize),

    #[error("invalid {kind} handle {handle}")]
    InvalidHandle { kind: &'static str, handle: i64 },

    #[error("type error: expected {expected}, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("operand is not an assignable place")]
    NotAPlace,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("incorrect float result")]
    FloatResult,

    #[error("cannot convert {0} to int")]
    StrToInt(String),

    #[error("cannot convert {0} to money")]
    InvalidMoney(String),

    #[error("json: {0}")]
    Json(String),

    #[error("contract {0} is not loaded")]
    UnknownContract(String),

    #[error("function index {0} is not registered")]
    UnknownFunction(u16),

    #[error("{name}: {message}")]
    HostFunction { name: String, message: String },
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Json(err.to_string())
    }
}

pub fn type_error(expected: &'static str, found: &'static str) -> RuntimeError {
    RuntimeError::TypeMismatch { expected, found }
}

pub fn index_out_of_range(index: i64, len: usize) -> RuntimeError {
    RuntimeError::IndexOutOfRange { index, len }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            index_out_of_range(5, 3).to_string(),
            "index out of range index:5 len:3"
        );
        assert_eq!(RuntimeError::OutOfGas.to_string(), "gas is over");
        assert_eq!(
            RuntimeError::KeyNotFound("k".into()).to_string(),
            "key k doesn't exist"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let err: RuntimeError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, RuntimeError::Json(_)));
    }
}

use crate::lang::types::Type;

/// A compile failure, positioned at the offending node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{contract} {line}:{column}: {kind}")]
pub struct CompileError {
    pub contract: String,
    pub line: u32,
    pub column: u32,
    pub kind: CompileErrorKind,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("operator {0} has not been found")]
    UnknownOperator(String),

    #[error("unexpected type {found}; expecting {expected}")]
    TypeMismatch { expected: Type, found: Type },

    #[error("variable {0} hasn't been defined")]
    UndefinedVariable(String),

    #[error("function {0} hasn't been defined")]
    UndefinedFunction(String),

    #[error("contract {0} hasn't been found")]
    UndefinedContract(String),

    #[error("environment variable ${0} is undefined")]
    UndefinedEnvironment(String),

    #[error("variable {0} has already been defined")]
    Redefinition(String),

    #[error("function {0} has already been defined")]
    FunctionRedefinition(String),

    #[error("function must return {expected}, not {found}")]
    InvalidReturn { expected: Type, found: Type },

    #[error("function must return a value")]
    MissingReturnValue,

    #[error("too big relative jump")]
    JumpTooFar,

    #[error("DATA section is too big ({0} bytes)")]
    DataSectionTooLarge(usize),

    #[error("calling mutable function or contract from the read contract")]
    ReadContractViolation,

    #[error("function cannot be defined inside another function")]
    FunctionNestingError,

    #[error("break must be inside of while or for")]
    BreakOutsideLoop,

    #[error("continue must be inside of while or for")]
    ContinueOutsideLoop,

    #[error("switch doesn't support {0} type")]
    SwitchType(Type),

    #[error("unexpected type {found} of case; expecting {expected}")]
    SwitchTypeMismatch { expected: Type, found: Type },

    #[error("unexpected type of the parameter {name}; expecting {expected}")]
    ParameterTypeMismatch { name: String, expected: Type },

    #[error("contract doesn't have {0} parameter")]
    UnknownContractParameter(String),

    #[error("contract {0} doesn't have parameters")]
    ContractWithoutParameters(String),

    #[error("invalid type")]
    InvalidType,

    #[error("unexpected type {0} of expression; expecting bool")]
    ConditionType(Type),

    #[error("type {0} doesn't support indexing")]
    IndexType(Type),

    #[error("unexpected type {found} of index; expecting {expected}")]
    IndexKeyType { expected: Type, found: Type },

    #[error("unexpected type {0} of expression; expecting array, bytes or map")]
    ForType(Type),

    #[error("{0} cannot appear here")]
    UnexpectedNode(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_position() {
        let err = CompileError {
            contract: "Transfer".to_string(),
            line: 3,
            column: 7,
            kind: CompileErrorKind::UndefinedVariable("amount".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Transfer 3:7: variable amount hasn't been defined"
        );
    }

    #[test]
    fn test_type_names_in_messages() {
        let kind = CompileErrorKind::IndexKeyType {
            expected: Type::STR,
            found: Type::INT,
        };
        assert_eq!(
            kind.to_string(),
            "unexpected type int of index; expecting str"
        );
        assert_eq!(
            CompileErrorKind::UnknownOperator("str*int".into()).to_string(),
            "operator str*int has not been found"
        );
    }
}

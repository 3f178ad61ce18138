use crate::lang::types::Type;
use crate::lang::value::Value;

/// Failure reported by a host function; surfaces as
/// [`RuntimeError::HostFunction`](crate::runtime::runtime_error::RuntimeError::HostFunction).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl From<&str> for HostError {
    fn from(message: &str) -> Self {
        HostError(message.to_string())
    }
}

impl From<String> for HostError {
    fn from(message: String) -> Self {
        HostError(message)
    }
}

/// What a host function hands back: its result (absent for void functions)
/// and the gas it charges on top of the call instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct HostReturn {
    pub value: Option<Value>,
    pub gas: i64,
}

impl HostReturn {
    pub fn new(value: Value, gas: i64) -> Self {
        Self {
            value: Some(value),
            gas,
        }
    }

    pub fn void(gas: i64) -> Self {
        Self { value: None, gas }
    }
}

pub type HostFn = Box<dyn Fn(&[Value]) -> Result<HostReturn, HostError>>;

/// A function supplied by the embedding host.
pub struct HostFunc {
    pub name: String,
    pub params: Vec<Type>,
    pub result: Option<Type>,
    /// Callable from read contracts.
    pub read: bool,
    pub func: HostFn,
}

impl HostFunc {
    pub fn new(
        name: &str,
        params: Vec<Type>,
        result: Option<Type>,
        func: impl Fn(&[Value]) -> Result<HostReturn, HostError> + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            params,
            result,
            read: false,
            func: Box::new(func),
        }
    }

    /// Marks the function as non-mutating.
    pub fn read_only(mut self) -> Self {
        self.read = true;
        self
    }

    pub fn result_type(&self) -> Type {
        self.result.unwrap_or(Type::VOID)
    }
}

impl std::fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunc")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("result", &self.result)
            .field("read", &self.read)
            .finish_non_exhaustive()
    }
}

/// A named, typed environment input read with `$name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvItem {
    pub name: String,
    pub ty: Type,
}

impl EnvItem {
    pub fn new(name: &str, ty: Type) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

/// Everything the host plugs into the compiler and the VM.
#[derive(Debug, Default)]
pub struct Host {
    pub funcs: Vec<HostFunc>,
    pub env: Vec<EnvItem>,
}

impl Host {
    pub fn new(funcs: Vec<HostFunc>, env: Vec<EnvItem>) -> Self {
        Self { funcs, env }
    }

    /// Position and type of the environment item `name`.
    pub fn env_item(&self, name: &str) -> Option<(u16, Type)> {
        self.env
            .iter()
            .position(|item| item.name == name)
            .map(|i| (i as u16, self.env[i].ty))
    }

    pub fn func(&self, index: u16) -> Option<&HostFunc> {
        self.funcs.get(index as usize)
    }
}

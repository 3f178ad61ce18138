//! Symbol table shared by the compiler and the VM.
//!
//! Keys are plain strings built from a signature:
//!
//! - operators: `#<op>#<type>[#<type>]`, e.g. `#+#1#1` for `int + int`;
//! - functions: `$<name>$<type>...`, e.g. `$Len$3` for `Len(str)`;
//! - contracts: the bare contract name.
//!
//! Operators, built-ins and host functions are registered once when the
//! namespace is built. Functions declared inside a contract never touch the
//! shared table: the compiler registers them into a [`Scope`] overlay that is
//! dropped once the contract is compiled.

use crate::bytecode::op::Opcode;
use crate::lang::node::{BinaryOp, UnaryOp};
use crate::lang::types::Type;
use crate::runtime::host::HostFunc;
use crate::runtime::stdlib::STDLIB;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a namespace key resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symbol {
    /// Built-in operator compiled to a single instruction.
    Operator { op: Opcode, result: Type },
    /// Entry of the built-in function table (`EMBEDFUNC`).
    Embedded { index: u16, result: Type },
    /// Host function (`CUSTOMFUNC`).
    Custom { index: u16, result: Type },
    /// Function declared in the contract being compiled (`CALLFUNC`).
    Function { index: u16, result: Type },
    /// A loaded contract (`CALLCONTRACT`).
    Contract(u16),
}

pub fn operator_key(symbol: &str, operands: &[Type]) -> String {
    let mut key = format!("#{}", symbol);
    for ty in operands {
        key.push_str(&format!("#{}", ty.tag()));
    }
    key
}

pub fn func_key(name: &str, params: &[Type]) -> String {
    let mut key = format!("${}", name);
    for ty in params {
        key.push_str(&format!("${}", ty.tag()));
    }
    key
}

/// Key with composite parameter types coarsened to their outer container,
/// so `Len(arr.str)` finds `Len(arr)`.
pub fn soft_func_key(name: &str, params: &[Type]) -> String {
    let coarse: Vec<Type> = params
        .iter()
        .map(|ty| if ty.is_composite() { ty.outer() } else { *ty })
        .collect();
    func_key(name, &coarse)
}

/// Read access to a symbol table.
pub trait Symbols {
    fn get(&self, key: &str) -> Option<Symbol>;

    fn operator(&self, symbol: &str, operands: &[Type]) -> Option<(Opcode, Type)> {
        match self.get(&operator_key(symbol, operands))? {
            Symbol::Operator { op, result } => Some((op, result)),
            _ => None,
        }
    }

    /// Exact signature first, then the soft key.
    fn func(&self, name: &str, args: &[Type]) -> Option<Symbol> {
        self.get(&func_key(name, args)).or_else(|| {
            if args.iter().any(|ty| ty.is_composite()) {
                self.get(&soft_func_key(name, args))
            } else {
                None
            }
        })
    }

    fn contract(&self, name: &str) -> Option<u16> {
        match self.get(name)? {
            Symbol::Contract(index) => Some(index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    symbols: BTreeMap<String, Symbol>,
}

impl Namespace {
    /// Operators and built-ins only.
    pub fn new() -> Self {
        let mut ns = Self::default();
        ns.register_operators();
        for (i, f) in STDLIB.iter().enumerate() {
            ns.register(
                func_key(f.name, f.params),
                Symbol::Embedded {
                    index: i as u16,
                    result: f.result,
                },
            );
        }
        ns
    }

    /// Operators, built-ins and the host's functions.
    pub fn with_host_funcs(funcs: &[HostFunc]) -> Self {
        let mut ns = Self::new();
        for (i, f) in funcs.iter().enumerate() {
            ns.register(
                func_key(&f.name, &f.params),
                Symbol::Custom {
                    index: i as u16,
                    result: f.result_type(),
                },
            );
        }
        ns
    }

    pub fn register(&mut self, key: String, symbol: Symbol) {
        self.symbols.insert(key, symbol);
    }

    pub fn remove(&mut self, key: &str) -> Option<Symbol> {
        self.symbols.remove(key)
    }

    /// Makes a loaded contract callable by name.
    pub fn link_contract(&mut self, name: &str, index: u16) {
        self.register(name.to_string(), Symbol::Contract(index));
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn register_operators(&mut self) {
        use Opcode as O;

        const INT: Type = Type::INT;
        const BOOL: Type = Type::BOOL;
        const STR: Type = Type::STR;
        const FLOAT: Type = Type::FLOAT;
        const MONEY: Type = Type::MONEY;
        const OBJ: Type = Type::OBJECT;
        const BYTES: Type = Type::BYTES;
        const FILE: Type = Type::FILE;
        const VOID: Type = Type::VOID;

        let unary = [
            (UnaryOp::Neg, INT, O::SignInt, INT),
            (UnaryOp::Not, BOOL, O::Not, BOOL),
            (UnaryOp::Neg, FLOAT, O::SignFloat, FLOAT),
            (UnaryOp::Neg, MONEY, O::SignMoney, MONEY),
        ];
        for (op, operand, code, result) in unary {
            self.register(
                operator_key(op.symbol(), &[operand]),
                Symbol::Operator { op: code, result },
            );
        }

        use BinaryOp as B;
        let binary = [
            // int
            (B::Add, INT, INT, O::AddInt, INT),
            (B::Sub, INT, INT, O::SubInt, INT),
            (B::Mul, INT, INT, O::MulInt, INT),
            (B::Div, INT, INT, O::DivInt, INT),
            (B::Mod, INT, INT, O::ModInt, INT),
            (B::Assign, INT, INT, O::AssignInt, VOID),
            (B::AddAssign, INT, INT, O::AssignAddInt, VOID),
            (B::SubAssign, INT, INT, O::AssignSubInt, VOID),
            (B::MulAssign, INT, INT, O::AssignMulInt, VOID),
            (B::DivAssign, INT, INT, O::AssignDivInt, VOID),
            (B::ModAssign, INT, INT, O::AssignModInt, VOID),
            (B::Eq, INT, INT, O::EqInt, BOOL),
            (B::Lt, INT, INT, O::LtInt, BOOL),
            (B::Gt, INT, INT, O::GtInt, BOOL),
            // bool
            (B::Assign, BOOL, BOOL, O::AssignInt, VOID),
            (B::And, BOOL, BOOL, O::And, BOOL),
            (B::Or, BOOL, BOOL, O::Or, BOOL),
            (B::Eq, BOOL, BOOL, O::EqInt, BOOL),
            // str
            (B::Add, STR, STR, O::AddStr, STR),
            (B::Assign, STR, STR, O::AssignStr, VOID),
            (B::AddAssign, STR, STR, O::AssignAddStr, VOID),
            (B::Eq, STR, STR, O::EqStr, BOOL),
            // float
            (B::Add, FLOAT, FLOAT, O::AddFloat, FLOAT),
            (B::Sub, FLOAT, FLOAT, O::SubFloat, FLOAT),
            (B::Mul, FLOAT, FLOAT, O::MulFloat, FLOAT),
            (B::Div, FLOAT, FLOAT, O::DivFloat, FLOAT),
            (B::Assign, FLOAT, FLOAT, O::AssignInt, VOID),
            (B::AddAssign, FLOAT, FLOAT, O::AssignAddFloat, VOID),
            (B::SubAssign, FLOAT, FLOAT, O::AssignSubFloat, VOID),
            (B::MulAssign, FLOAT, FLOAT, O::AssignMulFloat, VOID),
            (B::DivAssign, FLOAT, FLOAT, O::AssignDivFloat, VOID),
            (B::Eq, FLOAT, FLOAT, O::EqFloat, BOOL),
            (B::Lt, FLOAT, FLOAT, O::LtFloat, BOOL),
            (B::Gt, FLOAT, FLOAT, O::GtFloat, BOOL),
            // money values are immutable on the heap, so sharing a handle is safe
            (B::Assign, MONEY, MONEY, O::AssignInt, VOID),
            (B::Add, MONEY, MONEY, O::AddMoney, MONEY),
            (B::Sub, MONEY, MONEY, O::SubMoney, MONEY),
            (B::Mul, MONEY, MONEY, O::MulMoney, MONEY),
            (B::Div, MONEY, MONEY, O::DivMoney, MONEY),
            (B::AddAssign, MONEY, MONEY, O::AssignAddMoney, VOID),
            (B::SubAssign, MONEY, MONEY, O::AssignSubMoney, VOID),
            (B::MulAssign, MONEY, MONEY, O::AssignMulMoney, VOID),
            (B::DivAssign, MONEY, MONEY, O::AssignDivMoney, VOID),
            (B::Eq, MONEY, MONEY, O::EqMoney, BOOL),
            (B::Lt, MONEY, MONEY, O::LtMoney, BOOL),
            (B::Gt, MONEY, MONEY, O::GtMoney, BOOL),
            // obj, bytes, file
            (B::Assign, OBJ, OBJ, O::AssignInt, VOID),
            (B::Assign, BYTES, BYTES, O::AssignInt, VOID),
            (B::AddAssign, BYTES, BYTES, O::AssignAddBytes, VOID),
            (B::Assign, FILE, FILE, O::AssignInt, VOID),
        ];
        for (op, left, right, code, result) in binary {
            self.register(
                operator_key(op.symbol(), &[left, right]),
                Symbol::Operator { op: code, result },
            );
        }
    }
}

impl Symbols for Namespace {
    fn get(&self, key: &str) -> Option<Symbol> {
        self.symbols.get(key).copied()
    }
}

/// Overlay of contract-local functions on top of a shared [`Namespace`].
///
/// Blocks record [`Scope::mark`] on entry and [`Scope::release`] on exit so
/// functions declared inside a block stop resolving after it.
pub struct Scope<'a> {
    base: &'a Namespace,
    local: BTreeMap<String, Symbol>,
    order: Vec<String>,
}

impl<'a> Scope<'a> {
    pub fn new(base: &'a Namespace) -> Self {
        Self {
            base,
            local: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, key: String, symbol: Symbol) {
        self.order.push(key.clone());
        self.local.insert(key, symbol);
    }

    /// Whether `key` was declared in this overlay.
    pub fn is_local(&self, key: &str) -> bool {
        self.local.contains_key(key)
    }

    pub fn mark(&self) -> usize {
        self.order.len()
    }

    /// Forgets everything registered since `mark`.
    pub fn release(&mut self, mark: usize) {
        for key in self.order.drain(mark..) {
            self.local.remove(&key);
        }
    }
}

impl Symbols for Scope<'_> {
    fn get(&self, key: &str) -> Option<Symbol> {
        self.local
            .get(key)
            .copied()
            .or_else(|| self.base.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Value;
    use crate::runtime::host::HostReturn;

    #[test]
    fn test_operator_lookup() {
        let ns = Namespace::new();
        assert_eq!(
            ns.operator("+", &[Type::INT, Type::INT]),
            Some((Opcode::AddInt, Type::INT))
        );
        assert_eq!(
            ns.operator("==", &[Type::STR, Type::STR]),
            Some((Opcode::EqStr, Type::BOOL))
        );
        assert_eq!(
            ns.operator("-", &[Type::MONEY]),
            Some((Opcode::SignMoney, Type::MONEY))
        );
        assert_eq!(ns.operator("*", &[Type::STR, Type::INT]), None);
    }

    #[test]
    fn test_soft_match_coarsens_composites() {
        let ns = Namespace::new();
        let arr_int = Type::array_of(Type::INT).unwrap();
        assert!(matches!(
            ns.func("Len", &[arr_int]),
            Some(Symbol::Embedded {
                result: Type::INT,
                ..
            })
        ));
        let arr_str = Type::array_of(Type::STR).unwrap();
        // Join has an exact arr.str signature
        assert!(ns.func("Join", &[arr_str, Type::STR]).is_some());
        assert!(ns.func("Join", &[arr_int, Type::STR]).is_none());
    }

    #[test]
    fn test_host_funcs_registered() {
        let funcs = vec![HostFunc::new(
            "Balance",
            vec![Type::STR],
            Some(Type::MONEY),
            |_| Ok(HostReturn::new(Value::Int(0), 0)),
        )];
        let ns = Namespace::with_host_funcs(&funcs);
        assert_eq!(
            ns.func("Balance", &[Type::STR]),
            Some(Symbol::Custom {
                index: 0,
                result: Type::MONEY
            })
        );
    }

    #[test]
    fn test_scope_release_forgets_local_functions() {
        let ns = Namespace::new();
        let mut scope = Scope::new(&ns);
        let outer = scope.mark();
        scope.register(
            func_key("f", &[]),
            Symbol::Function {
                index: 0,
                result: Type::INT,
            },
        );
        assert!(scope.func("f", &[]).is_some());
        // base lookups still pass through
        assert!(scope.func("Len", &[Type::STR]).is_some());
        scope.release(outer);
        assert!(scope.func("f", &[]).is_none());
        assert!(ns.func("f", &[]).is_none());
    }

    #[test]
    fn test_contract_linking() {
        let mut ns = Namespace::new();
        ns.link_contract("Pay", 3);
        assert_eq!(ns.contract("Pay"), Some(3));
        assert_eq!(ns.contract("Len"), None);
    }
}

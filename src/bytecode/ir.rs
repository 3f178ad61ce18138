use crate::lang::types::Type;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Slot index and declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarInfo {
    pub index: u16,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncParam {
    pub name: String,
    pub ty: Type,
}

/// A function declared inside a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncInfo {
    pub name: String,
    pub result: Type,
    pub params: Vec<FuncParam>,
    /// Code offset of the first instruction after the function's skip jump.
    pub offset: usize,
    /// Number of variables live where the function was declared. Slots at or
    /// above it are the function's own and are addressed relative to the
    /// call frame.
    pub frame: u16,
}

/// A compiled contract.
///
/// Built once by the compiler and immutable afterwards; the VM only ever
/// reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub name: String,
    /// Read contracts may not call mutating host functions or contracts.
    pub read: bool,
    pub code: Vec<u16>,
    /// Declared `data` parameters, addressable by callers.
    pub params: BTreeMap<String, VarInfo>,
    pub funcs: Vec<FuncInfo>,
}

impl Contract {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// The function whose body starts at `offset`.
    pub fn func_at(&self, offset: usize) -> Option<&FuncInfo> {
        self.funcs.iter().find(|f| f.offset == offset)
    }

    /// Declared parameters ordered by slot.
    pub fn params_by_slot(&self) -> Vec<(&str, VarInfo)> {
        let mut params: Vec<_> = self
            .params
            .iter()
            .map(|(name, info)| (name.as_str(), *info))
            .collect();
        params.sort_by_key(|(_, info)| info.index);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_by_slot_orders_by_index() {
        let mut contract = Contract::new("Pay");
        contract.params.insert(
            "amount".into(),
            VarInfo {
                index: 1,
                ty: Type::MONEY,
            },
        );
        contract.params.insert(
            "to".into(),
            VarInfo {
                index: 0,
                ty: Type::STR,
            },
        );
        let names: Vec<_> = contract
            .params_by_slot()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["to", "amount"]);
    }

    #[test]
    fn test_func_at() {
        let mut contract = Contract::new("C");
        contract.funcs.push(FuncInfo {
            name: "f".into(),
            result: Type::INT,
            params: vec![],
            offset: 12,
            frame: 0,
        });
        assert_eq!(contract.func_at(12).map(|f| f.name.as_str()), Some("f"));
        assert!(contract.func_at(11).is_none());
    }
}

use crate::artifact::{self, ArtifactError};
use crate::bytecode::compile::compile;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::ir::Contract;
use crate::lang::node::{Node, NodeKind};
use crate::lang::value::Value;
use crate::namespace::{Namespace, Symbols};
use crate::runtime::host::{EnvItem, Host, HostFunc};
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm_bc::{Linked, Outcome, VmBc, VmConfig};
use log::debug;

/// Everything a [`Vm`] is built from.
#[derive(Debug)]
pub struct VmSettings {
    /// Gas limit used by [`Vm::call_default`].
    pub gas_limit: i64,
    /// Environment items contracts may read with `$name`.
    pub env: Vec<EnvItem>,
    pub funcs: Vec<HostFunc>,
    pub config: VmConfig,
}

impl Default for VmSettings {
    fn default() -> Self {
        VmSettings {
            gas_limit: 100_000,
            env: Vec::new(),
            funcs: Vec::new(),
            config: VmConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("contract {0} hasn't been loaded")]
    UnknownContract(String),

    #[error("contract {contract} doesn't have {name} parameter")]
    UnknownParameter { contract: String, name: String },

    #[error("parameter {name} expects {expected}, got {found}")]
    ParameterType {
        name: String,
        expected: String,
        found: &'static str,
    },

    #[error("environment variable ${0} hasn't been declared")]
    UnknownEnv(String),
}

/// A loaded set of contracts sharing one namespace, host and heap.
pub struct Vm {
    namespace: Namespace,
    contracts: Vec<Contract>,
    host: Host,
    env: Vec<Option<Value>>,
    runtime: VmBc,
    gas_limit: i64,
}

impl Vm {
    pub fn new(settings: VmSettings) -> Self {
        let namespace = Namespace::with_host_funcs(&settings.funcs);
        let env = vec![None; settings.env.len()];
        Vm {
            namespace,
            contracts: Vec::new(),
            host: Host::new(settings.funcs, settings.env),
            env,
            runtime: VmBc::with_config(settings.config),
            gas_limit: settings.gas_limit,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn contracts(&self) -> &[Contract] {
        &self.contracts
    }

    pub fn contract(&self, name: &str) -> Option<&Contract> {
        let index = self.namespace.contract(name)?;
        self.contracts.get(index as usize)
    }

    pub fn heap(&self) -> &crate::runtime::heap::Heap {
        &self.runtime.heap
    }

    /// Compiles a contract tree and links it under its name. Loading a name
    /// again replaces the earlier contract in place.
    pub fn load(&mut self, ast: &Node) -> Result<u16, CompileError> {
        let contract = compile(ast, &self.namespace, &self.contracts, &self.host)?;
        Ok(self.link(contract))
    }

    /// Installs a contract decoded from an artifact together with the
    /// namespace it was compiled against.
    pub fn load_artifact(&mut self, bytes: &[u8]) -> Result<u16, ArtifactError> {
        let (contract, namespace) = artifact::decode(bytes)?;
        self.namespace = namespace;
        Ok(self.link(contract))
    }

    /// Persisted form of the loaded contract `name`.
    pub fn artifact(&self, name: &str) -> Result<Vec<u8>, VmError> {
        let contract = self
            .contract(name)
            .ok_or_else(|| VmError::UnknownContract(name.to_string()))?;
        Ok(artifact::encode(contract, &self.namespace)?)
    }

    fn link(&mut self, contract: Contract) -> u16 {
        let index = match self.namespace.contract(&contract.name) {
            Some(index) if (index as usize) < self.contracts.len() => {
                self.contracts[index as usize] = contract;
                index
            }
            _ => {
                let index = self.contracts.len() as u16;
                self.namespace.link_contract(&contract.name, index);
                self.contracts.push(contract);
                index
            }
        };
        debug!("linked contract {} as {}", self.contracts[index as usize].name, index);
        index
    }

    /// Sets the value `$name` reads.
    pub fn set_env(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        let (index, ty) = self
            .host
            .env_item(name)
            .ok_or_else(|| VmError::UnknownEnv(name.to_string()))?;
        if !value.fits(ty) {
            return Err(VmError::ParameterType {
                name: format!("${}", name),
                expected: ty.to_string(),
                found: value.type_name(),
            });
        }
        self.env[index as usize] = Some(value);
        Ok(())
    }

    /// Runs the contract at `index` with already allocated parameter slots.
    pub fn run(&mut self, index: u16, params: &[(u16, i64)], gas_limit: i64) -> Outcome {
        let Some(contract) = self.contracts.get(index as usize) else {
            return Outcome {
                result: String::new(),
                gas_used: 0,
                error: Some(RuntimeError::UnknownContract(index.to_string())),
            };
        };
        let linked = Linked {
            contracts: &self.contracts,
            host: &self.host,
            env: &self.env,
        };
        self.runtime.run(&linked, contract, params, gas_limit)
    }

    /// Runs the contract `name` with named host values as its `data`
    /// parameters. The values are released again once the run is over.
    pub fn call(
        &mut self,
        name: &str,
        params: &[(&str, Value)],
        gas_limit: i64,
    ) -> Result<Outcome, VmError> {
        let index = self
            .namespace
            .contract(name)
            .filter(|&i| (i as usize) < self.contracts.len())
            .ok_or_else(|| VmError::UnknownContract(name.to_string()))?;

        let checkpoint = self.runtime.heap.checkpoint();
        let slots = self.marshal(index, params);
        let outcome = slots.map(|slots| self.run(index, &slots, gas_limit));
        self.runtime.heap.restore(checkpoint);
        outcome
    }

    /// Calls with the default gas limit.
    pub fn call_default(&mut self, name: &str, params: &[(&str, Value)]) -> Result<Outcome, VmError> {
        self.call(name, params, self.gas_limit)
    }

    fn marshal(&mut self, index: u16, params: &[(&str, Value)]) -> Result<Vec<(u16, i64)>, VmError> {
        let contract = &self.contracts[index as usize];
        let mut slots = Vec::with_capacity(params.len());
        for (name, value) in params {
            let info = contract
                .params
                .get(*name)
                .ok_or_else(|| VmError::UnknownParameter {
                    contract: contract.name.clone(),
                    name: name.to_string(),
                })?;
            if !value.fits(info.ty) {
                return Err(VmError::ParameterType {
                    name: name.to_string(),
                    expected: info.ty.to_string(),
                    found: value.type_name(),
                });
            }
            slots.push((info.index, self.runtime.heap.store(info.ty, value)?));
        }
        Ok(slots)
    }
}

/// Name of a contract tree, if it is one.
pub fn contract_name(ast: &Node) -> Option<&str> {
    match &ast.kind {
        NodeKind::Contract { name, .. } => Some(name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::node::{BinaryOp, VarDef};
    use crate::lang::types::Type;
    use crate::runtime::host::HostReturn;
    use rust_decimal::Decimal;

    fn vm() -> Vm {
        Vm::new(VmSettings::default())
    }

    #[test]
    fn test_load_and_run() {
        let mut vm = vm();
        let ast = Node::contract(
            "Sum",
            false,
            Vec::new(),
            vec![Node::ret(Some(Node::binary(
                BinaryOp::Add,
                Node::int(2),
                Node::binary(BinaryOp::Mul, Node::int(3), Node::int(4)),
            )))],
        );
        let index = vm.load(&ast).unwrap();
        let outcome = vm.run(index, &[], 1000);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.result, "14");
        assert!(outcome.gas_used > 0);
        assert_eq!(contract_name(&ast), Some("Sum"));
    }

    #[test]
    fn test_call_with_params() {
        let mut vm = vm();
        let ast = Node::contract(
            "Fee",
            false,
            vec![VarDef::param("amount", Type::MONEY), VarDef::param("who", Type::STR)],
            vec![Node::ret(Some(Node::binary(
                BinaryOp::Add,
                Node::var("who"),
                Node::call("str", vec![Node::var("amount")]),
            )))],
        );
        vm.load(&ast).unwrap();
        let outcome = vm
            .call(
                "Fee",
                &[
                    ("amount", Value::Money(Decimal::new(125, 1))),
                    ("who", Value::Str("bob:".into())),
                ],
                1000,
            )
            .unwrap();
        assert_eq!(outcome.result, "bob:12.5");
        assert_eq!(vm.heap().strings_len(), 0);
        assert_eq!(vm.heap().objects_len(), 0);
    }

    #[test]
    fn test_call_rejects_bad_params() {
        let mut vm = vm();
        let ast = Node::contract(
            "P",
            false,
            vec![VarDef::param("n", Type::INT)],
            vec![Node::ret(Some(Node::var("n")))],
        );
        vm.load(&ast).unwrap();
        assert!(matches!(
            vm.call("P", &[("x", Value::Int(1))], 100),
            Err(VmError::UnknownParameter { .. })
        ));
        assert!(matches!(
            vm.call("P", &[("n", Value::Str("1".into()))], 100),
            Err(VmError::ParameterType { .. })
        ));
        assert!(matches!(
            vm.call("Missing", &[], 100),
            Err(VmError::UnknownContract(_))
        ));
    }

    #[test]
    fn test_env() {
        let mut vm = Vm::new(VmSettings {
            env: vec![EnvItem::new("block", Type::INT)],
            ..VmSettings::default()
        });
        let ast = Node::contract("E", false, Vec::new(), vec![Node::ret(Some(Node::env("block")))]);
        let index = vm.load(&ast).unwrap();

        let outcome = vm.run(index, &[], 100);
        assert_eq!(
            outcome.error,
            Some(RuntimeError::UndefinedEnvironmentVariable("block".into()))
        );

        vm.set_env("block", Value::Int(77)).unwrap();
        assert_eq!(vm.run(index, &[], 100).result, "77");
        assert!(vm.set_env("block", Value::Bool(true)).is_err());
        assert!(matches!(
            vm.set_env("nope", Value::Int(1)),
            Err(VmError::UnknownEnv(_))
        ));
    }

    #[test]
    fn test_host_function() {
        let mut vm = Vm::new(VmSettings {
            funcs: vec![HostFunc::new(
                "Twice",
                vec![Type::STR],
                Some(Type::STR),
                |args| match args {
                    [Value::Str(s)] => Ok(HostReturn::new(Value::Str(s.repeat(2)), 10)),
                    _ => Err("bad args".into()),
                },
            )],
            ..VmSettings::default()
        });
        let ast = Node::contract(
            "H",
            false,
            Vec::new(),
            vec![Node::ret(Some(Node::call("Twice", vec![Node::str("ab")])))],
        );
        let index = vm.load(&ast).unwrap();
        let outcome = vm.run(index, &[], 1000);
        assert_eq!(outcome.result, "abab");
        assert!(outcome.gas_used > 10);
    }

    #[test]
    fn test_reload_replaces_contract() {
        let mut vm = vm();
        let first = Node::contract("R", false, Vec::new(), vec![Node::ret(Some(Node::int(1)))]);
        let second = Node::contract("R", false, Vec::new(), vec![Node::ret(Some(Node::int(2)))]);
        let a = vm.load(&first).unwrap();
        let b = vm.load(&second).unwrap();
        assert_eq!(a, b);
        assert_eq!(vm.contracts().len(), 1);
        assert_eq!(vm.run(a, &[], 100).result, "2");
    }

    #[test]
    fn test_artifact_roundtrip() {
        let mut vm = vm();
        let ast = Node::contract(
            "A",
            false,
            Vec::new(),
            vec![Node::ret(Some(Node::binary(BinaryOp::Add, Node::str("x"), Node::str("y"))))],
        );
        let index = vm.load(&ast).unwrap();
        let expected = vm.run(index, &[], 100);
        let bytes = vm.artifact("A").unwrap();

        let mut fresh = Vm::new(VmSettings::default());
        let loaded = fresh.load_artifact(&bytes).unwrap();
        assert_eq!(fresh.run(loaded, &[], 100), expected);
    }
}

use crate::bytecode::ir::Contract;
use crate::bytecode::op::{Opcode, jump_target};
use crate::lang::types::{Kind, Type};
use crate::lang::value::Value;
use crate::runtime::heap::{Checkpoint, Heap, Object};
use crate::runtime::host::Host;
use crate::runtime::runtime_error::{RuntimeError, index_out_of_range, type_error};
use crate::runtime::stdlib::STDLIB;
use log::{debug, trace};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Nested `CALLFUNC` frames within one contract run.
    pub max_call_depth: usize,
    pub max_stack_size: usize,
    /// Nested `CALLCONTRACT` runs.
    pub max_contract_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_stack_size: 10_000,
            max_contract_depth: 64,
        }
    }
}

/// Something an assignment instruction can write through.
#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    /// Runtime variable slot.
    Var(usize),
    /// Element of an array or bytes object, bounds-checked when created.
    Elem { handle: i64, index: usize },
    /// Entry of a map object; the key need not exist yet.
    Entry { handle: i64, key: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Value(i64),
    Place(Place),
}

/// Result of one top-level run.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Display form of the returned value; empty on error.
    pub result: String,
    pub gas_used: i64,
    pub error: Option<RuntimeError>,
}

impl Outcome {
    pub fn into_result(self) -> Result<String, RuntimeError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

/// The loaded world a run can reach: other contracts, host functions and
/// environment values (indexed like `host.env`).
pub struct Linked<'a> {
    pub contracts: &'a [Contract],
    pub host: &'a Host,
    pub env: &'a [Option<Value>],
}

/// The bytecode interpreter. Owns the heap arenas shared by every run.
#[derive(Debug, Default)]
pub struct VmBc {
    pub heap: Heap,
    config: VmConfig,
}

impl VmBc {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            heap: Heap::new(),
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Runs `contract` with `params` as (variable slot, value) pairs.
    ///
    /// Everything the run allocates is released before returning.
    pub fn run<'c>(
        &mut self,
        linked: &'c Linked<'c>,
        contract: &'c Contract,
        params: &[(u16, i64)],
        gas_limit: i64,
    ) -> Outcome {
        let (result, gas_used) = execute(
            &mut self.heap,
            self.config,
            linked,
            contract,
            params.to_vec(),
            gas_limit,
            0,
        );
        match result {
            Ok(result) => Outcome {
                result,
                gas_used,
                error: None,
            },
            Err(err) => {
                debug!("contract {} failed: {}", contract.name, err);
                Outcome {
                    result: String::new(),
                    gas_used,
                    error: Some(err),
                }
            }
        }
    }
}

fn execute<'c>(
    heap: &mut Heap,
    config: VmConfig,
    linked: &'c Linked<'c>,
    contract: &'c Contract,
    params: Vec<(u16, i64)>,
    gas_limit: i64,
    depth: usize,
) -> (Result<String, RuntimeError>, i64) {
    let checkpoint = heap.checkpoint();
    let mut exec = Exec {
        heap: &mut *heap,
        linked,
        contract,
        config,
        depth,
        gas: 0,
        gas_limit,
        ip: 0,
        data: Vec::new(),
        vars: Vec::new(),
        stack: Vec::new(),
        frames: Vec::new(),
        params,
        pars: Vec::new(),
        par_checkpoint: None,
    };
    let result = exec.exec();
    let gas = exec.gas;
    heap.restore(checkpoint);
    (result, gas)
}

/// A function call in progress.
struct Frame {
    return_ip: usize,
    /// Runtime variable count at the call.
    vars_len: usize,
    /// Operand stack height below the arguments.
    stack_base: usize,
    /// Compile-time slot index where the function's own variables start.
    compile_base: usize,
    returns: bool,
}

#[derive(Debug, Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

enum Cmp {
    Eq,
    Lt,
    Gt,
}

fn int_arith(arith: Arith, a: i64, b: i64) -> Result<i64, RuntimeError> {
    Ok(match arith {
        Arith::Add => a.wrapping_add(b),
        Arith::Sub => a.wrapping_sub(b),
        Arith::Mul => a.wrapping_mul(b),
        Arith::Div | Arith::Mod if b == 0 => return Err(RuntimeError::DivideByZero),
        Arith::Div => a.wrapping_div(b),
        Arith::Mod => a.wrapping_rem(b),
    })
}

fn float(slot: i64) -> f64 {
    f64::from_bits(slot as u64)
}

fn float_slot(f: f64) -> i64 {
    f.to_bits() as i64
}

fn float_arith(arith: Arith, a: i64, b: i64) -> Result<i64, RuntimeError> {
    let (a, b) = (float(a), float(b));
    Ok(float_slot(match arith {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
        Arith::Div if b == 0.0 => return Err(RuntimeError::DivideByZero),
        Arith::Div => a / b,
        Arith::Mod => a % b,
    }))
}

fn money_arith(heap: &mut Heap, arith: Arith, a: i64, b: i64) -> Result<i64, RuntimeError> {
    let (a, b) = (heap.money(a)?, heap.money(b)?);
    let result = match arith {
        Arith::Add => a.checked_add(b),
        Arith::Sub => a.checked_sub(b),
        Arith::Mul => a.checked_mul(b),
        Arith::Div | Arith::Mod if b.is_zero() => return Err(RuntimeError::DivideByZero),
        Arith::Div => a.checked_div(b),
        Arith::Mod => a.checked_rem(b),
    };
    let result = result.ok_or_else(|| RuntimeError::InvalidMoney(format!("{} overflow", a)))?;
    Ok(heap.push(Object::Money(result)))
}

fn compare<T: PartialOrd>(cmp: Cmp, a: T, b: T) -> i64 {
    (match cmp {
        Cmp::Eq => a == b,
        Cmp::Lt => a < b,
        Cmp::Gt => a > b,
    }) as i64
}

fn concat(heap: &mut Heap, a: i64, b: i64) -> Result<i64, RuntimeError> {
    let joined = format!("{}{}", heap.str(a)?, heap.str(b)?);
    Ok(heap.push_str(joined))
}

fn is_copied_param(ty: Type) -> bool {
    matches!(
        ty.kind(),
        Kind::Str | Kind::Arr | Kind::Map | Kind::Money | Kind::Bytes | Kind::File
    )
}

/// State of one contract run.
struct Exec<'h, 'c> {
    heap: &'h mut Heap,
    linked: &'c Linked<'c>,
    contract: &'c Contract,
    config: VmConfig,
    /// Contract nesting depth of this run.
    depth: usize,
    gas: i64,
    gas_limit: i64,
    ip: usize,
    /// Constant pool unpacked by DATA.
    data: Vec<u8>,
    vars: Vec<i64>,
    stack: Vec<Operand>,
    frames: Vec<Frame>,
    /// Parameters this run was called with.
    params: Vec<(u16, i64)>,
    /// Parameters collected by PARCONTRACT for the next CALLCONTRACT.
    pars: Vec<(u16, i64)>,
    par_checkpoint: Option<Checkpoint>,
}

impl<'h, 'c> Exec<'h, 'c> {
    // =========================================================================
    // Limits
    // =========================================================================

    fn check_limits(&mut self) -> Result<(), RuntimeError> {
        self.gas = self.gas.saturating_add(1);
        if self.gas > self.gas_limit {
            debug!("contract {} is out of gas at {}", self.contract.name, self.ip);
            return Err(RuntimeError::OutOfGas);
        }

        if self.stack.len() > self.config.max_stack_size {
            return Err(RuntimeError::StackOverflow(self.config.max_stack_size));
        }
        Ok(())
    }

    fn charge(&mut self, gas: i64) -> Result<(), RuntimeError> {
        self.gas = self.gas.saturating_add(gas.max(0));
        if self.gas > self.gas_limit {
            return Err(RuntimeError::OutOfGas);
        }
        Ok(())
    }

    // =========================================================================
    // Stack
    // =========================================================================

    fn push(&mut self, value: i64) {
        self.stack.push(Operand::Value(value));
    }

    fn pop(&mut self) -> Result<i64, RuntimeError> {
        match self.stack.pop() {
            Some(Operand::Value(v)) => Ok(v),
            Some(Operand::Place(_)) => Err(type_error("value", "place")),
            None => Err(RuntimeError::StackUnderflow),
        }
    }

    fn pop_place(&mut self) -> Result<Place, RuntimeError> {
        match self.stack.pop() {
            Some(Operand::Place(place)) => Ok(place),
            Some(Operand::Value(_)) => Err(RuntimeError::NotAPlace),
            None => Err(RuntimeError::StackUnderflow),
        }
    }

    /// Pops `n` values, oldest first.
    fn pop_n(&mut self, n: usize) -> Result<Vec<i64>, RuntimeError> {
        let start = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or(RuntimeError::StackUnderflow)?;
        self.stack
            .drain(start..)
            .map(|operand| match operand {
                Operand::Value(v) => Ok(v),
                Operand::Place(_) => Err(type_error("value", "place")),
            })
            .collect()
    }

    /// Applies `f` to the two top values. The stack is left untouched when
    /// `f` fails.
    fn binary(
        &mut self,
        f: impl FnOnce(&mut Heap, i64, i64) -> Result<i64, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let len = self.stack.len();
        let (a, b) = match self.stack.get(len.wrapping_sub(2)..) {
            Some([Operand::Value(a), Operand::Value(b)]) => (*a, *b),
            Some([_, _]) => return Err(type_error("value", "place")),
            _ => return Err(RuntimeError::StackUnderflow),
        };
        let result = f(&mut *self.heap, a, b)?;
        self.stack.truncate(len - 2);
        self.push(result);
        Ok(())
    }

    fn unary(&mut self, f: impl FnOnce(&mut Heap, i64) -> Result<i64, RuntimeError>) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let result = f(&mut *self.heap, value)?;
        self.push(result);
        Ok(())
    }

    // =========================================================================
    // Places
    // =========================================================================

    /// Runtime slot of compile-time variable `index`. Inside a function the
    /// function's own variables are relative to its frame.
    fn var_slot(&self, index: u16) -> Result<usize, RuntimeError> {
        let index = index as usize;
        let slot = match self.frames.last() {
            Some(frame) if index >= frame.compile_base => frame.vars_len + index - frame.compile_base,
            _ => index,
        };
        if slot < self.vars.len() {
            Ok(slot)
        } else {
            Err(RuntimeError::InvalidHandle {
                kind: "variable",
                handle: index as i64,
            })
        }
    }

    fn read(&self, place: &Place) -> Result<i64, RuntimeError> {
        match place {
            Place::Var(slot) => self.vars.get(*slot).copied().ok_or(RuntimeError::InvalidHandle {
                kind: "variable",
                handle: *slot as i64,
            }),
            Place::Elem { handle, index } => match self.heap.object(*handle)? {
                Object::Array(items) => items
                    .get(*index)
                    .copied()
                    .ok_or_else(|| index_out_of_range(*index as i64, items.len())),
                Object::Bytes(bytes) => bytes
                    .get(*index)
                    .map(|&b| b as i64)
                    .ok_or_else(|| index_out_of_range(*index as i64, bytes.len())),
                other => Err(type_error("arr", other.kind_name())),
            },
            Place::Entry { handle, key } => self
                .heap
                .map(*handle)?
                .get(key)
                .copied()
                .ok_or_else(|| RuntimeError::KeyNotFound(key.clone())),
        }
    }

    fn write(&mut self, place: &Place, value: i64) -> Result<(), RuntimeError> {
        match place {
            Place::Var(slot) => {
                let var = self.vars.get_mut(*slot).ok_or(RuntimeError::InvalidHandle {
                    kind: "variable",
                    handle: *slot as i64,
                })?;
                *var = value;
            }
            Place::Elem { handle, index } => match self.heap.object_mut(*handle)? {
                Object::Array(items) => {
                    let len = items.len();
                    let item = items
                        .get_mut(*index)
                        .ok_or_else(|| index_out_of_range(*index as i64, len))?;
                    *item = value;
                }
                Object::Bytes(bytes) => {
                    let byte =
                        u8::try_from(value).map_err(|_| RuntimeError::ByteValueOverflow(value))?;
                    let len = bytes.len();
                    let item = bytes
                        .get_mut(*index)
                        .ok_or_else(|| index_out_of_range(*index as i64, len))?;
                    *item = byte;
                }
                other => return Err(type_error("arr", other.kind_name())),
            },
            Place::Entry { handle, key } => {
                self.heap.map_mut(*handle)?.insert(key.clone(), value);
            }
        }
        Ok(())
    }

    /// `( place value -- )`: stores `f(current, value)` through the place.
    fn assign(
        &mut self,
        f: impl FnOnce(&mut Heap, i64, i64) -> Result<i64, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let place = self.pop_place()?;
        let current = self.read(&place)?;
        let result = f(&mut *self.heap, current, value)?;
        self.write(&place, result)
    }

    /// `( place value -- )`: stores the value as is.
    fn store(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let place = self.pop_place()?;
        self.write(&place, value)
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    fn jump(&self, at: usize) -> Result<usize, RuntimeError> {
        jump_target(at + 1, self.contract.code[at + 1])
            .filter(|&target| target <= self.contract.code.len())
            .ok_or(RuntimeError::InvalidJump(at))
    }

    /// Truncates the operand stack to the current frame before a statement
    /// level jump.
    fn reset_stack(&mut self) {
        let base = self.frames.last().map_or(0, |frame| frame.stack_base);
        self.stack.truncate(base);
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn exec(&mut self) -> Result<String, RuntimeError> {
        let contract = self.contract;
        let code = &contract.code;

        while self.ip < code.len() {
            self.check_limits()?;

            let at = self.ip;
            let op = Opcode::try_from(code[at]).map_err(RuntimeError::UnknownOpcode)?;
            let width = op.operand_len(code, at);
            if at + width >= code.len() {
                return Err(RuntimeError::TruncatedCode(at));
            }
            let args = &code[at + 1..=at + width];
            trace!("{:04} {:<14} {:?} stack={}", at, op.mnemonic(), args, self.stack.len());
            self.ip = at + 1 + width;

            match op {
                Opcode::Nop => {}

                // Literals
                Opcode::Push16 => self.push(args[0] as i16 as i64),
                Opcode::Push32 => {
                    let bits = (args[0] as u32) << 16 | args[1] as u32;
                    self.push(bits as i32 as i64);
                }
                Opcode::Push64 => {
                    let bits = args
                        .iter()
                        .fold(0u64, |acc, &word| acc << 16 | word as u64);
                    self.push(bits as i64);
                }
                Opcode::PushStr => {
                    let (offset, len) = (args[0] as usize, args[1] as usize);
                    let bytes = self.data.get(offset..offset + len).ok_or(
                        RuntimeError::InvalidHandle {
                            kind: "data",
                            handle: offset as i64,
                        },
                    )?;
                    let text = String::from_utf8_lossy(bytes).into_owned();
                    let handle = self.heap.push_str(text);
                    self.push(handle);
                }
                Opcode::Data => {
                    self.data = args[1..]
                        .iter()
                        .flat_map(|word| word.to_be_bytes())
                        .collect();
                }

                // Variables
                Opcode::InitVars => {
                    for &tag in &args[1..] {
                        let slot = self.heap.default_slot(Type::from_tag(tag));
                        self.vars.push(slot);
                    }
                }
                Opcode::DelVars => {
                    let count = args[0] as usize;
                    let keep = match self.frames.last() {
                        Some(frame) if count >= frame.compile_base => {
                            frame.vars_len + count - frame.compile_base
                        }
                        _ => count,
                    };
                    self.vars.truncate(keep);
                }
                Opcode::GetVar => {
                    let slot = self.var_slot(args[0])?;
                    self.push(self.vars[slot]);
                }
                Opcode::SetVar => {
                    let slot = self.var_slot(args[0])?;
                    self.stack.push(Operand::Place(Place::Var(slot)));
                }

                // Jumps
                Opcode::Jmp => {
                    self.ip = self.jump(at)?;
                    self.reset_stack();
                }
                Opcode::JmpRel => self.ip = self.jump(at)?,
                Opcode::Jze | Opcode::Jnz => {
                    let value = self.pop()?;
                    if (value == 0) == (op == Opcode::Jze) {
                        self.ip = self.jump(at)?;
                    }
                }

                // int
                Opcode::AddInt => self.binary(|_, a, b| int_arith(Arith::Add, a, b))?,
                Opcode::SubInt => self.binary(|_, a, b| int_arith(Arith::Sub, a, b))?,
                Opcode::MulInt => self.binary(|_, a, b| int_arith(Arith::Mul, a, b))?,
                Opcode::DivInt => self.binary(|_, a, b| int_arith(Arith::Div, a, b))?,
                Opcode::ModInt => self.binary(|_, a, b| int_arith(Arith::Mod, a, b))?,
                Opcode::EqInt => self.binary(|_, a, b| Ok(compare(Cmp::Eq, a, b)))?,
                Opcode::LtInt => self.binary(|_, a, b| Ok(compare(Cmp::Lt, a, b)))?,
                Opcode::GtInt => self.binary(|_, a, b| Ok(compare(Cmp::Gt, a, b)))?,

                // float
                Opcode::AddFloat => self.binary(|_, a, b| float_arith(Arith::Add, a, b))?,
                Opcode::SubFloat => self.binary(|_, a, b| float_arith(Arith::Sub, a, b))?,
                Opcode::MulFloat => self.binary(|_, a, b| float_arith(Arith::Mul, a, b))?,
                Opcode::DivFloat => self.binary(|_, a, b| float_arith(Arith::Div, a, b))?,
                Opcode::EqFloat => self.binary(|_, a, b| Ok(compare(Cmp::Eq, float(a), float(b))))?,
                Opcode::LtFloat => self.binary(|_, a, b| Ok(compare(Cmp::Lt, float(a), float(b))))?,
                Opcode::GtFloat => self.binary(|_, a, b| Ok(compare(Cmp::Gt, float(a), float(b))))?,

                // money
                Opcode::AddMoney => self.binary(|h, a, b| money_arith(h, Arith::Add, a, b))?,
                Opcode::SubMoney => self.binary(|h, a, b| money_arith(h, Arith::Sub, a, b))?,
                Opcode::MulMoney => self.binary(|h, a, b| money_arith(h, Arith::Mul, a, b))?,
                Opcode::DivMoney => self.binary(|h, a, b| money_arith(h, Arith::Div, a, b))?,
                Opcode::EqMoney => {
                    self.binary(|h, a, b| Ok(compare(Cmp::Eq, h.money(a)?, h.money(b)?)))?
                }
                Opcode::LtMoney => {
                    self.binary(|h, a, b| Ok(compare(Cmp::Lt, h.money(a)?, h.money(b)?)))?
                }
                Opcode::GtMoney => {
                    self.binary(|h, a, b| Ok(compare(Cmp::Gt, h.money(a)?, h.money(b)?)))?
                }

                // str
                Opcode::AddStr => self.binary(concat)?,
                Opcode::EqStr => self.binary(|h, a, b| Ok((h.str(a)? == h.str(b)?) as i64))?,

                // logic and stack
                Opcode::And => self.binary(|_, a, b| Ok((a != 0 && b != 0) as i64))?,
                Opcode::Or => self.binary(|_, a, b| Ok((a != 0 || b != 0) as i64))?,
                Opcode::Not => self.unary(|_, v| Ok((v == 0) as i64))?,
                Opcode::Dup => {
                    let top = self.stack.last().cloned().ok_or(RuntimeError::StackUnderflow)?;
                    self.stack.push(top);
                }
                Opcode::SignInt => self.unary(|_, v| Ok(v.wrapping_neg()))?,
                Opcode::SignFloat => self.unary(|_, v| Ok(float_slot(-float(v))))?,
                Opcode::SignMoney => {
                    self.unary(|h, v| {
                        let negated = -h.money(v)?;
                        Ok(h.push(Object::Money(negated)))
                    })?
                }

                // Assignment
                Opcode::AssignInt
                | Opcode::AssignSetMap
                | Opcode::AssignSetArr
                | Opcode::AssignSetBytes => self.store()?,
                Opcode::AssignStr => self.assign(|h, _, v| {
                    let copy = h.str(v)?.to_string();
                    Ok(h.push_str(copy))
                })?,
                Opcode::AssignAddInt => self.assign(|_, a, b| int_arith(Arith::Add, a, b))?,
                Opcode::AssignSubInt => self.assign(|_, a, b| int_arith(Arith::Sub, a, b))?,
                Opcode::AssignMulInt => self.assign(|_, a, b| int_arith(Arith::Mul, a, b))?,
                Opcode::AssignDivInt => self.assign(|_, a, b| int_arith(Arith::Div, a, b))?,
                Opcode::AssignModInt => self.assign(|_, a, b| int_arith(Arith::Mod, a, b))?,
                Opcode::AssignAddStr => self.assign(concat)?,
                Opcode::AssignAddFloat => self.assign(|_, a, b| float_arith(Arith::Add, a, b))?,
                Opcode::AssignSubFloat => self.assign(|_, a, b| float_arith(Arith::Sub, a, b))?,
                Opcode::AssignMulFloat => self.assign(|_, a, b| float_arith(Arith::Mul, a, b))?,
                Opcode::AssignDivFloat => self.assign(|_, a, b| float_arith(Arith::Div, a, b))?,
                Opcode::AssignAddMoney => self.assign(|h, a, b| money_arith(h, Arith::Add, a, b))?,
                Opcode::AssignSubMoney => self.assign(|h, a, b| money_arith(h, Arith::Sub, a, b))?,
                Opcode::AssignMulMoney => self.assign(|h, a, b| money_arith(h, Arith::Mul, a, b))?,
                Opcode::AssignDivMoney => self.assign(|h, a, b| money_arith(h, Arith::Div, a, b))?,
                Opcode::AssignAddBytes => self.assign(|h, a, b| {
                    let tail = h.bytes(b)?.clone();
                    h.bytes_mut(a)?.extend_from_slice(&tail);
                    Ok(a)
                })?,

                // Copies
                Opcode::Copy => {
                    let ty = Type::from_tag(args[0]);
                    self.unary(|h, v| h.deep_copy(ty, v))?
                }
                Opcode::CopyStr => self.unary(|h, v| h.deep_copy(Type::STR, v))?,

                // Calls
                Opcode::CallFunc => self.call_func(at)?,
                Opcode::RetFunc => {
                    let frame = self.frames.pop().ok_or(RuntimeError::StackUnderflow)?;
                    let result = if frame.returns { Some(self.pop()?) } else { None };
                    self.stack.truncate(frame.stack_base);
                    self.vars.truncate(frame.vars_len);
                    if let Some(result) = result {
                        self.push(result);
                    }
                    self.ip = frame.return_ip;
                }
                Opcode::GetParams => {
                    let len = self.vars.len();
                    for k in 1..=args[0] as usize {
                        let value = self.pop()?;
                        let slot = len.checked_sub(k).ok_or(RuntimeError::StackUnderflow)?;
                        self.vars[slot] = value;
                    }
                }
                Opcode::CustomFunc => self.call_custom(args[0])?,
                Opcode::EmbedFunc => self.call_embedded(args[0])?,
                Opcode::ParContract => {
                    if self.par_checkpoint.is_none() {
                        self.par_checkpoint = Some(self.heap.checkpoint());
                    }
                    let ty = Type::from_tag(args[1]);
                    let mut value = self.pop()?;
                    if is_copied_param(ty) {
                        value = self.heap.deep_copy(ty, value)?;
                    }
                    self.pars.push((args[0], value));
                }
                Opcode::CallContract => self.call_contract(args[0])?,
                Opcode::LoadPars => {
                    for &(slot, value) in &self.params {
                        let var = self.vars.get_mut(slot as usize).ok_or(
                            RuntimeError::InvalidHandle {
                                kind: "variable",
                                handle: slot as i64,
                            },
                        )?;
                        *var = value;
                    }
                }

                // Containers
                Opcode::GetIndex => self.binary(|h, handle, index| match h.object(handle)? {
                    Object::Array(items) => usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i).copied())
                        .ok_or_else(|| index_out_of_range(index, items.len())),
                    Object::Bytes(bytes) => usize::try_from(index)
                        .ok()
                        .and_then(|i| bytes.get(i).map(|&b| b as i64))
                        .ok_or_else(|| index_out_of_range(index, bytes.len())),
                    other => Err(type_error("arr", other.kind_name())),
                })?,
                Opcode::SetIndex => {
                    let index = self.pop()?;
                    let handle = self.pop()?;
                    let len = match self.heap.object(handle)? {
                        Object::Array(items) => items.len(),
                        Object::Bytes(bytes) => bytes.len(),
                        other => return Err(type_error("arr", other.kind_name())),
                    };
                    let index = usize::try_from(index)
                        .ok()
                        .filter(|&i| i < len)
                        .ok_or_else(|| index_out_of_range(index, len))?;
                    self.stack.push(Operand::Place(Place::Elem { handle, index }));
                }
                Opcode::GetMap => self.binary(|h, handle, key| {
                    let key = h.str(key)?;
                    h.map(handle)?
                        .get(key)
                        .copied()
                        .ok_or_else(|| RuntimeError::KeyNotFound(key.to_string()))
                })?,
                Opcode::SetMap => {
                    let key = self.pop()?;
                    let handle = self.pop()?;
                    self.heap.map(handle)?;
                    let key = self.heap.str(key)?.to_string();
                    self.stack.push(Operand::Place(Place::Entry { handle, key }));
                }
                Opcode::AppendArr => {
                    let value = self.pop()?;
                    let place = self.pop_place()?;
                    let handle = self.read(&place)?;
                    self.heap.array_mut(handle)?.push(value);
                }
                Opcode::InitArr => {
                    let items = self.pop_n(args[0] as usize)?;
                    let handle = self.heap.push(Object::Array(items));
                    self.push(handle);
                }
                Opcode::InitMap => {
                    let slots = self.pop_n(args[0] as usize * 2)?;
                    let mut items = BTreeMap::new();
                    for pair in slots.chunks(2) {
                        items.insert(self.heap.str(pair[0])?.to_string(), pair[1]);
                    }
                    let handle = self.heap.push(Object::Map(items));
                    self.push(handle);
                }
                Opcode::InitObj => {
                    let slots = self.pop_n(args[0] as usize * 3)?;
                    let mut members = serde_json::Map::new();
                    for triple in slots.chunks(3) {
                        let key = self.heap.str(triple[0])?.to_string();
                        members.insert(key, self.json_member(triple[1], triple[2])?);
                    }
                    let handle = self.heap.push(Object::Json(serde_json::Value::Object(members)));
                    self.push(handle);
                }
                Opcode::InitObjList => {
                    let slots = self.pop_n(args[0] as usize * 2)?;
                    let items = slots
                        .chunks(2)
                        .map(|pair| self.json_member(pair[0], pair[1]))
                        .collect::<Result<Vec<_>, _>>()?;
                    let handle = self.heap.push(Object::Json(serde_json::Value::Array(items)));
                    self.push(handle);
                }
                Opcode::Obj2List => self.unary(|h, handle| {
                    let items: Vec<serde_json::Value> = match h.json(handle)? {
                        serde_json::Value::Object(members) => members
                            .iter()
                            .map(|(key, value)| {
                                let mut single = serde_json::Map::new();
                                single.insert(key.clone(), value.clone());
                                serde_json::Value::Object(single)
                            })
                            .collect(),
                        _ => return Err(type_error("obj", "list")),
                    };
                    Ok(h.push(Object::Json(serde_json::Value::Array(items))))
                })?,

                // Environment and result
                Opcode::Env => {
                    let index = args[0] as usize;
                    let linked = self.linked;
                    let item = linked.host.env.get(index).ok_or(
                        RuntimeError::InvalidHandle {
                            kind: "environment",
                            handle: index as i64,
                        },
                    )?;
                    let value = linked
                        .env
                        .get(index)
                        .and_then(Option::as_ref)
                        .ok_or_else(|| RuntimeError::UndefinedEnvironmentVariable(item.name.clone()))?;
                    let slot = self.heap.store(item.ty, value)?;
                    self.push(slot);
                }
                Opcode::Return => {
                    let ty = Type::from_tag(args[0]);
                    if ty.is_void() {
                        return Ok(String::new());
                    }
                    let slot = self.pop()?;
                    return self.heap.stringify(ty, slot);
                }
            }
        }
        Ok(String::new())
    }

    fn json_member(&self, slot: i64, tag: i64) -> Result<serde_json::Value, RuntimeError> {
        let ty = Type::from_tag(tag as u16);
        if ty == Type::OBJECT {
            Ok(self.heap.json(slot)?.clone())
        } else {
            Ok(serde_json::Value::String(self.heap.stringify(ty, slot)?))
        }
    }

    fn call_func(&mut self, at: usize) -> Result<(), RuntimeError> {
        let target = self.jump(at)?;
        let func = self
            .contract
            .func_at(target)
            .ok_or(RuntimeError::InvalidJump(at))?;
        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeError::CallDepthExceeded(self.config.max_call_depth));
        }
        let stack_base = self
            .stack
            .len()
            .checked_sub(func.params.len())
            .ok_or(RuntimeError::StackUnderflow)?;
        self.frames.push(Frame {
            return_ip: self.ip,
            vars_len: self.vars.len(),
            stack_base,
            compile_base: func.frame as usize,
            returns: !func.result.is_void(),
        });
        self.ip = target;
        Ok(())
    }

    fn call_embedded(&mut self, index: u16) -> Result<(), RuntimeError> {
        let func = STDLIB
            .get(index as usize)
            .ok_or(RuntimeError::UnknownFunction(index))?;
        let args = self.pop_n(func.params.len())?;
        self.charge(func.gas)?;
        let result = (func.func)(&mut *self.heap, &args)?;
        if !func.result.is_void() {
            self.push(result);
        }
        Ok(())
    }

    fn call_custom(&mut self, index: u16) -> Result<(), RuntimeError> {
        let linked = self.linked;
        let func = linked
            .host
            .func(index)
            .ok_or(RuntimeError::UnknownFunction(index))?;
        let slots = self.pop_n(func.params.len())?;
        let args = func
            .params
            .iter()
            .zip(slots)
            .map(|(&ty, slot)| self.heap.load(ty, slot))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = (func.func)(&args).map_err(|err| RuntimeError::HostFunction {
            name: func.name.clone(),
            message: err.to_string(),
        })?;
        self.charge(ret.gas)?;
        match (func.result, ret.value) {
            (Some(ty), Some(value)) if value.fits(ty) => {
                let slot = self.heap.store(ty, &value)?;
                self.push(slot);
            }
            (Some(_), _) => return Err(RuntimeError::InvalidReturnType(func.name.clone())),
            (None, _) => {}
        }
        Ok(())
    }

    fn call_contract(&mut self, index: u16) -> Result<(), RuntimeError> {
        let linked = self.linked;
        let callee = linked
            .contracts
            .get(index as usize)
            .ok_or_else(|| RuntimeError::UnknownContract(index.to_string()))?;
        if self.depth + 1 >= self.config.max_contract_depth {
            return Err(RuntimeError::CallDepthExceeded(self.config.max_contract_depth));
        }
        let pars = std::mem::take(&mut self.pars);
        debug!(
            "{} calls contract {} with {} params",
            self.contract.name,
            callee.name,
            pars.len()
        );
        let (result, gas) = execute(
            &mut *self.heap,
            self.config,
            linked,
            callee,
            pars,
            self.gas_limit - self.gas,
            self.depth + 1,
        );
        self.gas += gas;
        if let Some(checkpoint) = self.par_checkpoint.take() {
            self.heap.restore(checkpoint);
        }
        let result = result?;
        let handle = self.heap.push_str(result);
        self.push(handle);
        Ok(())
    }
}

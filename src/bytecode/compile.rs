use std::collections::HashMap;

use log::debug;

use crate::{
    bytecode::{
        compile_error::{CompileError, CompileErrorKind},
        ir::{Contract, FuncInfo, FuncParam, VarInfo},
        op::Opcode,
    },
    lang::{
        node::{BinaryOp, Case, ElifBranch, Entry, Literal, Node, NodeKind, UnaryOp, VarDef},
        types::{Kind, Type},
    },
    namespace::{Namespace, Scope, Symbol, Symbols, func_key},
    runtime::{host::Host, stdlib},
};

/// Compiles one contract tree into bytecode.
///
/// `contracts` are the contracts already loaded, indexed the way `ns` links
/// them; `host` supplies environment items and the read flags of host
/// functions.
pub fn compile(
    ast: &Node,
    ns: &Namespace,
    contracts: &[Contract],
    host: &Host,
) -> Result<Contract, CompileError> {
    let NodeKind::Contract { name, read, body } = &ast.kind else {
        return Err(CompileError {
            contract: String::new(),
            line: ast.line,
            column: ast.column,
            kind: CompileErrorKind::UnexpectedNode(node_name(&ast.kind)),
        });
    };
    let mut contract = Contract::new(name);
    contract.read = *read;

    let mut compiler = Compiler {
        scope: Scope::new(ns),
        contracts,
        host,
        contract,
        code: Vec::new(),
        data: Vec::new(),
        strings: HashMap::new(),
        vars: Vec::new(),
        loops: Vec::new(),
        func: None,
        last_op: None,
        last_target: None,
        last_container: Type::VOID,
    };
    compiler.compile_block(body)?;
    let contract = compiler.finish(ast)?;
    debug!(
        "compiled contract {} ({} words, {} funcs)",
        contract.name,
        contract.code.len(),
        contract.funcs.len()
    );
    Ok(contract)
}

/// A variable visible at the current compile position.
struct Var {
    name: String,
    ty: Type,
}

/// Jumps waiting for the end or the step of the innermost loop.
struct Loop {
    /// Live variable count where the loop body starts.
    vars: usize,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

struct FuncCtx {
    result: Type,
}

/// How an assignment reaches its target; either way the place is already
/// on the stack.
enum Target {
    Var,
    /// Element of a container of the given type.
    Element(Type),
}

struct Compiler<'a> {
    /// Shared symbols plus the functions declared so far in this contract
    scope: Scope<'a>,

    contracts: &'a [Contract],

    host: &'a Host,

    /// Output contract; its code is assembled in `code` and moved in by `finish`
    contract: Contract,

    code: Vec<u16>,

    /// Constant pool emitted as the DATA prologue
    data: Vec<u8>,

    /// Interned string literals: text to (offset, length) in `data`
    strings: HashMap<String, (u16, u16)>,

    /// Live variables; the position is the slot index
    vars: Vec<Var>,

    loops: Vec<Loop>,

    /// Set while compiling a function body
    func: Option<FuncCtx>,

    /// Opcode and position of the last emitted instruction
    last_op: Option<(Opcode, usize)>,

    /// Most recent forward-jump target
    last_target: Option<usize>,

    /// Container type of the last indexing level compiled
    last_container: Type,
}

fn node_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Contract { .. } => "contract",
        NodeKind::Block { .. } => "block",
        NodeKind::Vars(_) => "variable declaration",
        NodeKind::Func { .. } => "function",
        NodeKind::Return(_) => "return",
        NodeKind::Literal(_) => "literal",
        NodeKind::Var(_) => "variable",
        NodeKind::Index { .. } => "index",
        NodeKind::Binary { .. } => "binary expression",
        NodeKind::Unary { .. } => "unary expression",
        NodeKind::Question { .. } => "ternary expression",
        NodeKind::Call { .. } => "call",
        NodeKind::CallContract { .. } => "contract call",
        NodeKind::Env(_) => "environment variable",
        NodeKind::Array(_) => "array",
        NodeKind::Map(_) => "map",
        NodeKind::Object(_) => "object",
        NodeKind::ObjectList(_) => "object list",
        NodeKind::ObjToList(_) => "obj2list",
        NodeKind::If { .. } => "if",
        NodeKind::While { .. } => "while",
        NodeKind::For { .. } => "for",
        NodeKind::ForRange { .. } => "for",
        NodeKind::Switch { .. } => "switch",
        NodeKind::Break => "break",
        NodeKind::Continue => "continue",
    }
}

impl<'a> Compiler<'a> {
    fn error(&self, node: &Node, kind: CompileErrorKind) -> CompileError {
        CompileError {
            contract: self.contract.name.clone(),
            line: node.line,
            column: node.column,
            kind,
        }
    }

    /// Prefixes the DATA prologue and hands out the contract.
    fn finish(mut self, node: &Node) -> Result<Contract, CompileError> {
        if self.data.len() > u16::MAX as usize {
            return Err(self.error(
                node,
                CompileErrorKind::DataSectionTooLarge(self.data.len()),
            ));
        }
        let mut code = Vec::new();
        if !self.data.is_empty() {
            let words: Vec<u16> = self
                .data
                .chunks(2)
                .map(|pair| (pair[0] as u16) << 8 | pair.get(1).copied().unwrap_or(0) as u16)
                .collect();
            code.push(Opcode::Data.into());
            code.push(words.len() as u16);
            code.extend(words);
        }
        let shift = code.len();
        code.append(&mut self.code);
        for func in &mut self.contract.funcs {
            func.offset += shift;
        }
        self.contract.code = code;
        Ok(self.contract)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn emit(&mut self, op: Opcode, operands: &[u16]) {
        self.last_op = Some((op, self.code.len()));
        self.code.push(op.into());
        self.code.extend_from_slice(operands);
    }

    /// Emits a relative jump with a placeholder offset and returns the
    /// position of its operand.
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit(op, &[0]);
        self.code.len() - 1
    }

    fn offset(&self, node: &Node, operand_at: usize, target: usize) -> Result<u16, CompileError> {
        let delta = target as i64 - (operand_at as i64 + 1);
        i16::try_from(delta)
            .map(|d| d as u16)
            .map_err(|_| self.error(node, CompileErrorKind::JumpTooFar))
    }

    fn patch_to(&mut self, node: &Node, operand_at: usize, target: usize) -> Result<(), CompileError> {
        self.code[operand_at] = self.offset(node, operand_at, target)?;
        if target >= operand_at {
            self.last_target = Some(target);
        }
        Ok(())
    }

    /// Points the jump at `operand_at` to the current end of code.
    fn patch(&mut self, node: &Node, operand_at: usize) -> Result<(), CompileError> {
        let target = self.code.len();
        self.patch_to(node, operand_at, target)
    }

    fn jump_to(&mut self, node: &Node, op: Opcode, target: usize) -> Result<(), CompileError> {
        let at = self.emit_jump(op);
        self.patch_to(node, at, target)
    }

    /// The code falls off its end only through a `RETFUNC`, so nothing
    /// needs to follow it.
    fn ends_with_return(&self) -> bool {
        let end = self.code.len();
        matches!(self.last_op, Some((Opcode::RetFunc, at)) if at + 1 == end)
            && self.last_target != Some(end)
    }

    fn push_int(&mut self, n: i64) {
        if let Ok(n) = i16::try_from(n) {
            self.emit(Opcode::Push16, &[n as u16]);
        } else if let Ok(n) = i32::try_from(n) {
            let bits = n as u32;
            self.emit(Opcode::Push32, &[(bits >> 16) as u16, bits as u16]);
        } else {
            self.push64(n as u64);
        }
    }

    fn push64(&mut self, bits: u64) {
        self.emit(
            Opcode::Push64,
            &[
                (bits >> 48) as u16,
                (bits >> 32) as u16,
                (bits >> 16) as u16,
                bits as u16,
            ],
        );
    }

    fn push_str(&mut self, node: &Node, text: &str) -> Result<(), CompileError> {
        let (offset, len) = match self.strings.get(text) {
            Some(&pos) => pos,
            None => {
                let offset = self.data.len();
                let end = offset + text.len();
                if end > u16::MAX as usize {
                    return Err(self.error(node, CompileErrorKind::DataSectionTooLarge(end)));
                }
                self.data.extend_from_slice(text.as_bytes());
                let pos = (offset as u16, text.len() as u16);
                self.strings.insert(text.to_string(), pos);
                pos
            }
        };
        self.emit(Opcode::PushStr, &[offset, len]);
        Ok(())
    }

    fn embed(&mut self, node: &Node, name: &str, params: &[Type]) -> Result<(), CompileError> {
        let index = stdlib::index_of(name, params)
            .ok_or_else(|| self.error(node, CompileErrorKind::UndefinedFunction(name.into())))?;
        self.emit(Opcode::EmbedFunc, &[index]);
        Ok(())
    }

    // =========================================================================
    // Variables
    // =========================================================================

    fn lookup_var(&self, node: &Node, name: &str) -> Result<(u16, Type), CompileError> {
        self.vars
            .iter()
            .rposition(|v| v.name == name)
            .map(|i| (i as u16, self.vars[i].ty))
            .ok_or_else(|| self.error(node, CompileErrorKind::UndefinedVariable(name.into())))
    }

    /// Adds variables to the table and returns their types for INITVARS.
    fn declare(&mut self, node: &Node, defs: &[VarDef]) -> Result<Vec<u16>, CompileError> {
        let mut types = Vec::with_capacity(defs.len());
        for def in defs {
            if def.ty.is_void() {
                return Err(self.error(node, CompileErrorKind::InvalidType));
            }
            if self.vars.iter().any(|v| v.name == def.name) {
                return Err(self.error(node, CompileErrorKind::Redefinition(def.name.clone())));
            }
            self.vars.push(Var {
                name: def.name.clone(),
                ty: def.ty,
            });
            types.push(def.ty.tag());
        }
        Ok(types)
    }

    /// Internal loop variable that no identifier can name.
    fn declare_hidden(&mut self, ty: Type) -> u16 {
        let index = self.vars.len();
        self.vars.push(Var {
            name: format!("#{}", index),
            ty,
        });
        index as u16
    }

    fn emit_initvars(&mut self, types: &[u16]) {
        let mut operands = Vec::with_capacity(types.len() + 1);
        operands.push(types.len() as u16);
        operands.extend_from_slice(types);
        self.emit(Opcode::InitVars, &operands);
    }

    /// Releases variables above `count` at runtime.
    fn emit_delvars(&mut self, count: usize) {
        if self.vars.len() > count {
            self.emit(Opcode::DelVars, &[count as u16]);
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_block(&mut self, node: &Node) -> Result<(), CompileError> {
        let NodeKind::Block { params, statements } = &node.kind else {
            return self.compile_statement(node);
        };
        let vars_mark = self.vars.len();
        let scope_mark = self.scope.mark();

        if !params.is_empty() {
            let types = self.declare(node, params)?;
            for (i, def) in params.iter().enumerate() {
                self.contract.params.insert(
                    def.name.clone(),
                    VarInfo {
                        index: (vars_mark + i) as u16,
                        ty: def.ty,
                    },
                );
            }
            self.emit_initvars(&types);
            self.emit(Opcode::LoadPars, &[]);
        }

        for statement in statements {
            self.compile_statement(statement)?;
        }

        if !self.ends_with_return() {
            self.emit_delvars(vars_mark);
        }
        self.vars.truncate(vars_mark);
        self.scope.release(scope_mark);
        Ok(())
    }

    fn compile_statement(&mut self, node: &Node) -> Result<(), CompileError> {
        match &node.kind {
            NodeKind::Block { .. } => self.compile_block(node),
            NodeKind::Vars(defs) => self.compile_vars(node, defs),
            NodeKind::Func {
                name,
                params,
                result,
                body,
            } => self.compile_func(node, name, params, *result, body),
            NodeKind::Return(expr) => self.compile_return(node, expr.as_deref()),
            NodeKind::If {
                cond,
                body,
                elifs,
                otherwise,
            } => self.compile_if(node, cond, body, elifs, otherwise.as_deref()),
            NodeKind::While { cond, body } => self.compile_while(node, cond, body),
            NodeKind::For {
                value,
                index,
                collection,
                body,
            } => self.compile_for(node, value, index.as_deref(), collection, body),
            NodeKind::ForRange { var, from, to, body } => {
                self.compile_for_range(node, var, from, to, body)
            }
            NodeKind::Switch {
                subject,
                cases,
                default,
            } => self.compile_switch(node, subject, cases, default.as_deref()),
            NodeKind::Break => self.compile_loop_exit(node, true),
            NodeKind::Continue => self.compile_loop_exit(node, false),
            NodeKind::Contract { .. } => Err(self.error(
                node,
                CompileErrorKind::UnexpectedNode(node_name(&node.kind)),
            )),
            _ => self.compile_expr(node).map(|_| ()),
        }
    }

    fn compile_vars(&mut self, node: &Node, defs: &[VarDef]) -> Result<(), CompileError> {
        let types = self.declare(node, defs)?;
        self.emit_initvars(&types);
        for def in defs {
            if let Some(init) = &def.init {
                let (index, ty) = self.lookup_var(node, &def.name)?;
                self.assign_var(init, BinaryOp::Assign, index, ty, init)?;
            }
        }
        Ok(())
    }

    fn compile_func(
        &mut self,
        node: &Node,
        name: &str,
        params: &[VarDef],
        result: Option<Type>,
        body: &Node,
    ) -> Result<(), CompileError> {
        if self.func.is_some() {
            return Err(self.error(node, CompileErrorKind::FunctionNestingError));
        }
        let param_types: Vec<Type> = params.iter().map(|p| p.ty).collect();
        let key = func_key(name, &param_types);
        if self.scope.is_local(&key) {
            return Err(self.error(node, CompileErrorKind::FunctionRedefinition(name.into())));
        }
        let result = result.unwrap_or(Type::VOID);

        let skip = self.emit_jump(Opcode::Jmp);
        let frame = self.vars.len();
        let index = self.contract.funcs.len() as u16;
        self.contract.funcs.push(FuncInfo {
            name: name.to_string(),
            result,
            params: params
                .iter()
                .map(|p| FuncParam {
                    name: p.name.clone(),
                    ty: p.ty,
                })
                .collect(),
            offset: self.code.len(),
            frame: frame as u16,
        });
        // registered before the body so the function can call itself
        self.scope.register(key, Symbol::Function { index, result });

        let types = self.declare(node, params)?;
        if !types.is_empty() {
            self.emit_initvars(&types);
            self.emit(Opcode::GetParams, &[types.len() as u16]);
        }

        let loops = std::mem::take(&mut self.loops);
        self.func = Some(FuncCtx { result });
        let compiled = self.compile_block(body);
        self.func = None;
        self.loops = loops;
        compiled?;

        if !self.ends_with_return() {
            if !result.is_void() {
                return Err(self.error(node, CompileErrorKind::MissingReturnValue));
            }
            self.emit(Opcode::RetFunc, &[]);
        }
        self.vars.truncate(frame);
        self.patch(node, skip)
    }

    fn compile_return(&mut self, node: &Node, expr: Option<&Node>) -> Result<(), CompileError> {
        let ty = match expr {
            Some(expr) => self.compile_expr(expr)?,
            None => Type::VOID,
        };
        match self.func.as_ref().map(|ctx| ctx.result) {
            Some(expected) => {
                if !expected.is_void() && ty.is_void() {
                    return Err(self.error(node, CompileErrorKind::MissingReturnValue));
                }
                if expected != ty {
                    return Err(self.error(
                        node,
                        CompileErrorKind::InvalidReturn {
                            expected,
                            found: ty,
                        },
                    ));
                }
                self.emit(Opcode::RetFunc, &[]);
            }
            None => self.emit(Opcode::Return, &[ty.tag()]),
        }
        Ok(())
    }

    fn compile_condition(&mut self, cond: &Node) -> Result<usize, CompileError> {
        let ty = self.compile_expr(cond)?;
        if ty != Type::BOOL {
            return Err(self.error(cond, CompileErrorKind::ConditionType(ty)));
        }
        Ok(self.emit_jump(Opcode::Jze))
    }

    fn compile_if(
        &mut self,
        node: &Node,
        cond: &Node,
        body: &Node,
        elifs: &[ElifBranch],
        otherwise: Option<&Node>,
    ) -> Result<(), CompileError> {
        let branches: Vec<(&Node, &Node)> = std::iter::once((cond, body))
            .chain(elifs.iter().map(|e| (&e.cond, &e.body)))
            .collect();
        let mut ends = Vec::new();
        for (i, (cond, body)) in branches.iter().enumerate() {
            let next = self.compile_condition(cond)?;
            self.compile_block(body)?;
            let more = i + 1 < branches.len() || otherwise.is_some();
            if more && !self.ends_with_return() {
                ends.push(self.emit_jump(Opcode::Jmp));
            }
            self.patch(node, next)?;
        }
        if let Some(otherwise) = otherwise {
            self.compile_block(otherwise)?;
        }
        for end in ends {
            self.patch(node, end)?;
        }
        Ok(())
    }

    fn compile_while(&mut self, node: &Node, cond: &Node, body: &Node) -> Result<(), CompileError> {
        let start = self.code.len();
        let exit = self.compile_condition(cond)?;
        self.loops.push(Loop {
            vars: self.vars.len(),
            breaks: Vec::new(),
            continues: Vec::new(),
        });
        self.compile_block(body)?;
        self.close_loop(node, start, exit)
    }

    /// Emits the back jump to `step` and resolves the loop's pending jumps.
    fn close_loop(&mut self, node: &Node, step: usize, exit: usize) -> Result<(), CompileError> {
        let Some(lp) = self.loops.pop() else {
            return Ok(());
        };
        for at in lp.continues {
            self.patch_to(node, at, step)?;
        }
        self.jump_to(node, Opcode::Jmp, step)?;
        self.patch(node, exit)?;
        for at in lp.breaks {
            self.patch(node, at)?;
        }
        Ok(())
    }

    fn compile_loop_exit(&mut self, node: &Node, is_break: bool) -> Result<(), CompileError> {
        let Some(vars) = self.loops.last().map(|lp| lp.vars) else {
            let kind = if is_break {
                CompileErrorKind::BreakOutsideLoop
            } else {
                CompileErrorKind::ContinueOutsideLoop
            };
            return Err(self.error(node, kind));
        };
        self.emit_delvars(vars);
        let at = self.emit_jump(Opcode::Jmp);
        if let Some(lp) = self.loops.last_mut() {
            if is_break {
                lp.breaks.push(at);
            } else {
                lp.continues.push(at);
            }
        }
        Ok(())
    }

    fn increment(&mut self, index: u16) {
        self.emit(Opcode::SetVar, &[index]);
        self.emit(Opcode::Push16, &[1]);
        self.emit(Opcode::AssignAddInt, &[]);
    }

    fn compile_for_range(
        &mut self,
        node: &Node,
        var: &str,
        from: &Node,
        to: &Node,
        body: &Node,
    ) -> Result<(), CompileError> {
        let mark = self.vars.len();
        let mut types = self.declare(node, &[VarDef::param(var, Type::INT)])?;
        let counter = mark as u16;
        let limit = self.declare_hidden(Type::INT);
        types.push(Type::INT.tag());
        self.emit_initvars(&types);

        for (index, expr) in [(counter, from), (limit, to)] {
            self.emit(Opcode::SetVar, &[index]);
            let ty = self.compile_expr(expr)?;
            if ty != Type::INT {
                return Err(self.error(
                    expr,
                    CompileErrorKind::TypeMismatch {
                        expected: Type::INT,
                        found: ty,
                    },
                ));
            }
            self.emit(Opcode::AssignInt, &[]);
        }

        let start = self.code.len();
        self.emit(Opcode::GetVar, &[counter]);
        self.emit(Opcode::GetVar, &[limit]);
        self.emit(Opcode::GtInt, &[]);
        let exit = self.emit_jump(Opcode::Jnz);

        self.loops.push(Loop {
            vars: self.vars.len(),
            breaks: Vec::new(),
            continues: Vec::new(),
        });
        self.compile_block(body)?;
        let step = self.code.len();
        self.increment(counter);
        self.finish_counted_loop(node, start, step, exit, mark)
    }

    /// Resolves loop jumps for loops whose `continue` lands on a step that
    /// differs from the condition.
    fn finish_counted_loop(
        &mut self,
        node: &Node,
        start: usize,
        step: usize,
        exit: usize,
        mark: usize,
    ) -> Result<(), CompileError> {
        if let Some(lp) = self.loops.pop() {
            for at in lp.continues {
                self.patch_to(node, at, step)?;
            }
            self.jump_to(node, Opcode::Jmp, start)?;
            self.patch(node, exit)?;
            for at in lp.breaks {
                self.patch(node, at)?;
            }
        }
        self.emit_delvars(mark);
        self.vars.truncate(mark);
        Ok(())
    }

    fn compile_for(
        &mut self,
        node: &Node,
        value: &str,
        index: Option<&str>,
        collection: &Node,
        body: &Node,
    ) -> Result<(), CompileError> {
        let mark = self.vars.len();

        // Slot types are patched in once the collection type is known.
        let coll = self.declare_hidden(Type::VOID);
        let counter = self.declare_hidden(Type::INT);
        let len = self.declare_hidden(Type::INT);
        let keys = self.declare_hidden(Type::VOID);
        let mut defs = vec![VarDef::param(value, Type::INT)];
        if let Some(index) = index {
            defs.push(VarDef::param(index, Type::INT));
        }
        let mut types = vec![Type::VOID.tag(), Type::INT.tag(), Type::INT.tag(), 0];
        types.extend(self.declare(node, &defs)?);
        let init_at = self.code.len() + 2;
        self.emit_initvars(&types);

        self.emit(Opcode::SetVar, &[coll]);
        let coll_ty = self.compile_expr(collection)?;
        self.emit(Opcode::AssignInt, &[]);

        let is_map = match coll_ty.kind() {
            Kind::Arr | Kind::Bytes => false,
            Kind::Map => true,
            _ => return Err(self.error(collection, CompileErrorKind::ForType(coll_ty))),
        };
        let arr_str = Type::array_of(Type::STR).unwrap_or(Type::ARR);
        let keys_ty = if is_map { arr_str } else { Type::INT };
        let index_ty = if is_map { Type::STR } else { Type::INT };
        let value_ty = coll_ty.elem();
        let value_var = keys as usize + 1;

        self.vars[coll as usize].ty = coll_ty;
        self.vars[keys as usize].ty = keys_ty;
        self.vars[value_var].ty = value_ty;
        self.code[init_at] = coll_ty.tag();
        self.code[init_at + 3] = keys_ty.tag();
        self.code[init_at + 4] = value_ty.tag();
        if index.is_some() {
            self.vars[value_var + 1].ty = index_ty;
            self.code[init_at + 5] = index_ty.tag();
        }

        if is_map {
            self.emit(Opcode::SetVar, &[keys]);
            self.emit(Opcode::GetVar, &[coll]);
            self.embed(node, "Keys", &[Type::MAP])?;
            self.emit(Opcode::AssignInt, &[]);
        }
        self.emit(Opcode::SetVar, &[len]);
        if is_map {
            self.emit(Opcode::GetVar, &[keys]);
            self.embed(node, "Len", &[Type::ARR])?;
        } else {
            self.emit(Opcode::GetVar, &[coll]);
            self.embed(node, "Len", &[coll_ty.outer()])?;
        }
        self.emit(Opcode::AssignInt, &[]);

        let start = self.code.len();
        self.emit(Opcode::GetVar, &[counter]);
        self.emit(Opcode::GetVar, &[len]);
        self.emit(Opcode::LtInt, &[]);
        let exit = self.emit_jump(Opcode::Jze);

        // value = coll[i] or coll[keys[i]]
        self.emit(Opcode::SetVar, &[value_var as u16]);
        self.emit(Opcode::GetVar, &[coll]);
        if is_map {
            self.emit(Opcode::GetVar, &[keys]);
            self.emit(Opcode::GetVar, &[counter]);
            self.emit(Opcode::GetIndex, &[]);
            self.emit(Opcode::GetMap, &[]);
        } else {
            self.emit(Opcode::GetVar, &[counter]);
            self.emit(Opcode::GetIndex, &[]);
        }
        self.emit(Opcode::AssignInt, &[]);
        if index.is_some() {
            self.emit(Opcode::SetVar, &[value_var as u16 + 1]);
            if is_map {
                self.emit(Opcode::GetVar, &[keys]);
                self.emit(Opcode::GetVar, &[counter]);
                self.emit(Opcode::GetIndex, &[]);
            } else {
                self.emit(Opcode::GetVar, &[counter]);
            }
            self.emit(Opcode::AssignInt, &[]);
        }

        self.loops.push(Loop {
            vars: self.vars.len(),
            breaks: Vec::new(),
            continues: Vec::new(),
        });
        self.compile_block(body)?;
        let step = self.code.len();
        self.increment(counter);
        self.finish_counted_loop(node, start, step, exit, mark)
    }

    fn compile_switch(
        &mut self,
        node: &Node,
        subject: &Node,
        cases: &[Case],
        default: Option<&Node>,
    ) -> Result<(), CompileError> {
        let ty = self.compile_expr(subject)?;
        let eq = match ty.kind() {
            Kind::Int => Opcode::EqInt,
            Kind::Str => Opcode::EqStr,
            Kind::Float => Opcode::EqFloat,
            _ => return Err(self.error(subject, CompileErrorKind::SwitchType(ty))),
        };
        let mut ends = Vec::new();
        for case in cases {
            let mut matched = Vec::new();
            for value in &case.values {
                self.emit(Opcode::Dup, &[]);
                let found = self.compile_expr(value)?;
                if found != ty {
                    return Err(self.error(
                        value,
                        CompileErrorKind::SwitchTypeMismatch {
                            expected: ty,
                            found,
                        },
                    ));
                }
                self.emit(eq, &[]);
                matched.push(self.emit_jump(Opcode::Jnz));
            }
            let next = self.emit_jump(Opcode::JmpRel);
            for at in matched {
                self.patch(node, at)?;
            }
            self.compile_block(&case.body)?;
            if !self.ends_with_return() {
                ends.push(self.emit_jump(Opcode::JmpRel));
            }
            self.patch(node, next)?;
        }
        if let Some(default) = default {
            self.compile_block(default)?;
        }
        for at in ends {
            self.patch(node, at)?;
        }
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn compile_expr(&mut self, node: &Node) -> Result<Type, CompileError> {
        match &node.kind {
            NodeKind::Literal(literal) => self.compile_literal(node, literal),
            NodeKind::Var(name) => {
                let (index, ty) = self.lookup_var(node, name)?;
                self.emit(Opcode::GetVar, &[index]);
                Ok(ty)
            }
            NodeKind::Index { name, indexes } => self.compile_index(node, name, indexes, false),
            NodeKind::Binary { op, left, right } => self.compile_binary(node, *op, left, right),
            NodeKind::Unary { op, operand } => self.compile_unary(node, *op, operand),
            NodeKind::Question { cond, left, right } => {
                self.compile_question(node, cond, left, right)
            }
            NodeKind::Call { name, args } => self.compile_call(node, name, args),
            NodeKind::CallContract { name, args } => self.compile_call_contract(node, name, args),
            NodeKind::Env(name) => {
                let (index, ty) = self.host.env_item(name).ok_or_else(|| {
                    self.error(node, CompileErrorKind::UndefinedEnvironment(name.clone()))
                })?;
                self.emit(Opcode::Env, &[index]);
                Ok(ty)
            }
            NodeKind::Array(items) => self.compile_array(node, items),
            NodeKind::Map(entries) => self.compile_map(node, entries),
            NodeKind::Object(entries) => {
                for entry in entries {
                    self.push_str(node, &entry.key)?;
                    let ty = self.compile_expr(&entry.value)?;
                    self.emit(Opcode::Push16, &[ty.tag()]);
                }
                self.emit(Opcode::InitObj, &[entries.len() as u16]);
                Ok(Type::OBJECT)
            }
            NodeKind::ObjectList(items) => {
                for item in items {
                    let ty = self.compile_expr(item)?;
                    self.emit(Opcode::Push16, &[ty.tag()]);
                }
                self.emit(Opcode::InitObjList, &[items.len() as u16]);
                Ok(Type::OBJECT)
            }
            NodeKind::ObjToList(expr) => {
                let ty = self.compile_expr(expr)?;
                if ty != Type::OBJECT {
                    return Err(self.error(
                        expr,
                        CompileErrorKind::TypeMismatch {
                            expected: Type::OBJECT,
                            found: ty,
                        },
                    ));
                }
                self.emit(Opcode::Obj2List, &[]);
                Ok(Type::OBJECT)
            }
            other => Err(self.error(node, CompileErrorKind::UnexpectedNode(node_name(other)))),
        }
    }

    fn compile_literal(&mut self, node: &Node, literal: &Literal) -> Result<Type, CompileError> {
        Ok(match literal {
            Literal::Int(n) => {
                self.push_int(*n);
                Type::INT
            }
            Literal::Bool(b) => {
                self.emit(Opcode::Push16, &[*b as u16]);
                Type::BOOL
            }
            Literal::Float(f) => {
                self.push64(f.to_bits());
                Type::FLOAT
            }
            Literal::Str(s) => {
                self.push_str(node, s)?;
                Type::STR
            }
        })
    }

    fn compile_unary(&mut self, node: &Node, op: UnaryOp, operand: &Node) -> Result<Type, CompileError> {
        let ty = self.compile_expr(operand)?;
        let (code, result) = self.scope.operator(op.symbol(), &[ty]).ok_or_else(|| {
            self.error(
                node,
                CompileErrorKind::UnknownOperator(format!("{}{}", op.symbol(), ty)),
            )
        })?;
        self.emit(code, &[]);
        Ok(result)
    }

    fn unknown_operator(&self, node: &Node, op: BinaryOp, left: Type, right: Type) -> CompileError {
        self.error(
            node,
            CompileErrorKind::UnknownOperator(format!("{}{}{}", left, op.symbol(), right)),
        )
    }

    fn compile_binary(
        &mut self,
        node: &Node,
        op: BinaryOp,
        left: &Node,
        right: &Node,
    ) -> Result<Type, CompileError> {
        if op.is_assign() {
            return self.compile_assign(node, op, left, right);
        }
        let (op, negate) = match op {
            BinaryOp::NotEq => (BinaryOp::Eq, true),
            BinaryOp::LtEq => (BinaryOp::Gt, true),
            BinaryOp::GtEq => (BinaryOp::Lt, true),
            op => (op, false),
        };

        let left_ty = self.compile_expr(left)?;
        let short_circuit = match op {
            BinaryOp::And => Some(self.dup_and_jump(Opcode::Jze)),
            BinaryOp::Or => Some(self.dup_and_jump(Opcode::Jnz)),
            _ => None,
        };
        let right_ty = self.compile_expr(right)?;
        let (code, result) = self
            .scope
            .operator(op.symbol(), &[left_ty, right_ty])
            .ok_or_else(|| self.unknown_operator(node, op, left_ty, right_ty))?;
        self.emit(code, &[]);
        if let Some(at) = short_circuit {
            self.patch(node, at)?;
        }
        if negate {
            self.emit(Opcode::Not, &[]);
        }
        Ok(result)
    }

    /// Keeps the left operand as the result when the right one is skipped.
    fn dup_and_jump(&mut self, jump: Opcode) -> usize {
        self.emit(Opcode::Dup, &[]);
        self.emit_jump(jump)
    }

    fn compile_question(
        &mut self,
        node: &Node,
        cond: &Node,
        left: &Node,
        right: &Node,
    ) -> Result<Type, CompileError> {
        let otherwise = self.compile_condition(cond)?;
        let left_ty = self.compile_expr(left)?;
        let end = self.emit_jump(Opcode::JmpRel);
        self.patch(node, otherwise)?;
        let right_ty = self.compile_expr(right)?;
        if left_ty != right_ty {
            return Err(self.error(
                node,
                CompileErrorKind::TypeMismatch {
                    expected: left_ty,
                    found: right_ty,
                },
            ));
        }
        self.patch(node, end)?;
        Ok(left_ty)
    }

    // =========================================================================
    // Assignment and indexing
    // =========================================================================

    fn compile_assign(
        &mut self,
        node: &Node,
        op: BinaryOp,
        left: &Node,
        right: &Node,
    ) -> Result<Type, CompileError> {
        match &left.kind {
            NodeKind::Var(name) => {
                let (index, ty) = self.lookup_var(left, name)?;
                self.assign_var(node, op, index, ty, right)
            }
            NodeKind::Index { name, indexes } => {
                let elem = self.compile_index(left, name, indexes, true)?;
                let container = self.last_container;
                self.assign_target(node, op, Target::Element(container), elem, right)
            }
            other => Err(self.error(left, CompileErrorKind::UnexpectedNode(node_name(other)))),
        }
    }

    fn assign_var(
        &mut self,
        node: &Node,
        op: BinaryOp,
        index: u16,
        ty: Type,
        right: &Node,
    ) -> Result<Type, CompileError> {
        self.emit(Opcode::SetVar, &[index]);
        self.assign_target(node, op, Target::Var, ty, right)
    }

    /// Compiles the right-hand side and the instruction that writes it
    /// through the place already on the stack.
    fn assign_target(
        &mut self,
        node: &Node,
        op: BinaryOp,
        target: Target,
        ty: Type,
        right: &Node,
    ) -> Result<Type, CompileError> {
        let right_ty = self.compile_expr(right)?;
        let mismatch = |this: &Self| {
            this.error(
                right,
                CompileErrorKind::TypeMismatch {
                    expected: ty,
                    found: right_ty,
                },
            )
        };

        match (op, &target) {
            (BinaryOp::Assign, Target::Var) if ty.is_container() => {
                if !accepts(ty, right_ty) {
                    return Err(mismatch(self));
                }
                self.emit(Opcode::Copy, &[ty.tag()]);
                self.emit(Opcode::AssignInt, &[]);
                return Ok(Type::VOID);
            }
            (BinaryOp::AddAssign, _) if ty.kind() == Kind::Arr && ty.elem() == right_ty => {
                self.emit_copy(right_ty);
                self.emit(Opcode::AppendArr, &[]);
                return Ok(Type::VOID);
            }
            (BinaryOp::Assign, Target::Element(container)) => {
                if !accepts(ty, right_ty) {
                    return Err(mismatch(self));
                }
                self.emit_copy(ty);
                let store = match container.kind() {
                    Kind::Map => Opcode::AssignSetMap,
                    Kind::Bytes => Opcode::AssignSetBytes,
                    _ => Opcode::AssignSetArr,
                };
                self.emit(store, &[]);
                return Ok(Type::VOID);
            }
            _ => {}
        }

        let (code, result) = self
            .scope
            .operator(op.symbol(), &[ty, right_ty])
            .ok_or_else(|| self.unknown_operator(node, op, ty, right_ty))?;
        self.emit(code, &[]);
        Ok(result)
    }

    /// Detaches a heap value from its source before it is stored elsewhere.
    fn emit_copy(&mut self, ty: Type) {
        match ty.kind() {
            Kind::Str => self.emit(Opcode::CopyStr, &[]),
            Kind::Arr | Kind::Map | Kind::Bytes | Kind::Money => {
                self.emit(Opcode::Copy, &[ty.tag()])
            }
            _ => {}
        }
    }

    /// Compiles `name[i]...`. As a read it leaves the element value; as an
    /// assignment target the last level leaves a place instead.
    fn compile_index(
        &mut self,
        node: &Node,
        name: &str,
        indexes: &[Node],
        target: bool,
    ) -> Result<Type, CompileError> {
        let (index, mut ty) = self.lookup_var(node, name)?;
        self.emit(Opcode::GetVar, &[index]);
        for (level, key) in indexes.iter().enumerate() {
            let last = level + 1 == indexes.len();
            let (expected, get, set) = match ty.kind() {
                Kind::Arr | Kind::Bytes => (Type::INT, Opcode::GetIndex, Opcode::SetIndex),
                Kind::Map => (Type::STR, Opcode::GetMap, Opcode::SetMap),
                _ => return Err(self.error(node, CompileErrorKind::IndexType(ty))),
            };
            let found = self.compile_expr(key)?;
            if found != expected {
                return Err(self.error(key, CompileErrorKind::IndexKeyType { expected, found }));
            }
            self.last_container = ty;
            self.emit(if target && last { set } else { get }, &[]);
            ty = ty.elem();
        }
        Ok(ty)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn compile_call(&mut self, node: &Node, name: &str, args: &[Node]) -> Result<Type, CompileError> {
        let mut types = Vec::with_capacity(args.len());
        for arg in args {
            types.push(self.compile_expr(arg)?);
        }
        let undefined = || {
            let sig: Vec<String> = types.iter().map(|t| t.to_string()).collect();
            CompileErrorKind::UndefinedFunction(format!("{}({})", name, sig.join(", ")))
        };
        match self.scope.func(name, &types) {
            Some(Symbol::Function { index, result }) => {
                let offset = self
                    .contract
                    .funcs
                    .get(index as usize)
                    .map(|f| f.offset)
                    .ok_or_else(|| self.error(node, undefined()))?;
                self.jump_to(node, Opcode::CallFunc, offset)?;
                Ok(result)
            }
            Some(Symbol::Embedded { index, result }) => {
                self.emit(Opcode::EmbedFunc, &[index]);
                Ok(result)
            }
            Some(Symbol::Custom { index, result }) => {
                let read = self.host.func(index).is_some_and(|f| f.read);
                if self.contract.read && !read {
                    return Err(self.error(node, CompileErrorKind::ReadContractViolation));
                }
                self.emit(Opcode::CustomFunc, &[index]);
                Ok(result)
            }
            _ => Err(self.error(node, undefined())),
        }
    }

    fn compile_call_contract(
        &mut self,
        node: &Node,
        name: &str,
        args: &[Entry],
    ) -> Result<Type, CompileError> {
        let undefined = || CompileErrorKind::UndefinedContract(name.to_string());
        let index = self
            .scope
            .contract(name)
            .ok_or_else(|| self.error(node, undefined()))?;
        let contracts = self.contracts;
        let callee = contracts
            .get(index as usize)
            .ok_or_else(|| self.error(node, undefined()))?;
        if self.contract.read && !callee.read {
            return Err(self.error(node, CompileErrorKind::ReadContractViolation));
        }
        if !args.is_empty() && callee.params.is_empty() {
            return Err(self.error(
                node,
                CompileErrorKind::ContractWithoutParameters(name.to_string()),
            ));
        }
        for arg in args {
            let info = callee.params.get(&arg.key).copied().ok_or_else(|| {
                self.error(
                    &arg.value,
                    CompileErrorKind::UnknownContractParameter(arg.key.clone()),
                )
            })?;
            let ty = self.compile_expr(&arg.value)?;
            if !accepts(info.ty, ty) {
                return Err(self.error(
                    &arg.value,
                    CompileErrorKind::ParameterTypeMismatch {
                        name: arg.key.clone(),
                        expected: info.ty,
                    },
                ));
            }
            self.emit(Opcode::ParContract, &[info.index, info.ty.tag()]);
        }
        self.emit(Opcode::CallContract, &[index]);
        Ok(Type::STR)
    }

    // =========================================================================
    // Composite literals
    // =========================================================================

    fn compile_array(&mut self, node: &Node, items: &[Node]) -> Result<Type, CompileError> {
        let mut elem: Option<Type> = None;
        for item in items {
            let ty = self.compile_expr(item)?;
            match elem {
                Some(expected) if expected != ty => {
                    return Err(self.error(
                        item,
                        CompileErrorKind::TypeMismatch {
                            expected,
                            found: ty,
                        },
                    ));
                }
                _ => elem = Some(ty),
            }
        }
        self.emit(Opcode::InitArr, &[items.len() as u16]);
        match elem {
            Some(elem) => {
                Type::array_of(elem).ok_or_else(|| self.error(node, CompileErrorKind::InvalidType))
            }
            None => Ok(Type::ARR),
        }
    }

    fn compile_map(&mut self, node: &Node, entries: &[Entry]) -> Result<Type, CompileError> {
        let mut elem: Option<Type> = None;
        for entry in entries {
            self.push_str(node, &entry.key)?;
            let ty = self.compile_expr(&entry.value)?;
            match elem {
                Some(expected) if expected != ty => {
                    return Err(self.error(
                        &entry.value,
                        CompileErrorKind::TypeMismatch {
                            expected,
                            found: ty,
                        },
                    ));
                }
                _ => elem = Some(ty),
            }
        }
        self.emit(Opcode::InitMap, &[entries.len() as u16]);
        match elem {
            Some(elem) => {
                Type::map_of(elem).ok_or_else(|| self.error(node, CompileErrorKind::InvalidType))
            }
            None => Ok(Type::MAP),
        }
    }
}

/// Whether a value of type `found` can be stored where `target` is declared.
/// Empty `[]` and `{}` literals carry no element type and fit any array or
/// map.
fn accepts(target: Type, found: Type) -> bool {
    target == found
        || (matches!(found.kind(), Kind::Arr | Kind::Map)
            && !found.is_composite()
            && found == target.outer())
}

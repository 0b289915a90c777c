use crate::language::ast::*;
use crate::runtime::{
    analysis::Analysis,
    environment::Environment,
    error::{RuntimeError, RuntimeResult},
    ffi::{Converter, CurriedCall},
    heap::Heap,
    table::Table,
    value::{Function, FunctionKind, ScriptFunction, Slot, Value},
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

/// Keyword-like introspection forms. They intercept call expressions by
/// name before ordinary dispatch because their argument evaluation differs
/// from a regular call.
const BUILTINS: &[&str] = &[
    "print",
    "globals",
    "locals",
    "memory",
    "ensure_value_type",
    "expect_failure",
];

/// Outcome of a statement: either execution continues, or one of the three
/// control-flow signals propagates until its catch site.
enum Flow {
    Normal,
    Break,
    Goto(String),
    Return(Vec<Value>),
}

/// A bindable location on the left of an assignment.
enum Place {
    Slot(Slot),
    Field(Rc<RefCell<Table>>, Value),
}

/// Positions of the runtime stacks, for restoring them after a caught
/// failure (`expect_failure` unwinds mid-call).
struct StackMark {
    blocks: usize,
    bases: usize,
    functions: usize,
    frames: usize,
}

pub struct Interpreter<'a> {
    source: &'a str,
    analysis: &'a Analysis,
    converter: &'a Converter,
    env: Environment,
    heap: Heap,
    /// Blocks currently entered, across every frame.
    blocks: Vec<BlockId>,
    /// Index into `blocks` where each frame's blocks begin.
    frame_bases: Vec<usize>,
    /// Script functions currently activated.
    functions: Vec<Rc<Function>>,
    out: &'a mut dyn Write,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        source: &'a str,
        analysis: &'a Analysis,
        converter: &'a Converter,
        out: &'a mut dyn Write,
    ) -> Self {
        Self {
            source,
            analysis,
            converter,
            env: Environment::new(),
            heap: Heap::new(),
            blocks: Vec::new(),
            frame_bases: Vec::new(),
            functions: Vec::new(),
            out,
        }
    }

    /// Installs a host-provided or predefined global before the run starts.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.env.set_global(name, value);
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn into_heap(self) -> Heap {
        self.heap
    }

    /// Evaluates the chunk as the outermost activation and returns its
    /// return values.
    pub fn run(&mut self, chunk: &Chunk) -> RuntimeResult<Vec<Value>> {
        self.env.push_frame();
        self.frame_bases.push(0);
        self.enter_block(chunk.block.id);
        self.env
            .frame_mut()
            .declare(chunk.block.id, "...", Value::Varargs(Vec::new()));

        let flow = self.run_block(&chunk.block)?;

        self.exit_block(chunk.block.id)?;
        self.frame_bases.pop();
        self.env.pop_frame();

        match flow {
            Flow::Return(values) => Ok(values),
            Flow::Normal => Ok(Vec::new()),
            Flow::Break | Flow::Goto(_) => Err(RuntimeError::Internal(
                "control-flow signal escaped the chunk".into(),
            )),
        }
    }

    // ---- block and stack management ----

    fn enter_block(&mut self, id: BlockId) {
        self.blocks.push(id);
        self.env.frame_mut().ensure_store(id);
    }

    fn exit_block(&mut self, id: BlockId) -> RuntimeResult<()> {
        match self.blocks.pop() {
            Some(top) if top == id => {
                self.env.frame_mut().remove_store(id);
                Ok(())
            }
            top => Err(RuntimeError::StackCorruption {
                expected: id.0,
                found: top.map(|b| b.0).unwrap_or(u32::MAX),
            }),
        }
    }

    fn current_block(&self) -> RuntimeResult<BlockId> {
        self.blocks
            .last()
            .copied()
            .ok_or_else(|| RuntimeError::Internal("no active block".into()))
    }

    fn mark(&self) -> StackMark {
        StackMark {
            blocks: self.blocks.len(),
            bases: self.frame_bases.len(),
            functions: self.functions.len(),
            frames: self.env.frame_count(),
        }
    }

    fn rewind(&mut self, mark: &StackMark) {
        self.blocks.truncate(mark.blocks);
        self.frame_bases.truncate(mark.bases);
        self.functions.truncate(mark.functions);
        while self.env.frame_count() > mark.frames {
            self.env.pop_frame();
        }
    }

    /// Resolution order: deepest live binding of the current frame, then
    /// the current function's closure, then the globals.
    fn lookup(&self, name: &str) -> Option<Slot> {
        let base = self.frame_bases.last().copied().unwrap_or(0);
        for block in self.blocks[base..].iter().rev() {
            if let Some(slot) = self.env.frame().slot(*block, name) {
                return Some(slot);
            }
        }
        if let Some(function) = self.functions.last() {
            if let FunctionKind::Script(script) = &function.kind {
                if let Some(slot) = script.closure.get(name) {
                    return Some(slot.clone());
                }
            }
        }
        self.env.global_slot(name)
    }

    // ---- statements ----

    /// Runs the statements of an already-entered block, catching `Goto`
    /// signals whose label lives here.
    fn run_block(&mut self, block: &Block) -> RuntimeResult<Flow> {
        let mut index = 0;
        while index < block.statements.len() {
            match self.eval_statement(&block.statements[index])? {
                Flow::Normal => index += 1,
                Flow::Goto(label) => {
                    if self.analysis.block_has_label(block.id, &label) {
                        let target = block.statements.iter().position(
                            |s| matches!(s, Statement::Label(n) if n.text == label),
                        );
                        match target {
                            Some(at) => index = at + 1,
                            None => {
                                return Err(RuntimeError::Internal(format!(
                                    "label `{label}` associated with a block that lacks it"
                                )));
                            }
                        }
                    } else {
                        return Ok(Flow::Goto(label));
                    }
                }
                other => return Ok(other),
            }
        }
        if let Some(ret) = &block.ret {
            let values = self.eval_expr_list(&ret.exprs)?;
            return Ok(Flow::Return(values));
        }
        Ok(Flow::Normal)
    }

    fn eval_block(&mut self, block: &Block) -> RuntimeResult<Flow> {
        self.enter_block(block.id);
        let flow = self.run_block(block)?;
        self.exit_block(block.id)?;
        Ok(flow)
    }

    fn eval_statement(&mut self, statement: &Statement) -> RuntimeResult<Flow> {
        match statement {
            Statement::Empty | Statement::Label(_) => Ok(Flow::Normal),
            Statement::Break(_) => Ok(Flow::Break),
            Statement::Goto(name) => Ok(Flow::Goto(name.text.clone())),
            Statement::Do(block) => self.eval_block(block),
            Statement::While(stat) => self.eval_while(stat),
            Statement::Repeat(stat) => self.eval_repeat(stat),
            Statement::If(stat) => self.eval_if(stat),
            Statement::NumericFor(stat) => self.eval_numeric_for(stat),
            Statement::GenericFor(stat) => self.eval_generic_for(stat),
            Statement::FunctionDecl(stat) => {
                self.eval_function_decl(stat)?;
                Ok(Flow::Normal)
            }
            Statement::LocalFunction(stat) => {
                self.eval_local_function(stat)?;
                Ok(Flow::Normal)
            }
            Statement::Local(stat) => {
                self.eval_local(stat)?;
                Ok(Flow::Normal)
            }
            Statement::Assign(stat) => {
                self.eval_assign(stat)?;
                Ok(Flow::Normal)
            }
            Statement::Call(expr) => {
                self.eval_call_multi(expr)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn eval_while(&mut self, stat: &WhileStat) -> RuntimeResult<Flow> {
        loop {
            if !self.eval_expr(&stat.condition)?.as_bool_weak() {
                break;
            }
            match self.eval_block(&stat.body)? {
                Flow::Normal => {}
                Flow::Break => break,
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    /// The until-condition sees the body's locals: it is evaluated in the
    /// body scope, before teardown.
    fn eval_repeat(&mut self, stat: &RepeatStat) -> RuntimeResult<Flow> {
        loop {
            self.enter_block(stat.body.id);
            match self.run_block(&stat.body)? {
                Flow::Normal => {
                    let done = self.eval_expr(&stat.condition)?.as_bool_weak();
                    self.exit_block(stat.body.id)?;
                    if done {
                        break;
                    }
                }
                Flow::Break => {
                    self.exit_block(stat.body.id)?;
                    break;
                }
                other => {
                    self.exit_block(stat.body.id)?;
                    return Ok(other);
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn eval_if(&mut self, stat: &IfStat) -> RuntimeResult<Flow> {
        for (guard, arm) in &stat.arms {
            if self.eval_expr(guard)?.as_bool_weak() {
                return self.eval_block(arm);
            }
        }
        if let Some(else_block) = &stat.else_block {
            return self.eval_block(else_block);
        }
        Ok(Flow::Normal)
    }

    fn eval_numeric_for(&mut self, stat: &NumericForStat) -> RuntimeResult<Flow> {
        let start = self.numeric_for_bound(&stat.start, "counter of numeric for")?;
        let limit = self.numeric_for_bound(&stat.limit, "limit of numeric for")?;
        let step = match &stat.step {
            Some(expr) => self.numeric_for_bound(expr, "increment of numeric for")?,
            None => Value::Int(1),
        };

        let float_mode = matches!(start, Value::Float(_))
            || matches!(limit, Value::Float(_))
            || matches!(step, Value::Float(_));

        self.enter_block(stat.body.id);
        let name = &stat.variable.text;
        let slot = self
            .env
            .frame_mut()
            .declare(stat.body.id, name, Value::Nil);

        let flow = if float_mode {
            let mut counter = start.as_double_weak()?;
            let limit = limit.as_double_weak()?;
            let step = step.as_double_weak()?;
            loop {
                let proceed = if step >= 0.0 {
                    counter <= limit
                } else {
                    counter >= limit
                };
                if !proceed {
                    break Flow::Normal;
                }
                *slot.borrow_mut() = Value::Float(counter);
                match self.run_block(&stat.body)? {
                    Flow::Normal => {}
                    Flow::Break => break Flow::Normal,
                    other => break other,
                }
                self.env.frame_mut().clear_store_except(stat.body.id, name);
                counter += step;
            }
        } else {
            let mut counter = start.as_int_weak(false)?;
            let limit = limit.as_int_weak(false)?;
            let step = step.as_int_weak(false)?;
            loop {
                let proceed = if step >= 0 {
                    counter <= limit
                } else {
                    counter >= limit
                };
                if !proceed {
                    break Flow::Normal;
                }
                *slot.borrow_mut() = Value::Int(counter);
                match self.run_block(&stat.body)? {
                    Flow::Normal => {}
                    Flow::Break => break Flow::Normal,
                    other => break other,
                }
                self.env.frame_mut().clear_store_except(stat.body.id, name);
                counter = counter.wrapping_add(step);
            }
        };

        self.exit_block(stat.body.id)?;
        Ok(flow)
    }

    fn numeric_for_bound(&mut self, expr: &Expr, context: &str) -> RuntimeResult<Value> {
        let value = self.eval_expr(expr)?;
        match value {
            Value::Int(_) | Value::Float(_) => Ok(value),
            other => Err(RuntimeError::bad_type(
                "int or double",
                other.type_name(),
                context,
            )),
        }
    }

    fn eval_generic_for(&mut self, stat: &GenericForStat) -> RuntimeResult<Flow> {
        let values = self.eval_expr_list(&stat.exprs)?;
        if values.is_empty() {
            return Err(RuntimeError::BadForIn);
        }
        let iterator = values[0].clone();
        if !matches!(iterator, Value::Function(_)) {
            return Err(RuntimeError::ForInBadType {
                type_name: iterator.type_name().to_string(),
            });
        }
        let state = values.get(1).cloned().unwrap_or(Value::Nil);
        let mut control = values.get(2).cloned().unwrap_or(Value::Nil);

        self.enter_block(stat.body.id);
        let flow = loop {
            let results = self.call_value(&iterator, vec![state.clone(), control.clone()])?;
            let first = results.first().cloned().unwrap_or(Value::Nil);
            if first.is_nil() {
                break Flow::Normal;
            }
            control = first;

            for (i, name) in stat.names.iter().enumerate() {
                let value = results.get(i).cloned().unwrap_or(Value::Nil);
                self.env.frame_mut().declare(stat.body.id, &name.text, value);
            }

            match self.run_block(&stat.body)? {
                Flow::Normal => {}
                Flow::Break => break Flow::Normal,
                other => break other,
            }
            self.env.frame_mut().clear_store(stat.body.id);
        };

        self.exit_block(stat.body.id)?;
        Ok(flow)
    }

    fn eval_local(&mut self, stat: &LocalStat) -> RuntimeResult<()> {
        let values = self.eval_expr_list(&stat.exprs)?;
        let block = self.current_block()?;
        for (i, name) in stat.names.iter().enumerate() {
            let value = values.get(i).cloned().unwrap_or(Value::Nil);
            self.env.frame_mut().declare(block, &name.text, value);
        }
        Ok(())
    }

    fn eval_assign(&mut self, stat: &AssignStat) -> RuntimeResult<()> {
        let mut places = Vec::with_capacity(stat.targets.len());
        for target in &stat.targets {
            places.push(self.resolve_place(target)?);
        }
        let values = self.eval_expr_list(&stat.exprs)?;
        for (i, place) in places.into_iter().enumerate() {
            let value = values.get(i).cloned().unwrap_or(Value::Nil);
            match place {
                Place::Slot(slot) => *slot.borrow_mut() = value,
                Place::Field(table, key) => table.borrow_mut().set(key, value)?,
            }
        }
        Ok(())
    }

    fn resolve_place(&mut self, target: &Expr) -> RuntimeResult<Place> {
        match target {
            Expr::Name(name) => match self.lookup(&name.text) {
                Some(slot) => Ok(Place::Slot(slot)),
                None => Ok(Place::Slot(self.env.define_global(&name.text))),
            },
            Expr::Index(index) => {
                let object = self.eval_expr(&index.object)?;
                let key = self.eval_index_key(&index.index)?;
                match object {
                    Value::Table(table) => Ok(Place::Field(table, key)),
                    Value::Nil => Err(RuntimeError::NilAccess),
                    other => Err(RuntimeError::BadDotAccess {
                        type_name: other.type_name().to_string(),
                    }),
                }
            }
            other => Err(RuntimeError::Internal(format!(
                "invalid assignment target: {other:?}"
            ))),
        }
    }

    fn eval_function_decl(&mut self, stat: &FunctionDeclStat) -> RuntimeResult<()> {
        let value = self.make_function(&stat.body)?;
        let first = &stat.path[0];

        if stat.path.len() == 1 {
            match self.lookup(&first.text) {
                Some(slot) => *slot.borrow_mut() = value,
                None => self.env.set_global(&first.text, value),
            }
            return Ok(());
        }

        let mut current = match self.lookup(&first.text) {
            Some(slot) => slot.borrow().clone(),
            None => Value::Nil,
        };
        for name in &stat.path[1..stat.path.len() - 1] {
            current = match current {
                Value::Table(table) => {
                    let field = table.borrow().get_str(&name.text);
                    field
                }
                Value::Nil => return Err(RuntimeError::NilAccess),
                other => {
                    return Err(RuntimeError::BadDotAccess {
                        type_name: other.type_name().to_string(),
                    });
                }
            };
        }
        let last = &stat.path[stat.path.len() - 1];
        match current {
            Value::Table(table) => {
                table.borrow_mut().set_str(&last.text, value);
                Ok(())
            }
            Value::Nil => Err(RuntimeError::NilAccess),
            other => Err(RuntimeError::BadDotAccess {
                type_name: other.type_name().to_string(),
            }),
        }
    }

    /// The local binding exists before the function value is built, so the
    /// body can call itself through its own closure.
    fn eval_local_function(&mut self, stat: &LocalFunctionStat) -> RuntimeResult<()> {
        let block = self.current_block()?;
        let slot = self
            .env
            .frame_mut()
            .declare(block, &stat.name.text, Value::Nil);
        let value = self.make_function(&stat.body)?;
        *slot.borrow_mut() = value;
        Ok(())
    }

    fn make_function(&mut self, body: &Rc<FuncBody>) -> RuntimeResult<Value> {
        let closure = self.build_closure(body.block.id);
        let function = self.heap.alloc_function(Function {
            kind: FunctionKind::Script(ScriptFunction {
                params: body.params.clone(),
                body: body.clone(),
                closure,
            }),
        });
        Ok(Value::Function(function))
    }

    /// Captures the live bindings visible at function-creation time. The
    /// enclosing function's closure comes first so that names it captured
    /// from outer activations stay reachable; live blocks of the current
    /// frame overlay it, innermost binding winning.
    fn build_closure(&self, body_block: BlockId) -> HashMap<String, Slot> {
        let mut closure = HashMap::new();
        if let Some(function) = self.functions.last() {
            if let FunctionKind::Script(script) = &function.kind {
                for (name, slot) in &script.closure {
                    closure.insert(name.clone(), slot.clone());
                }
            }
        }
        for parent in self.analysis.parents_of_function(body_block) {
            if let Some(store) = self.env.frame().store(*parent) {
                for (name, slot) in store {
                    closure.insert(name.clone(), slot.clone());
                }
            }
        }
        closure
    }

    // ---- calls ----

    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> RuntimeResult<Vec<Value>> {
        match callee {
            Value::Function(function) => self.call_function(&function.clone(), args),
            other => Err(RuntimeError::BadCall {
                type_name: other.type_name().to_string(),
            }),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
    ) -> RuntimeResult<Vec<Value>> {
        match &function.kind {
            FunctionKind::Host(host) => {
                let mut call = CurriedCall::new(host.clone());
                for arg in &args {
                    call.bind_next(self.converter, arg)?;
                }
                Ok(vec![call.invoke()?])
            }
            FunctionKind::Script(_) => self.call_script(function.clone(), args),
        }
    }

    /// Push a frame, bind formals positionally, run the body, and harvest
    /// the `Return` signal. Extra arguments flow into `...` when the formal
    /// list ends with it; missing formals become nil.
    fn call_script(&mut self, function: Rc<Function>, args: Vec<Value>) -> RuntimeResult<Vec<Value>> {
        let FunctionKind::Script(script) = &function.kind else {
            return Err(RuntimeError::Internal("host function in script path".into()));
        };
        let body = script.body.clone();
        let params = &script.params;
        let variadic = params.last().is_some_and(|p| p == "...");
        let named_count = params.len() - usize::from(variadic);

        self.env.push_frame();
        self.frame_bases.push(self.blocks.len());
        self.functions.push(function.clone());
        self.enter_block(body.block.id);

        let mut args = args.into_iter();
        for param in &params[..named_count] {
            let value = args.next().unwrap_or(Value::Nil);
            self.env.frame_mut().declare(body.block.id, param, value);
        }
        if variadic {
            let rest: Vec<Value> = args.collect();
            self.env
                .frame_mut()
                .declare(body.block.id, "...", Value::Varargs(rest));
        }

        let flow = self.run_block(&body.block)?;

        self.exit_block(body.block.id)?;
        self.functions.pop();
        self.frame_bases.pop();
        self.env.pop_frame();

        match flow {
            Flow::Return(values) => Ok(values),
            Flow::Normal => Ok(Vec::new()),
            Flow::Break | Flow::Goto(_) => Err(RuntimeError::Internal(
                "control-flow signal escaped a function body".into(),
            )),
        }
    }

    // ---- expressions ----

    /// An expression list: every entry contributes one value except the
    /// last, which expands fully when multi-valued.
    fn eval_expr_list(&mut self, exprs: &[Expr]) -> RuntimeResult<Vec<Value>> {
        let mut values = Vec::with_capacity(exprs.len());
        for (i, expr) in exprs.iter().enumerate() {
            if i + 1 == exprs.len() {
                values.extend(self.eval_expr_values(expr)?);
            } else {
                values.push(self.eval_expr(expr)?);
            }
        }
        Ok(values)
    }

    /// Full value list of an expression: calls yield all their results,
    /// `...` yields its bundle, everything else yields one value.
    fn eval_expr_values(&mut self, expr: &Expr) -> RuntimeResult<Vec<Value>> {
        match expr {
            Expr::Call(_) | Expr::MethodCall(_) => self.eval_call_multi(expr),
            Expr::Varargs(_) => match self.lookup("...") {
                Some(slot) => {
                    let value = slot.borrow().clone();
                    match value {
                        Value::Varargs(values) => Ok(values),
                        other => Ok(vec![other]),
                    }
                }
                None => Ok(Vec::new()),
            },
            other => Ok(vec![self.eval_expr(other)?]),
        }
    }

    /// Single-value semantics: a multi-valued expression contributes its
    /// first value, or nil when empty.
    fn eval_expr(&mut self, expr: &Expr) -> RuntimeResult<Value> {
        match expr {
            Expr::Nil(_) => Ok(Value::Nil),
            Expr::True(_) => Ok(Value::Bool(true)),
            Expr::False(_) => Ok(Value::Bool(false)),
            Expr::Int(value, _) => Ok(Value::Int(*value)),
            Expr::Float(value, _) => Ok(Value::Float(*value)),
            Expr::Str(value, _) => Ok(Value::Str(value.clone())),
            Expr::Varargs(_) => {
                let values = self.eval_expr_values(expr)?;
                Ok(values.into_iter().next().unwrap_or(Value::Nil))
            }
            Expr::Function(body) => self.make_function(body),
            Expr::Name(name) => match self.lookup(&name.text) {
                Some(slot) => Ok(slot.borrow().clone()),
                None => Ok(Value::Nil),
            },
            Expr::Paren(inner, _) => self.eval_expr(inner),
            Expr::Index(index) => self.eval_index(index),
            Expr::Call(_) | Expr::MethodCall(_) => {
                let values = self.eval_call_multi(expr)?;
                Ok(values.into_iter().next().unwrap_or(Value::Nil))
            }
            Expr::Table(table) => self.eval_table(table),
            Expr::Binary(binary) => self.eval_binary(binary),
            Expr::Unary(unary) => self.eval_unary(unary),
        }
    }

    fn eval_index_key(&mut self, key: &IndexKey) -> RuntimeResult<Value> {
        match key {
            IndexKey::Dot(name) => Ok(Value::Str(name.text.clone())),
            IndexKey::Bracket(expr) => self.eval_expr(expr),
        }
    }

    fn eval_index(&mut self, index: &IndexExpr) -> RuntimeResult<Value> {
        let object = self.eval_expr(&index.object)?;
        let key = self.eval_index_key(&index.index)?;
        match object {
            Value::Table(table) => {
                let value = table.borrow().get(&key)?;
                Ok(value)
            }
            Value::Userdata(_) => Ok(Value::Nil),
            Value::Nil => Err(RuntimeError::NilAccess),
            other => Err(RuntimeError::BadDotAccess {
                type_name: other.type_name().to_string(),
            }),
        }
    }

    fn eval_call_multi(&mut self, expr: &Expr) -> RuntimeResult<Vec<Value>> {
        match expr {
            Expr::Call(call) => {
                if let Expr::Name(name) = &call.callee {
                    if BUILTINS.contains(&name.text.as_str()) {
                        return self.eval_builtin(&name.text, &call.args);
                    }
                }
                let callee = self.eval_expr(&call.callee)?;
                let args = self.eval_expr_list(&call.args)?;
                self.call_value(&callee, args)
            }
            Expr::MethodCall(call) => {
                let object = self.eval_expr(&call.object)?;
                let method = match &object {
                    Value::Table(table) => table.borrow().get_str(&call.method.text),
                    Value::Nil => return Err(RuntimeError::NilAccess),
                    other => {
                        return Err(RuntimeError::BadDotAccess {
                            type_name: other.type_name().to_string(),
                        });
                    }
                };
                let mut args = vec![object];
                args.extend(self.eval_expr_list(&call.args)?);
                self.call_value(&method, args)
            }
            other => Err(RuntimeError::Internal(format!(
                "not a call expression: {other:?}"
            ))),
        }
    }

    /// Fields evaluate left to right; the positional index advances only on
    /// positional items (a positional nil is skipped but consumes its
    /// index), and the final positional item expands when multi-valued.
    fn eval_table(&mut self, table: &TableExpr) -> RuntimeResult<Value> {
        let result = self.heap.alloc_table(Table::new());
        let mut index: i64 = 1;
        let last = table.fields.len().saturating_sub(1);
        for (i, field) in table.fields.iter().enumerate() {
            match field {
                TableField::Positional(expr) => {
                    if i == last {
                        for value in self.eval_expr_values(expr)? {
                            if !value.is_nil() {
                                result.borrow_mut().set(Value::Int(index), value)?;
                            }
                            index += 1;
                        }
                    } else {
                        let value = self.eval_expr(expr)?;
                        if !value.is_nil() {
                            result.borrow_mut().set(Value::Int(index), value)?;
                        }
                        index += 1;
                    }
                }
                TableField::Named(name, expr) => {
                    let value = self.eval_expr(expr)?;
                    result.borrow_mut().set_str(&name.text, value);
                }
                TableField::Keyed(key_expr, value_expr) => {
                    let key = self.eval_expr(key_expr)?;
                    let value = self.eval_expr(value_expr)?;
                    // Nil and varargs keys are silently dropped here, unlike
                    // subscript assignment which rejects them.
                    if !matches!(key, Value::Nil | Value::Varargs(_)) {
                        result.borrow_mut().set(key, value)?;
                    }
                }
            }
        }
        Ok(Value::Table(result))
    }

    // ---- operators ----

    fn eval_binary(&mut self, binary: &BinaryExpr) -> RuntimeResult<Value> {
        match binary.op {
            BinaryOp::And => {
                let left = self.eval_expr(&binary.left)?;
                if left.as_bool_weak() {
                    self.eval_expr(&binary.right)
                } else {
                    Ok(left)
                }
            }
            BinaryOp::Or => {
                let left = self.eval_expr(&binary.left)?;
                if left.as_bool_weak() {
                    Ok(left)
                } else {
                    self.eval_expr(&binary.right)
                }
            }
            op => {
                let left = self.eval_expr(&binary.left)?;
                let right = self.eval_expr(&binary.right)?;
                apply_binary(op, &left, &right)
            }
        }
    }

    fn eval_unary(&mut self, unary: &UnaryExpr) -> RuntimeResult<Value> {
        let value = self.eval_expr(&unary.operand)?;
        match unary.op {
            UnaryOp::Not => Ok(Value::Bool(!value.as_bool_weak())),
            UnaryOp::Neg => match value {
                Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
                Value::Float(v) => Ok(Value::Float(-v)),
                Value::Str(_) => {
                    let Value::Float(v) = value.from_string_to_number(true)? else {
                        return Err(RuntimeError::Internal(
                            "forced double conversion produced a non-double".into(),
                        ));
                    };
                    Ok(Value::Float(-v))
                }
                other => Err(RuntimeError::bad_type_contextless(
                    "number",
                    other.type_name(),
                )),
            },
            UnaryOp::Len => match &value {
                Value::Str(s) => Ok(Value::Int(s.len() as i64)),
                Value::Table(t) => Ok(Value::Int(t.borrow().border())),
                other => Err(RuntimeError::bad_type_contextless(
                    "string or table",
                    other.type_name(),
                )),
            },
            UnaryOp::BitNot => Ok(Value::Int(!value.as_int_weak(true)?)),
        }
    }

    // ---- built-in introspection forms ----

    fn eval_builtin(&mut self, name: &str, args: &[Expr]) -> RuntimeResult<Vec<Value>> {
        match name {
            "print" => {
                let values = self.eval_expr_list(args)?;
                let line = values
                    .iter()
                    .map(Value::render)
                    .collect::<Vec<_>>()
                    .join(" ");
                let _ = writeln!(self.out, "{line}");
            }
            "globals" => self.dump_globals(),
            "locals" => self.dump_locals()?,
            "memory" => self.dump_memory(),
            "ensure_value_type" => self.builtin_ensure_value_type(args)?,
            "expect_failure" => self.builtin_expect_failure(args)?,
            _ => {
                return Err(RuntimeError::Internal(format!(
                    "unknown builtin `{name}`"
                )));
            }
        }
        Ok(Vec::new())
    }

    fn dump_globals(&mut self) {
        let _ = writeln!(self.out, "Globals:");
        let entries: Vec<String> = self
            .env
            .globals()
            .map(|(name, slot)| format!("{name}: {}", slot.borrow().render()))
            .collect();
        for entry in entries {
            let _ = writeln!(self.out, "{entry}");
        }
        let _ = writeln!(self.out);
    }

    fn dump_locals(&mut self) -> RuntimeResult<()> {
        let block = self.current_block()?;
        let _ = writeln!(self.out, "Locals (top block):");
        let entries: Vec<String> = self
            .env
            .frame()
            .store(block)
            .map(|store| {
                store
                    .iter()
                    .map(|(name, slot)| format!("{name}: {}", slot.borrow().render()))
                    .collect()
            })
            .unwrap_or_default();
        for entry in entries {
            let _ = writeln!(self.out, "{entry}");
        }
        let _ = writeln!(self.out);
        Ok(())
    }

    fn dump_memory(&mut self) {
        let heap_line = self.heap.dump();
        let _ = writeln!(self.out, "{heap_line}");
        self.dump_globals();
        for frame_index in 0..self.env.frame_count() {
            let _ = writeln!(self.out, "Locals (frame {frame_index}):");
            let begin = self.frame_bases.get(frame_index).copied().unwrap_or(0);
            let end = self
                .frame_bases
                .get(frame_index + 1)
                .copied()
                .unwrap_or(self.blocks.len());
            let mut lines = Vec::new();
            for (depth, block) in self.blocks[begin..end].iter().enumerate() {
                lines.push(format!("  Block {depth}"));
                if let Some(store) = self
                    .env
                    .frame_at(frame_index)
                    .and_then(|frame| frame.store(*block))
                {
                    for (name, slot) in store {
                        lines.push(format!("    {name}: {}", slot.borrow().render()));
                    }
                }
            }
            for line in lines {
                let _ = writeln!(self.out, "{line}");
            }
        }
    }

    fn builtin_ensure_value_type(&mut self, args: &[Expr]) -> RuntimeResult<()> {
        if args.len() != 3 {
            return Err(RuntimeError::Internal(
                "ensure_value_type expects exactly 3 arguments".into(),
            ));
        }
        let expression = args[0].span().slice(self.source).trim().to_string();
        let value = self.eval_expr(&args[0])?;
        let expected = self.eval_expr(&args[1])?;
        let type_value = self.eval_expr(&args[2])?;

        // Equality is not checked for reference types; identity would be
        // meaningless against a freshly built expectation.
        if !expected.is_reference() && value != expected {
            return Err(RuntimeError::ValueEqualityExpected {
                expression,
                expected: expected.render(),
                got: value.render(),
            });
        }

        let Value::Str(type_name) = type_value else {
            return Err(RuntimeError::bad_type_contextless(
                "string",
                type_value.type_name(),
            ));
        };
        const KNOWN: &[&str] = &["int", "double", "string", "table", "bool", "nil"];
        if !KNOWN.contains(&type_name.as_str()) {
            return Err(RuntimeError::UnknownTypeName { type_name });
        }

        if value.type_name() != type_name {
            return Err(RuntimeError::TypeEqualityExpected {
                expression,
                expected: type_name,
                got: value.type_name().to_string(),
            });
        }
        Ok(())
    }

    /// The argument must raise a type error; the stacks are restored to
    /// their pre-evaluation positions after the unwound call frames.
    fn builtin_expect_failure(&mut self, args: &[Expr]) -> RuntimeResult<()> {
        if args.len() != 1 {
            return Err(RuntimeError::Internal(
                "expect_failure expects exactly 1 argument".into(),
            ));
        }
        let expression = args[0].span().slice(self.source).trim().to_string();
        let mark = self.mark();
        match self.eval_expr(&args[0]) {
            Ok(_) => Err(RuntimeError::FailureExpected { expression }),
            Err(error) if error.is_type_error() => {
                self.rewind(&mark);
                let _ = writeln!(
                    self.out,
                    "Expression {expression} rightfully triggered a type error"
                );
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> RuntimeResult<Value> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
            if let (Value::Int(a), Value::Int(b)) = (left, right) {
                let result = match op {
                    BinaryOp::Add => a.wrapping_add(*b),
                    BinaryOp::Sub => a.wrapping_sub(*b),
                    _ => a.wrapping_mul(*b),
                };
                return Ok(Value::Int(result));
            }
            let a = left.as_double_weak()?;
            let b = right.as_double_weak()?;
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                _ => a * b,
            };
            Ok(Value::Float(result))
        }
        BinaryOp::Div => Ok(Value::Float(
            left.as_double_weak()? / right.as_double_weak()?,
        )),
        BinaryOp::FloorDiv => {
            let quotient = (left.as_double_weak()? / right.as_double_weak()?).floor();
            if let (Value::Int(_), Value::Int(_)) = (left, right) {
                Ok(Value::Int(quotient as i64))
            } else {
                Ok(Value::Float(quotient))
            }
        }
        BinaryOp::Mod => {
            if let (Value::Int(a), Value::Int(b)) = (left, right) {
                return match a.checked_rem(*b) {
                    Some(result) => Ok(Value::Int(result)),
                    None => Ok(Value::Float(f64::NAN)),
                };
            }
            Ok(Value::Float(ieee_remainder(
                left.as_double_weak()?,
                right.as_double_weak()?,
            )))
        }
        BinaryOp::Pow => Ok(Value::Float(
            left.as_double_weak()?.powf(right.as_double_weak()?),
        )),
        BinaryOp::Concat => {
            let mut result = left.as_string()?;
            result.push_str(&right.as_string()?);
            Ok(Value::Str(result))
        }
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::NotEq => Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::LtEq | BinaryOp::GtEq => {
            let a = left.as_double_weak()?;
            let b = right.as_double_weak()?;
            let result = match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Gt => a > b,
                BinaryOp::LtEq => a <= b,
                _ => a >= b,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
            let a = left.as_int_weak(true)?;
            let b = right.as_int_weak(true)?;
            let result = match op {
                BinaryOp::BitAnd => a & b,
                BinaryOp::BitOr => a | b,
                _ => a ^ b,
            };
            Ok(Value::Int(result))
        }
        BinaryOp::Shl => Ok(Value::Int(lua_shift(
            left.as_int_weak(true)?,
            right.as_int_weak(true)?,
            true,
        ))),
        BinaryOp::Shr => Ok(Value::Int(lua_shift(
            left.as_int_weak(true)?,
            right.as_int_weak(true)?,
            false,
        ))),
        BinaryOp::And | BinaryOp::Or => Err(RuntimeError::Internal(
            "short-circuit operators reached apply_binary".into(),
        )),
    }
}

/// IEEE 754 remainder: `a - b * round_to_nearest(a / b)`.
fn ieee_remainder(a: f64, b: f64) -> f64 {
    if b == 0.0 || !a.is_finite() {
        return f64::NAN;
    }
    let quotient = (a / b).round_ties_even();
    a - b * quotient
}

/// Shifts follow the scripting semantics rather than the host's: counts of
/// 64 or more flush to zero, negative counts shift the other way, and the
/// right shift is logical.
fn lua_shift(value: i64, count: i64, left: bool) -> i64 {
    if count < 0 {
        return lua_shift(value, count.saturating_neg(), !left);
    }
    if count >= 64 {
        return 0;
    }
    if left {
        ((value as u64) << count) as i64
    } else {
        ((value as u64) >> count) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ieee_remainder_rounds_to_nearest() {
        assert_eq!(ieee_remainder(5.0, 2.0), 1.0);
        assert_eq!(ieee_remainder(7.0, 4.0), -1.0);
        assert!(ieee_remainder(1.0, 0.0).is_nan());
    }

    #[test]
    fn shifts_follow_script_semantics() {
        assert_eq!(lua_shift(1, 4, true), 16);
        assert_eq!(lua_shift(16, 4, false), 1);
        assert_eq!(lua_shift(1, 64, true), 0);
        assert_eq!(lua_shift(16, -2, false), 64);
        assert_eq!(lua_shift(-1, 1, false), i64::MAX);
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        let v = apply_binary(BinaryOp::Add, &Value::Int(2), &Value::Int(3)).unwrap();
        assert!(matches!(v, Value::Int(5)));
        let v = apply_binary(BinaryOp::Mul, &Value::Int(2), &Value::Int(3)).unwrap();
        assert!(matches!(v, Value::Int(6)));
    }

    #[test]
    fn mixed_arithmetic_promotes() {
        let v = apply_binary(BinaryOp::Add, &Value::Int(1), &Value::Float(2.0)).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 3.0));
    }

    #[test]
    fn division_is_always_double() {
        let v = apply_binary(BinaryOp::Div, &Value::Int(1), &Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 0.5));
    }

    #[test]
    fn floor_division_keeps_integer_when_both_are() {
        let v = apply_binary(BinaryOp::FloorDiv, &Value::Int(7), &Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Int(3)));
        let v = apply_binary(BinaryOp::FloorDiv, &Value::Float(7.0), &Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 3.0));
        let v = apply_binary(BinaryOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Int(-4)));
    }

    #[test]
    fn power_is_always_double() {
        let v = apply_binary(BinaryOp::Pow, &Value::Int(2), &Value::Int(10)).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 1024.0));
    }

    #[test]
    fn concat_coerces_numbers() {
        let v = apply_binary(BinaryOp::Concat, &Value::Int(1), &Value::Str("x".into())).unwrap();
        assert_eq!(v, Value::Str("1x".into()));
    }

    #[test]
    fn comparison_coerces_strings() {
        let v = apply_binary(BinaryOp::Lt, &Value::Str("1".into()), &Value::Int(2)).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn comparison_rejects_non_numeric() {
        assert!(apply_binary(BinaryOp::Lt, &Value::Nil, &Value::Int(2)).is_err());
    }

    #[test]
    fn equality_is_structural_not_weak() {
        let v = apply_binary(
            BinaryOp::Eq,
            &Value::Str("a".into()),
            &Value::Str("a".into()),
        )
        .unwrap();
        assert_eq!(v, Value::Bool(true));
        let v = apply_binary(BinaryOp::Eq, &Value::Str("1".into()), &Value::Int(1)).unwrap();
        assert_eq!(v, Value::Bool(false));
    }

    #[test]
    fn bitwise_accepts_whole_doubles() {
        let v = apply_binary(BinaryOp::BitAnd, &Value::Float(6.0), &Value::Int(3)).unwrap();
        assert!(matches!(v, Value::Int(2)));
        assert!(apply_binary(BinaryOp::BitAnd, &Value::Float(6.5), &Value::Int(3)).is_err());
    }
}

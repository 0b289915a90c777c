use crate::language::ast::*;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("`break` outside of a loop at line {line}")]
    LonelyBreak { line: usize },
    #[error("goto `{label}` crosses the declaration of: {}", locals.join(", "))]
    CrossedLocal { label: String, locals: Vec<String> },
    #[error("No visible label `{label}` for goto")]
    InvisibleLabel { label: String },
    #[error("Label `{label}` already defined in this block")]
    LabelAlreadyDefined { label: String },
}

/// What the evaluator needs from the pre-execution pass: which blocks catch
/// which labels, and which blocks enclose each function body (for closure
/// capture).
#[derive(Debug, Default)]
pub struct Analysis {
    label_blocks: HashMap<String, Vec<BlockId>>,
    function_parents: HashMap<BlockId, Vec<BlockId>>,
}

impl Analysis {
    pub fn block_has_label(&self, block: BlockId, label: &str) -> bool {
        self.label_blocks
            .get(label)
            .is_some_and(|blocks| blocks.contains(&block))
    }

    /// Enclosing blocks of a function body, outermost first.
    pub fn parents_of_function(&self, body: BlockId) -> &[BlockId] {
        self.function_parents
            .get(&body)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub fn analyze(chunk: &Chunk, source: &str) -> Result<Analysis, AnalysisError> {
    let mut walker = Walker::new(source);
    walker.enter_scope(chunk.block.id);
    walker.walk_block(&chunk.block, false)?;
    walker.exit_scope();
    walker.validate()?;
    Ok(walker.analysis)
}

/// Ordered occupants of a block, in statement order. Gotos are resolved
/// against these lists: a label already seen is a legal backward jump, and
/// otherwise the search walks forward through the rest of each enclosing
/// block of the same function.
#[derive(Debug)]
enum ScopeElement {
    Goto(String),
    Label(String),
    Local(String),
    Child(BlockId),
}

/// One goto-able region: the chunk, or one function body. Gotos never cross
/// scope boundaries.
struct Scope {
    root: BlockId,
    elements: HashMap<BlockId, Vec<ScopeElement>>,
}

struct Walker<'src> {
    source: &'src str,
    analysis: Analysis,
    scopes: Vec<Scope>,
    /// Indices into `scopes` of the scopes currently being walked.
    active: Vec<usize>,
    /// Blocks open in the current scope; the last is the parent for `Child`
    /// elements.
    scope_blocks: Vec<Vec<BlockId>>,
    /// Every block open in the walk, across scope boundaries; snapshot
    /// becomes a function body's parent list.
    block_chain: Vec<BlockId>,
    /// Loop nesting per scope; `break` needs a nonzero top.
    loop_depth: Vec<usize>,
}

impl<'src> Walker<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            source,
            analysis: Analysis::default(),
            scopes: Vec::new(),
            active: Vec::new(),
            scope_blocks: Vec::new(),
            block_chain: Vec::new(),
            loop_depth: Vec::new(),
        }
    }

    fn enter_scope(&mut self, root: BlockId) {
        self.scopes.push(Scope {
            root,
            elements: HashMap::new(),
        });
        self.active.push(self.scopes.len() - 1);
        self.scope_blocks.push(Vec::new());
        self.loop_depth.push(0);
    }

    fn exit_scope(&mut self) {
        self.active.pop();
        self.scope_blocks.pop();
        self.loop_depth.pop();
    }

    fn current_scope(&mut self) -> &mut Scope {
        let index = *self.active.last().expect("walker scope stack is empty");
        &mut self.scopes[index]
    }

    fn push_element(&mut self, block: BlockId, element: ScopeElement) -> Result<(), AnalysisError> {
        if let ScopeElement::Label(name) = &element {
            let name = name.clone();
            let elements = self.current_scope().elements.entry(block).or_default();
            let duplicate = elements
                .iter()
                .any(|e| matches!(e, ScopeElement::Label(l) if *l == name));
            if duplicate {
                return Err(AnalysisError::LabelAlreadyDefined { label: name });
            }
        }
        self.current_scope()
            .elements
            .entry(block)
            .or_default()
            .push(element);
        Ok(())
    }

    fn walk_block(&mut self, block: &Block, is_loop_body: bool) -> Result<(), AnalysisError> {
        if let Some(parent) = self.scope_blocks.last().and_then(|b| b.last()).copied() {
            self.push_element(parent, ScopeElement::Child(block.id))?;
        }
        self.current_scope().elements.entry(block.id).or_default();
        if let Some(blocks) = self.scope_blocks.last_mut() {
            blocks.push(block.id);
        }
        self.block_chain.push(block.id);
        if is_loop_body {
            if let Some(depth) = self.loop_depth.last_mut() {
                *depth += 1;
            }
        }

        let result = self.walk_statements(block);

        if is_loop_body {
            if let Some(depth) = self.loop_depth.last_mut() {
                *depth -= 1;
            }
        }
        self.block_chain.pop();
        if let Some(blocks) = self.scope_blocks.last_mut() {
            blocks.pop();
        }
        result
    }

    fn walk_statements(&mut self, block: &Block) -> Result<(), AnalysisError> {
        for statement in &block.statements {
            match statement {
                Statement::Empty => {}
                Statement::Break(span) => {
                    if self.loop_depth.last().copied().unwrap_or(0) == 0 {
                        return Err(AnalysisError::LonelyBreak {
                            line: span.line(self.source),
                        });
                    }
                }
                Statement::Goto(name) => {
                    self.push_element(block.id, ScopeElement::Goto(name.text.clone()))?;
                }
                Statement::Label(name) => {
                    self.push_element(block.id, ScopeElement::Label(name.text.clone()))?;
                    self.analysis
                        .label_blocks
                        .entry(name.text.clone())
                        .or_default()
                        .push(block.id);
                }
                Statement::Do(inner) => self.walk_block(inner, false)?,
                Statement::While(stat) => {
                    self.walk_expr(&stat.condition)?;
                    self.walk_block(&stat.body, true)?;
                }
                Statement::Repeat(stat) => {
                    // The until-condition evaluates in the body's scope, so
                    // it is walked as part of the body for closure purposes.
                    self.walk_repeat(stat)?;
                }
                Statement::If(stat) => {
                    for (guard, arm) in &stat.arms {
                        self.walk_expr(guard)?;
                        self.walk_block(arm, false)?;
                    }
                    if let Some(else_block) = &stat.else_block {
                        self.walk_block(else_block, false)?;
                    }
                }
                Statement::NumericFor(stat) => {
                    self.walk_expr(&stat.start)?;
                    self.walk_expr(&stat.limit)?;
                    if let Some(step) = &stat.step {
                        self.walk_expr(step)?;
                    }
                    self.walk_block(&stat.body, true)?;
                }
                Statement::GenericFor(stat) => {
                    for expr in &stat.exprs {
                        self.walk_expr(expr)?;
                    }
                    self.walk_block(&stat.body, true)?;
                }
                Statement::FunctionDecl(stat) => {
                    self.walk_function_body(&stat.body)?;
                }
                Statement::LocalFunction(stat) => {
                    // The binding exists before the body, so the function
                    // can see itself.
                    self.push_element(block.id, ScopeElement::Local(stat.name.text.clone()))?;
                    self.walk_function_body(&stat.body)?;
                }
                Statement::Local(stat) => {
                    for expr in &stat.exprs {
                        self.walk_expr(expr)?;
                    }
                    for name in &stat.names {
                        self.push_element(block.id, ScopeElement::Local(name.text.clone()))?;
                    }
                }
                Statement::Assign(stat) => {
                    for target in &stat.targets {
                        self.walk_expr(target)?;
                    }
                    for expr in &stat.exprs {
                        self.walk_expr(expr)?;
                    }
                }
                Statement::Call(expr) => self.walk_expr(expr)?,
            }
        }
        if let Some(ret) = &block.ret {
            for expr in &ret.exprs {
                self.walk_expr(expr)?;
            }
        }
        Ok(())
    }

    fn walk_repeat(&mut self, stat: &RepeatStat) -> Result<(), AnalysisError> {
        let block = &stat.body;
        if let Some(parent) = self.scope_blocks.last().and_then(|b| b.last()).copied() {
            self.push_element(parent, ScopeElement::Child(block.id))?;
        }
        self.current_scope().elements.entry(block.id).or_default();
        if let Some(blocks) = self.scope_blocks.last_mut() {
            blocks.push(block.id);
        }
        self.block_chain.push(block.id);
        if let Some(depth) = self.loop_depth.last_mut() {
            *depth += 1;
        }

        let result = self
            .walk_statements(block)
            .and_then(|_| self.walk_expr(&stat.condition));

        if let Some(depth) = self.loop_depth.last_mut() {
            *depth -= 1;
        }
        self.block_chain.pop();
        if let Some(blocks) = self.scope_blocks.last_mut() {
            blocks.pop();
        }
        result
    }

    fn walk_function_body(&mut self, body: &FuncBody) -> Result<(), AnalysisError> {
        self.analysis
            .function_parents
            .insert(body.block.id, self.block_chain.clone());
        self.enter_scope(body.block.id);
        let result = self.walk_block(&body.block, false);
        self.exit_scope();
        result
    }

    fn walk_expr(&mut self, expr: &Expr) -> Result<(), AnalysisError> {
        match expr {
            Expr::Nil(_)
            | Expr::True(_)
            | Expr::False(_)
            | Expr::Varargs(_)
            | Expr::Int(_, _)
            | Expr::Float(_, _)
            | Expr::Str(_, _)
            | Expr::Name(_) => Ok(()),
            Expr::Function(body) => self.walk_function_body(body),
            Expr::Paren(inner, _) => self.walk_expr(inner),
            Expr::Index(index) => {
                self.walk_expr(&index.object)?;
                if let IndexKey::Bracket(key) = &index.index {
                    self.walk_expr(key)?;
                }
                Ok(())
            }
            Expr::Call(call) => {
                self.walk_expr(&call.callee)?;
                for arg in &call.args {
                    self.walk_expr(arg)?;
                }
                Ok(())
            }
            Expr::MethodCall(call) => {
                self.walk_expr(&call.object)?;
                for arg in &call.args {
                    self.walk_expr(arg)?;
                }
                Ok(())
            }
            Expr::Table(table) => {
                for field in &table.fields {
                    match field {
                        TableField::Positional(value) => self.walk_expr(value)?,
                        TableField::Named(_, value) => self.walk_expr(value)?,
                        TableField::Keyed(key, value) => {
                            self.walk_expr(key)?;
                            self.walk_expr(value)?;
                        }
                    }
                }
                Ok(())
            }
            Expr::Binary(binary) => {
                self.walk_expr(&binary.left)?;
                self.walk_expr(&binary.right)
            }
            Expr::Unary(unary) => self.walk_expr(&unary.operand),
        }
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        for scope in &self.scopes {
            let mut stack = Vec::new();
            explore(scope, scope.root, Vec::new(), &mut stack)?;
        }
        Ok(())
    }
}

fn explore(
    scope: &Scope,
    block: BlockId,
    mut labels: Vec<String>,
    stack: &mut Vec<(BlockId, usize)>,
) -> Result<(), AnalysisError> {
    let Some(elements) = scope.elements.get(&block) else {
        return Ok(());
    };
    for (index, element) in elements.iter().enumerate() {
        match element {
            ScopeElement::Goto(label) => {
                if labels.iter().any(|l| l == label) {
                    continue;
                }
                stack.push((block, index));
                let result = validate_goto(scope, stack, label);
                stack.pop();
                result?;
            }
            ScopeElement::Label(label) => labels.push(label.clone()),
            ScopeElement::Child(child) => {
                stack.push((block, index));
                let result = explore(scope, *child, labels.clone(), stack);
                stack.pop();
                result?;
            }
            ScopeElement::Local(_) => {}
        }
    }
    Ok(())
}

/// Forward search for `label` from the goto's position outward. A local
/// declared between the goto and the label, in the segment where the label
/// is found, makes the jump illegal.
fn validate_goto(
    scope: &Scope,
    stack: &[(BlockId, usize)],
    label: &str,
) -> Result<(), AnalysisError> {
    for (block, start) in stack.iter().rev() {
        let Some(elements) = scope.elements.get(block) else {
            continue;
        };
        let mut crossed = Vec::new();
        for element in &elements[*start..] {
            match element {
                ScopeElement::Local(name) => crossed.push(name.clone()),
                ScopeElement::Label(found) if found == label => {
                    if crossed.is_empty() {
                        return Ok(());
                    }
                    return Err(AnalysisError::CrossedLocal {
                        label: label.to_string(),
                        locals: crossed,
                    });
                }
                _ => {}
            }
        }
    }
    Err(AnalysisError::InvisibleLabel {
        label: label.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::parser::parse_chunk;

    fn analyze_source(source: &str) -> Result<Analysis, AnalysisError> {
        let chunk = parse_chunk(source).expect("parse");
        analyze(&chunk, source)
    }

    #[test]
    fn break_inside_loops_is_legal() {
        assert!(analyze_source("while true do break end").is_ok());
        assert!(analyze_source("repeat break until true").is_ok());
        assert!(analyze_source("for i = 1, 2 do break end").is_ok());
        assert!(analyze_source("for k in f do break end").is_ok());
        assert!(analyze_source("while true do if x then break end end").is_ok());
    }

    #[test]
    fn lonely_break_is_rejected_with_line() {
        match analyze_source("local x = 1\nbreak") {
            Err(AnalysisError::LonelyBreak { line }) => assert_eq!(line, 2),
            other => panic!("expected LonelyBreak, got {other:?}"),
        }
    }

    #[test]
    fn break_does_not_leak_into_nested_functions() {
        let source = "while true do local f = function() break end end";
        assert!(matches!(
            analyze_source(source),
            Err(AnalysisError::LonelyBreak { .. })
        ));
    }

    #[test]
    fn backward_goto_is_legal() {
        assert!(analyze_source("::top:: local x = 1 goto top").is_ok());
    }

    #[test]
    fn forward_goto_within_block_is_legal() {
        assert!(analyze_source("goto done print('skipped') ::done::").is_ok());
    }

    #[test]
    fn goto_out_of_nested_blocks_is_legal() {
        assert!(analyze_source("do do goto out end end ::out::").is_ok());
        assert!(
            analyze_source("for i = 1, 3 do for j = 1, 3 do goto done end end ::done::").is_ok()
        );
    }

    #[test]
    fn goto_crossing_a_local_is_rejected() {
        match analyze_source("goto skip local x = 1 ::skip::") {
            Err(AnalysisError::CrossedLocal { label, locals }) => {
                assert_eq!(label, "skip");
                assert_eq!(locals, vec!["x".to_string()]);
            }
            other => panic!("expected CrossedLocal, got {other:?}"),
        }
    }

    #[test]
    fn goto_past_inner_locals_to_outer_label_is_legal() {
        // The local is confined to the inner block; jumping over the rest of
        // that block is fine.
        assert!(analyze_source("do goto out local x = 1 end ::out::").is_ok());
    }

    #[test]
    fn invisible_label_is_rejected() {
        assert!(matches!(
            analyze_source("goto nowhere"),
            Err(AnalysisError::InvisibleLabel { .. })
        ));
    }

    #[test]
    fn labels_do_not_cross_function_boundaries() {
        assert!(matches!(
            analyze_source("::here:: local f = function() goto here end"),
            Err(AnalysisError::InvisibleLabel { .. })
        ));
    }

    #[test]
    fn goto_cannot_enter_a_block() {
        assert!(matches!(
            analyze_source("goto inner do ::inner:: end"),
            Err(AnalysisError::InvisibleLabel { .. })
        ));
    }

    #[test]
    fn duplicate_labels_in_one_block_are_rejected() {
        assert!(matches!(
            analyze_source("::l:: ::l::"),
            Err(AnalysisError::LabelAlreadyDefined { .. })
        ));
        // Same label name in different blocks is fine.
        assert!(analyze_source("::l:: do ::l:: end").is_ok());
    }

    #[test]
    fn label_blocks_are_recorded() {
        let chunk = parse_chunk("for i = 1, 2 do goto done end ::done::").expect("parse");
        let analysis = analyze(&chunk, "").expect("analyze");
        assert!(analysis.block_has_label(chunk.block.id, "done"));
    }

    #[test]
    fn function_parents_list_enclosing_blocks() {
        let source = "do local x = 1 local f = function() return x end end";
        let chunk = parse_chunk(source).expect("parse");
        let analysis = analyze(&chunk, source).expect("analyze");

        let Statement::Do(inner) = &chunk.block.statements[0] else {
            panic!("expected do block");
        };
        let Statement::Local(local) = &inner.statements[1] else {
            panic!("expected local");
        };
        let Expr::Function(body) = &local.exprs[0] else {
            panic!("expected function expression");
        };

        let parents = analysis.parents_of_function(body.block.id);
        assert_eq!(parents.to_vec(), vec![chunk.block.id, inner.id]);
    }

    #[test]
    fn local_function_sees_itself() {
        assert!(analyze_source("local function f() return f end").is_ok());
    }
}

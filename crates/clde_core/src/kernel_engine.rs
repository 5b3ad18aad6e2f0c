//! Kernel programs: a small polynomial expression language compiled to stack
//! bytecode and dispatched once per work item on the context's queue.
//!
//! Besides `+ - *`, unary minus and parentheses the language has two
//! intrinsics over (re, im) argument pairs:
//!
//! ```text
//! cre(a, b, c, d, ...) = Re((a + ib)(c + id)...)
//! cim(a, b, c, d, ...) = Im((a + ib)(c + id)...)
//! ```
//!
//! Each pair costs a constant number of ops, so complex products of any
//! degree compile to linear-size bytecode.

use crate::device::CommandQueue;
use crate::error::EngineError;
use crate::traits::Scalar;
use std::collections::{HashMap, HashSet};

/// OpCodes for the stack machine that runs kernel lanes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant.
    LoadConst(f64),
    /// Pushes the work item's variable at this index.
    LoadVar(usize),
    /// Pushes the work item's parameter at this index.
    LoadParam(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    Neg,
    /// Pops (d, c, b, a), pushes the pair (ac - bd, ad + bc).
    ComplexMul,
    /// Pops (im, re), pushes re.
    TakeRe,
    /// Pops (im, re), pushes im.
    TakeIm,
}

/// A compiled sequence of operations producing one value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    /// Deepest the stack gets while running this program.
    pub fn max_depth(&self) -> usize {
        let mut depth = 0usize;
        let mut max = 0usize;
        for op in &self.ops {
            match op {
                OpCode::LoadConst(_) | OpCode::LoadVar(_) | OpCode::LoadParam(_) => depth += 1,
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::TakeRe | OpCode::TakeIm => {
                    depth = depth.saturating_sub(1)
                }
                OpCode::ComplexMul => depth = depth.saturating_sub(2),
                OpCode::Neg => {}
            }
            max = max.max(depth);
        }
        max
    }
}

/// Stateless stack machine; `stack` is scratch owned by the caller so a
/// worker can reuse it across work items.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::from_f64(val).unwrap_or_else(T::nan)),
                OpCode::LoadVar(idx) => stack.push(vars[idx]),
                OpCode::LoadParam(idx) => stack.push(params[idx]),
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                OpCode::ComplexMul => {
                    let d = pop(stack);
                    let c = pop(stack);
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(a * c - b * d);
                    stack.push(a * d + b * c);
                }
                OpCode::TakeRe => {
                    pop(stack);
                }
                OpCode::TakeIm => {
                    let im = pop(stack);
                    pop(stack);
                    stack.push(im);
                }
            }
        }

        pop(stack)
    }
}

// Compiled bytecode is postfix and balanced, so operands are always present.
fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::zero)
}

fn binary<T: Scalar>(stack: &mut Vec<T>, op: impl Fn(T, T) -> T) {
    let b = pop(stack);
    let a = pop(stack);
    stack.push(op(a, b));
}

// --- AST & Parser ---

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // + - *
    Negate(Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Resolves identifiers to variable/parameter slots and emits bytecode.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let param_map = param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { var_map, param_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, String> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), String> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else {
                    return Err(format!("unknown identifier `{name}`"));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    _ => return Err(format!("unknown binary operator `{op}`")),
                });
            }
            Expr::Negate(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, args) => {
                let take = match func.as_str() {
                    "cre" => OpCode::TakeRe,
                    "cim" => OpCode::TakeIm,
                    _ => return Err(format!("unknown function `{func}`")),
                };
                if args.len() % 2 != 0 {
                    return Err(format!(
                        "`{func}` takes (re, im) pairs, got {} arguments",
                        args.len()
                    ));
                }
                ops.push(OpCode::LoadConst(1.0));
                ops.push(OpCode::LoadConst(0.0));
                for pair in args.chunks_exact(2) {
                    self.compile_recursive(&pair[0], ops)?;
                    self.compile_recursive(&pair[1], ops)?;
                    ops.push(OpCode::ComplexMul);
                }
                ops.push(take);
            }
        }
        Ok(())
    }
}

/// Parses one expression; the whole input must be consumed.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected trailing {token:?}")),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Comma,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(col, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    literal.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            // Optional exponent: e.g. 1e-7, 2.5E+3
            if let Some(&(_, e)) = chars.peek() {
                if e == 'e' || e == 'E' {
                    literal.push(e);
                    chars.next();
                    if let Some(&(_, sign)) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            literal.push(sign);
                            chars.next();
                        }
                    }
                    while let Some(&(_, d)) = chars.peek() {
                        if d.is_ascii_digit() {
                            literal.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            let value = literal
                .parse::<f64>()
                .map_err(|_| format!("malformed number `{literal}` at column {col}"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                ',' => Token::Comma,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => return Err(format!("unexpected character `{c}` at column {col}")),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Star) = self.peek() {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), '*', Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let operand = self.parse_unary()?;
            return Ok(Expr::Negate(Box::new(operand)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let args = self.parse_arguments()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_close()?;
                Ok(expr)
            }
            Some(token) => Err(format!("unexpected {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    // After the opening parenthesis; consumes the closing one.
    fn parse_arguments(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            match self.consume() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err("expected `,` or `)`".to_string()),
            }
        }
    }

    fn expect_close(&mut self) -> Result<(), String> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err("expected `)`".to_string()),
        }
    }
}

// --- Programs ---

/// Source of a kernel program: named per-work-item variables, named
/// parameters, and one expression per output lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub name: String,
    pub vars: Vec<String>,
    pub params: Vec<String>,
    pub outputs: Vec<String>,
}

impl KernelSource {
    pub fn new<V, P, O>(name: &str, vars: V, params: P, outputs: O) -> Self
    where
        V: IntoIterator,
        V::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            name: name.to_string(),
            vars: vars.into_iter().map(Into::into).collect(),
            params: params.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }
}

/// How a bound buffer feeds each work item.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a, T> {
    /// `width` consecutive values per work item.
    Rows { data: &'a [T], width: usize },
    /// The same values for every work item.
    Uniform(&'a [T]),
}

impl<'a, T> Binding<'a, T> {
    fn width(&self) -> usize {
        match self {
            Binding::Rows { width, .. } => *width,
            Binding::Uniform(data) => data.len(),
        }
    }

    fn row(&self, item: usize) -> &'a [T] {
        match *self {
            Binding::Rows { data, width } => &data[item * width..(item + 1) * width],
            Binding::Uniform(data) => data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Store,
    /// out += result
    Accumulate,
}

/// A compiled kernel program, owned by the context that built it.
#[derive(Debug)]
pub struct Program {
    source: KernelSource,
    lanes: Vec<Bytecode>,
    stack_depth: usize,
}

impl Program {
    pub fn build(source: &KernelSource) -> Result<Self, EngineError> {
        let fail = |diagnostic: String| EngineError::KernelBuild {
            program: source.name.clone(),
            diagnostic,
        };

        let mut seen = HashSet::new();
        for name in source.vars.iter().chain(&source.params) {
            if !seen.insert(name.as_str()) {
                return Err(fail(format!("`{name}` is declared twice")));
            }
        }

        let compiler = Compiler::new(&source.vars, &source.params);
        let mut lanes = Vec::with_capacity(source.outputs.len());
        for (lane, text) in source.outputs.iter().enumerate() {
            let code = parse(text)
                .and_then(|expr| compiler.compile(&expr))
                .map_err(|err| fail(format!("output {lane}: {err}")))?;
            lanes.push(code);
        }
        let stack_depth = lanes.iter().map(Bytecode::max_depth).max().unwrap_or(0);

        Ok(Self {
            source: source.clone(),
            lanes,
            stack_depth,
        })
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn var_count(&self) -> usize {
        self.source.vars.len()
    }

    pub fn param_count(&self) -> usize {
        self.source.params.len()
    }

    /// Runs every lane once per work item. Row `i` of `output` (width =
    /// `lanes()`) receives the results for work item `i`.
    pub fn dispatch<T: Scalar>(
        &self,
        queue: &CommandQueue,
        work_items: usize,
        vars: &[Binding<'_, T>],
        params: &[Binding<'_, T>],
        output: &mut [T],
        mode: WriteMode,
    ) -> Result<(), EngineError> {
        let lanes = self.lanes.len();
        let name = self.name();
        check_bindings(name, "variables", vars, self.var_count(), work_items)?;
        check_bindings(name, "parameters", params, self.param_count(), work_items)?;
        if output.len() != work_items * lanes {
            return Err(EngineError::size_mismatch(
                format!("output of kernel `{name}`"),
                work_items * lanes,
                output.len(),
            ));
        }
        if work_items == 0 || lanes == 0 {
            return Ok(());
        }

        let var_count = self.var_count();
        let param_count = self.param_count();
        queue.run_rows(
            name,
            output,
            lanes,
            || {
                (
                    Vec::with_capacity(self.stack_depth),
                    Vec::with_capacity(var_count),
                    Vec::with_capacity(param_count),
                )
            },
            |(stack, var_buf, param_buf): &mut (Vec<T>, Vec<T>, Vec<T>), item, row| {
                gather(vars, item, var_buf);
                gather(params, item, param_buf);
                for (slot, code) in row.iter_mut().zip(&self.lanes) {
                    let value = VM::execute(code, var_buf, param_buf, stack);
                    *slot = match mode {
                        WriteMode::Store => value,
                        WriteMode::Accumulate => *slot + value,
                    };
                }
            },
        );
        Ok(())
    }
}

fn check_bindings<T>(
    program: &str,
    role: &str,
    bindings: &[Binding<'_, T>],
    declared: usize,
    work_items: usize,
) -> Result<(), EngineError> {
    let bound: usize = bindings.iter().map(Binding::width).sum();
    if bound != declared {
        return Err(EngineError::size_mismatch(
            format!("{role} bound to kernel `{program}`"),
            declared,
            bound,
        ));
    }
    for binding in bindings {
        if let Binding::Rows { data, width } = binding {
            if data.len() != work_items * width {
                return Err(EngineError::size_mismatch(
                    format!("{role} buffer of kernel `{program}`"),
                    work_items * width,
                    data.len(),
                ));
            }
        }
    }
    Ok(())
}

fn gather<T: Copy>(bindings: &[Binding<'_, T>], item: usize, buf: &mut Vec<T>) {
    buf.clear();
    for binding in bindings {
        buf.extend_from_slice(binding.row(item));
    }
}

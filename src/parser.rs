//! Recursive-descent parser producing a typed AST and symbol tables.
//!
//! The parser mirrors the classic chibicc structure: a precedence ladder of
//! expression helpers below a thin statement layer, with type annotation
//! interleaved so pointer arithmetic can be classified the moment both
//! operands exist. Scoped name resolution lives in `ParserContext`; the
//! emitter receives flat per-function `locals` and program-wide `globals`
//! lists that are never rewound.

use crate::error::{CompileError, CompileResult};
use crate::tokenizer::{Token, TokenKind, describe_token, token_text};
use crate::ty::{Member, Type};

const MAX_CALL_ARGS: usize = 6;

/// Binary operators recognised by the language. `>` and `>=` do not appear:
/// relational parsing swaps their operands into `Lt`/`Le`. The three `Ptr*`
/// variants mark pointer arithmetic so the emitter can scale by the base
/// type's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  PtrAdd,
  PtrSub,
  PtrDiff,
  Mul,
  Div,
  Eq,
  Ne,
  Lt,
  Le,
}

/// Where a variable lives: the current function's frame or program data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarId {
  Local(usize),
  Global(usize),
}

/// A declared variable. Stack offsets for locals are the emitter's
/// business, not the parser's.
#[derive(Debug, Clone, PartialEq)]
pub struct Obj {
  pub name: String,
  pub ty: Type,
  pub is_local: bool,
  /// Literal bytes for string-literal globals, including the trailing NUL.
  pub contents: Option<Vec<u8>>,
}

/// A node of the AST. `tok` indexes the token that introduced the node so
/// diagnostics can point back into the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  pub kind: NodeKind,
  pub tok: usize,
  /// Filled in by `add_type`; present on every node of a parsed program.
  pub ty: Option<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
  Num {
    val: i64,
  },
  Var {
    var: VarId,
  },
  Binary {
    op: BinaryOp,
    lhs: Box<Node>,
    rhs: Box<Node>,
  },
  Assign {
    lhs: Box<Node>,
    rhs: Box<Node>,
  },
  Addr {
    operand: Box<Node>,
  },
  Deref {
    operand: Box<Node>,
  },
  Member {
    operand: Box<Node>,
    member: Member,
  },
  FunCall {
    name: String,
    args: Vec<Node>,
  },
  StmtExpr {
    body: Vec<Node>,
  },
  Return {
    operand: Box<Node>,
  },
  If {
    cond: Box<Node>,
    then: Box<Node>,
    els: Option<Box<Node>>,
  },
  While {
    cond: Box<Node>,
    body: Box<Node>,
  },
  For {
    init: Option<Box<Node>>,
    cond: Option<Box<Node>>,
    inc: Option<Box<Node>>,
    body: Box<Node>,
  },
  Block {
    body: Vec<Node>,
  },
  ExprStmt {
    expr: Box<Node>,
  },
  /// Declaration without an initializer; a no-op for the emitter.
  Null,
}

impl Node {
  fn new(kind: NodeKind, tok: usize) -> Self {
    Self {
      kind,
      tok,
      ty: None,
    }
  }

  fn num(val: i64, tok: usize) -> Self {
    Self::new(NodeKind::Num { val }, tok)
  }

  /// Variable references are stamped with their declared type right here,
  /// the only point where the binding is at hand.
  fn var_ref(var: VarId, ty: Type, tok: usize) -> Self {
    Self {
      kind: NodeKind::Var { var },
      tok,
      ty: Some(ty),
    }
  }

  fn binary(op: BinaryOp, lhs: Node, rhs: Node, tok: usize) -> Self {
    Self::new(
      NodeKind::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
      },
      tok,
    )
  }

  fn assign(lhs: Node, rhs: Node, tok: usize) -> Self {
    Self::new(
      NodeKind::Assign {
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
      },
      tok,
    )
  }

  fn addr(operand: Node, tok: usize) -> Self {
    Self::new(
      NodeKind::Addr {
        operand: Box::new(operand),
      },
      tok,
    )
  }

  fn deref(operand: Node, tok: usize) -> Self {
    Self::new(
      NodeKind::Deref {
        operand: Box::new(operand),
      },
      tok,
    )
  }

  fn member(operand: Node, member: Member, tok: usize) -> Self {
    let ty = member.ty.clone();
    Self {
      kind: NodeKind::Member {
        operand: Box::new(operand),
        member,
      },
      tok,
      ty: Some(ty),
    }
  }

  fn ret(operand: Node, tok: usize) -> Self {
    Self::new(
      NodeKind::Return {
        operand: Box::new(operand),
      },
      tok,
    )
  }

  fn expr_stmt(expr: Node, tok: usize) -> Self {
    Self::new(
      NodeKind::ExprStmt {
        expr: Box::new(expr),
      },
      tok,
    )
  }
}

#[derive(Debug, Clone)]
pub struct Function {
  pub name: String,
  /// Indices into `locals` for the declared parameters, in order.
  pub params: Vec<usize>,
  pub body: Vec<Node>,
  pub locals: Vec<Obj>,
}

#[derive(Debug, Clone)]
pub struct Program {
  pub globals: Vec<Obj>,
  pub functions: Vec<Function>,
}

/// Parse a whole translation unit.
// Parse procedure overview:
// - `parse` initialises the cursor and context, then alternates between
//   `parse_function` and `parse_global_var` using bounded lookahead.
// - Statements descend through `parse_stmt`, which annotates types on the
//   finished subtree; expressions climb the usual precedence ladder.
pub fn parse(tokens: &[Token], source: &str) -> CompileResult<Program> {
  let mut stream = TokenStream::new(tokens, source);
  let mut ctx = ParserContext::new();

  let mut functions = Vec::new();
  while !stream.is_eof() {
    if is_function(&mut stream)? {
      functions.push(parse_function(&mut stream, &mut ctx)?);
    } else {
      parse_global_var(&mut stream, &mut ctx)?;
    }
  }

  Ok(Program {
    globals: std::mem::take(&mut ctx.globals),
    functions,
  })
}

/// Decide whether the next top-level item is a function definition by
/// looking for `basetype ident "("`. The cursor is rewound afterwards and
/// the item reparsed; `parse_basetype` has no effect beyond cursor
/// movement, so the throwaway parse is harmless.
fn is_function(stream: &mut TokenStream) -> CompileResult<bool> {
  let saved = stream.pos;
  parse_basetype(stream)?;
  let is_func = stream.consume_ident().is_some() && stream.consume("(").is_some();
  stream.pos = saved;
  Ok(is_func)
}

// ----- Declarations and types -----

fn is_typename(stream: &TokenStream) -> bool {
  stream.peek_is("char") || stream.peek_is("int") || stream.peek_is("struct")
}

// basetype = ("char" | "int" | struct-decl) "*"*
fn parse_basetype(stream: &mut TokenStream) -> CompileResult<Type> {
  if !is_typename(stream) {
    return Err(stream.error_here("typename expected"));
  }

  let mut ty = if stream.consume("char").is_some() {
    Type::char_type()
  } else if stream.consume("int").is_some() {
    Type::int()
  } else {
    parse_struct_decl(stream)?
  };

  while stream.consume("*").is_some() {
    ty = Type::pointer_to(ty);
  }
  Ok(ty)
}

// struct-decl = "struct" "{" (basetype ident type-suffix ";")* "}"
fn parse_struct_decl(stream: &mut TokenStream) -> CompileResult<Type> {
  stream.skip("struct")?;
  stream.skip("{")?;

  let mut members = Vec::new();
  while stream.consume("}").is_none() {
    let base = parse_basetype(stream)?;
    let (name, _) = stream.get_ident()?;
    let ty = parse_type_suffix(stream, base)?;
    stream.skip(";")?;
    members.push((name, ty));
  }

  Ok(Type::struct_of(members))
}

// type-suffix = ("[" num "]")*
//
// Suffixes nest outside-in: `int x[2][3]` is an array of two arrays of
// three ints, hence the recursion before `array_of`.
fn parse_type_suffix(stream: &mut TokenStream, base: Type) -> CompileResult<Type> {
  if stream.consume("[").is_none() {
    return Ok(base);
  }
  let (len, _) = stream.get_number()?;
  stream.skip("]")?;
  let base = parse_type_suffix(stream, base)?;
  Ok(Type::array_of(base, len))
}

// function = basetype ident "(" params? ")" "{" stmt* "}"
fn parse_function(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Function> {
  ctx.begin_function();

  parse_basetype(stream)?;
  let (name, _) = stream.get_ident()?;
  stream.skip("(")?;

  let scope = ctx.enter_scope();
  let params = parse_func_params(stream, ctx)?;
  stream.skip("{")?;

  let mut body = Vec::new();
  while stream.consume("}").is_none() {
    body.push(parse_stmt(stream, ctx)?);
  }
  ctx.leave_scope(scope);

  Ok(Function {
    name,
    params,
    body,
    locals: ctx.take_locals(),
  })
}

// params = param ("," param)*
// param  = basetype ident type-suffix
fn parse_func_params(
  stream: &mut TokenStream,
  ctx: &mut ParserContext,
) -> CompileResult<Vec<usize>> {
  let mut params = Vec::new();
  if stream.consume(")").is_some() {
    return Ok(params);
  }

  loop {
    let loc = stream.current_loc();
    let base = parse_basetype(stream)?;
    let (name, _) = stream.get_ident()?;
    let ty = parse_type_suffix(stream, base)?;
    params.push(ctx.declare_local(&name, ty));
    if params.len() > MAX_CALL_ARGS {
      return Err(CompileError::at(
        stream.source,
        loc,
        format!("functions support at most {MAX_CALL_ARGS} parameters"),
      ));
    }
    if stream.consume(",").is_none() {
      break;
    }
  }
  stream.skip(")")?;
  Ok(params)
}

// global-var = basetype ident type-suffix ";"
fn parse_global_var(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<()> {
  let base = parse_basetype(stream)?;
  let (name, _) = stream.get_ident()?;
  let ty = parse_type_suffix(stream, base)?;
  stream.skip(";")?;
  ctx.declare_global(&name, ty);
  Ok(())
}

// declaration = basetype ident type-suffix ("=" expr)? ";"
fn parse_declaration(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let tok = stream.pos;
  let base = parse_basetype(stream)?;
  let (name, _) = stream.get_ident()?;
  let ty = parse_type_suffix(stream, base)?;
  let is_array = ty.is_array();
  let var_ty = ty.clone();
  let index = ctx.declare_local(&name, ty);

  if stream.consume(";").is_some() {
    return Ok(Node::new(NodeKind::Null, tok));
  }

  let assign_loc = stream.current_loc();
  stream.skip("=")?;
  if is_array {
    return Err(CompileError::at(
      stream.source,
      assign_loc,
      "array initialisers are not supported",
    ));
  }

  let lhs = Node::var_ref(VarId::Local(index), var_ty, tok);
  let rhs = parse_expr(stream, ctx)?;
  stream.skip(";")?;
  let assign = Node::assign(lhs, rhs, tok);
  Ok(Node::expr_stmt(assign, tok))
}

// ----- Statement parsing -----

/// Parse one statement and annotate types on the finished subtree.
fn parse_stmt(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let mut node = parse_stmt_inner(stream, ctx)?;
  add_type(&mut node, stream)?;
  Ok(node)
}

// stmt = "return" expr ";"
//      | "if" "(" expr ")" stmt ("else" stmt)?
//      | "while" "(" expr ")" stmt
//      | "for" "(" expr-stmt? ";" expr? ";" expr-stmt? ")" stmt
//      | "{" stmt* "}"
//      | declaration
//      | expr ";"
fn parse_stmt_inner(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  if let Some(tok) = stream.consume("return") {
    let operand = parse_expr(stream, ctx)?;
    stream.skip(";")?;
    return Ok(Node::ret(operand, tok));
  }

  if let Some(tok) = stream.consume("if") {
    stream.skip("(")?;
    let cond = parse_expr(stream, ctx)?;
    stream.skip(")")?;
    let then = parse_stmt(stream, ctx)?;
    let els = if stream.consume("else").is_some() {
      Some(Box::new(parse_stmt(stream, ctx)?))
    } else {
      None
    };
    return Ok(Node::new(
      NodeKind::If {
        cond: Box::new(cond),
        then: Box::new(then),
        els,
      },
      tok,
    ));
  }

  if let Some(tok) = stream.consume("while") {
    stream.skip("(")?;
    let cond = parse_expr(stream, ctx)?;
    stream.skip(")")?;
    let body = parse_stmt(stream, ctx)?;
    return Ok(Node::new(
      NodeKind::While {
        cond: Box::new(cond),
        body: Box::new(body),
      },
      tok,
    ));
  }

  if let Some(tok) = stream.consume("for") {
    stream.skip("(")?;

    let init = if stream.consume(";").is_none() {
      let stmt = parse_expr_stmt(stream, ctx)?;
      stream.skip(";")?;
      Some(Box::new(stmt))
    } else {
      None
    };
    let cond = if stream.consume(";").is_none() {
      let expr = parse_expr(stream, ctx)?;
      stream.skip(";")?;
      Some(Box::new(expr))
    } else {
      None
    };
    let inc = if stream.consume(")").is_none() {
      let stmt = parse_expr_stmt(stream, ctx)?;
      stream.skip(")")?;
      Some(Box::new(stmt))
    } else {
      None
    };
    let body = parse_stmt(stream, ctx)?;
    return Ok(Node::new(
      NodeKind::For {
        init,
        cond,
        inc,
        body: Box::new(body),
      },
      tok,
    ));
  }

  if let Some(tok) = stream.consume("{") {
    let scope = ctx.enter_scope();
    let mut body = Vec::new();
    while stream.consume("}").is_none() {
      body.push(parse_stmt(stream, ctx)?);
    }
    ctx.leave_scope(scope);
    return Ok(Node::new(NodeKind::Block { body }, tok));
  }

  if is_typename(stream) {
    return parse_declaration(stream, ctx);
  }

  let node = parse_expr_stmt(stream, ctx)?;
  stream.skip(";")?;
  Ok(node)
}

/// Wrap an expression as a statement. The terminator is the caller's
/// business: `;` for plain statements, `)` for a for-loop increment.
fn parse_expr_stmt(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let tok = stream.pos;
  let expr = parse_expr(stream, ctx)?;
  Ok(Node::expr_stmt(expr, tok))
}

// ----- Expression parsing -----

// expr = assign
fn parse_expr(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  parse_assign(stream, ctx)
}

// assign = equality ("=" assign)?
fn parse_assign(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let node = parse_equality(stream, ctx)?;
  if let Some(tok) = stream.consume("=") {
    let rhs = parse_assign(stream, ctx)?;
    return Ok(Node::assign(node, rhs, tok));
  }
  Ok(node)
}

// equality = relational (("==" | "!=") relational)*
fn parse_equality(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let mut node = parse_relational(stream, ctx)?;

  loop {
    if let Some(tok) = stream.consume("==") {
      let rhs = parse_relational(stream, ctx)?;
      node = Node::binary(BinaryOp::Eq, node, rhs, tok);
    } else if let Some(tok) = stream.consume("!=") {
      let rhs = parse_relational(stream, ctx)?;
      node = Node::binary(BinaryOp::Ne, node, rhs, tok);
    } else {
      return Ok(node);
    }
  }
}

// relational = add (("<" | "<=" | ">" | ">=") add)*
//
// Only `Lt` and `Le` exist as node kinds; `>` and `>=` swap their operands
// so `a > b` builds the same tree as `b < a`.
fn parse_relational(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let mut node = parse_add(stream, ctx)?;

  loop {
    if let Some(tok) = stream.consume("<") {
      let rhs = parse_add(stream, ctx)?;
      node = Node::binary(BinaryOp::Lt, node, rhs, tok);
    } else if let Some(tok) = stream.consume("<=") {
      let rhs = parse_add(stream, ctx)?;
      node = Node::binary(BinaryOp::Le, node, rhs, tok);
    } else if let Some(tok) = stream.consume(">") {
      let lhs = parse_add(stream, ctx)?;
      node = Node::binary(BinaryOp::Lt, lhs, node, tok);
    } else if let Some(tok) = stream.consume(">=") {
      let lhs = parse_add(stream, ctx)?;
      node = Node::binary(BinaryOp::Le, lhs, node, tok);
    } else {
      return Ok(node);
    }
  }
}

// add = mul (("+" | "-") mul)*
fn parse_add(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let mut node = parse_mul(stream, ctx)?;

  loop {
    if let Some(tok) = stream.consume("+") {
      let rhs = parse_mul(stream, ctx)?;
      node = build_add(node, rhs, tok, stream)?;
    } else if let Some(tok) = stream.consume("-") {
      let rhs = parse_mul(stream, ctx)?;
      node = build_sub(node, rhs, tok, stream)?;
    } else {
      return Ok(node);
    }
  }
}

// mul = unary (("*" | "/") unary)*
fn parse_mul(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let mut node = parse_unary(stream, ctx)?;

  loop {
    if let Some(tok) = stream.consume("*") {
      let rhs = parse_unary(stream, ctx)?;
      node = Node::binary(BinaryOp::Mul, node, rhs, tok);
    } else if let Some(tok) = stream.consume("/") {
      let rhs = parse_unary(stream, ctx)?;
      node = Node::binary(BinaryOp::Div, node, rhs, tok);
    } else {
      return Ok(node);
    }
  }
}

// unary = ("+" | "-" | "*" | "&") unary | postfix
fn parse_unary(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  if stream.consume("+").is_some() {
    return parse_unary(stream, ctx);
  }

  if let Some(tok) = stream.consume("-") {
    // -x lowers to 0 - x.
    let operand = parse_unary(stream, ctx)?;
    return Ok(Node::binary(BinaryOp::Sub, Node::num(0, tok), operand, tok));
  }

  if let Some(tok) = stream.consume("&") {
    let operand = parse_unary(stream, ctx)?;
    return Ok(Node::addr(operand, tok));
  }

  if let Some(tok) = stream.consume("*") {
    let operand = parse_unary(stream, ctx)?;
    return Ok(Node::deref(operand, tok));
  }

  parse_postfix(stream, ctx)
}

// postfix = primary ("[" expr "]" | "." ident)*
fn parse_postfix(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  let mut node = parse_primary(stream, ctx)?;

  loop {
    if let Some(tok) = stream.consume("[") {
      // x[y] is short for *(x+y).
      let index = parse_expr(stream, ctx)?;
      stream.skip("]")?;
      let sum = build_add(node, index, tok, stream)?;
      node = Node::deref(sum, tok);
      continue;
    }

    if stream.consume(".").is_some() {
      node = parse_member_access(stream, node)?;
      continue;
    }

    return Ok(node);
  }
}

/// Resolve `lhs.name` against the members of `lhs`'s struct type. The node
/// keeps the resolved member so the emitter can read its offset.
fn parse_member_access(stream: &mut TokenStream, mut lhs: Node) -> CompileResult<Node> {
  add_type(&mut lhs, stream)?;

  let struct_ty = match lhs.ty.as_ref() {
    Some(ty) if ty.is_struct() => ty.clone(),
    _ => return Err(stream.error_at_tok(lhs.tok, "not a struct")),
  };

  let (name, tok) = stream.get_ident()?;
  let member = struct_ty
    .find_member(&name)
    .cloned()
    .ok_or_else(|| stream.error_at_tok(tok, "no such member"))?;
  Ok(Node::member(lhs, member, tok))
}

// stmt-expr = "(" "{" stmt stmt* "}" ")"
//
// A GNU C extension: the block evaluates to its last statement, which must
// be an expression statement. That statement's inner expression is spliced
// into the body in its place.
fn parse_stmt_expr(
  stream: &mut TokenStream,
  ctx: &mut ParserContext,
  tok: usize,
) -> CompileResult<Node> {
  let mut body = vec![parse_stmt(stream, ctx)?];
  while stream.consume("}").is_none() {
    body.push(parse_stmt(stream, ctx)?);
  }
  stream.skip(")")?;

  match body.pop() {
    Some(Node {
      kind: NodeKind::ExprStmt { expr },
      ..
    }) => body.push(*expr),
    Some(other) => {
      return Err(stream.error_at_tok(other.tok, "stmt expr returning void is not supported"));
    }
    None => {
      return Err(stream.error_at_tok(tok, "stmt expr returning void is not supported"));
    }
  }

  Ok(Node::new(NodeKind::StmtExpr { body }, tok))
}

// func-args = assign ("," assign)*
fn parse_func_args(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Vec<Node>> {
  let mut args = Vec::new();
  if stream.consume(")").is_some() {
    return Ok(args);
  }

  args.push(parse_assign(stream, ctx)?);
  while stream.consume(",").is_some() {
    args.push(parse_assign(stream, ctx)?);
  }
  stream.skip(")")?;
  Ok(args)
}

// primary = "(" "{" stmt stmt* "}" ")"
//         | "(" expr ")"
//         | "sizeof" unary
//         | ident ("(" func-args? ")")?
//         | str
//         | num
fn parse_primary(stream: &mut TokenStream, ctx: &mut ParserContext) -> CompileResult<Node> {
  if let Some(tok) = stream.consume("(") {
    if stream.consume("{").is_some() {
      return parse_stmt_expr(stream, ctx, tok);
    }
    let node = parse_expr(stream, ctx)?;
    stream.skip(")")?;
    return Ok(node);
  }

  if let Some(tok) = stream.consume("sizeof") {
    let mut operand = parse_unary(stream, ctx)?;
    add_type(&mut operand, stream)?;
    let size = operand.ty.as_ref().map(Type::size).unwrap_or(0);
    return Ok(Node::num(size, tok));
  }

  if let Some(tok) = stream.consume_ident() {
    let name = token_text(&stream.tokens[tok], stream.source).to_string();

    if stream.consume("(").is_some() {
      let args = parse_func_args(stream, ctx)?;
      if args.len() > MAX_CALL_ARGS {
        return Err(stream.error_at_tok(
          tok,
          format!("function calls support at most {MAX_CALL_ARGS} arguments"),
        ));
      }
      return Ok(Node::new(NodeKind::FunCall { name, args }, tok));
    }

    let var = ctx
      .lookup(&name)
      .ok_or_else(|| stream.error_at_tok(tok, "undefined variable"))?;
    let ty = ctx.var(var).ty.clone();
    return Ok(Node::var_ref(var, ty, tok));
  }

  if let Some(tok) = stream.consume_str() {
    let contents = stream.tokens[tok].contents.clone().unwrap_or_default();
    let index = ctx.declare_string(contents);
    let ty = ctx.globals[index].ty.clone();
    return Ok(Node::var_ref(VarId::Global(index), ty, tok));
  }

  match stream.peek().map(|token| token.kind) {
    Some(TokenKind::Num) => {
      let (value, tok) = stream.get_number()?;
      Ok(Node::num(value, tok))
    }
    _ => Err(stream.error_here("expected expression")),
  }
}

// ----- Typed-node construction -----

/// Classify `lhs + rhs` after typing both operands. Integer addition stays
/// `Add`; a pointer-like operand (anything with a base type, so arrays
/// decay here) turns the node into `PtrAdd` with the pointer on the left.
fn build_add(mut lhs: Node, mut rhs: Node, tok: usize, stream: &TokenStream) -> CompileResult<Node> {
  add_type(&mut lhs, stream)?;
  add_type(&mut rhs, stream)?;
  let lhs_ty = lhs.ty.clone().unwrap_or_else(Type::int);
  let rhs_ty = rhs.ty.clone().unwrap_or_else(Type::int);

  if lhs_ty.is_integer() && rhs_ty.is_integer() {
    Ok(Node::binary(BinaryOp::Add, lhs, rhs, tok))
  } else if lhs_ty.has_base() && rhs_ty.is_integer() {
    Ok(Node::binary(BinaryOp::PtrAdd, lhs, rhs, tok))
  } else if lhs_ty.is_integer() && rhs_ty.has_base() {
    Ok(Node::binary(BinaryOp::PtrAdd, rhs, lhs, tok))
  } else {
    Err(stream.error_at_tok(tok, "invalid operands"))
  }
}

/// Classify `lhs - rhs`: integer subtraction, pointer displacement, or the
/// difference of two pointers. Subtracting a pointer from an integer has no
/// meaning and is rejected.
fn build_sub(mut lhs: Node, mut rhs: Node, tok: usize, stream: &TokenStream) -> CompileResult<Node> {
  add_type(&mut lhs, stream)?;
  add_type(&mut rhs, stream)?;
  let lhs_ty = lhs.ty.clone().unwrap_or_else(Type::int);
  let rhs_ty = rhs.ty.clone().unwrap_or_else(Type::int);

  if lhs_ty.is_integer() && rhs_ty.is_integer() {
    Ok(Node::binary(BinaryOp::Sub, lhs, rhs, tok))
  } else if lhs_ty.has_base() && rhs_ty.is_integer() {
    Ok(Node::binary(BinaryOp::PtrSub, lhs, rhs, tok))
  } else if lhs_ty.has_base() && rhs_ty.has_base() {
    Ok(Node::binary(BinaryOp::PtrDiff, lhs, rhs, tok))
  } else {
    Err(stream.error_at_tok(tok, "invalid operands"))
  }
}

/// Annotate `node` and its children with types. Idempotent: a node that
/// already carries a type is left untouched, as is its subtree.
fn add_type(node: &mut Node, stream: &TokenStream) -> CompileResult<()> {
  if node.ty.is_some() {
    return Ok(());
  }

  let tok = node.tok;
  let ty = match &mut node.kind {
    NodeKind::Num { .. } | NodeKind::Null => Type::int(),
    // Variable references are typed at construction; the guard above keeps
    // this arm from being reached.
    NodeKind::Var { .. } => return Ok(()),
    NodeKind::Member { operand, member } => {
      add_type(operand, stream)?;
      member.ty.clone()
    }
    NodeKind::Binary { op, lhs, rhs } => {
      add_type(lhs, stream)?;
      add_type(rhs, stream)?;
      match op {
        BinaryOp::PtrAdd | BinaryOp::PtrSub => lhs.ty.clone().unwrap_or_else(Type::int),
        _ => Type::int(),
      }
    }
    NodeKind::Assign { lhs, rhs } => {
      add_type(lhs, stream)?;
      add_type(rhs, stream)?;
      lhs.ty.clone().unwrap_or_else(Type::int)
    }
    NodeKind::Addr { operand } => {
      add_type(operand, stream)?;
      let operand_ty = operand.ty.clone().unwrap_or_else(Type::int);
      if operand_ty.is_array() {
        Type::pointer_to(operand_ty.base().cloned().unwrap_or_else(Type::int))
      } else {
        Type::pointer_to(operand_ty)
      }
    }
    NodeKind::Deref { operand } => {
      add_type(operand, stream)?;
      match operand.ty.as_ref().and_then(Type::base) {
        Some(base) => base.clone(),
        None => return Err(stream.error_at_tok(tok, "invalid pointer dereference")),
      }
    }
    NodeKind::FunCall { args, .. } => {
      for arg in args {
        add_type(arg, stream)?;
      }
      Type::int()
    }
    NodeKind::StmtExpr { body } => {
      for stmt in body.iter_mut() {
        add_type(stmt, stream)?;
      }
      body
        .last()
        .and_then(|last| last.ty.clone())
        .unwrap_or_else(Type::int)
    }
    NodeKind::Return { operand } => {
      add_type(operand, stream)?;
      operand.ty.clone().unwrap_or_else(Type::int)
    }
    NodeKind::ExprStmt { expr } => {
      add_type(expr, stream)?;
      expr.ty.clone().unwrap_or_else(Type::int)
    }
    NodeKind::If { cond, then, els } => {
      add_type(cond, stream)?;
      add_type(then, stream)?;
      if let Some(els) = els {
        add_type(els, stream)?;
      }
      Type::int()
    }
    NodeKind::While { cond, body } => {
      add_type(cond, stream)?;
      add_type(body, stream)?;
      Type::int()
    }
    NodeKind::For {
      init,
      cond,
      inc,
      body,
    } => {
      for part in [init, cond, inc] {
        if let Some(part) = part {
          add_type(part, stream)?;
        }
      }
      add_type(body, stream)?;
      Type::int()
    }
    NodeKind::Block { body } => {
      for stmt in body {
        add_type(stmt, stream)?;
      }
      Type::int()
    }
  };

  node.ty = Some(ty);
  Ok(())
}

// ----- Symbol and scope management -----

/// Scoped name resolution plus the flat variable lists handed to the
/// emitter. The scope chain is a plain stack of bindings; entering a block
/// records the stack depth and leaving truncates back to it, so inner
/// declarations shadow outer ones and vanish on exit. `locals` and
/// `globals` are append-only and keep every declaration.
struct ParserContext {
  locals: Vec<Obj>,
  globals: Vec<Obj>,
  scope: Vec<(String, VarId)>,
  string_count: usize,
}

impl ParserContext {
  fn new() -> Self {
    Self {
      locals: Vec::new(),
      globals: Vec::new(),
      scope: Vec::new(),
      string_count: 0,
    }
  }

  fn begin_function(&mut self) {
    self.locals.clear();
  }

  fn enter_scope(&self) -> usize {
    self.scope.len()
  }

  fn leave_scope(&mut self, marker: usize) {
    self.scope.truncate(marker);
  }

  fn declare_local(&mut self, name: &str, ty: Type) -> usize {
    let index = self.locals.len();
    self.locals.push(Obj {
      name: name.to_string(),
      ty,
      is_local: true,
      contents: None,
    });
    self.scope.push((name.to_string(), VarId::Local(index)));
    index
  }

  fn declare_global(&mut self, name: &str, ty: Type) -> usize {
    let index = self.globals.len();
    self.globals.push(Obj {
      name: name.to_string(),
      ty,
      is_local: false,
      contents: None,
    });
    self.scope.push((name.to_string(), VarId::Global(index)));
    index
  }

  /// Promote a string literal to an anonymous global carrying its bytes.
  fn declare_string(&mut self, contents: Vec<u8>) -> usize {
    let label = format!(".L.data.{}", self.string_count);
    self.string_count += 1;
    let ty = Type::array_of(Type::char_type(), contents.len() as i64);
    let index = self.declare_global(&label, ty);
    self.globals[index].contents = Some(contents);
    index
  }

  /// Walk the scope chain from the innermost binding outward; the first
  /// match wins.
  fn lookup(&self, name: &str) -> Option<VarId> {
    self
      .scope
      .iter()
      .rev()
      .find(|(bound, _)| bound == name)
      .map(|(_, var)| *var)
  }

  fn var(&self, id: VarId) -> &Obj {
    match id {
      VarId::Local(index) => &self.locals[index],
      VarId::Global(index) => &self.globals[index],
    }
  }

  fn take_locals(&mut self) -> Vec<Obj> {
    std::mem::take(&mut self.locals)
  }
}

// ----- Token cursor -----

/// Lightweight cursor over the token slice.
struct TokenStream<'a> {
  tokens: &'a [Token],
  source: &'a str,
  pos: usize,
}

impl<'a> TokenStream<'a> {
  fn new(tokens: &'a [Token], source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn current_loc(&self) -> usize {
    self
      .tokens
      .get(self.pos)
      .map(|token| token.loc)
      .unwrap_or(self.source.len())
  }

  fn peek_is(&self, symbol: &str) -> bool {
    self
      .peek()
      .filter(|token| {
        matches!(token.kind, TokenKind::Punctuator | TokenKind::Keyword)
          && token_text(token, self.source) == symbol
      })
      .is_some()
  }

  /// Consume the current token if it is the given punctuator or keyword,
  /// returning its index for diagnostics.
  fn consume(&mut self, op: &str) -> Option<usize> {
    if self.peek_is(op) {
      let index = self.pos;
      self.pos += 1;
      return Some(index);
    }
    None
  }

  fn consume_ident(&mut self) -> Option<usize> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Ident
    {
      let index = self.pos;
      self.pos += 1;
      return Some(index);
    }
    None
  }

  fn consume_str(&mut self) -> Option<usize> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Str
    {
      let index = self.pos;
      self.pos += 1;
      return Some(index);
    }
    None
  }

  fn skip(&mut self, s: &str) -> CompileResult<()> {
    if self.consume(s).is_some() {
      Ok(())
    } else {
      let got = describe_token(self.peek(), self.source);
      Err(self.error_here(format!("expected \"{s}\", but got \"{got}\"")))
    }
  }

  /// Parse the current token as an integer literal.
  fn get_number(&mut self) -> CompileResult<(i64, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Num
    {
      let value = token.value.ok_or_else(|| {
        CompileError::at(
          self.source,
          token.loc,
          "internal error: numeric token missing value",
        )
      })?;
      let index = self.pos;
      self.pos += 1;
      return Ok((value, index));
    }

    let got = describe_token(self.peek(), self.source);
    Err(self.error_here(format!("expected a number, but got \"{got}\"")))
  }

  /// Parse the current token as an identifier.
  fn get_ident(&mut self) -> CompileResult<(String, usize)> {
    if let Some(index) = self.consume_ident() {
      let text = token_text(&self.tokens[index], self.source).to_string();
      return Ok((text, index));
    }

    let got = describe_token(self.peek(), self.source);
    Err(self.error_here(format!("expected an identifier, but got \"{got}\"")))
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek().map(|token| token.kind), Some(TokenKind::Eof))
  }

  fn error_here(&self, message: impl Into<String>) -> CompileError {
    CompileError::at(self.source, self.current_loc(), message)
  }

  fn error_at_tok(&self, index: usize, message: impl Into<String>) -> CompileError {
    let loc = self
      .tokens
      .get(index)
      .map(|token| token.loc)
      .unwrap_or(self.source.len());
    CompileError::at(self.source, loc, message)
  }
}

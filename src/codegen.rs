//! Code generation: lower the parsed AST into AT&T x86-64 assembly.
//!
//! The emitter uses a simple stack machine: every expression leaves a
//! single value on the stack and statements pop intermediate results as we
//! chain them. Locals live on the stack frame and are addressed relative
//! to `%rbp`; globals and promoted string literals live in `.data` and are
//! addressed `%rip`-relative.

use crate::error::{CompileError, CompileResult};
use crate::parser::{BinaryOp, Function, Node, NodeKind, Obj, Program, VarId};
use crate::tokenizer::Token;
use crate::ty::Type;

const ARG_REGS8: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];
const ARG_REGS1: [&str; 6] = ["%dil", "%sil", "%dl", "%cl", "%r8b", "%r9b"];

/// Emit assembly for a whole program.
pub fn generate(prog: &Program, tokens: &[Token], source: &str) -> CompileResult<String> {
  let mut r#gen = Codegen {
    source,
    tokens,
    globals: &prog.globals,
    offsets: Vec::new(),
    funcname: String::new(),
    label_seq: 0,
    asm: String::new(),
  };

  r#gen.emit_data();
  r#gen.directive(".text");
  for func in &prog.functions {
    r#gen.emit_function(func)?;
  }
  Ok(r#gen.asm)
}

struct Codegen<'a> {
  source: &'a str,
  tokens: &'a [Token],
  globals: &'a [Obj],
  /// Frame offsets for the current function's locals, index-aligned.
  offsets: Vec<i64>,
  funcname: String,
  label_seq: usize,
  asm: String,
}

impl<'a> Codegen<'a> {
  fn directive(&mut self, text: impl AsRef<str>) {
    self.asm.push_str(text.as_ref());
    self.asm.push('\n');
  }

  fn label(&mut self, name: impl AsRef<str>) {
    self.asm.push_str(name.as_ref());
    self.asm.push_str(":\n");
  }

  fn op(&mut self, instruction: impl AsRef<str>) {
    self.asm.push_str("    ");
    self.asm.push_str(instruction.as_ref());
    self.asm.push('\n');
  }

  fn next_label(&mut self) -> usize {
    self.label_seq += 1;
    self.label_seq
  }

  fn error_at(&self, node: &Node, message: impl Into<String>) -> CompileError {
    let loc = self
      .tokens
      .get(node.tok)
      .map(|token| token.loc)
      .unwrap_or(self.source.len());
    CompileError::at(self.source, loc, message)
  }

  fn emit_data(&mut self) {
    let globals = self.globals;
    self.directive(".data");
    for var in globals {
      self.label(&var.name);
      match &var.contents {
        Some(bytes) => {
          for byte in bytes {
            self.op(format!(".byte {byte}"));
          }
        }
        None => self.op(format!(".zero {}", var.ty.size())),
      }
    }
  }

  fn emit_function(&mut self, func: &Function) -> CompileResult<()> {
    // Frame layout: the newest local sits closest to the frame pointer.
    let mut offsets = vec![0; func.locals.len()];
    let mut offset = 0;
    for (index, var) in func.locals.iter().enumerate().rev() {
      offset += var.ty.size();
      offsets[index] = offset;
    }
    let stack_size = align_to(offset, 16);
    self.offsets = offsets;
    self.funcname = func.name.clone();

    self.directive(format!(".global {}", func.name));
    self.label(&func.name);
    self.op("push %rbp");
    self.op("mov %rsp, %rbp");
    if stack_size > 0 {
      self.op(format!("sub ${stack_size}, %rsp"));
    }

    // Spill parameters from the argument registers into their slots.
    for (i, &param) in func.params.iter().enumerate() {
      let offset = self.offsets[param];
      if func.locals[param].ty.size() == 1 {
        self.op(format!("mov {}, -{offset}(%rbp)", ARG_REGS1[i]));
      } else {
        self.op(format!("mov {}, -{offset}(%rbp)", ARG_REGS8[i]));
      }
    }

    for stmt in &func.body {
      self.gen_stmt(stmt)?;
    }

    self.label(format!(".L.return.{}", func.name));
    self.op("mov %rbp, %rsp");
    self.op("pop %rbp");
    self.op("ret");
    Ok(())
  }

  /// Emit a statement, leaving the stack balanced.
  fn gen_stmt(&mut self, node: &Node) -> CompileResult<()> {
    match &node.kind {
      NodeKind::ExprStmt { expr } => {
        self.gen_expr(expr)?;
        self.op("add $8, %rsp");
      }
      NodeKind::Return { operand } => {
        self.gen_expr(operand)?;
        self.op("pop %rax");
        self.op(format!("jmp .L.return.{}", self.funcname));
      }
      NodeKind::If { cond, then, els } => {
        let seq = self.next_label();
        self.gen_expr(cond)?;
        self.op("pop %rax");
        self.op("cmp $0, %rax");
        match els {
          Some(els) => {
            self.op(format!("je .L.else.{seq}"));
            self.gen_stmt(then)?;
            self.op(format!("jmp .L.end.{seq}"));
            self.label(format!(".L.else.{seq}"));
            self.gen_stmt(els)?;
          }
          None => {
            self.op(format!("je .L.end.{seq}"));
            self.gen_stmt(then)?;
          }
        }
        self.label(format!(".L.end.{seq}"));
      }
      NodeKind::While { cond, body } => {
        let seq = self.next_label();
        self.label(format!(".L.begin.{seq}"));
        self.gen_expr(cond)?;
        self.op("pop %rax");
        self.op("cmp $0, %rax");
        self.op(format!("je .L.end.{seq}"));
        self.gen_stmt(body)?;
        self.op(format!("jmp .L.begin.{seq}"));
        self.label(format!(".L.end.{seq}"));
      }
      NodeKind::For {
        init,
        cond,
        inc,
        body,
      } => {
        let seq = self.next_label();
        if let Some(init) = init {
          self.gen_stmt(init)?;
        }
        self.label(format!(".L.begin.{seq}"));
        if let Some(cond) = cond {
          self.gen_expr(cond)?;
          self.op("pop %rax");
          self.op("cmp $0, %rax");
          self.op(format!("je .L.end.{seq}"));
        }
        self.gen_stmt(body)?;
        if let Some(inc) = inc {
          self.gen_stmt(inc)?;
        }
        self.op(format!("jmp .L.begin.{seq}"));
        self.label(format!(".L.end.{seq}"));
      }
      NodeKind::Block { body } => {
        for stmt in body {
          self.gen_stmt(stmt)?;
        }
      }
      NodeKind::Null => {}
      _ => return Err(self.error_at(node, "expected a statement")),
    }
    Ok(())
  }

  /// Emit an expression, leaving its value on top of the stack.
  fn gen_expr(&mut self, node: &Node) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Num { val } => {
        self.op(format!("mov ${val}, %rax"));
        self.op("push %rax");
      }
      NodeKind::Var { .. } | NodeKind::Member { .. } => {
        self.gen_addr(node)?;
        if !node_is_array(node) {
          self.load(node);
        }
      }
      NodeKind::Assign { lhs, rhs } => {
        self.gen_addr(lhs)?;
        self.gen_expr(rhs)?;
        self.store(node);
      }
      NodeKind::Addr { operand } => self.gen_addr(operand)?,
      NodeKind::Deref { operand } => {
        self.gen_expr(operand)?;
        if !node_is_array(node) {
          self.load(node);
        }
      }
      NodeKind::FunCall { name, args } => {
        for arg in args {
          self.gen_expr(arg)?;
        }
        for i in (0..args.len()).rev() {
          self.op(format!("pop {}", ARG_REGS8[i]));
        }

        // %rsp must be 16-byte aligned at the call instruction; the
        // check happens at runtime because the emitter does not track
        // stack depth.
        let seq = self.next_label();
        self.op("mov %rsp, %rax");
        self.op("and $15, %rax");
        self.op(format!("jnz .L.call.{seq}"));
        self.op("mov $0, %rax");
        self.op(format!("call {name}"));
        self.op(format!("jmp .L.end.{seq}"));
        self.label(format!(".L.call.{seq}"));
        self.op("sub $8, %rsp");
        self.op("mov $0, %rax");
        self.op(format!("call {name}"));
        self.op("add $8, %rsp");
        self.label(format!(".L.end.{seq}"));
        self.op("push %rax");
      }
      NodeKind::StmtExpr { body } => match body.split_last() {
        Some((last, stmts)) => {
          for stmt in stmts {
            self.gen_stmt(stmt)?;
          }
          self.gen_expr(last)?;
        }
        None => return Err(self.error_at(node, "empty statement expression")),
      },
      NodeKind::Binary { op, lhs, rhs } => {
        self.gen_expr(lhs)?;
        self.gen_expr(rhs)?;
        self.op("pop %rdi");
        self.op("pop %rax");
        match op {
          BinaryOp::Add => self.op("add %rdi, %rax"),
          BinaryOp::PtrAdd => {
            self.op(format!("imul ${}, %rdi", scale_of(node)));
            self.op("add %rdi, %rax");
          }
          BinaryOp::Sub => self.op("sub %rdi, %rax"),
          BinaryOp::PtrSub => {
            self.op(format!("imul ${}, %rdi", scale_of(node)));
            self.op("sub %rdi, %rax");
          }
          BinaryOp::PtrDiff => {
            self.op("sub %rdi, %rax");
            self.op("cqo");
            self.op(format!("mov ${}, %rdi", scale_of(lhs)));
            self.op("idiv %rdi");
          }
          BinaryOp::Mul => self.op("imul %rdi, %rax"),
          BinaryOp::Div => {
            self.op("cqo");
            self.op("idiv %rdi");
          }
          BinaryOp::Eq => {
            self.op("cmp %rdi, %rax");
            self.op("sete %al");
            self.op("movzbl %al, %eax");
          }
          BinaryOp::Ne => {
            self.op("cmp %rdi, %rax");
            self.op("setne %al");
            self.op("movzbl %al, %eax");
          }
          BinaryOp::Lt => {
            self.op("cmp %rdi, %rax");
            self.op("setl %al");
            self.op("movzbl %al, %eax");
          }
          BinaryOp::Le => {
            self.op("cmp %rdi, %rax");
            self.op("setle %al");
            self.op("movzbl %al, %eax");
          }
        }
        self.op("push %rax");
      }
      _ => return Err(self.error_at(node, "expected an expression")),
    }
    Ok(())
  }

  /// Push the address of an lvalue.
  fn gen_addr(&mut self, node: &Node) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Var { var } => {
        match *var {
          VarId::Local(index) => {
            let offset = self.offsets[index];
            self.op(format!("lea -{offset}(%rbp), %rax"));
          }
          VarId::Global(index) => {
            let globals = self.globals;
            self.op(format!("lea {}(%rip), %rax", globals[index].name));
          }
        }
        self.op("push %rax");
      }
      NodeKind::Deref { operand } => self.gen_expr(operand)?,
      NodeKind::Member { operand, member } => {
        self.gen_addr(operand)?;
        self.op("pop %rax");
        self.op(format!("add ${}, %rax", member.offset));
        self.op("push %rax");
      }
      _ => return Err(self.error_at(node, "not an lvalue")),
    }
    Ok(())
  }

  /// Replace the address on top of the stack with the value it points at,
  /// sized by the node's type.
  fn load(&mut self, node: &Node) {
    self.op("pop %rax");
    if node_size(node) == 1 {
      self.op("movsbq (%rax), %rax");
    } else {
      self.op("mov (%rax), %rax");
    }
    self.op("push %rax");
  }

  /// Store the value on top of the stack through the address below it.
  fn store(&mut self, node: &Node) {
    self.op("pop %rdi");
    self.op("pop %rax");
    if node_size(node) == 1 {
      self.op("mov %dil, (%rax)");
    } else {
      self.op("mov %rdi, (%rax)");
    }
    self.op("push %rdi");
  }
}

fn node_size(node: &Node) -> i64 {
  node.ty.as_ref().map(Type::size).unwrap_or(8)
}

fn node_is_array(node: &Node) -> bool {
  node.ty.as_ref().is_some_and(Type::is_array)
}

/// Byte size of the pointee for a pointer-typed node.
fn scale_of(node: &Node) -> i64 {
  node
    .ty
    .as_ref()
    .and_then(Type::base)
    .map(Type::size)
    .unwrap_or(8)
}

fn align_to(n: i64, align: i64) -> i64 {
  if align == 0 {
    return n;
  }
  ((n + align - 1) / align) * align
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser::parse;
  use crate::tokenizer::tokenize;

  fn compile(source: &str) -> String {
    let tokens = tokenize(source).unwrap();
    let prog = parse(&tokens, source).unwrap();
    generate(&prog, &tokens, source).unwrap()
  }

  fn compile_error(source: &str) -> String {
    let tokens = tokenize(source).unwrap();
    let prog = parse(&tokens, source).unwrap();
    generate(&prog, &tokens, source).unwrap_err().to_string()
  }

  #[test]
  fn emits_prologue_epilogue_and_return() {
    let asm = compile("int main() { return 42; }");
    assert!(asm.contains(".global main"));
    assert!(asm.contains("main:"));
    assert!(asm.contains("push %rbp"));
    assert!(asm.contains("mov $42, %rax"));
    assert!(asm.contains("jmp .L.return.main"));
    assert!(asm.contains(".L.return.main:"));
    assert!(asm.contains("ret"));
  }

  #[test]
  fn globals_reserve_zeroed_storage() {
    let asm = compile("int x; int main() { return x; }");
    assert!(asm.contains(".data"));
    assert!(asm.contains("x:\n    .zero 8"));
    assert!(asm.contains("lea x(%rip), %rax"));
  }

  #[test]
  fn string_literals_emit_their_bytes() {
    let asm = compile("int main() { char *s = \"hi\"; return 0; }");
    assert!(asm.contains(".L.data.0:"));
    assert!(asm.contains(".byte 104"));
    assert!(asm.contains(".byte 105"));
    assert!(asm.contains(".byte 0"));
  }

  #[test]
  fn char_access_uses_byte_sized_moves() {
    let asm = compile("int main() { char c; c = 1; return c; }");
    assert!(asm.contains("mov %dil, (%rax)"));
    assert!(asm.contains("movsbq (%rax), %rax"));
  }

  #[test]
  fn char_parameters_spill_byte_registers() {
    let asm = compile("int f(char c) { return c; }");
    assert!(asm.contains("mov %dil, -"));
  }

  #[test]
  fn pointer_arithmetic_scales_by_element_size() {
    let asm = compile("int main() { int a[2]; return *(a+1); }");
    assert!(asm.contains("imul $8, %rdi"));

    let asm = compile("int main() { char a[4]; return *(a+1); }");
    assert!(asm.contains("imul $1, %rdi"));
  }

  #[test]
  fn pointer_difference_divides_by_element_size() {
    let asm = compile("int main() { int a[4]; return (a+3) - a; }");
    assert!(asm.contains("sub %rdi, %rax"));
    assert!(asm.contains("mov $8, %rdi"));
    assert!(asm.contains("idiv %rdi"));
  }

  #[test]
  fn member_access_adds_the_offset() {
    let asm = compile("int main() { struct { int x; char y; } s; s.y = 7; return s.y; }");
    assert!(asm.contains("add $8, %rax"));
  }

  #[test]
  fn calls_align_the_stack_and_fill_argument_registers() {
    let asm = compile("int main() { return foo(1, 2); }");
    assert!(asm.contains("pop %rsi"));
    assert!(asm.contains("pop %rdi"));
    assert!(asm.contains("and $15, %rax"));
    assert!(asm.contains("call foo"));
  }

  #[test]
  fn control_flow_labels_are_numbered() {
    let asm = compile("int main() { if (1) return 2; else return 3; }");
    assert!(asm.contains(".L.else.1:"));
    assert!(asm.contains(".L.end.1:"));

    let asm = compile("int main() { while (0) {} return 0; }");
    assert!(asm.contains(".L.begin.1:"));
    assert!(asm.contains("je .L.end.1"));
  }

  #[test]
  fn assigning_to_a_non_lvalue_is_rejected() {
    let err = compile_error("int main() { 1 = 2; return 0; }");
    assert!(err.contains("not an lvalue"));
  }
}

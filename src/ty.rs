//! The closed type universe of the language: `char`, `int`, pointers,
//! arrays and anonymous structs. Types are plain values built once and
//! cloned freely; there is no interning.

/// A named slot inside a struct, laid out at a fixed byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
  pub name: String,
  pub ty: Type,
  pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
  Char,
  Int,
  Ptr,
  Array { len: i64 },
  Struct { members: Vec<Member>, size: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
  pub kind: TypeKind,
  pub base: Option<Box<Type>>,
}

impl Type {
  pub fn int() -> Self {
    Self {
      kind: TypeKind::Int,
      base: None,
    }
  }

  pub fn char_type() -> Self {
    Self {
      kind: TypeKind::Char,
      base: None,
    }
  }

  pub fn pointer_to(base: Type) -> Self {
    Self {
      kind: TypeKind::Ptr,
      base: Some(Box::new(base)),
    }
  }

  pub fn array_of(base: Type, len: i64) -> Self {
    Self {
      kind: TypeKind::Array { len },
      base: Some(Box::new(base)),
    }
  }

  /// Build a struct type from its members in declaration order, assigning
  /// each a byte offset. Members are packed back to back: no inter-member
  /// padding, and the struct ends exactly at the last member's end.
  pub fn struct_of(members: Vec<(String, Type)>) -> Self {
    let mut laid_out = Vec::with_capacity(members.len());
    let mut offset = 0;
    for (name, ty) in members {
      let size = ty.size();
      laid_out.push(Member {
        name,
        ty,
        offset,
      });
      offset += size;
    }
    Self {
      kind: TypeKind::Struct {
        members: laid_out,
        size: offset,
      },
      base: None,
    }
  }

  pub fn is_integer(&self) -> bool {
    matches!(self.kind, TypeKind::Char | TypeKind::Int)
  }

  pub fn is_array(&self) -> bool {
    matches!(self.kind, TypeKind::Array { .. })
  }

  pub fn is_struct(&self) -> bool {
    matches!(self.kind, TypeKind::Struct { .. })
  }

  /// True for pointers and arrays, the operand classes that participate
  /// in pointer arithmetic.
  pub fn has_base(&self) -> bool {
    self.base.is_some()
  }

  pub fn base(&self) -> Option<&Type> {
    self.base.as_deref()
  }

  pub fn size(&self) -> i64 {
    match &self.kind {
      TypeKind::Char => 1,
      TypeKind::Int => 8,
      TypeKind::Ptr => 8,
      TypeKind::Array { len } => {
        let base = self.base.as_deref().map(Type::size).unwrap_or(0);
        base * len
      }
      TypeKind::Struct { size, .. } => *size,
    }
  }

  pub fn members(&self) -> Option<&[Member]> {
    match &self.kind {
      TypeKind::Struct { members, .. } => Some(members),
      _ => None,
    }
  }

  pub fn find_member(&self, name: &str) -> Option<&Member> {
    self
      .members()?
      .iter()
      .find(|member| member.name == name)
  }
}

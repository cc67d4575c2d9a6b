//! The type lattice: base, pointer, const, typedef, array, struct and
//! union types synthesised from DWARF.

use crate::dwarf::loclist::Operator;
use crate::source::TypeId;

/// Where a composite member lives relative to the start of the composite.
#[derive(Clone, Debug)]
pub enum MemberLocation {
    /// Constant byte offset, the common case.
    Offset(u64),

    /// The sole operator of a `DW_AT_data_member_location` expression.
    Expr(Operator),
}

/// A member of a struct or union.
#[derive(Clone, Debug)]
pub struct TypeMember {
    pub name: String,
    pub typ: TypeId,
    pub offset: MemberLocation,
}

/// A type in the coprocessor program. At most one of `pointer_to`,
/// `element_type` and `members` is populated.
#[derive(Clone, Debug)]
pub struct SourceType {
    pub name: String,

    /// Size in bytes of a value of this type.
    pub size: u64,

    pub constant: bool,

    /// Pointed-to type for pointer types.
    pub pointer_to: Option<TypeId>,

    /// Element type for array types.
    pub element_type: Option<TypeId>,
    pub element_count: u64,

    /// Members for composite types.
    pub members: Vec<TypeMember>,
}

impl SourceType {
    pub fn base(name: impl Into<String>, size: u64) -> SourceType {
        SourceType {
            name: name.into(),
            size,
            constant: false,
            pointer_to: None,
            element_type: None,
            element_count: 0,
            members: vec![],
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer_to.is_some()
    }

    pub fn is_array(&self) -> bool {
        self.element_type.is_some()
    }

    pub fn is_composite(&self) -> bool {
        !self.members.is_empty()
    }
}

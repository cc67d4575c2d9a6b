//! Variables: globals, lexically scoped locals and their derived children.

use crate::coproc::{Cart, CoProc};
use crate::dwarf::loclist::{Location, LocationCell, Loclist};
use crate::source::function::SourceRange;
use crate::source::types::{MemberLocation, SourceType};
use crate::source::{LineId, TypeId};
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Limit on recursion when materialising derived children. Pointer chains
/// in the debuggee can be circular.
const MAX_CHILD_DEPTH: usize = 8;

/// A variable in the coprocessor program.
pub struct SourceVariable {
    pub name: String,
    pub typ: TypeId,
    pub decl_line: Option<LineId>,

    /// How to locate the variable. `None` when the DWARF carries no
    /// location attribute.
    pub loclist: Option<Arc<Loclist>>,

    /// Most recently resolved location. Written on the emulator thread,
    /// read anywhere.
    pub cell: Arc<LocationCell>,

    /// Set on the first resolution failure. Subsequent reads return the
    /// sentinel zero location without retrying.
    unresolvable: Arc<AtomicBool>,

    /// Derived variables: array elements, composite members, pointer
    /// dereference.
    pub children: Vec<SourceVariable>,
}

impl SourceVariable {
    pub fn new(name: impl Into<String>, typ: TypeId, loclist: Option<Loclist>) -> SourceVariable {
        SourceVariable {
            name: name.into(),
            typ,
            decl_line: None,
            loclist: loclist.map(Arc::new),
            cell: Arc::new(LocationCell::default()),
            unresolvable: Arc::new(AtomicBool::new(false)),
            children: vec![],
        }
    }

    /// Most recently resolved location.
    pub fn cached(&self) -> Location {
        self.cell.get()
    }

    /// Address of the variable, as of the last resolution.
    pub fn address(&self) -> Option<u64> {
        let loc = self.cached();
        loc.address_ok.then_some(loc.address)
    }

    /// Value of the variable, as of the last resolution.
    pub fn value(&self) -> Option<u32> {
        let loc = self.cached();
        loc.value_ok.then_some(loc.value)
    }

    pub fn is_unresolvable(&self) -> bool {
        self.unresolvable.load(Ordering::Relaxed)
    }

    /// Resolve the loclist against live coprocessor state and publish the
    /// result. Emulator thread only.
    pub fn update(&self, coproc: &dyn CoProc) {
        let Some(loclist) = &self.loclist else {
            return;
        };
        resolve_into(loclist, coproc, &self.cell, &self.unresolvable, &self.name);
    }

    /// As [`SourceVariable::update`] but recursing into derived children.
    /// Children resolve after the parent because their loclists read the
    /// parent's published location.
    pub fn update_recursive(&self, coproc: &dyn CoProc) {
        self.update(coproc);
        for child in &self.children {
            child.update_recursive(coproc);
        }
    }

    /// Request a resolution from the UI thread. The work is pushed onto
    /// the emulator thread; the result appears in the cell at the next
    /// yield boundary.
    pub fn post_update(&self, cart: &dyn Cart, coproc: Arc<dyn CoProc>) {
        let Some(loclist) = self.loclist.clone() else {
            return;
        };
        let cell = Arc::clone(&self.cell);
        let unresolvable = Arc::clone(&self.unresolvable);
        let name = self.name.clone();

        cart.push_function(Box::new(move || {
            resolve_into(&loclist, &*coproc, &cell, &unresolvable, &name);
        }));
    }
}

fn resolve_into(
    loclist: &Loclist,
    coproc: &dyn CoProc,
    cell: &LocationCell,
    unresolvable: &AtomicBool,
    name: &str,
) {
    if unresolvable.load(Ordering::Relaxed) {
        return;
    }

    match loclist.resolve(coproc) {
        Ok(res) => {
            if let Some(err) = res.error {
                if !unresolvable.swap(true, Ordering::Relaxed) {
                    warn!(target: "variables", "{name}: {err}");
                }
            }
            cell.set(res.location);
        }
        Err(err) => {
            if !unresolvable.swap(true, Ordering::Relaxed) {
                warn!(target: "variables", "{name}: {err}");
            }
            cell.set(Location::default());
        }
    }
}

/// A local variable with the ranges that govern its visibility. The
/// lexical ranges are where the name is in scope; the resolvable range is
/// where the location expression is meaningful.
pub struct SourceVariableLocal {
    pub var: SourceVariable,
    pub lexical: Vec<SourceRange>,
    pub resolvable: SourceRange,
}

impl SourceVariableLocal {
    pub fn in_scope(&self, pc: u32) -> bool {
        self.resolvable.contains(pc)
    }
}

/// Materialise derived children for a variable, recursively: array
/// elements, composite members and a pointer dereference child.
pub fn add_children(var: &mut SourceVariable, types: &[SourceType]) {
    add_children_depth(var, types, MAX_CHILD_DEPTH);
}

fn add_children_depth(var: &mut SourceVariable, types: &[SourceType], depth: usize) {
    if depth == 0 {
        return;
    }

    let Some(typ) = types.get(var.typ) else {
        return;
    };

    if let Some(elem) = typ.element_type {
        let elem_size = types.get(elem).map(|t| t.size).unwrap_or(0);
        for i in 0..typ.element_count {
            let mut child = SourceVariable::new(
                format!("{}[{i}]", var.name),
                elem,
                Some(Loclist::parent_offset(Arc::clone(&var.cell), i * elem_size)),
            );
            add_children_depth(&mut child, types, depth - 1);
            var.children.push(child);
        }
        return;
    }

    if typ.is_composite() {
        for member in &typ.members {
            let loclist = match &member.offset {
                MemberLocation::Offset(offset) => {
                    Loclist::parent_offset(Arc::clone(&var.cell), *offset)
                }
                MemberLocation::Expr(op) => {
                    let mut l = Loclist::parent_offset(Arc::clone(&var.cell), 0);
                    l.push(op.clone());
                    l
                }
            };
            let mut child = SourceVariable::new(
                format!("{}.{}", var.name, member.name),
                member.typ,
                Some(loclist),
            );
            add_children_depth(&mut child, types, depth - 1);
            var.children.push(child);
        }
        return;
    }

    if let Some(pointee) = typ.pointer_to {
        let mut child = SourceVariable::new(
            format!("*{}", var.name),
            pointee,
            Some(Loclist::parent_deref(Arc::clone(&var.cell))),
        );
        add_children_depth(&mut child, types, depth - 1);
        var.children.push(child);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dwarf::loclist::FrameBase;
    use std::collections::HashMap;

    struct MockCoProc {
        mem: HashMap<u32, u32>,
    }

    impl CoProc for MockCoProc {
        fn read_reg(&self, _n: u32) -> Option<u32> {
            None
        }

        fn read_u32(&self, addr: u32) -> Option<u32> {
            self.mem.get(&addr).copied()
        }
    }

    fn types() -> Vec<SourceType> {
        use crate::source::types::{MemberLocation, TypeMember};

        let mut types = vec![SourceType::base("int", 4)];
        types.push(SourceType {
            name: "int [2]".into(),
            size: 8,
            constant: false,
            pointer_to: None,
            element_type: Some(0),
            element_count: 2,
            members: vec![],
        });
        types.push(SourceType {
            name: "struct pair".into(),
            size: 8,
            constant: false,
            pointer_to: None,
            element_type: None,
            element_count: 0,
            members: vec![
                TypeMember {
                    name: "a".into(),
                    typ: 0,
                    offset: MemberLocation::Offset(0),
                },
                TypeMember {
                    name: "b".into(),
                    typ: 0,
                    offset: MemberLocation::Offset(4),
                },
            ],
        });
        types
    }

    #[test]
    fn array_children_follow_parent() {
        let types = types();
        let coproc = MockCoProc {
            mem: [(0x2000_0000, 11), (0x2000_0004, 22)].into_iter().collect(),
        };

        // global array at 0x20000000: addr opcode
        let loclist =
            Loclist::from_expr(&[0x03, 0x00, 0x00, 0x00, 0x20], FrameBase::None).unwrap();
        let mut var = SourceVariable::new("arr", 1, Some(loclist));
        add_children(&mut var, &types);
        assert_eq!(var.children.len(), 2);

        var.update_recursive(&coproc);
        assert_eq!(var.children[0].value(), Some(11));
        assert_eq!(var.children[1].value(), Some(22));
        assert_eq!(var.children[1].address(), Some(0x2000_0004));
    }

    #[test]
    fn member_children() {
        let types = types();
        let coproc = MockCoProc {
            mem: [(0x2000_0010, 5), (0x2000_0014, 6)].into_iter().collect(),
        };

        let loclist =
            Loclist::from_expr(&[0x03, 0x10, 0x00, 0x00, 0x20], FrameBase::None).unwrap();
        let mut var = SourceVariable::new("p", 2, Some(loclist));
        add_children(&mut var, &types);
        assert_eq!(var.children.len(), 2);
        assert_eq!(var.children[1].name, "p.b");

        var.update_recursive(&coproc);
        assert_eq!(var.children[0].value(), Some(5));
        assert_eq!(var.children[1].value(), Some(6));
    }

    struct MockCart;

    impl crate::coproc::Cart for MockCart {
        fn elf_section(&self, _name: &str) -> Option<u32> {
            None
        }

        // the emulator thread is idle in tests: run pushed work inline
        fn push_function(&self, f: Box<dyn FnOnce() + Send>) {
            f()
        }
    }

    // a global fetched from the UI side: the read is posted to the
    // emulator thread and the result appears in the cell
    #[test]
    fn global_address_and_posted_value() {
        let coproc = std::sync::Arc::new(MockCoProc {
            mem: [(0x2000_0140, 77)].into_iter().collect(),
        });

        // addr 0x20000140
        let loclist =
            Loclist::from_expr(&[0x03, 0x40, 0x01, 0x00, 0x20], FrameBase::None).unwrap();
        let var = SourceVariable::new("counter", 0, Some(loclist));
        assert_eq!(var.value(), None);

        var.post_update(&MockCart, coproc);
        assert_eq!(var.address(), Some(0x2000_0140));
        assert_eq!(var.value(), Some(77));
    }

    #[test]
    fn unresolvable_latches() {
        let coproc = MockCoProc {
            mem: HashMap::new(),
        };
        let loclist =
            Loclist::from_expr(&[0x03, 0x00, 0x00, 0x00, 0x20], FrameBase::None).unwrap();
        let var = SourceVariable::new("x", 0, Some(loclist));

        var.update(&coproc);
        assert!(var.is_unresolvable());
        assert_eq!(var.value(), None);

        // a later successful read must not resurrect the variable
        var.update(&coproc);
        assert_eq!(var.value(), None);
    }
}

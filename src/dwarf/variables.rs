//! Variables: a lexically scoped walk over the DWARF tree.
//!
//! The walk keeps a stack of scopes. Compile units reset it; subprograms,
//! inlined subroutines and lexical blocks push their address ranges.
//! `DW_TAG_variable` and `DW_TAG_formal_parameter` entries materialise
//! against the innermost scope: file level means a global, anything
//! inside a function means a local bounded by the scope's ranges.

use crate::dwarf::frame::FrameSection;
use crate::dwarf::functions::{decl_line, resolve_name};
use crate::dwarf::loclist::{FrameBase, Loclist};
use crate::dwarf::{
    attr_die_ref, attr_location, die_ranges, Die, EndianArcSlice, LocationClass, TypeMap, UnitData,
};
use crate::dwarf::loclist::LoclistSection;
use crate::error::LoadError;
use crate::source::function::SourceRange;
use crate::source::variable::{add_children, SourceVariable, SourceVariableLocal};
use crate::source::Source;
use crate::coproc::CoProc;
use log::debug;
use std::sync::Arc;

struct Scope {
    depth: isize,
    ranges: Vec<SourceRange>,
    function: Option<usize>,
    in_function: bool,
}

pub(crate) fn build(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit_data: &UnitData,
    source: &mut Source,
    type_map: &TypeMap,
    loc: &LoclistSection,
    frame: Option<Arc<FrameSection>>,
    coproc: &dyn CoProc,
    origin: u32,
) -> Result<(), LoadError> {
    let unit = &unit_data.unit;

    let mut scopes: Vec<Scope> = vec![];
    let mut depth: isize = 0;

    let mut cursor = unit.entries();
    while let Some((delta, die)) = cursor.next_dfs()? {
        depth += delta;
        while scopes.last().map(|s| s.depth >= depth).unwrap_or(false) {
            scopes.pop();
        }

        match die.tag() {
            gimli::DW_TAG_compile_unit => {
                scopes.clear();
                scopes.push(Scope {
                    depth,
                    ranges: die_ranges(dwarf, unit, die, origin, false)?,
                    function: None,
                    in_function: false,
                });
            }

            gimli::DW_TAG_subprogram => {
                let function = resolve_name(dwarf, unit_data, die)
                    .and_then(|name| source.function_by_name(&name));
                scopes.push(Scope {
                    depth,
                    ranges: die_ranges(dwarf, unit, die, origin, false)?,
                    function,
                    in_function: true,
                });
            }

            gimli::DW_TAG_inlined_subroutine | gimli::DW_TAG_lexical_block => {
                let function = scopes.iter().rev().find_map(|s| s.function);
                scopes.push(Scope {
                    depth,
                    ranges: die_ranges(dwarf, unit, die, origin, false)?,
                    function,
                    in_function: true,
                });
            }

            gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                materialise(
                    dwarf, unit_data, die, source, type_map, loc, &frame, &scopes, coproc,
                )?;
            }

            _ => {}
        }
    }

    Ok(())
}

fn materialise(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit_data: &UnitData,
    die: &Die<'_, '_>,
    source: &mut Source,
    type_map: &TypeMap,
    loc: &LoclistSection,
    frame: &Option<Arc<FrameSection>>,
    scopes: &[Scope],
    coproc: &dyn CoProc,
) -> Result<(), LoadError> {
    let unit = &unit_data.unit;

    let Some(name) = resolve_name(dwarf, unit_data, die) else {
        return Ok(());
    };
    let Some(typ) = resolve_type_ref(unit, die).and_then(|o| type_map.get(&o).copied()) else {
        return Ok(());
    };

    // constants have no storage worth watching; pointers to constants do
    let t = &source.types[typ];
    if t.constant && !t.is_pointer() {
        return Ok(());
    }

    let Some(location) = attr_location(die, gimli::DW_AT_location) else {
        return Ok(());
    };

    let decl = decl_line(unit_data, die, source).or_else(|| {
        indirection_target(unit, die).and_then(|target| decl_line(unit_data, &target, source))
    });

    let in_function = scopes.iter().any(|s| s.in_function);
    let function = scopes.iter().rev().find_map(|s| s.function);
    let framebase = match function.and_then(|f| source.functions[f].framebase.clone()) {
        Some(loclist) => FrameBase::Loclist(loclist),
        None => match frame {
            Some(frame) => FrameBase::Cfa(Arc::clone(frame)),
            None => FrameBase::None,
        },
    };

    let lexical: Vec<SourceRange> = scopes
        .iter()
        .rev()
        .find(|s| !s.ranges.is_empty())
        .map(|s| s.ranges.clone())
        .unwrap_or_default();

    match location {
        LocationClass::Expr(expr) => {
            let loclist = match Loclist::from_expr(&expr, framebase) {
                Ok(loclist) => loclist,
                Err(err) => {
                    debug!(target: "variables", "{name}: {err}");
                    return Ok(());
                }
            };

            if !in_function {
                commit_global(source, name, typ, decl, loclist, coproc);
            } else {
                if lexical.is_empty() {
                    return Ok(());
                }
                let resolvable = span(&lexical);
                commit_local(source, name, typ, decl, loclist, lexical, resolvable);
            }
        }

        LocationClass::LoclistPtr(offset) => {
            let entries = match loc.loclists(offset, unit_data.low_pc, framebase) {
                Ok(entries) => entries,
                Err(err) => {
                    debug!(target: "variables", "{name}: {err}");
                    return Ok(());
                }
            };

            for entry in entries {
                let resolvable = SourceRange {
                    start: entry.start,
                    end: entry.end,
                    inline: false,
                };
                commit_local(
                    source,
                    name.clone(),
                    typ,
                    decl,
                    entry.loclist,
                    lexical.clone(),
                    resolvable,
                );
            }
        }
    }

    Ok(())
}

fn commit_global(
    source: &mut Source,
    name: String,
    typ: usize,
    decl: Option<usize>,
    loclist: Loclist,
    coproc: &dyn CoProc,
) {
    if source.globals.iter().any(|g| g.name == name) {
        return;
    }

    let mut var = SourceVariable::new(name, typ, Some(loclist));
    var.decl_line = decl;
    add_children(&mut var, &source.types);

    let id = source.globals.len();

    // a global's address is static: resolve it once
    if let Some(loclist) = &var.loclist {
        if let Ok(res) = loclist.resolve_raw(coproc) {
            if !res.location.value_ok {
                source
                    .globals_by_address
                    .insert(res.location.value as u64, id);
            }
        }
    }

    if let Some(decl) = decl {
        if let Some(file_id) = source.lines[decl].file {
            if let Some((_, file)) = source.files.get_index_mut(file_id) {
                file.has_globals = true;
            }
        }
    }

    source.globals.push(var);
}

fn commit_local(
    source: &mut Source,
    name: String,
    typ: usize,
    decl: Option<usize>,
    loclist: Loclist,
    lexical: Vec<SourceRange>,
    resolvable: SourceRange,
) {
    let mut var = SourceVariable::new(name, typ, Some(loclist));
    var.decl_line = decl;
    add_children(&mut var, &source.types);

    source.locals.push(SourceVariableLocal {
        var,
        lexical,
        resolvable,
    });
}

/// The smallest single range spanning a range set.
fn span(ranges: &[SourceRange]) -> SourceRange {
    SourceRange {
        start: ranges.iter().map(|r| r.start).min().unwrap_or(0),
        end: ranges.iter().map(|r| r.end).max().unwrap_or(0),
        inline: false,
    }
}

fn indirection_target<'abbrev, 'unit>(
    unit: &'unit gimli::Unit<EndianArcSlice>,
    die: &Die<'abbrev, 'unit>,
) -> Option<Die<'unit, 'unit>> {
    for at in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
        if let Some(offset) = attr_die_ref(unit, die, at) {
            if let Ok(target) = unit.entry(offset) {
                return Some(target);
            }
        }
    }
    None
}

fn resolve_type_ref(
    unit: &gimli::Unit<EndianArcSlice>,
    die: &Die<'_, '_>,
) -> Option<gimli::UnitOffset> {
    if let Some(offset) = attr_die_ref(unit, die, gimli::DW_AT_type) {
        return Some(offset);
    }
    let target = indirection_target(unit, die)?;
    attr_die_ref(unit, &target, gimli::DW_AT_type)
}

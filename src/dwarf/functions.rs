//! Extract subprograms and inlined subroutines.

use crate::dwarf::frame::FrameSection;
use crate::dwarf::loclist::{FrameBase, Loclist};
use crate::dwarf::{
    attr_die_ref, attr_location, attr_string, attr_udata, die_ranges, Die, EndianArcSlice,
    LocationClass, UnitData,
};
use crate::error::LoadError;
use crate::source::function::SourceFunction;
use crate::source::{FunctionId, LineId, Source};
use log::debug;
use std::sync::Arc;

pub(crate) fn build(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit_data: &UnitData,
    source: &mut Source,
    frame: Option<Arc<FrameSection>>,
    origin: u32,
) -> Result<(), LoadError> {
    let unit = &unit_data.unit;

    // frame base of the innermost non-inlined function seen so far.
    // inlined instances inherit it
    let mut current_framebase: Option<Arc<Loclist>> = None;

    let mut cursor = unit.entries();
    while let Some((_, die)) = cursor.next_dfs()? {
        match die.tag() {
            gimli::DW_TAG_subprogram => {
                let ranges = die_ranges(dwarf, unit, die, origin, false)?;
                if ranges.is_empty() {
                    continue;
                }

                let Some(name) = resolve_name(dwarf, unit_data, die) else {
                    continue;
                };

                let framebase = framebase_loclist(die, frame.clone());
                current_framebase = framebase.clone();

                let mut function = SourceFunction::new(name);
                function.ranges = ranges;
                function.framebase = framebase;
                function.decl_line = decl_line(unit_data, die, source);

                let id = source.add_function(function);
                backfill_decl(source, id);
            }

            gimli::DW_TAG_inlined_subroutine => {
                let ranges = die_ranges(dwarf, unit, die, origin, true)?;
                if ranges.is_empty() {
                    continue;
                }

                let Some(name) = resolve_name(dwarf, unit_data, die) else {
                    debug!(target: "dwarf-loader", "inlined subroutine without a resolvable name");
                    continue;
                };

                let mut function = SourceFunction::new(name);
                function.ranges = ranges;
                function.framebase = current_framebase.clone();

                let id = source.add_function(function);
                backfill_decl(source, id);
            }

            _ => {}
        }
    }

    Ok(())
}

/// Resolve a function's name, following `DW_AT_specification` and
/// `DW_AT_abstract_origin` indirection first.
pub(crate) fn resolve_name(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit_data: &UnitData,
    die: &Die<'_, '_>,
) -> Option<String> {
    let unit = &unit_data.unit;

    if let Some(name) = attr_string(dwarf, unit, die, gimli::DW_AT_name) {
        return Some(name);
    }

    for at in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
        if let Some(offset) = attr_die_ref(unit, die, at) {
            if let Ok(target) = unit.entry(offset) {
                if let Some(name) = resolve_name(dwarf, unit_data, &target) {
                    return Some(name);
                }
            }
        }
    }

    None
}

/// The function's frame base expression. Only the expression class is
/// supported; a frame base that is itself a location list does not occur
/// in the toolchains this overlay serves.
fn framebase_loclist(die: &Die<'_, '_>, frame: Option<Arc<FrameSection>>) -> Option<Arc<Loclist>> {
    let context = match frame {
        Some(frame) => FrameBase::Cfa(frame),
        None => FrameBase::None,
    };

    match attr_location(die, gimli::DW_AT_frame_base)? {
        LocationClass::Expr(expr) => match Loclist::from_expr(&expr, context) {
            Ok(loclist) => Some(Arc::new(loclist)),
            Err(err) => {
                debug!(target: "dwarf-loader", "frame base expression: {err}");
                None
            }
        },
        LocationClass::LoclistPtr(_) => {
            debug!(target: "dwarf-loader", "frame base as location list is not supported");
            None
        }
    }
}

/// Line of the function's declaration, from `DW_AT_decl_file` and
/// `DW_AT_decl_line`.
pub(crate) fn decl_line(
    unit_data: &UnitData,
    die: &Die<'_, '_>,
    source: &Source,
) -> Option<LineId> {
    let file_index = attr_udata(die, gimli::DW_AT_decl_file)? as usize;
    let line = attr_udata(die, gimli::DW_AT_decl_line)? as usize;

    let file_id = (*unit_data.file_ids.get(file_index)?)?;
    let (_, file) = source.files.get_index(file_id)?;
    file.lines.get(line.checked_sub(1)?).copied()
}

/// Point a freshly committed function's declaration line back at the
/// function.
fn backfill_decl(source: &mut Source, id: FunctionId) {
    if let Some(line) = source.functions[id].decl_line {
        if source.lines[line].function.is_none() {
            source.lines[line].function = Some(id);
        }
    }
}

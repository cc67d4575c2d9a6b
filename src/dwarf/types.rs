//! Synthesise the type lattice from DWARF DIEs.
//!
//! Arena slots are reserved for every type DIE up front so that forward
//! and circular references (a struct containing a pointer to itself)
//! resolve to stable ids. Base types fill first; everything else fills in
//! two passes because pointer names and array sizes depend on other
//! entries being complete.

use crate::dwarf::loclist::Operator;
use crate::dwarf::{attr_die_ref, attr_string, attr_udata, EndianArcSlice, TypeMap, UnitData};
use crate::error::LoadError;
use crate::source::types::{MemberLocation, SourceType, TypeMember};
use crate::source::Source;
use gimli::{AttributeValue, DwTag, Reader, UnitOffset};
use log::debug;

pub(crate) fn build(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit_data: &UnitData,
    source: &mut Source,
) -> Result<TypeMap, LoadError> {
    let unit = &unit_data.unit;
    let mut map = TypeMap::new();
    let mut work: Vec<(UnitOffset, DwTag)> = vec![];

    let mut cursor = unit.entries();
    while let Some((_, die)) = cursor.next_dfs()? {
        match die.tag() {
            gimli::DW_TAG_base_type
            | gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_const_type
            | gimli::DW_TAG_typedef
            | gimli::DW_TAG_structure_type
            | gimli::DW_TAG_union_type
            | gimli::DW_TAG_array_type => {
                let id = source.types.len();
                source.types.push(SourceType::base("", 0));
                map.insert(die.offset(), id);
                work.push((die.offset(), die.tag()));
            }
            _ => {}
        }
    }

    for &(offset, tag) in &work {
        if tag != gimli::DW_TAG_base_type {
            continue;
        }
        let die = unit.entry(offset)?;
        let id = map[&offset];
        source.types[id] = SourceType::base(
            attr_string(dwarf, unit, &die, gimli::DW_AT_name).unwrap_or_default(),
            attr_udata(&die, gimli::DW_AT_byte_size).unwrap_or(0),
        );
    }

    for _ in 0..2 {
        for &(offset, tag) in &work {
            if tag == gimli::DW_TAG_base_type {
                continue;
            }
            fill(dwarf, unit_data, offset, tag, &map, source)?;
        }
    }

    Ok(map)
}

fn fill(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit_data: &UnitData,
    offset: UnitOffset,
    tag: DwTag,
    map: &TypeMap,
    source: &mut Source,
) -> Result<(), LoadError> {
    let unit = &unit_data.unit;
    let die = unit.entry(offset)?;
    let id = map[&offset];

    let referenced = attr_die_ref(unit, &die, gimli::DW_AT_type).and_then(|o| map.get(&o).copied());

    match tag {
        gimli::DW_TAG_pointer_type => {
            let name = match referenced {
                Some(pointee) => format!("{} *", source.types[pointee].name),
                None => "void *".to_string(),
            };
            source.types[id] = SourceType {
                name,
                size: attr_udata(&die, gimli::DW_AT_byte_size).unwrap_or(4),
                constant: false,
                pointer_to: referenced,
                element_type: None,
                element_count: 0,
                members: vec![],
            };
        }

        gimli::DW_TAG_typedef => {
            let name = attr_string(dwarf, unit, &die, gimli::DW_AT_name).unwrap_or_default();
            match referenced {
                Some(target) => {
                    let mut copy = source.types[target].clone();
                    copy.name = name;
                    source.types[id] = copy;
                }
                None => {
                    debug!(target: "dwarf-loader", "typedef {name} of unmodelled type");
                    source.types[id].name = name;
                }
            }
        }

        gimli::DW_TAG_const_type => match referenced {
            Some(target) => {
                let mut copy = source.types[target].clone();
                copy.name = format!("const {}", copy.name);
                copy.constant = true;
                source.types[id] = copy;
            }
            None => source.types[id].constant = true,
        },

        gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type => {
            let prefix = if tag == gimli::DW_TAG_structure_type {
                "struct"
            } else {
                "union"
            };
            let name = match attr_string(dwarf, unit, &die, gimli::DW_AT_name) {
                Some(n) => format!("{prefix} {n}"),
                None => format!("{prefix} {:#x}", offset.0),
            };
            let size = attr_udata(&die, gimli::DW_AT_byte_size).unwrap_or(0);
            let members = members(dwarf, unit_data, offset, map)?;

            // composites with no members are of no use to the variable
            // model
            if members.is_empty() {
                debug!(target: "dwarf-loader", "discarding empty composite {name}");
                return Ok(());
            }

            source.types[id] = SourceType {
                name,
                size,
                constant: false,
                pointer_to: None,
                element_type: None,
                element_count: 0,
                members,
            };
        }

        gimli::DW_TAG_array_type => {
            let Some(element) = referenced else {
                return Ok(());
            };
            let Some(count) = subrange_count(unit_data, offset)? else {
                return Ok(());
            };

            let element_size = source.types[element].size;
            source.types[id] = SourceType {
                name: format!("{} [{count}]", source.types[element].name),
                size: element_size * count,
                constant: false,
                pointer_to: None,
                element_type: Some(element),
                element_count: count,
                members: vec![],
            };
        }

        _ => {}
    }

    Ok(())
}

fn members(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit_data: &UnitData,
    offset: UnitOffset,
    map: &TypeMap,
) -> Result<Vec<TypeMember>, LoadError> {
    let unit = &unit_data.unit;
    let mut members = vec![];

    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let mut children = root.children();

    while let Some(node) = children.next()? {
        let die = node.entry();
        if die.tag() != gimli::DW_TAG_member {
            continue;
        }

        let Some(name) = attr_string(dwarf, unit, die, gimli::DW_AT_name) else {
            continue;
        };
        let Some(typ) = attr_die_ref(unit, die, gimli::DW_AT_type).and_then(|o| map.get(&o).copied())
        else {
            debug!(target: "dwarf-loader", "member {name} of unmodelled type");
            continue;
        };

        let offset = match die.attr(gimli::DW_AT_data_member_location).ok().flatten() {
            None => MemberLocation::Offset(0),
            Some(attr) => match attr.value() {
                AttributeValue::Exprloc(expr) => {
                    let bytes = expr.0.to_slice().map_err(LoadError::Dwarf)?;
                    match Operator::decode(&bytes) {
                        Ok((op, _)) => MemberLocation::Expr(op),
                        Err(err) => {
                            debug!(target: "dwarf-loader", "member {name} location: {err}");
                            continue;
                        }
                    }
                }
                _ => MemberLocation::Offset(attr.value().udata_value().unwrap_or(0)),
            },
        };

        members.push(TypeMember { name, typ, offset });
    }

    Ok(members)
}

/// Element count of an array type: its subrange child's upper bound plus
/// one, or an explicit count.
fn subrange_count(unit_data: &UnitData, offset: UnitOffset) -> Result<Option<u64>, LoadError> {
    let unit = &unit_data.unit;
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let mut children = root.children();

    while let Some(node) = children.next()? {
        let die = node.entry();
        if die.tag() != gimli::DW_TAG_subrange_type {
            continue;
        }
        if let Some(upper) = attr_udata(die, gimli::DW_AT_upper_bound) {
            return Ok(Some(upper + 1));
        }
        if let Some(count) = attr_udata(die, gimli::DW_AT_count) {
            return Ok(Some(count));
        }
    }

    Ok(None)
}

//! The line program walk: binding addresses to source lines.
//!
//! The walk runs twice per compilation unit. The first pass binds lines
//! belonging to non-inlined functions, the second overlays inlined
//! instances; binding inlined callees only after their callers means an
//! outer function's binding is never clobbered prematurely.
//!
//! After the DWARF passes, symbol table functions without DWARF coverage
//! get stub functions and stub lines. Addresses outside any range at all
//! belong to the driver and bind lazily, at first observation.

use crate::dwarf::{LineEntry, SymbolFunction, UnitData};
use crate::error::LoadError;
use crate::source::function::{SourceFunction, SourceRange};
use crate::source::{FileId, Source};
use std::path::PathBuf;

/// The parts of a unit's line program the mapper consumes.
pub(crate) struct LineProgram<'a> {
    pub entries: &'a [LineEntry],
    pub file_ids: &'a [Option<FileId>],
    pub files: &'a [PathBuf],
}

impl<'a> From<&'a UnitData> for LineProgram<'a> {
    fn from(unit: &'a UnitData) -> Self {
        LineProgram {
            entries: &unit.line_entries,
            file_ids: &unit.file_ids,
            files: &unit.files,
        }
    }
}

pub(crate) fn map_lines(
    source: &mut Source,
    unit: &UnitData,
    origin: u32,
    inlined_pass: bool,
) -> Result<(), LoadError> {
    walk(source, LineProgram::from(unit), origin, inlined_pass)
}

fn walk(
    source: &mut Source,
    lp: LineProgram,
    origin: u32,
    inlined_pass: bool,
) -> Result<(), LoadError> {
    let mut sl: Option<usize> = None;
    let mut stmt = false;
    let mut start: u32 = origin;

    for le in lp.entries {
        let Some(&Some(file_id)) = lp.file_ids.get(le.file_index) else {
            continue;
        };

        let (_, file) = source.files.get_index(file_id).expect("file id from walk");
        if le.line as i64 - 1 >= file.num_lines() as i64 {
            return Err(LoadError::SourceMismatch {
                file: lp.files.get(le.file_index).cloned().unwrap_or_default(),
                line: le.line,
                max: file.num_lines(),
            });
        }

        let end = (le.address as u32).wrapping_add(origin);

        if let Some(line_id) = sl {
            if end > start {
                bind(source, line_id, stmt, start, end, inlined_pass)?;
            }
        }

        if le.end_sequence {
            sl = None;
            continue;
        }

        let (_, file) = source.files.get_index(file_id).expect("file id from walk");
        sl = le
            .line
            .checked_sub(1)
            .and_then(|n| file.lines.get(n as usize))
            .copied();
        stmt = le.is_stmt;
        start = end;
    }

    Ok(())
}

/// Bind one address range to a source line: choose the owning function by
/// smallest containing range, then attach every disassembled instruction
/// in the range.
fn bind(
    source: &mut Source,
    line_id: usize,
    stmt: bool,
    start: u32,
    end: u32,
    inlined_pass: bool,
) -> Result<(), LoadError> {
    let (function, range) = source
        .function_range_at(start)
        .ok_or(LoadError::NoFunctionForLine(start))?;

    if range.inline != inlined_pass {
        return Ok(());
    }

    source.lines[line_id].function = Some(function);
    if stmt {
        source.lines[line_id].breakable = true;
    }
    if !source.lines[line_id].break_addresses.contains(&start) {
        source.lines[line_id].break_addresses.push(start);
    }

    let mut addr = start;
    while addr < end {
        let is_32bit = match source.disasm.get_mut(&addr) {
            None => {
                addr += 2;
                continue;
            }
            Some(disasm) => {
                if !inlined_pass {
                    disasm.line = Some(line_id);
                }
                disasm.is_32bit
            }
        };

        if !inlined_pass && !source.lines[line_id].disassembly.contains(&addr) {
            source.lines[line_id].disassembly.push(addr);
        }
        source.lines_by_address.insert(addr, line_id);

        addr += if is_32bit { 4 } else { 2 };
    }

    if let Some(file_id) = source.lines[line_id].file {
        if let Some((_, file)) = source.files.get_index_mut(file_id) {
            file.has_executable_lines = true;
        }
    }

    Ok(())
}

/// Create stub functions and lines for symbol table functions the DWARF
/// does not cover. A stub overlapping any bound address is dropped.
pub(crate) fn insert_stubs(source: &mut Source, symbols: &[SymbolFunction]) {
    for sym in symbols {
        if source.function_by_name(&sym.name).is_some() {
            continue;
        }

        // thumb function symbols carry the mode bit
        let start = sym.addr & !1;
        let end = start + sym.size - 1;

        let overlaps = source
            .lines_by_address
            .keys()
            .any(|&a| a >= start && a <= end);
        if overlaps {
            continue;
        }

        let mut function = SourceFunction::stub(&sym.name);
        function.add_range(SourceRange {
            start,
            end,
            inline: false,
        });
        let function = source.add_function(function);

        let line = source.add_stub_line(sym.name.clone());
        source.lines[line].function = Some(function);

        let mut addr = start;
        while addr <= end {
            source.lines_by_address.insert(addr, line);
            let step = match source.disasm.get(&addr) {
                Some(d) if d.is_32bit => 4,
                _ => 2,
            };
            addr += step;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::file::{FileContent, SourceDisasm, SourceFile, SourceLine};

    fn add_file(source: &mut Source, path: &str, num_lines: usize) -> FileId {
        let file_id = source.files.len();
        let mut file = SourceFile {
            filename: path.into(),
            short_filename: path.into(),
            lines: vec![],
            max_line_width: 0,
            has_globals: false,
            has_executable_lines: false,
        };
        for i in 0..num_lines {
            let line_id = source.lines.len();
            source.lines.push(SourceLine::new(
                file_id,
                i + 1,
                &FileContent {
                    plain: format!("line {}", i + 1),
                    fragments: vec![],
                },
            ));
            file.lines.push(line_id);
        }
        source.files.insert(path.into(), file);
        file_id
    }

    fn add_disasm(source: &mut Source, addr: u32, is_32bit: bool) {
        source.disasm.insert(
            addr,
            SourceDisasm {
                addr,
                opcode: 0x46c0,
                is_32bit,
                mnemonic: "NOP".into(),
                line: None,
            },
        );
    }

    fn entry(address: u64, line: u64, is_stmt: bool, end_sequence: bool) -> LineEntry {
        LineEntry {
            address,
            file_index: 1,
            line,
            is_stmt,
            end_sequence,
        }
    }

    fn files() -> Vec<PathBuf> {
        vec![PathBuf::new(), PathBuf::from("main.c")]
    }

    // single function, single line: eight 2-byte no-ops all bind to line 1
    #[test]
    fn single_function_single_line() {
        let mut source = Source::new();
        let file = add_file(&mut source, "main.c", 2);
        for addr in (0x8000..0x8010).step_by(2) {
            add_disasm(&mut source, addr, false);
        }

        let mut main = SourceFunction::new("main");
        main.add_range(SourceRange {
            start: 0x8000,
            end: 0x800f,
            inline: false,
        });
        source.add_function(main);

        let entries = vec![
            entry(0x8000, 1, true, false),
            entry(0x8010, 1, false, true),
        ];
        let file_ids = vec![None, Some(file)];
        let file_paths = files();
        let lp = LineProgram {
            entries: &entries,
            file_ids: &file_ids,
            files: &file_paths,
        };
        walk(&mut source, lp, 0, false).unwrap();

        let line = source.files[file].lines[0];
        assert_eq!(source.lines[line].disassembly.len(), 8);
        assert!(source.lines[line].breakable);
        assert_eq!(source.lines[line].break_addresses.as_slice(), &[0x8000]);
        for addr in (0x8000..0x8010).step_by(2) {
            assert_eq!(source.lines_by_address[&addr], line);
        }
        let main = source.function_by_name("main").unwrap();
        assert_eq!(source.lines[line].function, Some(main));
    }

    // a 32bit instruction occupies two halfwords but binds once
    #[test]
    fn wide_instruction_binds_once() {
        let mut source = Source::new();
        let file = add_file(&mut source, "main.c", 1);
        add_disasm(&mut source, 0x8000, true);
        add_disasm(&mut source, 0x8004, false);

        let mut main = SourceFunction::new("main");
        main.add_range(SourceRange {
            start: 0x8000,
            end: 0x8005,
            inline: false,
        });
        source.add_function(main);

        let entries = vec![
            entry(0x8000, 1, true, false),
            entry(0x8006, 1, false, true),
        ];
        let file_ids = vec![None, Some(file)];
        let file_paths = files();
        let lp = LineProgram {
            entries: &entries,
            file_ids: &file_ids,
            files: &file_paths,
        };
        walk(&mut source, lp, 0, false).unwrap();

        let line = source.files[file].lines[0];
        assert_eq!(source.lines[line].disassembly, vec![0x8000, 0x8004]);
        assert!(!source.lines_by_address.contains_key(&0x8002));
    }

    // inlined instance: pass one binds the caller, pass two overlays the
    // callee on the inlined range
    #[test]
    fn inlined_instance() {
        let mut source = Source::new();
        let file = add_file(&mut source, "main.c", 4);
        for addr in (0x8000..0x8020).step_by(2) {
            add_disasm(&mut source, addr, false);
        }

        let mut caller = SourceFunction::new("caller");
        caller.add_range(SourceRange {
            start: 0x8000,
            end: 0x801f,
            inline: false,
        });
        source.add_function(caller);

        let mut callee = SourceFunction::new("callee");
        callee.add_range(SourceRange {
            start: 0x8008,
            end: 0x800f,
            inline: true,
        });
        source.add_function(callee);

        let entries = vec![
            entry(0x8000, 1, true, false),
            entry(0x8008, 3, true, false),
            entry(0x8010, 2, true, false),
            entry(0x8020, 2, false, true),
        ];
        let file_ids = vec![None, Some(file)];

        walk(
            &mut source,
            LineProgram {
                entries: &entries,
                file_ids: &file_ids,
                files: &files(),
            },
            0,
            false,
        )
        .unwrap();
        walk(
            &mut source,
            LineProgram {
                entries: &entries,
                file_ids: &file_ids,
                files: &files(),
            },
            0,
            true,
        )
        .unwrap();

        let caller = source.function_by_name("caller").unwrap();
        let callee = source.function_by_name("callee").unwrap();
        let line1 = source.files[file].lines[0];
        let line3 = source.files[file].lines[2];
        let line2 = source.files[file].lines[1];

        assert_eq!(source.lines[line1].function, Some(caller));
        assert_eq!(source.lines[line3].function, Some(callee));
        assert_eq!(source.lines[line2].function, Some(caller));

        for addr in (0x8000..0x8008).step_by(2) {
            assert_eq!(source.lines_by_address[&addr], line1);
        }
        for addr in (0x8008..0x8010).step_by(2) {
            assert_eq!(source.lines_by_address[&addr], line3);
        }
        for addr in (0x8010..0x8020).step_by(2) {
            assert_eq!(source.lines_by_address[&addr], line2);
        }
    }

    #[test]
    fn source_mismatch_is_fatal() {
        let mut source = Source::new();
        let file = add_file(&mut source, "main.c", 1);

        let mut main = SourceFunction::new("main");
        main.add_range(SourceRange {
            start: 0x8000,
            end: 0x800f,
            inline: false,
        });
        source.add_function(main);

        let entries = vec![entry(0x8000, 9, true, false)];
        let file_ids = vec![None, Some(file)];
        let res = walk(
            &mut source,
            LineProgram {
                entries: &entries,
                file_ids: &file_ids,
                files: &files(),
            },
            0,
            false,
        );
        assert!(matches!(res, Err(LoadError::SourceMismatch { .. })));
    }

    #[test]
    fn no_function_is_fatal() {
        let mut source = Source::new();
        let file = add_file(&mut source, "main.c", 2);
        add_disasm(&mut source, 0x8000, false);

        let entries = vec![
            entry(0x8000, 1, true, false),
            entry(0x8002, 1, false, true),
        ];
        let file_ids = vec![None, Some(file)];
        let res = walk(
            &mut source,
            LineProgram {
                entries: &entries,
                file_ids: &file_ids,
                files: &files(),
            },
            0,
            false,
        );
        assert!(matches!(res, Err(LoadError::NoFunctionForLine(0x8000))));
    }

    #[test]
    fn stub_insertion() {
        let mut source = Source::new();
        for addr in (0x9000..0x9008).step_by(2) {
            add_disasm(&mut source, addr, false);
        }

        let symbols = vec![SymbolFunction {
            name: "memcpy".into(),
            addr: 0x9001, // thumb bit set
            size: 8,
        }];
        insert_stubs(&mut source, &symbols);

        let stub = source.function_by_name("memcpy").unwrap();
        assert!(source.functions[stub].is_stub());
        let line = source.lines_by_address[&0x9000];
        assert_eq!(source.lines[line].function, Some(stub));
        assert_eq!(source.lines_by_address[&0x9006], line);
    }

    #[test]
    fn stub_dropped_when_overlapping() {
        let mut source = Source::new();
        let line = source.add_stub_line("taken");
        source.lines_by_address.insert(0x9004, line);

        let symbols = vec![SymbolFunction {
            name: "memcpy".into(),
            addr: 0x9000,
            size: 8,
        }];
        insert_stubs(&mut source, &symbols);
        assert!(source.function_by_name("memcpy").is_none());
    }
}

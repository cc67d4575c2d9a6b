//! DWARF consumption: the ELF loader and the builders that populate the
//! [`Source`] model.
//!
//! `.debug_info` and `.debug_line` are read through gimli. The
//! `.debug_frame` and `.debug_loc` sections are parsed by this crate
//! ([`frame`], [`loclist`]) from buffers copied out of the ELF; the file
//! handle does not survive construction.

pub mod frame;
pub mod loclist;

mod functions;
mod lines;
mod types;
mod variables;

use crate::coproc::{Cart, CoProc, Disassembler};
use crate::error::LoadError;
use crate::source::file::{FileContent, SourceDisasm, SourceFile, SourceLine};
use crate::source::{FileId, Source};
use crate::weak_error;
use bytes::Bytes;
use fallible_iterator::FallibleIterator;
use gimli::{AttributeValue, DwAt, Reader, RunTimeEndian, UnitOffset};
use itertools::Itertools;
use log::{debug, info, warn};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SectionKind, SymbolKind};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

pub(crate) type Die<'abbrev, 'unit> =
    gimli::DebuggingInformationEntry<'abbrev, 'unit, EndianArcSlice, usize>;

/// Filenames probed, in order, when the ELF path is a directory.
const ELF_CANDIDATES: &[&str] = &[
    "armcode.elf",
    "main/armcode.elf",
    "main/bin/armcode.elf",
    "custom/bin/custom2.elf",
    "arm/main.elf",
];

/// One row of a compilation unit's line program, reduced to what the
/// mapper needs.
pub(crate) struct LineEntry {
    pub address: u64,
    pub file_index: usize,
    pub line: u64,
    pub is_stmt: bool,
    pub end_sequence: bool,
}

/// A compilation unit and everything extracted from its line program.
pub(crate) struct UnitData {
    pub unit: gimli::Unit<EndianArcSlice>,

    /// File table of the unit's line program, by file index.
    pub files: Vec<PathBuf>,

    /// Model file id per file index. `None` when the file could not be
    /// read from disk.
    pub file_ids: Vec<Option<FileId>>,

    pub line_entries: Vec<LineEntry>,

    /// Relocated low PC: the base address for `.debug_loc` lists.
    pub low_pc: u32,

    pub producer: Option<String>,
}

/// An ELF symbol table function, used for stub insertion.
pub(crate) struct SymbolFunction {
    pub name: String,
    pub addr: u32,
    pub size: u32,
}

/// Locate the ELF under `path`, which may name the file itself or a
/// directory to search.
pub fn find_elf(path: &Path) -> Result<PathBuf, LoadError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    for candidate in ELF_CANDIDATES {
        let p = path.join(candidate);
        if p.is_file() {
            return Ok(p);
        }
    }
    Err(LoadError::NoElf(path.to_path_buf()))
}

/// Build the whole source model from the ELF at (or under) `elf_path`.
pub(crate) fn build(
    elf_path: &Path,
    rom_dir: &Path,
    cart: &dyn Cart,
    coproc: &dyn CoProc,
    disassembler: &dyn Disassembler,
) -> Result<Source, LoadError> {
    let elf_path = find_elf(elf_path)?;
    debug!(target: "dwarf-loader", "loading debug information from {elf_path:?}");

    let file = fs::File::open(&elf_path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let obj = object::File::parse(&*mmap)?;

    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    // the one executable section, its data and its load origin
    let mut exec: Option<(String, u32, Vec<u8>)> = None;
    for section in obj.sections() {
        if section.kind() != SectionKind::Text {
            continue;
        }
        if exec.is_some() {
            return Err(LoadError::MultipleExecutableSections);
        }
        let name = section.name()?.to_string();
        let addr = if obj.kind() == ObjectKind::Relocatable {
            cart.elf_section(&name).unwrap_or(0)
        } else {
            section.address() as u32
        };
        exec = Some((name, addr, section.uncompressed_data()?.to_vec()));
    }
    let (_, origin, text) = exec.ok_or(LoadError::NoExecutableSection)?;

    let symbols: Vec<SymbolFunction> = obj
        .symbols()
        .filter(|s| s.kind() == SymbolKind::Text && s.size() > 0)
        .filter_map(|s| {
            let name = s.name().ok()?.to_string();
            let addr = if obj.kind() == ObjectKind::Relocatable {
                origin.wrapping_add(s.address() as u32)
            } else {
                s.address() as u32
            };
            Some(SymbolFunction {
                name,
                addr,
                size: s.size() as u32,
            })
        })
        .collect();

    // DWARF data is copied into owned buffers; nothing borrows the mmap
    // after construction
    let dwarf = gimli::Dwarf::load(|id| -> gimli::Result<EndianArcSlice> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[]));
        Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
    })?;

    let frame = {
        let data = section_data(&obj, ".debug_frame");
        if data.is_empty() {
            None
        } else {
            Some(Arc::new(frame::FrameSection::new(data, origin)?))
        }
    };
    let loc = loclist::LoclistSection::new(section_data(&obj, ".debug_loc"));

    let headers = dwarf.units().collect::<Vec<_>>()?;
    if headers.is_empty() {
        return Err(LoadError::NoDwarf);
    }

    let mut source = Source::new();

    let mut units = Vec::with_capacity(headers.len());
    for header in headers {
        let unit = dwarf.unit(header)?;
        units.push(parse_unit(&dwarf, unit, origin)?);
    }

    for unit in &units {
        if let Some(producer) = &unit.producer {
            if !acceptable_optimisation(producer) {
                info!(target: "dwarf-loader", "unit produced with untrusted optimisation: {producer}");
                source.optimised_warning = true;
            }
        }
    }

    load_source_files(&mut source, &mut units, rom_dir);
    disassemble(&mut source, &text, origin, disassembler);

    let mut type_maps = Vec::with_capacity(units.len());
    for unit in &units {
        type_maps.push(types::build(&dwarf, unit, &mut source)?);
    }

    for unit in &units {
        functions::build(&dwarf, unit, &mut source, frame.clone(), origin)?;
    }

    for unit in &units {
        lines::map_lines(&mut source, unit, origin, false)?;
    }
    for unit in &units {
        lines::map_lines(&mut source, unit, origin, true)?;
    }
    lines::insert_stubs(&mut source, &symbols);

    // a line bound from several discontiguous ranges collects addresses
    // out of order
    for line in &mut source.lines {
        line.disassembly.sort_unstable();
    }

    for (unit, type_map) in units.iter().zip(&type_maps) {
        variables::build(
            &dwarf,
            unit,
            &mut source,
            type_map,
            &loc,
            frame.clone(),
            coproc,
            origin,
        )?;
    }

    source.main_function = source.function_by_name("main");
    source.init_sorted_views();

    info!(
        target: "dwarf-loader",
        "{} files, {} functions, {} globals, {} locals",
        source.files.len(),
        source.functions.len(),
        source.globals.len(),
        source.locals.len()
    );

    Ok(source)
}

fn section_data(obj: &object::File, name: &str) -> Bytes {
    obj.section_by_name(name)
        .and_then(|section| section.uncompressed_data().ok())
        .map(|data| Bytes::copy_from_slice(&data))
        .unwrap_or_default()
}

/// Producers matching `GNU...` are probed for an optimisation flag. `-Os`
/// or no flag at all is acceptable; anything else earns a warning.
fn acceptable_optimisation(producer: &str) -> bool {
    static OPT: Lazy<Regex> = Lazy::new(|| Regex::new(r" -O(\S+)").unwrap());

    if !producer.starts_with("GNU") {
        return true;
    }
    match OPT.captures(producer) {
        Some(caps) => &caps[1] == "s",
        None => true,
    }
}

fn parse_unit(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: gimli::Unit<EndianArcSlice>,
    origin: u32,
) -> Result<UnitData, LoadError> {
    let mut files = vec![];
    let mut line_entries = vec![];

    if let Some(ref lp) = unit.line_program {
        let mut rows = lp.clone().rows();
        while let Some((_, row)) = rows.next_row()? {
            line_entries.push(LineEntry {
                address: row.address(),
                file_index: row.file_index() as usize,
                line: row.line().map(std::num::NonZeroU64::get).unwrap_or(0),
                is_stmt: row.is_stmt(),
                end_sequence: row.end_sequence(),
            });
        }

        let header = rows.header();
        match header.file(0) {
            Some(file) => files.push(render_file_path(&unit, file, header, dwarf)?),
            None => files.push(PathBuf::default()),
        }
        let mut index = 1;
        while let Some(file) = header.file(index) {
            files.push(render_file_path(&unit, file, header, dwarf)?);
            index += 1;
        }
    }

    let producer = {
        let mut cursor = unit.header.entries(&unit.abbreviations);
        cursor.next_dfs()?;
        cursor
            .current()
            .and_then(|root| attr_string(dwarf, &unit, root, gimli::DW_AT_producer))
    };

    let low_pc = unit.low_pc as u32 + origin;
    let file_ids = vec![None; files.len()];

    Ok(UnitData {
        unit,
        files,
        file_ids,
        line_entries,
        low_pc,
        producer,
    })
}

fn render_file_path(
    dw_unit: &gimli::Unit<EndianArcSlice>,
    file: &gimli::FileEntry<EndianArcSlice, usize>,
    header: &gimli::LineProgramHeader<EndianArcSlice, usize>,
    sections: &gimli::Dwarf<EndianArcSlice>,
) -> Result<PathBuf, gimli::Error> {
    let mut path = if let Some(ref comp_dir) = dw_unit.comp_dir {
        PathBuf::from(comp_dir.to_string_lossy()?.as_ref())
    } else {
        PathBuf::new()
    };

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            path.push(
                sections
                    .attr_string(dw_unit, directory)?
                    .to_string_lossy()?
                    .as_ref(),
            );
        }
    }

    path.push(
        sections
            .attr_string(dw_unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path)
}

/// Read every file the DWARF references from disk and install it in the
/// model. Files are read in parallel; a file that cannot be read is
/// logged and its lines stay unknown.
fn load_source_files(source: &mut Source, units: &mut [UnitData], rom_dir: &Path) {
    let wanted: Vec<PathBuf> = units
        .iter()
        .flat_map(|unit| unit.files.iter())
        .filter(|path| !path.as_os_str().is_empty())
        .unique()
        .cloned()
        .collect();

    let loaded: Vec<(PathBuf, std::io::Result<(SourceFile, Vec<FileContent>)>)> = wanted
        .into_par_iter()
        .map(|path| {
            let res = SourceFile::load(&path, rom_dir);
            (path, res)
        })
        .collect();

    for (path, res) in loaded {
        let Some((mut file, content)) = weak_error!(res) else {
            continue;
        };

        let file_id = source.files.len();
        for (i, line_content) in content.iter().enumerate() {
            let line_id = source.lines.len();
            source.lines.push(SourceLine::new(file_id, i + 1, line_content));
            file.lines.push(line_id);
        }
        source.files.insert(path, file);
    }

    for unit in units.iter_mut() {
        unit.file_ids = unit
            .files
            .iter()
            .map(|path| source.files.get_index_of(path))
            .collect();
    }
}

/// Decode every instruction in the executable section. Thumb-2: a 32bit
/// instruction is one entry covering both halfwords.
fn disassemble(source: &mut Source, text: &[u8], origin: u32, disassembler: &dyn Disassembler) {
    let mut i = 0_usize;
    while i + 2 <= text.len() {
        let addr = origin + i as u32;
        let opcode = u16::from_le_bytes([text[i], text[i + 1]]);
        let (mnemonic, is_32bit) = disassembler.disassemble(opcode);

        if is_32bit && i + 4 <= text.len() {
            let lower = u16::from_le_bytes([text[i + 2], text[i + 3]]);
            source.disasm.insert(
                addr,
                SourceDisasm {
                    addr,
                    opcode: (opcode as u32) << 16 | lower as u32,
                    is_32bit: true,
                    mnemonic,
                    line: None,
                },
            );
            i += 4;
        } else {
            source.disasm.insert(
                addr,
                SourceDisasm {
                    addr,
                    opcode: opcode as u32,
                    is_32bit: false,
                    mnemonic,
                    line: None,
                },
            );
            i += 2;
        }
    }
}

pub(crate) fn attr_string(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    die: &Die<'_, '_>,
    at: DwAt,
) -> Option<String> {
    let attr = die.attr(at).ok().flatten()?;
    dwarf
        .attr_string(unit, attr.value())
        .ok()?
        .to_string_lossy()
        .ok()
        .map(|s| s.to_string())
}

pub(crate) fn attr_udata(die: &Die<'_, '_>, at: DwAt) -> Option<u64> {
    die.attr(at).ok().flatten()?.udata_value()
}

/// A reference-class attribute, reduced to an offset within the same
/// unit. Cross-unit references are rare in the embedded toolchains this
/// overlay serves and are dropped with a log.
pub(crate) fn attr_die_ref(
    unit: &gimli::Unit<EndianArcSlice>,
    die: &Die<'_, '_>,
    at: DwAt,
) -> Option<UnitOffset> {
    match die.attr(at).ok().flatten()?.value() {
        AttributeValue::UnitRef(offset) => Some(offset),
        AttributeValue::DebugInfoRef(offset) => match offset.to_unit_offset(&unit.header) {
            Some(offset) => Some(offset),
            None => {
                warn!(target: "dwarf-loader", "dropped cross-unit die reference");
                None
            }
        },
        _ => None,
    }
}

/// The `DW_AT_location` (or `DW_AT_frame_base` or member location)
/// attribute classes this overlay evaluates.
pub(crate) enum LocationClass {
    /// The attribute is a single expression.
    Expr(Vec<u8>),

    /// The attribute points into `.debug_loc`.
    LoclistPtr(u64),
}

pub(crate) fn attr_location(die: &Die<'_, '_>, at: DwAt) -> Option<LocationClass> {
    match die.attr(at).ok().flatten()?.value() {
        AttributeValue::Exprloc(expr) => {
            Some(LocationClass::Expr(expr.0.to_slice().ok()?.to_vec()))
        }
        AttributeValue::Block(block) => Some(LocationClass::Expr(block.to_slice().ok()?.to_vec())),
        AttributeValue::LocationListsRef(offset) => Some(LocationClass::LoclistPtr(offset.0 as u64)),
        AttributeValue::SecOffset(offset) => Some(LocationClass::LoclistPtr(offset as u64)),
        AttributeValue::Udata(offset) => Some(LocationClass::LoclistPtr(offset)),
        AttributeValue::Data4(offset) => Some(LocationClass::LoclistPtr(offset as u64)),
        _ => None,
    }
}

/// Collect a DIE's address ranges as model ranges, relocated by the
/// executable origin.
pub(crate) fn die_ranges(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    die: &Die<'_, '_>,
    origin: u32,
    inline: bool,
) -> Result<Vec<crate::source::function::SourceRange>, gimli::Error> {
    let mut ranges = vec![];
    let mut iter = dwarf.die_ranges(unit, die)?;
    while let Some(range) = iter.next()? {
        if range.end <= range.begin {
            continue;
        }
        ranges.push(crate::source::function::SourceRange {
            start: range.begin as u32 + origin,
            end: (range.end - 1) as u32 + origin,
            inline,
        });
    }
    Ok(ranges)
}

/// Map from DIE offset to model type id, per unit.
pub(crate) type TypeMap = HashMap<UnitOffset, crate::source::TypeId>;

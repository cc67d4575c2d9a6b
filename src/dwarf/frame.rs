//! Call frame information from the `.debug_frame` section.
//!
//! The section is parsed once, into CIE and FDE records. Evaluation happens
//! on demand: [`FrameSection::framebase`] reads the coprocessor program
//! counter, finds the covering FDE and runs the call frame instructions into
//! a frame table until the table row for that address is known. The frame
//! base is then the value of the CFA register plus the CFA offset.

use crate::coproc::{CoProc, PC_REGISTER};
use crate::error::{LoadError, LocationError};
use crate::leb128::{decode_sleb128, decode_uleb128};
use bytes::Bytes;
use log::warn;
use std::collections::HashMap;
use std::collections::VecDeque;

const CIE_ID: u32 = 0xffff_ffff;

#[derive(Debug, Clone)]
struct Cie {
    code_alignment: u64,
    data_alignment: i64,

    // unused during CFA evaluation but part of the record
    #[allow(dead_code)]
    return_address_register: u64,

    instructions: Bytes,
}

#[derive(Debug, Clone)]
struct Fde {
    cie: u32,
    start: u32,
    end: u32,
    instructions: Bytes,
}

/// One row of the frame table. Only the CFA rule is tracked; register
/// recovery rules are parsed but discarded.
#[derive(Debug, Clone, Copy, Default)]
struct FrameTableRow {
    location: u32,
    cfa_register: u64,
    cfa_offset: i64,
}

/// Parsed `.debug_frame` section.
pub struct FrameSection {
    cies: HashMap<u32, Cie>,
    fdes: Vec<Fde>,
    origin: u32,
}

impl FrameSection {
    /// Parse `.debug_frame` data. FDE addresses are relocated by the
    /// executable origin.
    pub fn new(data: Bytes, origin: u32) -> Result<FrameSection, LoadError> {
        let mut cies = HashMap::new();
        let mut fdes = vec![];

        let truncated = |_| LoadError::TruncatedSection(".debug_frame");

        let mut offset = 0_usize;
        while offset + 8 <= data.len() {
            let record_offset = offset as u32;
            let length = read_u32(&data, offset).map_err(truncated)? as usize;
            if length == 0 {
                break;
            }
            let id = read_u32(&data, offset + 4).map_err(truncated)?;

            let body_start = offset + 8;
            let body_end = offset + 4 + length;
            if body_end > data.len() || body_end < body_start {
                return Err(LoadError::TruncatedSection(".debug_frame"));
            }

            if id == CIE_ID {
                let mut c = body_start;
                if c + 2 > body_end {
                    return Err(LoadError::TruncatedSection(".debug_frame"));
                }

                let version = data[c];
                c += 1;
                if version != 1 {
                    return Err(LoadError::UnsupportedCieVersion(version));
                }

                let aug_end = data[c..body_end]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|p| c + p)
                    .ok_or(LoadError::TruncatedSection(".debug_frame"))?;
                let augmentation = String::from_utf8_lossy(&data[c..aug_end]).to_string();
                if !augmentation.is_empty() {
                    return Err(LoadError::UnsupportedCieAugmentation(augmentation));
                }
                c = aug_end + 1;

                let (code_alignment, n) = decode_uleb128(&data[c..body_end]);
                c += n;
                let (data_alignment, n) = decode_sleb128(&data[c..body_end]);
                c += n;
                let (return_address_register, n) = decode_uleb128(&data[c..body_end]);
                c += n;

                cies.insert(
                    record_offset,
                    Cie {
                        code_alignment,
                        data_alignment,
                        return_address_register,
                        instructions: data.slice(c..body_end),
                    },
                );
            } else {
                let start = read_u32(&data, body_start)
                    .map_err(truncated)?
                    .wrapping_add(origin);
                let range = read_u32(&data, body_start + 4).map_err(truncated)?;

                fdes.push(Fde {
                    cie: id,
                    start,
                    end: start.wrapping_add(range),
                    instructions: data.slice(body_start + 8..body_end),
                });
            }

            offset = body_end;
        }

        fdes.sort_unstable_by_key(|f| f.start);

        Ok(FrameSection { cies, fdes, origin })
    }

    /// Frame base at the coprocessor's current program counter.
    pub fn framebase(&self, coproc: &dyn CoProc) -> Result<u64, LocationError> {
        let pc = coproc
            .read_reg(PC_REGISTER)
            .ok_or(LocationError::UnknownRegister(PC_REGISTER))?;
        self.framebase_for_pc(coproc, pc)
    }

    /// Frame base at an explicit address.
    pub fn framebase_for_pc(&self, coproc: &dyn CoProc, pc: u32) -> Result<u64, LocationError> {
        let fde = self
            .fdes
            .iter()
            .find(|f| pc >= f.start && pc <= f.end)
            .ok_or(LocationError::NoFde(pc))?;
        let cie = self.cies.get(&fde.cie).ok_or(LocationError::NoFrameBase)?;

        let mut table = FrameTable::new(fde.start, self.origin);
        table.run(&cie.instructions, cie, u32::MAX)?;
        let broke = table.run(&fde.instructions, cie, pc)?;

        let row = if broke && table.rows.len() > 1 {
            table.rows[1]
        } else {
            table.rows[0]
        };

        let base = coproc
            .read_reg(row.cfa_register as u32)
            .ok_or(LocationError::UnknownRegister(row.cfa_register as u32))?;

        Ok((base as i64 + row.cfa_offset) as u64)
    }
}

/// Working state for call frame instruction interpretation. Rows grow at the
/// front: `rows[0]` is the row being built, `rows[1]` the last complete row.
struct FrameTable {
    rows: VecDeque<FrameTableRow>,
    remembered: Vec<FrameTableRow>,
    origin: u32,
}

impl FrameTable {
    fn new(start: u32, origin: u32) -> FrameTable {
        let mut rows = VecDeque::new();
        rows.push_front(FrameTableRow {
            location: start,
            ..FrameTableRow::default()
        });
        FrameTable {
            rows,
            remembered: vec![],
            origin,
        }
    }

    fn front(&mut self) -> &mut FrameTableRow {
        &mut self.rows[0]
    }

    /// Start a new row at `location`. Returns true when the table now covers
    /// the break address and interpretation must stop.
    fn advance(&mut self, location: u32, break_addr: u32) -> bool {
        let mut row = self.rows[0];
        row.location = location;
        self.rows.push_front(row);
        location >= break_addr
    }

    /// Interpret call frame instructions per DWARF-4 section 6.4.2,
    /// breaking when the current row's location reaches `break_addr`.
    fn run(&mut self, instr: &[u8], cie: &Cie, break_addr: u32) -> Result<bool, LocationError> {
        let mut c = 0_usize;

        while c < instr.len() {
            let op = instr[c];
            c += 1;

            match op & 0xc0 {
                // DW_CFA_advance_loc
                0x40 => {
                    let delta = (op & 0x3f) as u64 * cie.code_alignment;
                    let loc = self.rows[0].location.wrapping_add(delta as u32);
                    if self.advance(loc, break_addr) {
                        return Ok(true);
                    }
                    continue;
                }
                // DW_CFA_offset: register rule, operand consumed and dropped
                0x80 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    continue;
                }
                // DW_CFA_restore
                0xc0 => continue,
                _ => {}
            }

            match op {
                // DW_CFA_nop
                0x00 => {}
                // DW_CFA_set_loc
                0x01 => {
                    let addr = read_u32(instr, c)?.wrapping_add(self.origin);
                    c += 4;
                    if self.advance(addr, break_addr) {
                        return Ok(true);
                    }
                }
                // DW_CFA_advance_loc1/2/4
                0x02 => {
                    let delta = *instr.get(c).ok_or(LocationError::TruncatedExpression)? as u64;
                    c += 1;
                    let loc = self.rows[0]
                        .location
                        .wrapping_add((delta * cie.code_alignment) as u32);
                    if self.advance(loc, break_addr) {
                        return Ok(true);
                    }
                }
                0x03 => {
                    let delta = read_u16(instr, c)? as u64;
                    c += 2;
                    let loc = self.rows[0]
                        .location
                        .wrapping_add((delta * cie.code_alignment) as u32);
                    if self.advance(loc, break_addr) {
                        return Ok(true);
                    }
                }
                0x04 => {
                    let delta = read_u32(instr, c)? as u64;
                    c += 4;
                    let loc = self.rows[0]
                        .location
                        .wrapping_add((delta * cie.code_alignment) as u32);
                    if self.advance(loc, break_addr) {
                        return Ok(true);
                    }
                }
                // DW_CFA_offset_extended
                0x05 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                }
                // DW_CFA_restore_extended, undefined, same_value
                0x06..=0x08 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                }
                // DW_CFA_register
                0x09 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                }
                // DW_CFA_remember_state
                0x0a => self.remembered.push(self.rows[0]),
                // DW_CFA_restore_state
                0x0b => {
                    if let Some(row) = self.remembered.pop() {
                        let location = self.rows[0].location;
                        *self.front() = FrameTableRow { location, ..row };
                    }
                }
                // DW_CFA_def_cfa
                0x0c => {
                    let (reg, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (off, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    self.front().cfa_register = reg;
                    self.front().cfa_offset = off as i64;
                }
                // DW_CFA_def_cfa_register
                0x0d => {
                    let (reg, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    self.front().cfa_register = reg;
                }
                // DW_CFA_def_cfa_offset
                0x0e => {
                    let (off, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    self.front().cfa_offset = off as i64;
                }
                // DW_CFA_def_cfa_expression: the CFA cannot be expressed as
                // register+offset, which is all the frame table models
                0x0f => return Err(LocationError::NoFrameBase),
                // DW_CFA_expression
                0x10 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (len, n) = decode_uleb128(&instr[c..]);
                    c += n + len as usize;
                }
                // DW_CFA_offset_extended_sf
                0x11 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (_, n) = decode_sleb128(&instr[c..]);
                    c += n;
                }
                // DW_CFA_def_cfa_sf
                0x12 => {
                    let (reg, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (off, n) = decode_sleb128(&instr[c..]);
                    c += n;
                    self.front().cfa_register = reg;
                    self.front().cfa_offset = off * cie.data_alignment;
                }
                // DW_CFA_def_cfa_offset_sf
                0x13 => {
                    let (off, n) = decode_sleb128(&instr[c..]);
                    c += n;
                    self.front().cfa_offset = off * cie.data_alignment;
                }
                // DW_CFA_val_offset
                0x14 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                }
                // DW_CFA_val_offset_sf
                0x15 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (_, n) = decode_sleb128(&instr[c..]);
                    c += n;
                }
                // DW_CFA_val_expression
                0x16 => {
                    let (_, n) = decode_uleb128(&instr[c..]);
                    c += n;
                    let (len, n) = decode_uleb128(&instr[c..]);
                    c += n + len as usize;
                }
                _ => {
                    warn!(target: "frame", "unknown call frame instruction {op:#04x}");
                    return Err(LocationError::UnknownOpcode(op));
                }
            }
        }

        Ok(false)
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, LocationError> {
    let b = data
        .get(offset..offset + 2)
        .ok_or(LocationError::TruncatedExpression)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, LocationError> {
    let b = data
        .get(offset..offset + 4)
        .ok_or(LocationError::TruncatedExpression)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cfg(test)]
mod test {
    use super::*;

    struct Regs {
        regs: [u32; 16],
    }

    impl CoProc for Regs {
        fn read_reg(&self, n: u32) -> Option<u32> {
            self.regs.get(n as usize).copied()
        }

        fn read_u32(&self, _addr: u32) -> Option<u32> {
            None
        }
    }

    // one CIE (version 1, empty augmentation, code align 2, data align -4,
    // ra register 14) and one FDE covering [0x8000, 0x8020) that defines the
    // CFA as r13+0 and, from 0x8008, as r13+8
    fn section() -> Bytes {
        let mut d: Vec<u8> = vec![];

        // CIE
        let cie_body: Vec<u8> = vec![
            1,    // version
            0,    // augmentation ""
            2,    // code alignment
            0x7c, // data alignment -4
            14,   // return address register
            0x0c, 13, 0, // def_cfa r13, 0
        ];
        d.extend(((cie_body.len() + 4) as u32).to_le_bytes());
        d.extend(CIE_ID.to_le_bytes());
        d.extend(&cie_body);

        // FDE
        let fde_body: Vec<u8> = {
            let mut b: Vec<u8> = vec![];
            b.extend(0x8000_u32.to_le_bytes()); // start
            b.extend(0x20_u32.to_le_bytes()); // range
            b.push(0x40 | 4); // advance_loc 4*2 = 8
            b.extend([0x0e, 8]); // def_cfa_offset 8
            b
        };
        d.extend(((fde_body.len() + 4) as u32).to_le_bytes());
        d.extend(0_u32.to_le_bytes()); // CIE pointer
        d.extend(&fde_body);

        Bytes::from(d)
    }

    #[test]
    fn cfa_before_and_after_prologue() {
        let fs = FrameSection::new(section(), 0).unwrap();
        let mut regs = Regs { regs: [0; 16] };
        regs.regs[13] = 0x4000_0100;

        // before the advance_loc: CFA = r13 + 0
        regs.regs[15] = 0x8000;
        assert_eq!(fs.framebase(&regs).unwrap(), 0x4000_0100);

        regs.regs[15] = 0x8006;
        assert_eq!(fs.framebase(&regs).unwrap(), 0x4000_0100);

        // after: CFA = r13 + 8
        regs.regs[15] = 0x800a;
        assert_eq!(fs.framebase(&regs).unwrap(), 0x4000_0108);
    }

    #[test]
    fn no_fde() {
        let fs = FrameSection::new(section(), 0).unwrap();
        let mut regs = Regs { regs: [0; 16] };
        regs.regs[15] = 0x9000;
        assert_eq!(fs.framebase(&regs), Err(LocationError::NoFde(0x9000)));
    }

    #[test]
    fn unsupported_cie_version() {
        let mut d: Vec<u8> = vec![];
        let cie_body: Vec<u8> = vec![4, 0, 1, 0x7c, 14];
        d.extend(((cie_body.len() + 4) as u32).to_le_bytes());
        d.extend(CIE_ID.to_le_bytes());
        d.extend(&cie_body);

        assert!(matches!(
            FrameSection::new(Bytes::from(d), 0),
            Err(LoadError::UnsupportedCieVersion(4))
        ));
    }

    #[test]
    fn fde_relocation() {
        let fs = FrameSection::new(section(), 0x1000_0000).unwrap();
        let mut regs = Regs { regs: [0; 16] };
        regs.regs[13] = 0x4000_0100;
        regs.regs[15] = 0x1000_8000;
        assert_eq!(fs.framebase(&regs).unwrap(), 0x4000_0100);
    }
}

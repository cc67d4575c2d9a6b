//! Source files, lines and per-line disassembly.

use crate::profile::{Phases, StatsGroup};
use crate::source::{FileId, FunctionId, LineId};
use smallvec::SmallVec;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A file referenced by any compilation unit. Created on first reference,
/// immutable thereafter.
pub struct SourceFile {
    /// Absolute filename as recorded in the DWARF.
    pub filename: PathBuf,

    /// Filename relative to the ROM directory, with symlinks evaluated.
    /// Used for presentation.
    pub short_filename: String,

    /// Lines of the file, in order. Indices into [`super::Source::lines`].
    pub lines: Vec<LineId>,

    /// Width of the widest line, in characters.
    pub max_line_width: usize,

    pub has_globals: bool,
    pub has_executable_lines: bool,
}

impl SourceFile {
    /// Read a file from disk, one [`content`] entry per line.
    ///
    /// [`content`]: FileContent
    pub fn load(filename: &Path, rom_dir: &Path) -> io::Result<(SourceFile, Vec<FileContent>)> {
        let text = fs::read_to_string(filename)?;

        let content: Vec<FileContent> = text
            .lines()
            .map(|l| FileContent {
                plain: l.to_string(),
                fragments: fragment(l),
            })
            .collect();

        let max_line_width = content.iter().map(|c| c.plain.chars().count()).max().unwrap_or(0);

        Ok((
            SourceFile {
                filename: filename.to_path_buf(),
                short_filename: short_filename(filename, rom_dir),
                lines: vec![],
                max_line_width,
                has_globals: false,
                has_executable_lines: false,
            },
            content,
        ))
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }
}

/// Raw text of one line, before it becomes a [`SourceLine`] in the model.
pub struct FileContent {
    pub plain: String,
    pub fragments: Vec<Fragment>,
}

/// Shorten a filename for presentation: relative to the ROM directory with
/// symlinks evaluated where possible.
fn short_filename(filename: &Path, rom_dir: &Path) -> String {
    let canon_file = fs::canonicalize(filename).unwrap_or_else(|_| filename.to_path_buf());
    let canon_dir = fs::canonicalize(rom_dir).unwrap_or_else(|_| rom_dir.to_path_buf());

    canon_file
        .strip_prefix(&canon_dir)
        .unwrap_or(&canon_file)
        .to_string_lossy()
        .to_string()
}

/// A single line of source.
pub struct SourceLine {
    /// Owning file. `None` only for stub lines.
    pub file: Option<FileId>,

    /// Line number, from 1. Zero for stub lines.
    pub number: usize,

    /// Function the line belongs to. Set during the line program walk;
    /// `None` for lines with no executable content.
    pub function: Option<FunctionId>,

    pub plain: String,
    pub fragments: Vec<Fragment>,

    /// Addresses of instructions generated for this line, in address
    /// order. Keys into [`super::Source::disasm`].
    pub disassembly: Vec<u32>,

    /// True when any associated address is a statement start.
    pub breakable: bool,

    /// Addresses a breakpoint on this line covers.
    pub break_addresses: SmallVec<[u32; 2]>,

    /// Set when a yield with a bug reason landed on this line.
    pub bug: bool,

    pub stats: StatsGroup,

    /// Which phases have executed this line.
    pub kernel: Phases,

    pub stub: bool,
}

impl SourceLine {
    pub fn new(file: FileId, number: usize, content: &FileContent) -> SourceLine {
        SourceLine {
            file: Some(file),
            number,
            function: None,
            plain: content.plain.clone(),
            fragments: content.fragments.clone(),
            disassembly: vec![],
            breakable: false,
            break_addresses: SmallVec::new(),
            bug: false,
            stats: StatsGroup::default(),
            kernel: Phases::default(),
            stub: false,
        }
    }

    pub fn stub(plain: impl Into<String>) -> SourceLine {
        SourceLine {
            file: None,
            number: 0,
            function: None,
            plain: plain.into(),
            fragments: vec![],
            disassembly: vec![],
            breakable: false,
            break_addresses: SmallVec::new(),
            bug: false,
            stats: StatsGroup::default(),
            kernel: Phases::default(),
            stub: true,
        }
    }
}

/// One decoded instruction.
pub struct SourceDisasm {
    pub addr: u32,

    /// 16bit opcode, or both halfwords of a 32bit instruction.
    pub opcode: u32,

    pub is_32bit: bool,

    pub mnemonic: String,

    /// The source line the instruction was generated from. Bound during
    /// the line program walk.
    pub line: Option<LineId>,
}

impl SourceDisasm {
    /// Opcode rendered the way the follow-on word of a 32bit instruction
    /// is: the placeholder mnemonic.
    pub const PLACEHOLDER: &'static str = "-";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Code,
    Comment,
    StringLiteral,
    Number,
}

/// A lexical fragment of a source line, for colourisation.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub text: String,
}

/// Split a line into colourisable fragments. The lexer is line-local and
/// deliberately rough: it recognises line comments, string literals and
/// numbers, and leaves everything else as code.
pub fn fragment(line: &str) -> Vec<Fragment> {
    let mut fragments: Vec<Fragment> = vec![];
    let bytes = line.as_bytes();
    let mut code_start = 0_usize;
    let mut i = 0_usize;

    let flush = |fragments: &mut Vec<Fragment>, from: usize, to: usize| {
        if to > from {
            fragments.push(Fragment {
                kind: FragmentKind::Code,
                text: line[from..to].to_string(),
            });
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                flush(&mut fragments, code_start, i);
                fragments.push(Fragment {
                    kind: FragmentKind::Comment,
                    text: line[i..].to_string(),
                });
                return fragments;
            }
            b'"' => {
                flush(&mut fragments, code_start, i);
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != b'"' {
                    if bytes[j] == b'\\' {
                        j += 1;
                    }
                    j += 1;
                }
                let end = (j + 1).min(bytes.len());
                fragments.push(Fragment {
                    kind: FragmentKind::StringLiteral,
                    text: line[i..end].to_string(),
                });
                i = end;
                code_start = i;
            }
            b'0'..=b'9'
                if i == 0 || !(bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_') =>
            {
                flush(&mut fragments, code_start, i);
                let mut j = i;
                while j < bytes.len()
                    && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'.' || bytes[j] == b'x')
                {
                    j += 1;
                }
                fragments.push(Fragment {
                    kind: FragmentKind::Number,
                    text: line[i..j].to_string(),
                });
                i = j;
                code_start = i;
            }
            _ => i += 1,
        }
    }

    flush(&mut fragments, code_start, bytes.len());
    fragments
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fragments() {
        let f = fragment("x = 0x40; // set \"x\"");
        assert_eq!(
            f,
            vec![
                Fragment {
                    kind: FragmentKind::Code,
                    text: "x = ".into()
                },
                Fragment {
                    kind: FragmentKind::Number,
                    text: "0x40".into()
                },
                Fragment {
                    kind: FragmentKind::Code,
                    text: "; ".into()
                },
                Fragment {
                    kind: FragmentKind::Comment,
                    text: "// set \"x\"".into()
                },
            ]
        );
    }

    #[test]
    fn fragments_string() {
        let f = fragment(r#"puts("a // b");"#);
        assert_eq!(f[1].kind, FragmentKind::StringLiteral);
        assert_eq!(f[1].text, r#""a // b""#);
        assert_eq!(f[2].text, ");");
    }

    #[test]
    fn fragments_identifier_digits_are_code() {
        let f = fragment("r2d2");
        assert_eq!(
            f,
            vec![Fragment {
                kind: FragmentKind::Code,
                text: "r2d2".into()
            }]
        );
    }
}

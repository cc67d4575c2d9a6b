use std::path::PathBuf;

/// Errors that abort model construction. No model is produced when one of
/// these is returned.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no ELF file found under {0}")]
    NoElf(PathBuf),
    #[error("ELF contains no DWARF debug information")]
    NoDwarf,
    #[error("unsupported CIE version {0}")]
    UnsupportedCieVersion(u8),
    #[error("unsupported CIE augmentation {0:?}")]
    UnsupportedCieAugmentation(String),
    #[error("more than one executable section in ELF")]
    MultipleExecutableSections,
    #[error("no executable section in ELF")]
    NoExecutableSection,
    #[error("{file}: line {line} referenced by DWARF but file has {max} lines")]
    SourceMismatch {
        file: PathBuf,
        line: u64,
        max: usize,
    },
    #[error("no function for source line at address {0:#010x}")]
    NoFunctionForLine(u32),
    #[error("truncated {0} section")]
    TruncatedSection(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("object file parsing error: {0}")]
    Obj(#[from] object::Error),
    #[error("dwarf parsing error: {0}")]
    Dwarf(#[from] gimli::Error),
}

/// Errors contained to a single loclist or variable. The affected variable is
/// flagged unresolvable and the error is logged once; the model survives.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LocationError {
    #[error("empty stack at end of location expression")]
    EmptyStack,
    #[error("unreadable address {0:#010x}")]
    UnreadableAddress(u32),
    #[error("unknown register {0}")]
    UnknownRegister(u32),
    #[error("no frame base defined")]
    NoFrameBase,
    #[error("unknown operator {0:#04x}")]
    UnknownOpcode(u8),
    #[error("operator {0} is not implemented")]
    UnimplementedOpcode(&'static str),
    #[error("no FDE covers address {0:#010x}")]
    NoFde(u32),
    #[error("truncated location expression")]
    TruncatedExpression,
    #[error("division by zero in location expression")]
    DivisionByZero,
    #[error("parent variable location not resolved")]
    ParentUnresolved,
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "overlay", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "overlay", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and puts the error into debug logs if it
/// occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}

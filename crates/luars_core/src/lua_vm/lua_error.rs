/// Lightweight error enum - only 1 byte!
/// The error object itself lives in the thread state (`LuaState::error_value`)
/// so it stays visible to the collector while the error unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Runtime error - error object stored in the thread state
    RuntimeError,
    /// Error reported by a chunk loader (bad binary chunk, front-end syntax error)
    SyntaxError,
    /// Memory ceiling hit after an emergency collection
    OutOfMemory,
    /// Error while running a message handler or after a repeated overflow
    ErrorInErrorHandling,
    /// Coroutine yield - yielded values sit on top of the coroutine stack
    Yield,
}

impl LuaError {
    /// Status code reported at a protected boundary.
    pub fn status(self) -> LuaStatus {
        match self {
            LuaError::RuntimeError => LuaStatus::ErrRun,
            LuaError::SyntaxError => LuaStatus::ErrSyntax,
            LuaError::OutOfMemory => LuaStatus::ErrMem,
            LuaError::ErrorInErrorHandling => LuaStatus::ErrErr,
            LuaError::Yield => LuaStatus::Yield,
        }
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::RuntimeError => write!(f, "Runtime Error"),
            LuaError::SyntaxError => write!(f, "Syntax Error"),
            LuaError::OutOfMemory => write!(f, "Out Of Memory"),
            LuaError::ErrorInErrorHandling => write!(f, "Error In Error Handling"),
            LuaError::Yield => write!(f, "Coroutine Yield"),
        }
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

/// Thread status codes (LUA_OK .. LUA_ERRERR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LuaStatus {
    #[default]
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrErr = 5,
}

impl LuaStatus {
    pub fn is_error(self) -> bool {
        (self as u8) > LuaStatus::Yield as u8
    }

    pub fn from_u8(v: u8) -> LuaStatus {
        match v {
            0 => LuaStatus::Ok,
            1 => LuaStatus::Yield,
            2 => LuaStatus::ErrRun,
            3 => LuaStatus::ErrSyntax,
            4 => LuaStatus::ErrMem,
            _ => LuaStatus::ErrErr,
        }
    }

    /// Inverse of `LuaError::status` for error codes.
    pub fn to_error(self) -> Option<LuaError> {
        match self {
            LuaStatus::Ok => None,
            LuaStatus::Yield => Some(LuaError::Yield),
            LuaStatus::ErrRun => Some(LuaError::RuntimeError),
            LuaStatus::ErrSyntax => Some(LuaError::SyntaxError),
            LuaStatus::ErrMem => Some(LuaError::OutOfMemory),
            LuaStatus::ErrErr => Some(LuaError::ErrorInErrorHandling),
        }
    }
}

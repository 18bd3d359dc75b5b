// Runtime error carried through every LuaResult.
// The dispatch loop stamps the source position on first raise and grows
// the traceback as frames unwind.

use std::rc::Rc;

pub type LuaResult<T> = Result<T, LuaError>;

#[derive(Clone)]
pub struct LuaError {
    /// Human-readable message, without position prefix.
    pub message: String,
    /// Error level, as in `error(msg, level)`.
    pub level: i32,
    /// Accumulated "stack traceback:" lines, innermost first.
    pub traceback: Vec<String>,
    /// `source:line` of the raising instruction.
    pub fileline: Option<String>,
    /// Original host error when this wraps a host-callable failure.
    pub cause: Option<Rc<dyn std::error::Error>>,
}

impl LuaError {
    pub fn new(message: impl Into<String>) -> LuaError {
        LuaError {
            message: message.into(),
            level: 1,
            traceback: Vec::new(),
            fileline: None,
            cause: None,
        }
    }

    pub fn with_level(message: impl Into<String>, level: i32) -> LuaError {
        LuaError {
            level,
            ..LuaError::new(message)
        }
    }

    /// Wrap a non-Lua host failure; the original error is kept as cause.
    pub fn host(err: impl std::error::Error + 'static) -> LuaError {
        let message = err.to_string();
        LuaError {
            cause: Some(Rc::new(err)),
            ..LuaError::new(message)
        }
    }

    /// Stamp the raising position once; later frames only extend the
    /// traceback.
    pub fn stamp_fileline(&mut self, fileline: String) {
        if self.fileline.is_none() {
            self.fileline = Some(fileline);
        }
    }

    pub fn push_traceback(&mut self, line: String) {
        self.traceback.push(line);
    }

    /// Full message with position prefix, as scripts would see it.
    pub fn positioned_message(&self) -> String {
        match &self.fileline {
            Some(fl) if self.level > 0 => format!("{}: {}", fl, self.message),
            _ => self.message.clone(),
        }
    }

    /// Message plus the accumulated traceback.
    pub fn full_report(&self) -> String {
        if self.traceback.is_empty() {
            return self.positioned_message();
        }
        let mut out = self.positioned_message();
        out.push_str("\nstack traceback:");
        for line in &self.traceback {
            out.push_str("\n\t");
            out.push_str(line);
        }
        out
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.positioned_message())
    }
}

impl std::fmt::Debug for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaError")
            .field("message", &self.message)
            .field("fileline", &self.fileline)
            .field("level", &self.level)
            .finish()
    }
}

impl std::error::Error for LuaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref()
    }
}

/// One entry of a captured call-frame chain: the source line the frame was
/// executing and the enclosing function's name (`None` for the top-level
/// script).
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub function: Option<String>,
}

/// A fatal runtime error. Carries the whole frame chain at the moment of the
/// error, innermost first; `Display` renders it under the message.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_trace(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        let mut error = RuntimeError::new(message);
        error.trace = trace;
        error
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.message)?;

        for frame in &self.trace {
            match &frame.function {
                Some(name) => write!(f, "\n  [line {}] in {}()", frame.line, name)?,
                None => write!(f, "\n  [line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

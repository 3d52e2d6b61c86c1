use super::{BoundaryDetector, Span};
use crate::domain::StructuralKind;
use crate::error::{QaError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    ExpectOpen,
    /// Just after `[`: an element or `]`.
    ExpectElemOrClose,
    /// Just after `,`: an element is mandatory.
    ExpectElem,
    InElem,
    Done,
}

/// Top-level elements of a JSON array. Boundaries fall only where nesting
/// returns to the array itself, so an element is never split.
pub struct JsonArrayDetector {
    phase: Phase,
    /// Open brackets inside the current element.
    stack: Vec<u8>,
    in_string: bool,
    escape: bool,
    /// A container element has closed; only whitespace may follow before `,`/`]`.
    closed: bool,
    elem_start: u64,
    elem_end: u64,
}

impl JsonArrayDetector {
    pub fn new() -> Self {
        Self {
            phase: Phase::ExpectOpen,
            stack: Vec::new(),
            in_string: false,
            escape: false,
            closed: false,
            elem_start: 0,
            elem_end: 0,
        }
    }

    fn start_elem(&mut self, pos: u64) {
        self.phase = Phase::InElem;
        self.stack.clear();
        self.in_string = false;
        self.escape = false;
        self.closed = false;
        self.elem_start = pos;
        self.elem_end = pos;
    }

    fn elem_byte(&mut self, b: u8, pos: u64, out: &mut Vec<Span>) -> Result<()> {
        if self.in_string {
            if self.escape {
                self.escape = false;
            } else if b == b'\\' {
                self.escape = true;
            } else if b == b'"' {
                self.in_string = false;
                if self.stack.is_empty() {
                    self.closed = true;
                }
            }
            self.elem_end = pos + 1;
            return Ok(());
        }

        if b.is_ascii_whitespace() {
            return Ok(());
        }

        if self.stack.is_empty() {
            match b {
                b',' => {
                    out.push(Span::record(self.elem_start, self.elem_end));
                    self.phase = Phase::ExpectElem;
                    return Ok(());
                }
                b']' => {
                    out.push(Span::record(self.elem_start, self.elem_end));
                    self.phase = Phase::Done;
                    return Ok(());
                }
                _ if self.closed => {
                    return Err(QaError::corrupt(pos, "unexpected byte after array element"));
                }
                _ => {}
            }
        }

        match b {
            b'"' => {
                // a string after a scalar token (`1"a"`) is still malformed
                if self.stack.is_empty() && self.elem_end > self.elem_start {
                    return Err(QaError::corrupt(pos, "unexpected string in scalar element"));
                }
                self.in_string = true;
            }
            b'{' | b'[' => {
                if self.stack.is_empty() && self.elem_end > self.elem_start {
                    return Err(QaError::corrupt(pos, "unexpected bracket in scalar element"));
                }
                self.stack.push(b);
            }
            b'}' | b']' => {
                let want = if b == b'}' { b'{' } else { b'[' };
                match self.stack.pop() {
                    Some(open) if open == want => {
                        if self.stack.is_empty() {
                            self.closed = true;
                        }
                    }
                    _ => return Err(QaError::corrupt(pos, "unbalanced closing bracket")),
                }
            }
            _ => {}
        }
        self.elem_end = pos + 1;
        Ok(())
    }
}

impl Default for JsonArrayDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundaryDetector for JsonArrayDetector {
    fn kind(&self) -> StructuralKind {
        StructuralKind::JsonArray
    }

    fn scan(&mut self, bytes: &[u8], offset: u64, out: &mut Vec<Span>) -> Result<()> {
        for (i, &b) in bytes.iter().enumerate() {
            let pos = offset + i as u64;
            match self.phase {
                Phase::ExpectOpen => match b {
                    b'[' => self.phase = Phase::ExpectElemOrClose,
                    // UTF-8 byte order mark
                    0xEF | 0xBB | 0xBF if pos < 3 => {}
                    _ if b.is_ascii_whitespace() => {}
                    _ => return Err(QaError::corrupt(pos, "expected '[' opening the array")),
                },
                Phase::ExpectElemOrClose => match b {
                    b']' => self.phase = Phase::Done,
                    b',' => return Err(QaError::corrupt(pos, "empty array element")),
                    _ if b.is_ascii_whitespace() => {}
                    _ => {
                        self.start_elem(pos);
                        self.elem_byte(b, pos, out)?;
                    }
                },
                Phase::ExpectElem => match b {
                    b']' => return Err(QaError::corrupt(pos, "trailing comma before ']'")),
                    b',' => return Err(QaError::corrupt(pos, "empty array element")),
                    _ if b.is_ascii_whitespace() => {}
                    _ => {
                        self.start_elem(pos);
                        self.elem_byte(b, pos, out)?;
                    }
                },
                Phase::InElem => self.elem_byte(b, pos, out)?,
                Phase::Done => {
                    if !b.is_ascii_whitespace() {
                        return Err(QaError::corrupt(pos, "trailing data after closing ']'"));
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, end: u64, _out: &mut Vec<Span>) -> Result<()> {
        match self.phase {
            Phase::Done => Ok(()),
            Phase::ExpectOpen => Err(QaError::corrupt(end, "no JSON array in input")),
            Phase::InElem if self.in_string => {
                Err(QaError::corrupt(end, "unterminated string at end of input"))
            }
            _ => Err(QaError::corrupt(end, "unbalanced brackets: array not closed")),
        }
    }

    fn retain_from(&self) -> Option<u64> {
        (self.phase == Phase::InElem).then_some(self.elem_start)
    }
}

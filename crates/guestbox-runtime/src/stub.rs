//! Arithmetic evaluator used when no real guest is available.
//!
//! Understands numeric literals, `+ - * /`, unary minus and parentheses.
//! A trailing `;` is ignored and empty input is `undefined`. Anything else
//! fails with [`RuntimeError::GuestExecution`].

use guestbox_common::RuntimeError;

/// Evaluate `code`. `Ok(None)` is `undefined`.
///
/// # Errors
///
/// Returns [`RuntimeError::GuestExecution`] for unsupported input or
/// division by zero.
pub fn evaluate(code: &str) -> Result<Option<String>, RuntimeError> {
    let code = code.trim().trim_end_matches(';').trim();
    if code.is_empty() {
        return Ok(None);
    }

    let mut parser = Parser {
        src: code.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(parser.unexpected());
    }

    Ok(Some(format_number(value)))
}

/// Integral values print without a fraction, as JSON would.
#[allow(clippy::cast_possible_truncation)]
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        serde_json::Number::from_f64(value).map_or_else(|| "null".to_string(), |n| n.to_string())
    }
}

/// Nesting limit for parentheses and unary minus.
const MAX_DEPTH: usize = 256;

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn expr(&mut self) -> Result<f64, RuntimeError> {
        let mut acc = self.term()?;
        loop {
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    acc += self.term()?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    acc -= self.term()?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn term(&mut self) -> Result<f64, RuntimeError> {
        let mut acc = self.factor()?;
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    acc *= self.factor()?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(RuntimeError::guest_execution("division by zero"));
                    }
                    acc /= divisor;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, RuntimeError> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                self.nested(|p| Ok(-p.factor()?))
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.nested(Self::expr)?;
                if self.peek() != Some(b')') {
                    return Err(self.unexpected());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            _ => Err(self.unexpected()),
        }
    }

    fn nested(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<f64, RuntimeError>,
    ) -> Result<f64, RuntimeError> {
        if self.depth >= MAX_DEPTH {
            return Err(RuntimeError::guest_execution("expression nested too deeply"));
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn number(&mut self) -> Result<f64, RuntimeError> {
        let start = self.pos;
        while self
            .src
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit() || *c == b'.')
        {
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.unexpected())
    }

    /// Next non-whitespace byte.
    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.src.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn unexpected(&self) -> RuntimeError {
        let rest = String::from_utf8_lossy(&self.src[self.pos.min(self.src.len())..]);
        RuntimeError::guest_execution(format!(
            "unsupported expression near `{rest}` (no guest module available)"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(code: &str) -> String {
        evaluate(code).unwrap().unwrap()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 1"), "2");
        assert_eq!(eval("1 + 2"), "3");
        assert_eq!(eval("2 * 3"), "6");
        assert_eq!(eval("10 - 5"), "5");
        assert_eq!(eval("1 + 2 * 3"), "7");
        assert_eq!(eval("(1 + 2) * 3;"), "9");
        assert_eq!(eval("-4 + 1"), "-3");
        assert_eq!(eval("7 / 2"), "3.5");
        assert_eq!(eval("42"), "42");
    }

    #[test]
    fn test_empty_is_undefined() {
        assert_eq!(evaluate("").unwrap(), None);
        assert_eq!(evaluate("  ;").unwrap(), None);
    }

    #[test]
    fn test_unsupported() {
        for code in ["console.log('hi')", "1 +", "(1", "1 2", "1 / 0"] {
            assert!(
                matches!(evaluate(code), Err(RuntimeError::GuestExecution { .. })),
                "{code}"
            );
        }
    }

    #[test]
    fn test_nesting_limit() {
        assert_eq!(eval(&format!("{}1{}", "(".repeat(200), ")".repeat(200))), "1");
        assert_eq!(eval(&format!("{}1", "-".repeat(200))), "1");

        for code in [
            format!("{}1", "(".repeat(1_000_000)),
            format!("{}1", "-".repeat(1_000_000)),
            format!("{}1{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1)),
        ] {
            match evaluate(&code) {
                Err(RuntimeError::GuestExecution { message }) => {
                    assert_eq!(message, "expression nested too deeply");
                }
                other => panic!("expected nesting error, got {other:?}"),
            }
        }
    }
}

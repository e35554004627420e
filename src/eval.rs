//! Parameter Conversion Expressions
//!
//! Logged parameters arrive as raw bytes and become engineering units
//! through small arithmetic formulas like `x*0.25` or `(x-40)*1.8+32`.
//! This is a fixed-grammar evaluator over the variables `x` and `y`:
//! numbers, the four operators, parentheses, unary minus. Formulas parse
//! once and evaluate per sample.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConversionError {
    #[error("unexpected character {0:?} in formula")]
    UnexpectedChar(char),
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("unknown variable {0:?}; only x and y are available")]
    UnknownVariable(String),
    #[error("trailing input after formula: {0:?}")]
    TrailingInput(String),
    #[error("malformed number {0:?}")]
    BadNumber(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    VarX,
    VarY,
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, x: f64, y: f64) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::VarX => x,
            Expr::VarY => y,
            Expr::Neg(e) => -e.eval(x, y),
            Expr::Add(a, b) => a.eval(x, y) + b.eval(x, y),
            Expr::Sub(a, b) => a.eval(x, y) - b.eval(x, y),
            Expr::Mul(a, b) => a.eval(x, y) * b.eval(x, y),
            Expr::Div(a, b) => a.eval(x, y) / b.eval(x, y),
        }
    }
}

/// A parsed conversion formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    expr: Expr,
}

impl Conversion {
    pub fn parse(formula: &str) -> Result<Self, ConversionError> {
        let mut parser = Parser {
            chars: formula.chars().collect(),
            pos: 0,
        };
        let expr = parser.expression()?;
        parser.skip_whitespace();
        if parser.pos < parser.chars.len() {
            let rest: String = parser.chars[parser.pos..].iter().collect();
            return Err(ConversionError::TrailingInput(rest));
        }
        Ok(Self { expr })
    }

    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        self.expr.eval(x, y)
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expression(&mut self) -> Result<Expr, ConversionError> {
        let mut left = self.term()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    left = Expr::Add(Box::new(left), Box::new(self.term()?));
                }
                Some('-') => {
                    self.pos += 1;
                    left = Expr::Sub(Box::new(left), Box::new(self.term()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn term(&mut self) -> Result<Expr, ConversionError> {
        let mut left = self.factor()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    left = Expr::Mul(Box::new(left), Box::new(self.factor()?));
                }
                Some('/') => {
                    self.pos += 1;
                    left = Expr::Div(Box::new(left), Box::new(self.factor()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn factor(&mut self) -> Result<Expr, ConversionError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(ConversionError::UnexpectedEnd),
            Some('-') => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.factor()?)))
            }
            Some('(') => {
                self.pos += 1;
                let inner = self.expression()?;
                self.skip_whitespace();
                if self.peek() == Some(')') {
                    self.pos += 1;
                    Ok(inner)
                } else {
                    Err(ConversionError::UnexpectedEnd)
                }
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.variable(),
            Some(c) => Err(ConversionError::UnexpectedChar(c)),
        }
    }

    fn number(&mut self) -> Result<Expr, ConversionError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse()
            .map(Expr::Number)
            .map_err(|_| ConversionError::BadNumber(text))
    }

    fn variable(&mut self) -> Result<Expr, ConversionError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        match name.as_str() {
            "x" | "X" => Ok(Expr::VarX),
            "y" | "Y" => Ok(Expr::VarY),
            _ => Err(ConversionError::UnknownVariable(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(formula: &str, x: f64, y: f64) -> f64 {
        Conversion::parse(formula).unwrap().evaluate(x, y)
    }

    #[test]
    fn plain_scaling() {
        assert_eq!(eval("x*0.25", 400.0, 0.0), 100.0);
        assert_eq!(eval("x/4", 100.0, 0.0), 25.0);
    }

    #[test]
    fn temperature_style_formula() {
        // Raw coolant byte to Fahrenheit.
        assert_eq!(eval("(x-40)*1.8+32", 140.0, 0.0), 212.0);
    }

    #[test]
    fn both_variables() {
        assert_eq!(eval("x*256+y", 0x12 as f64, 0x34 as f64), 0x1234 as f64);
    }

    #[test]
    fn precedence_and_unary_minus() {
        assert_eq!(eval("2+3*4", 0.0, 0.0), 14.0);
        assert_eq!(eval("-x+10", 4.0, 0.0), 6.0);
        assert_eq!(eval("-(2+3)", 0.0, 0.0), -5.0);
    }

    #[test]
    fn unknown_variable_is_an_error() {
        assert_eq!(
            Conversion::parse("rpm*4"),
            Err(ConversionError::UnknownVariable("rpm".to_string()))
        );
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        assert!(matches!(
            Conversion::parse("x+1)"),
            Err(ConversionError::TrailingInput(_))
        ));
    }

    #[test]
    fn whitespace_is_free() {
        assert_eq!(eval("  x * 100 / 255 ", 255.0, 0.0), 100.0);
    }
}

//! Text expression parser.
//!
//! Recursive descent over the grammar below, producing the same
//! [`ConditionNode`] tree as the structured form. Errors carry the byte offset
//! of the offending input.
//!
//! ```text
//! expr     := and_expr ("or" and_expr)*
//! and_expr := unary ("and" unary)*
//! unary    := "not" unary | primary
//! primary  := "(" expr ")" | "@" ident | "between" "(" operand "," operand "," operand ")"
//!           | operand (cmp_op operand)?
//! operand  := number | "[" number ("," number)* "]" | ident ("." ident)? | ident "(" args ")"
//! cmp_op   := ">" | "<" | ">=" | "<=" | "==" | "!="
//! ```

use super::compile::ConditionLimits;
use super::source::{CallSource, CompareSource, ConditionNode, ConditionSource, OperandSource};
use crate::error::ConfigError;

/// Parse a text expression into a condition tree.
///
/// Parenthesis nesting is bounded by `limits.max_depth` so hostile input
/// cannot exhaust the stack.
pub fn parse_expression(input: &str, limits: &ConditionLimits) -> Result<ConditionNode, ConfigError> {
    let mut parser = Parser::new(input, limits.max_depth);
    let node = parser.parse_or()?;
    parser.skip_whitespace();
    if parser.pos < input.len() {
        return Err(parser.error(format!("unexpected '{}'", parser.peek_word())));
    }
    Ok(node)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, max_depth: usize) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
            max_depth,
        }
    }

    fn error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::Syntax {
            message: message.into(),
            position: self.pos,
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ConfigError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            Some(_) => Err(self.error(format!(
                "expected '{expected}', found '{}'",
                self.peek_word()
            ))),
            None => Err(self.error(format!("expected '{expected}', found end of input"))),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        let remaining = self.remaining();
        remaining.starts_with(keyword)
            && !remaining[keyword.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace();
        if self.peek_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn peek_word(&self) -> String {
        let word: String = self
            .remaining()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if word.is_empty() {
            self.peek()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "end of input".to_string())
        } else {
            word
        }
    }

    fn enter(&mut self) -> Result<(), ConfigError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ConfigError::DepthExceeded {
                depth: self.depth,
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_or(&mut self) -> Result<ConditionNode, ConfigError> {
        let first = self.parse_and()?;
        let mut children = vec![first];
        while self.consume_keyword("or") {
            children.push(self.parse_and()?);
        }
        Ok(fold(children, ConditionNode::Any))
    }

    fn parse_and(&mut self) -> Result<ConditionNode, ConfigError> {
        let first = self.parse_unary()?;
        let mut children = vec![first];
        while self.consume_keyword("and") {
            children.push(self.parse_unary()?);
        }
        Ok(fold(children, ConditionNode::All))
    }

    fn parse_unary(&mut self) -> Result<ConditionNode, ConfigError> {
        if self.consume_keyword("not") {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.leave();
            return Ok(ConditionNode::Not(Box::new(ConditionSource::Node(inner))));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ConditionNode, ConfigError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(self.error("expected condition, found end of input")),
            Some('(') => {
                self.advance();
                self.enter()?;
                let inner = self.parse_or()?;
                self.leave();
                self.expect_char(')')?;
                Ok(inner)
            }
            Some('@') => {
                self.advance();
                let name = self.parse_identifier()?;
                Ok(ConditionNode::Ref(name))
            }
            Some(_) if self.peek_keyword("between") => self.parse_between(),
            Some(_) => {
                let start = self.pos;
                let left = self.parse_operand()?;
                self.skip_whitespace();
                if let Some(op) = self.parse_comparator() {
                    let right = self.parse_operand()?;
                    return Ok(ConditionNode::Compare(CompareSource {
                        left,
                        op: op.to_string(),
                        right: Some(right),
                        low: None,
                        high: None,
                    }));
                }
                match left {
                    OperandSource::Call { call } => Ok(ConditionNode::Call(call)),
                    _ => Err(ConfigError::Syntax {
                        message: format!(
                            "expected comparison operator after '{}'",
                            self.input[start..self.pos].trim()
                        ),
                        position: self.pos,
                    }),
                }
            }
        }
    }

    fn parse_between(&mut self) -> Result<ConditionNode, ConfigError> {
        self.pos += "between".len();
        let args = self.parse_args()?;
        let [left, low, high]: [OperandSource; 3] = args.try_into().map_err(|args: Vec<_>| {
            ConfigError::Arity {
                function: "between".to_string(),
                expected: "3".to_string(),
                found: args.len(),
            }
        })?;
        Ok(ConditionNode::Compare(CompareSource {
            left,
            op: "between".to_string(),
            right: None,
            low: Some(low),
            high: Some(high),
        }))
    }

    fn parse_comparator(&mut self) -> Option<&'static str> {
        const OPS: [&str; 6] = [">=", "<=", "==", "!=", ">", "<"];
        let op = OPS.into_iter().find(|op| self.remaining().starts_with(op))?;
        self.pos += op.len();
        Some(op)
    }

    fn parse_operand(&mut self) -> Result<OperandSource, ConfigError> {
        self.skip_whitespace();
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c == '-' || c == '.' => {
                Ok(OperandSource::Number(self.parse_number()?))
            }
            Some('[') => self.parse_series(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let name = self.parse_identifier()?;
                self.skip_whitespace();
                if self.peek() == Some('(') {
                    let args = self.parse_args()?;
                    return Ok(OperandSource::Call {
                        call: CallSource { name, args },
                    });
                }
                if self.peek() == Some('.') {
                    self.advance();
                    let field = self.parse_identifier()?;
                    return Ok(OperandSource::Reference(format!("{name}.{field}")));
                }
                Ok(OperandSource::Reference(name))
            }
            Some(_) => Err(self.error(format!("expected operand, found '{}'", self.peek_word()))),
            None => Err(self.error("expected operand, found end of input")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<OperandSource>, ConfigError> {
        self.expect_char('(')?;
        self.enter()?;
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.advance();
            self.leave();
            return Ok(args);
        }
        loop {
            args.push(self.parse_operand()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(')') => {
                    self.advance();
                    break;
                }
                _ => {
                    return Err(self.error(format!(
                        "expected ',' or ')', found '{}'",
                        self.peek_word()
                    )))
                }
            }
        }
        self.leave();
        Ok(args)
    }

    fn parse_series(&mut self) -> Result<OperandSource, ConfigError> {
        self.expect_char('[')?;
        let mut values = vec![self.parse_number()?];
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                    values.push(self.parse_number()?);
                }
                Some(']') => {
                    self.advance();
                    return Ok(OperandSource::Series(values));
                }
                _ => {
                    return Err(self.error(format!(
                        "expected ',' or ']', found '{}'",
                        self.peek_word()
                    )))
                }
            }
        }
    }

    fn parse_identifier(&mut self) -> Result<String, ConfigError> {
        self.skip_whitespace();
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_alphabetic() || c == '_' => {}
            _ => {
                return Err(self.error(format!(
                    "expected identifier, found '{}'",
                    self.peek_word()
                )))
            }
        }
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.advance();
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_number(&mut self) -> Result<f64, ConfigError> {
        self.skip_whitespace();
        let start = self.pos;
        let mut digits = 0;
        let mut has_dot = false;

        if self.peek() == Some('-') {
            self.advance();
        }
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        if digits == 0 {
            return Err(ConfigError::Syntax {
                message: "expected number".to_string(),
                position: start,
            });
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>().map_err(|_| ConfigError::Syntax {
            message: format!("invalid number: {text}"),
            position: start,
        })
    }
}

fn fold(
    mut children: Vec<ConditionNode>,
    group: fn(Vec<ConditionSource>) -> ConditionNode,
) -> ConditionNode {
    if children.len() == 1 {
        return children.remove(0);
    }
    group(children.into_iter().map(ConditionSource::Node).collect())
}

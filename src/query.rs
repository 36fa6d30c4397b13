//! Parser for the GraphQL subset used by webhook subscription documents.
//!
//! Apps describe the shape of their payload with a subscription such as
//!
//! ```graphql
//! subscription {
//!   event {
//!     ... on OrderCreated { order { id number } }
//!   }
//! }
//! ```
//!
//! Only what payload projection needs is kept: selection sets, aliases,
//! arguments, inline fragments and named fragments. Variable definitions and
//! directives are accepted and dropped.

use std::collections::HashMap;

use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Enum(String),
    Variable(String),
    List(Vec<ArgValue>),
    Object(Vec<(String, ArgValue)>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectionSet {
    pub items: Vec<Selection>,
}

impl SelectionSet {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Field(Field),
    InlineFragment(InlineFragment),
    FragmentSpread(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, ArgValue)>,
    pub selection: SelectionSet,
}

impl Field {
    /// Key under which the field appears in the result.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn argument(&self, name: &str) -> Option<&ArgValue> {
        self.arguments
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub selection: SelectionSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentDefinition {
    pub name: String,
    pub type_condition: String,
    pub selection: SelectionSet,
}

/// A parsed subscription with its fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDocument {
    pub operation_name: Option<String>,
    pub selection: SelectionSet,
    pub fragments: HashMap<String, FragmentDefinition>,
}

impl SubscriptionDocument {
    pub fn fragment(&self, name: &str) -> Result<&FragmentDefinition, QueryError> {
        self.fragments
            .get(name)
            .ok_or_else(|| QueryError::UnknownFragment(name.to_string()))
    }

    /// The subscription root field (`event`, or an event-named field).
    pub fn root_field(&self) -> Option<&Field> {
        self.selection.items.iter().find_map(|item| match item {
            Selection::Field(field) => Some(field),
            _ => None,
        })
    }
}

/// Parse a webhook subscription document.
pub fn parse_subscription(source: &str) -> Result<SubscriptionDocument, QueryError> {
    let tokens = Lexer::new(source).tokenize()?;
    let document = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    }
    .parse_document()?;
    validate_fragments(&document)?;
    Ok(document)
}

/// Channel slugs listed in the root field's `channels` argument.
///
/// Unparseable documents yield no filter; they fail later, at generation.
pub fn filterable_channel_slugs(source: &str) -> Vec<String> {
    let Ok(document) = parse_subscription(source) else {
        return Vec::new();
    };
    let Some(ArgValue::List(values)) = document.root_field().and_then(|f| f.argument("channels")) else {
        return Vec::new();
    };
    values
        .iter()
        .filter_map(|value| match value {
            ArgValue::String(slug) => Some(slug.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Punct(char),
    Spread,
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::Syntax {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_ignored(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == ',' || c == '\u{feff}' {
                self.bump();
            } else if c == '#' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, QueryError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_ignored();
            let (line, column) = (self.line, self.column);
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(Spanned { token, line, column });
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, QueryError> {
        let Some(c) = self.peek() else {
            return Ok(Token::Eof);
        };
        match c {
            '{' | '}' | '(' | ')' | '[' | ']' | ':' | '!' | '$' | '=' | '@' | '|' | '&' => {
                self.bump();
                Ok(Token::Punct(c))
            }
            '.' => {
                if self.peek_at(1) == Some('.') && self.peek_at(2) == Some('.') {
                    self.bump();
                    self.bump();
                    self.bump();
                    Ok(Token::Spread)
                } else {
                    Err(self.error("expected `...`"))
                }
            }
            '"' => self.string(),
            '-' | '0'..='9' => self.number(),
            c if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(c) = self.peek() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        name.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                Ok(Token::Name(name))
            }
            other => Err(self.error(format!("unexpected character `{other}`"))),
        }
    }

    fn string(&mut self) -> Result<Token, QueryError> {
        if self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
            return self.block_string();
        }
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some('"') => return Ok(Token::Str(value)),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('"') => '"',
                        Some('\\') => '\\',
                        Some('/') => '/',
                        Some('b') => '\u{8}',
                        Some('f') => '\u{c}',
                        Some('n') => '\n',
                        Some('r') => '\r',
                        Some('t') => '\t',
                        Some('u') => {
                            let mut code = String::new();
                            for _ in 0..4 {
                                match self.bump() {
                                    Some(c) if c.is_ascii_hexdigit() => code.push(c),
                                    _ => return Err(self.error("invalid unicode escape")),
                                }
                            }
                            u32::from_str_radix(&code, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("invalid unicode escape"))?
                        }
                        _ => return Err(self.error("invalid escape sequence")),
                    };
                    value.push(escaped);
                }
                Some(c) => value.push(c),
            }
        }
    }

    fn block_string(&mut self) -> Result<Token, QueryError> {
        for _ in 0..3 {
            self.bump();
        }
        let mut value = String::new();
        loop {
            if self.peek() == Some('"') && self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
                for _ in 0..3 {
                    self.bump();
                }
                return Ok(Token::Str(value.trim().to_string()));
            }
            match self.bump() {
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated block string")),
            }
        }
    }

    fn number(&mut self) -> Result<Token, QueryError> {
        let mut text = String::new();
        let mut is_float = false;
        if self.peek() == Some('-') {
            text.push('-');
            self.bump();
        }
        self.digits(&mut text)?;
        if self.peek() == Some('.') {
            is_float = true;
            text.push('.');
            self.bump();
            self.digits(&mut text)?;
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            text.push('e');
            self.bump();
            if let Some(sign @ ('+' | '-')) = self.peek() {
                text.push(sign);
                self.bump();
            }
            self.digits(&mut text)?;
        }
        if is_float {
            text.parse()
                .map(Token::Float)
                .map_err(|_| self.error(format!("invalid number `{text}`")))
        } else {
            text.parse()
                .map(Token::Int)
                .map_err(|_| self.error(format!("invalid number `{text}`")))
        }
    }

    fn digits(&mut self, text: &mut String) -> Result<(), QueryError> {
        let start = text.len();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if text.len() == start {
            Err(self.error("expected digit"))
        } else {
            Ok(())
        }
    }
}

/// Deepest nesting of selection sets or literal values a document may use.
pub const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        let (line, column) = self
            .tokens
            .get(self.pos)
            .map(|t| (t.line, t.column))
            .unwrap_or((0, 0));
        QueryError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, QueryError>) -> Result<T, QueryError> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error(format!("nesting exceeds {MAX_NESTING} levels")));
        }
        self.nesting += 1;
        let result = f(self);
        self.nesting -= 1;
        result
    }

    fn is_punct(&self, c: char) -> bool {
        *self.peek() == Token::Punct(c)
    }

    fn is_name(&self, name: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == name)
    }

    fn expect_punct(&mut self, c: char) -> Result<(), QueryError> {
        if self.is_punct(c) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected `{c}`")))
        }
    }

    fn expect_name(&mut self) -> Result<String, QueryError> {
        match self.peek().clone() {
            Token::Name(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("expected name")),
        }
    }

    fn parse_document(mut self) -> Result<SubscriptionDocument, QueryError> {
        let mut operations = Vec::new();
        let mut fragments = HashMap::new();

        loop {
            match self.peek().clone() {
                Token::Eof => break,
                Token::Punct('{') => {
                    let selection = self.parse_selection_set()?;
                    operations.push((None, selection));
                }
                Token::Name(keyword) if keyword == "fragment" => {
                    let fragment = self.parse_fragment()?;
                    if fragments.contains_key(&fragment.name) {
                        return Err(self.error(format!("duplicate fragment `{}`", fragment.name)));
                    }
                    fragments.insert(fragment.name.clone(), fragment);
                }
                Token::Name(keyword) if matches!(keyword.as_str(), "subscription" | "query" | "mutation") => {
                    self.advance();
                    if keyword != "subscription" {
                        return Err(QueryError::UnsupportedOperation(keyword));
                    }
                    let name = match self.peek() {
                        Token::Name(_) => Some(self.expect_name()?),
                        _ => None,
                    };
                    if self.is_punct('(') {
                        self.skip_variable_definitions()?;
                    }
                    self.skip_directives()?;
                    let selection = self.parse_selection_set()?;
                    operations.push((name, selection));
                }
                _ => return Err(self.error("expected operation or fragment definition")),
            }
        }

        if operations.len() > 1 {
            return Err(QueryError::MultipleOperations);
        }
        let (operation_name, selection) = operations.pop().ok_or(QueryError::MissingOperation)?;
        Ok(SubscriptionDocument {
            operation_name,
            selection,
            fragments,
        })
    }

    fn skip_variable_definitions(&mut self) -> Result<(), QueryError> {
        let mut depth = 0usize;
        loop {
            match self.advance() {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Token::Eof => return Err(self.error("unterminated variable definitions")),
                _ => {}
            }
        }
    }

    fn skip_directives(&mut self) -> Result<(), QueryError> {
        while self.is_punct('@') {
            self.advance();
            self.expect_name()?;
            if self.is_punct('(') {
                self.parse_arguments()?;
            }
        }
        Ok(())
    }

    fn parse_fragment(&mut self) -> Result<FragmentDefinition, QueryError> {
        self.advance();
        if self.is_name("on") {
            return Err(self.error("fragment cannot be named `on`"));
        }
        let name = self.expect_name()?;
        if !self.is_name("on") {
            return Err(self.error("expected `on`"));
        }
        self.advance();
        let type_condition = self.expect_name()?;
        self.skip_directives()?;
        let selection = self.parse_selection_set()?;
        Ok(FragmentDefinition {
            name,
            type_condition,
            selection,
        })
    }

    fn parse_selection_set(&mut self) -> Result<SelectionSet, QueryError> {
        self.nested(Self::parse_selection_items)
    }

    fn parse_selection_items(&mut self) -> Result<SelectionSet, QueryError> {
        self.expect_punct('{')?;
        let mut items = Vec::new();
        while !self.is_punct('}') {
            if *self.peek() == Token::Eof {
                return Err(self.error("unterminated selection set"));
            }
            items.push(self.parse_selection()?);
        }
        if items.is_empty() {
            return Err(self.error("selection set cannot be empty"));
        }
        self.advance();
        Ok(SelectionSet { items })
    }

    fn parse_selection(&mut self) -> Result<Selection, QueryError> {
        if *self.peek() == Token::Spread {
            self.advance();
            if self.is_name("on") {
                self.advance();
                let type_condition = self.expect_name()?;
                self.skip_directives()?;
                let selection = self.parse_selection_set()?;
                return Ok(Selection::InlineFragment(InlineFragment {
                    type_condition: Some(type_condition),
                    selection,
                }));
            }
            if self.is_punct('{') || self.is_punct('@') {
                self.skip_directives()?;
                let selection = self.parse_selection_set()?;
                return Ok(Selection::InlineFragment(InlineFragment {
                    type_condition: None,
                    selection,
                }));
            }
            let name = self.expect_name()?;
            self.skip_directives()?;
            return Ok(Selection::FragmentSpread(name));
        }

        let first = self.expect_name()?;
        let (alias, name) = if self.is_punct(':') {
            self.advance();
            (Some(first), self.expect_name()?)
        } else {
            (None, first)
        };
        let arguments = if self.is_punct('(') {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        self.skip_directives()?;
        let selection = if self.is_punct('{') {
            self.parse_selection_set()?
        } else {
            SelectionSet::default()
        };
        Ok(Selection::Field(Field {
            alias,
            name,
            arguments,
            selection,
        }))
    }

    fn parse_arguments(&mut self) -> Result<Vec<(String, ArgValue)>, QueryError> {
        self.expect_punct('(')?;
        let mut arguments = Vec::new();
        while !self.is_punct(')') {
            let name = self.expect_name()?;
            self.expect_punct(':')?;
            let value = self.parse_value()?;
            arguments.push((name, value));
        }
        if arguments.is_empty() {
            return Err(self.error("argument list cannot be empty"));
        }
        self.advance();
        Ok(arguments)
    }

    fn parse_value(&mut self) -> Result<ArgValue, QueryError> {
        self.nested(Self::parse_value_token)
    }

    fn parse_value_token(&mut self) -> Result<ArgValue, QueryError> {
        match self.advance() {
            Token::Punct('$') => Ok(ArgValue::Variable(self.expect_name()?)),
            Token::Int(value) => Ok(ArgValue::Int(value)),
            Token::Float(value) => Ok(ArgValue::Float(value)),
            Token::Str(value) => Ok(ArgValue::String(value)),
            Token::Name(name) => Ok(match name.as_str() {
                "true" => ArgValue::Bool(true),
                "false" => ArgValue::Bool(false),
                "null" => ArgValue::Null,
                _ => ArgValue::Enum(name),
            }),
            Token::Punct('[') => {
                let mut items = Vec::new();
                while !self.is_punct(']') {
                    if *self.peek() == Token::Eof {
                        return Err(self.error("unterminated list"));
                    }
                    items.push(self.parse_value()?);
                }
                self.advance();
                Ok(ArgValue::List(items))
            }
            Token::Punct('{') => {
                let mut fields = Vec::new();
                while !self.is_punct('}') {
                    let name = self.expect_name()?;
                    self.expect_punct(':')?;
                    fields.push((name, self.parse_value()?));
                }
                self.advance();
                Ok(ArgValue::Object(fields))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected value"))
            }
        }
    }
}

fn collect_spreads<'a>(selection: &'a SelectionSet, out: &mut Vec<&'a str>) {
    for item in &selection.items {
        match item {
            Selection::Field(field) => collect_spreads(&field.selection, out),
            Selection::InlineFragment(fragment) => collect_spreads(&fragment.selection, out),
            Selection::FragmentSpread(name) => out.push(name),
        }
    }
}

fn validate_fragments(document: &SubscriptionDocument) -> Result<(), QueryError> {
    let mut spreads = Vec::new();
    collect_spreads(&document.selection, &mut spreads);
    for name in spreads {
        document.fragment(name)?;
    }

    let mut depths = HashMap::new();
    for name in document.fragments.keys() {
        let mut stack = Vec::new();
        visit_fragment(document, name, &mut stack, &mut depths)?;
    }
    Ok(())
}

/// Length of the longest spread chain starting at `name`.
fn visit_fragment<'a>(
    document: &'a SubscriptionDocument,
    name: &'a str,
    stack: &mut Vec<&'a str>,
    depths: &mut HashMap<&'a str, usize>,
) -> Result<usize, QueryError> {
    if let Some(depth) = depths.get(name) {
        return Ok(*depth);
    }
    if stack.contains(&name) {
        return Err(QueryError::FragmentCycle(name.to_string()));
    }
    if stack.len() >= MAX_NESTING {
        return Err(QueryError::NestingTooDeep { max_depth: MAX_NESTING });
    }
    let fragment = document.fragment(name)?;
    stack.push(name);
    let mut spreads = Vec::new();
    collect_spreads(&fragment.selection, &mut spreads);
    let mut deepest = 0;
    for spread in spreads {
        deepest = deepest.max(visit_fragment(document, spread, stack, depths)?);
    }
    stack.pop();

    let depth = deepest + 1;
    if depth > MAX_NESTING {
        return Err(QueryError::NestingTooDeep { max_depth: MAX_NESTING });
    }
    depths.insert(name, depth);
    Ok(depth)
}

//! A hand-rolled EDN subset: enough to round-trip the event vectors this
//! wire format needs (nil, booleans, numbers, strings, keywords, namespaced
//! symbols, vectors, maps, sets). Not a general EDN reader — no tagged
//! literals, no chars, no ratios.

use std::fmt::Write as _;

/// A namespaced identifier, used for both `:keyword` and `symbol` values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident {
    pub namespace: Option<String>,
    pub name: String,
}

impl Ident {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Parse `ns/name` or bare `name` into an [`Ident`].
    pub fn parse(text: &str) -> Self {
        match text.split_once('/') {
            Some((ns, name)) if !ns.is_empty() => Ident::namespaced(ns, name),
            _ => Ident::new(text),
        }
    }

    fn write(&self, out: &mut String) {
        if let Some(ns) = &self.namespace {
            out.push_str(ns);
            out.push('/');
        }
        out.push_str(&self.name);
    }
}

impl std::fmt::Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}/{}", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// A value in the EDN subset this wire format speaks.
#[derive(Debug, Clone, PartialEq)]
pub enum EdnValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Keyword(Ident),
    Symbol(Ident),
    Vector(Vec<EdnValue>),
    /// Key/value pairs in encounter order — EDN maps are unordered in
    /// principle, but preserving insertion order keeps serialization
    /// deterministic and round-trips fine for our purposes.
    Map(Vec<(EdnValue, EdnValue)>),
    Set(Vec<EdnValue>),
}

impl EdnValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EdnValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[EdnValue]> {
        match self {
            EdnValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(EdnValue, EdnValue)]> {
        match self {
            EdnValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a map entry by string key (EDN maps in this wire format key
    /// by keyword or string interchangeably on read).
    pub fn map_get(&self, key: &str) -> Option<&EdnValue> {
        self.as_map()?.iter().find_map(|(k, v)| {
            let matches = match k {
                EdnValue::Keyword(id) if id.namespace.is_none() => id.name == key,
                EdnValue::Str(s) => s == key,
                _ => false,
            };
            matches.then_some(v)
        })
    }
}

impl From<&str> for EdnValue {
    fn from(s: &str) -> Self {
        EdnValue::Str(s.to_owned())
    }
}

impl From<String> for EdnValue {
    fn from(s: String) -> Self {
        EdnValue::Str(s)
    }
}

impl From<i64> for EdnValue {
    fn from(n: i64) -> Self {
        EdnValue::Int(n)
    }
}

impl From<bool> for EdnValue {
    fn from(b: bool) -> Self {
        EdnValue::Bool(b)
    }
}

/// An error encountered while parsing EDN text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("EDN parse error at byte {pos}: {reason}")]
pub struct EdnParseError {
    pub pos: u32,
    pub reason: String,
}

fn err(pos: u32, reason: impl Into<String>) -> EdnParseError {
    EdnParseError {
        pos,
        reason: reason.into(),
    }
}

/// Byte-offset cursor over the source text, mirroring the cursor used by
/// this pack's hand-written lexers.
struct Cursor<'src> {
    source: &'src str,
    pos: u32,
    chars: std::str::Chars<'src>,
}

impl<'src> Cursor<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            source,
            pos: 0,
            chars: source.chars(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.clone().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.pos += c.len_utf8() as u32;
        Some(c)
    }

    fn is_eof(&self) -> bool {
        self.peek().is_none()
    }

    fn eat_while(&mut self, predicate: impl Fn(char) -> bool) {
        while let Some(c) = self.peek() {
            if predicate(c) {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn slice(&self, start: u32, end: u32) -> &'src str {
        &self.source[start as usize..end as usize]
    }

    fn skip_whitespace_and_commas(&mut self) {
        self.eat_while(|c| c.is_whitespace() || c == ',');
    }
}

fn is_symbol_char(c: char) -> bool {
    c.is_alphanumeric()
        || matches!(
            c,
            '-' | '_' | '.' | '*' | '+' | '!' | '?' | '<' | '>' | '=' | '&' | '%' | '$' | '/'
        )
}

/// Parse a single EDN value out of `text`. Trailing whitespace after the
/// value is allowed; trailing non-whitespace is an error.
pub fn parse(text: &str) -> Result<EdnValue, EdnParseError> {
    let mut cursor = Cursor::new(text);
    cursor.skip_whitespace_and_commas();
    let value = parse_value(&mut cursor)?;
    cursor.skip_whitespace_and_commas();
    if !cursor.is_eof() {
        return Err(err(cursor.pos, "trailing input after value"));
    }
    Ok(value)
}

fn parse_value(cursor: &mut Cursor<'_>) -> Result<EdnValue, EdnParseError> {
    cursor.skip_whitespace_and_commas();
    match cursor.peek() {
        None => Err(err(cursor.pos, "unexpected end of input")),
        Some('[') => parse_seq(cursor, '[', ']').map(EdnValue::Vector),
        Some('{') => parse_map(cursor),
        Some('#') => parse_set(cursor),
        Some('"') => parse_string(cursor).map(EdnValue::Str),
        Some(':') => parse_keyword(cursor),
        Some(c) if c.is_ascii_digit() => parse_number(cursor),
        Some('-') => parse_number_or_symbol(cursor),
        Some(c) if is_symbol_char(c) => parse_symbol_like(cursor),
        Some(c) => Err(err(cursor.pos, format!("unexpected character '{c}'"))),
    }
}

fn parse_seq(
    cursor: &mut Cursor<'_>,
    open: char,
    close: char,
) -> Result<Vec<EdnValue>, EdnParseError> {
    let start = cursor.pos;
    let opened = cursor.advance();
    if opened != Some(open) {
        return Err(err(start, format!("expected '{open}'")));
    }
    let mut items = Vec::new();
    loop {
        cursor.skip_whitespace_and_commas();
        match cursor.peek() {
            None => return Err(err(cursor.pos, format!("unterminated sequence, expected '{close}'"))),
            Some(c) if c == close => {
                cursor.advance();
                return Ok(items);
            }
            _ => items.push(parse_value(cursor)?),
        }
    }
}

fn parse_map(cursor: &mut Cursor<'_>) -> Result<EdnValue, EdnParseError> {
    let entries = parse_seq(cursor, '{', '}')?;
    if entries.len() % 2 != 0 {
        return Err(err(cursor.pos, "map literal has an odd number of forms"));
    }
    let mut pairs = Vec::with_capacity(entries.len() / 2);
    let mut iter = entries.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    Ok(EdnValue::Map(pairs))
}

fn parse_set(cursor: &mut Cursor<'_>) -> Result<EdnValue, EdnParseError> {
    let start = cursor.pos;
    if cursor.advance() != Some('#') {
        return Err(err(start, "expected '#'"));
    }
    if cursor.advance() != Some('{') {
        return Err(err(start, "expected '#{' for a set literal"));
    }
    let mut items = Vec::new();
    loop {
        cursor.skip_whitespace_and_commas();
        match cursor.peek() {
            None => return Err(err(cursor.pos, "unterminated set, expected '}'")),
            Some('}') => {
                cursor.advance();
                return Ok(EdnValue::Set(items));
            }
            _ => items.push(parse_value(cursor)?),
        }
    }
}

fn parse_string(cursor: &mut Cursor<'_>) -> Result<String, EdnParseError> {
    let start = cursor.pos;
    if cursor.advance() != Some('"') {
        return Err(err(start, "expected '\"'"));
    }
    let mut out = String::new();
    loop {
        match cursor.advance() {
            None => return Err(err(cursor.pos, "unterminated string literal")),
            Some('"') => return Ok(out),
            Some('\\') => match cursor.advance() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => out.push(other),
                None => return Err(err(cursor.pos, "unterminated escape sequence")),
            },
            Some(c) => out.push(c),
        }
    }
}

fn parse_keyword(cursor: &mut Cursor<'_>) -> Result<EdnValue, EdnParseError> {
    let start = cursor.pos;
    cursor.advance(); // ':'
    let token_start = cursor.pos;
    cursor.eat_while(is_symbol_char);
    if cursor.pos == token_start {
        return Err(err(start, "empty keyword"));
    }
    let text = cursor.slice(token_start, cursor.pos);
    Ok(EdnValue::Keyword(Ident::parse(text)))
}

fn parse_symbol_like(cursor: &mut Cursor<'_>) -> Result<EdnValue, EdnParseError> {
    let start = cursor.pos;
    cursor.eat_while(is_symbol_char);
    let text = cursor.slice(start, cursor.pos);
    match text {
        "nil" => Ok(EdnValue::Nil),
        "true" => Ok(EdnValue::Bool(true)),
        "false" => Ok(EdnValue::Bool(false)),
        _ => Ok(EdnValue::Symbol(Ident::parse(text))),
    }
}

fn parse_number_or_symbol(cursor: &mut Cursor<'_>) -> Result<EdnValue, EdnParseError> {
    // A leading '-' could start a negative number or a symbol like `-main`.
    let start = cursor.pos;
    let mut probe = cursor.chars.clone();
    probe.next(); // skip '-'
    if probe.next().is_some_and(|c| c.is_ascii_digit()) {
        parse_number(cursor)
    } else {
        cursor.advance();
        let token_start = start;
        cursor.eat_while(is_symbol_char);
        let text = cursor.slice(token_start, cursor.pos);
        Ok(EdnValue::Symbol(Ident::parse(text)))
    }
}

fn parse_number(cursor: &mut Cursor<'_>) -> Result<EdnValue, EdnParseError> {
    let start = cursor.pos;
    if cursor.peek() == Some('-') {
        cursor.advance();
    }
    cursor.eat_while(|c| c.is_ascii_digit());
    let mut is_float = false;
    if cursor.peek() == Some('.') {
        is_float = true;
        cursor.advance();
        cursor.eat_while(|c| c.is_ascii_digit());
    }
    if matches!(cursor.peek(), Some('e') | Some('E')) {
        is_float = true;
        cursor.advance();
        if matches!(cursor.peek(), Some('+') | Some('-')) {
            cursor.advance();
        }
        cursor.eat_while(|c| c.is_ascii_digit());
    }
    let text = cursor.slice(start, cursor.pos);
    if is_float {
        text.parse::<f64>()
            .map(EdnValue::Float)
            .map_err(|e| err(start, format!("invalid number '{text}': {e}")))
    } else {
        text.parse::<i64>()
            .map(EdnValue::Int)
            .map_err(|e| err(start, format!("invalid number '{text}': {e}")))
    }
}

/// Serialize a value to its EDN text representation.
pub fn write(value: &EdnValue) -> String {
    let mut out = String::new();
    write_into(value, &mut out);
    out
}

fn write_into(value: &EdnValue, out: &mut String) {
    match value {
        EdnValue::Nil => out.push_str("nil"),
        EdnValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        EdnValue::Int(n) => {
            let _ = write!(out, "{n}");
        }
        EdnValue::Float(n) => {
            let _ = write!(out, "{n}");
        }
        EdnValue::Str(s) => write_string(s, out),
        EdnValue::Keyword(id) => {
            out.push(':');
            id.write(out);
        }
        EdnValue::Symbol(id) => id.write(out),
        EdnValue::Vector(items) => write_seq(items, '[', ']', out),
        EdnValue::Map(pairs) => {
            out.push('{');
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_into(k, out);
                out.push(' ');
                write_into(v, out);
            }
            out.push('}');
        }
        EdnValue::Set(items) => {
            out.push('#');
            write_seq(items, '{', '}', out);
        }
    }
}

fn write_seq(items: &[EdnValue], open: char, close: char, out: &mut String) {
    out.push(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write_into(item, out);
    }
    out.push(close);
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

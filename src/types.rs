//! Type language: parsing, printing, and introspection of LabRAD type tags.
//!
//! A `Type` is a value object: two `Type`s are equal iff their tags are
//! structurally identical. Cluster child offsets and the overall inline
//! width are derived once, at parse/construction time, and cached on the
//! `Cluster` variant rather than recomputed on every access.

use std::{error, fmt};

/// The LabRAD type universe (§3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Empty,
    Bool,
    Int,
    Word,
    Str,
    Value(Option<String>),
    Complex(Option<String>),
    Time,
    List {
        element: Box<Type>,
        depth: usize,
    },
    Cluster {
        children: Vec<Type>,
        /// Byte offset of each child within the cluster's inline area.
        offsets: Vec<usize>,
    },
    Error {
        payload: Box<Type>,
    },
}

/// Malformed type tag: carries the char position at which parsing failed
/// and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeParseError {
    pub position: usize,
    pub reason: String,
}

impl fmt::Display for TypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type parse error at position {}: {}", self.position, self.reason)
    }
}

impl error::Error for TypeParseError {}

impl Type {
    /// Build a `List` with the given element type and depth, clamping
    /// nothing: depth `0` is a caller bug, not normalized away.
    pub fn list(depth: usize, element: Type) -> Type {
        Type::List {
            element: Box::new(element),
            depth,
        }
    }

    /// Build a `Cluster`, computing and caching child offsets.
    pub fn cluster(children: Vec<Type>) -> Type {
        let mut offsets = Vec::with_capacity(children.len());
        let mut offset = 0;
        for child in &children {
            offsets.push(offset);
            offset += child.inline_width();
        }
        Type::Cluster { children, offsets }
    }

    pub fn error(payload: Type) -> Type {
        Type::Error {
            payload: Box::new(payload),
        }
    }

    /// Parse a type tag (§4.B grammar). One-pass, fails on the first
    /// malformed construct.
    pub fn parse(tag: &str) -> Result<Type, TypeParseError> {
        let chars: Vec<char> = tag.chars().collect();
        let mut parser = Parser { chars: &chars, pos: 0 };
        let ty = parser.parse_type()?;
        parser.skip_ignorable();
        if parser.pos != parser.chars.len() {
            return Err(TypeParseError {
                position: parser.pos,
                reason: format!("unexpected trailing character '{}'", parser.chars[parser.pos]),
            });
        }
        Ok(ty)
    }

    /// Print the canonical wire tag for this type (inverse of `parse`).
    pub fn tag(&self) -> String {
        let mut out = String::new();
        self.write_tag(&mut out);
        out
    }

    fn write_tag(&self, out: &mut String) {
        match self {
            Type::Empty => {}
            Type::Bool => out.push('b'),
            Type::Int => out.push('i'),
            Type::Word => out.push('w'),
            Type::Str => out.push('s'),
            Type::Time => out.push('t'),
            Type::Value(units) => {
                out.push('v');
                write_units(out, units);
            }
            Type::Complex(units) => {
                out.push('c');
                write_units(out, units);
            }
            Type::List { element, depth } => {
                out.push('*');
                if *depth != 1 {
                    out.push_str(&depth.to_string());
                }
                element.write_tag(out);
            }
            Type::Cluster { children, .. } => {
                out.push('(');
                for child in children {
                    child.write_tag(out);
                }
                out.push(')');
            }
            Type::Error { payload } => {
                out.push('E');
                if !matches!(payload.as_ref(), Type::Empty) {
                    payload.write_tag(out);
                }
            }
        }
    }

    /// Human-friendly rendering, e.g. `"*2(int, string)"`.
    pub fn pretty(&self) -> String {
        match self {
            Type::Empty => "none".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Int => "int".to_string(),
            Type::Word => "word".to_string(),
            Type::Str => "string".to_string(),
            Type::Time => "time".to_string(),
            Type::Value(None) => "value".to_string(),
            Type::Value(Some(u)) => format!("value[{u}]"),
            Type::Complex(None) => "complex".to_string(),
            Type::Complex(Some(u)) => format!("complex[{u}]"),
            Type::List { element, depth } => {
                if *depth == 1 {
                    format!("*{}", element.pretty())
                } else {
                    format!("*{}{}", depth, element.pretty())
                }
            }
            Type::Cluster { children, .. } => {
                let parts: Vec<String> = children.iter().map(Type::pretty).collect();
                format!("({})", parts.join(", "))
            }
            Type::Error { payload } => {
                if matches!(payload.as_ref(), Type::Empty) {
                    "error".to_string()
                } else {
                    format!("error({})", payload.pretty())
                }
            }
        }
    }

    /// Width, in bytes, of this type's inline area.
    pub fn inline_width(&self) -> usize {
        match self {
            Type::Empty => 0,
            Type::Bool => 1,
            Type::Int | Type::Word | Type::Str => 4,
            Type::Value(_) => 8,
            Type::Complex(_) | Type::Time => 16,
            Type::List { depth, .. } => 4 * depth + 4,
            Type::Cluster { children, .. } => children.iter().map(Type::inline_width).sum(),
            Type::Error { payload } => 8 + payload.inline_width(),
        }
    }

    /// A type is fixed-width iff it contains no `Str`, `List`, or `Error`
    /// anywhere in its structure.
    pub fn is_fixed(&self) -> bool {
        match self {
            Type::Str | Type::List { .. } | Type::Error { .. } => false,
            Type::Cluster { children, .. } => children.iter().all(Type::is_fixed),
            _ => true,
        }
    }

    /// Number of leading `*` dimensions. Panics on a non-`List` type.
    pub fn depth(&self) -> usize {
        match self {
            Type::List { depth, .. } => *depth,
            other => panic!("depth() called on non-list type {}", other.tag()),
        }
    }

    /// Number of children. Panics on a non-`Cluster` type.
    pub fn size(&self) -> usize {
        match self {
            Type::Cluster { children, .. } => children.len(),
            other => panic!("size() called on non-cluster type {}", other.tag()),
        }
    }

    /// The element type of a `List`, or the `i`-th child of a `Cluster`.
    /// Panics on any other type, or an out-of-range cluster index.
    pub fn subtype(&self, i: usize) -> &Type {
        match self {
            Type::List { element, .. } => element,
            Type::Cluster { children, .. } => &children[i],
            other => panic!("subtype() called on non-composite type {}", other.tag()),
        }
    }

    /// Byte offset of the `i`-th cluster child within the inline area.
    /// Panics on a non-`Cluster` type.
    pub fn cluster_offset(&self, i: usize) -> usize {
        match self {
            Type::Cluster { offsets, .. } => offsets[i],
            other => panic!("cluster_offset() called on non-cluster type {}", other.tag()),
        }
    }

    /// Units string, for `Value`/`Complex` only.
    pub fn units(&self) -> Option<&str> {
        match self {
            Type::Value(u) | Type::Complex(u) => u.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

fn write_units(out: &mut String, units: &Option<String>) {
    if let Some(u) = units {
        out.push('[');
        out.push_str(u);
        out.push(']');
    }
}

fn is_ignorable(c: char) -> bool {
    c.is_whitespace() || c == ','
}

struct Parser<'a> {
    chars: &'a [char],
    pos: usize,
}

impl Parser<'_> {
    fn skip_ignorable(&mut self) {
        while self.pos < self.chars.len() && is_ignorable(self.chars[self.pos]) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn err(&self, reason: impl Into<String>) -> TypeParseError {
        TypeParseError {
            position: self.pos,
            reason: reason.into(),
        }
    }

    fn parse_type(&mut self) -> Result<Type, TypeParseError> {
        self.skip_ignorable();
        match self.peek() {
            None => Ok(Type::Empty),
            Some('_') => {
                self.advance();
                Ok(Type::Empty)
            }
            Some('b') => {
                self.advance();
                Ok(Type::Bool)
            }
            Some('i') => {
                self.advance();
                Ok(Type::Int)
            }
            Some('w') => {
                self.advance();
                Ok(Type::Word)
            }
            Some('t') => {
                self.advance();
                Ok(Type::Time)
            }
            Some('s') => {
                self.advance();
                Ok(Type::Str)
            }
            Some('v') => {
                self.advance();
                let units = self.parse_units()?;
                Ok(Type::Value(units))
            }
            Some('c') => {
                self.advance();
                let units = self.parse_units()?;
                Ok(Type::Complex(units))
            }
            Some('*') => {
                self.advance();
                let depth = self.parse_depth();
                let element = self.parse_type()?;
                Ok(Type::list(depth, element))
            }
            Some('(') => self.parse_cluster(),
            Some('E') => {
                self.advance();
                self.skip_ignorable();
                let payload = match self.peek() {
                    None | Some(')') => Type::Empty,
                    _ => self.parse_type()?,
                };
                Ok(Type::error(payload))
            }
            Some(c) => Err(self.err(format!("unexpected character '{c}'"))),
        }
    }

    fn parse_depth(&mut self) -> usize {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            1
        } else {
            self.chars[start..self.pos]
                .iter()
                .collect::<String>()
                .parse()
                .unwrap_or(1)
        }
    }

    fn parse_units(&mut self) -> Result<Option<String>, TypeParseError> {
        self.skip_ignorable();
        if self.peek() != Some('[') {
            return Ok(None);
        }
        self.advance();
        let start = self.pos;
        while self.peek().is_some_and(|c| c != ']') {
            self.pos += 1;
        }
        if self.peek() != Some(']') {
            return Err(self.err("unterminated units, missing ']'"));
        }
        let units: String = self.chars[start..self.pos].iter().collect();
        self.advance();
        Ok(Some(units))
    }

    fn parse_cluster(&mut self) -> Result<Type, TypeParseError> {
        self.advance(); // '('
        let mut children = Vec::new();
        loop {
            self.skip_ignorable();
            match self.peek() {
                Some(')') => break,
                None => return Err(self.err("unterminated cluster, missing ')'")),
                _ => children.push(self.parse_type()?),
            }
        }
        self.advance(); // ')'
        if children.is_empty() {
            return Err(self.err("empty cluster"));
        }
        Ok(Type::cluster(children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scalars() {
        assert_eq!(Type::parse("i").unwrap(), Type::Int);
        assert_eq!(Type::parse("w").unwrap(), Type::Word);
        assert_eq!(Type::parse("b").unwrap(), Type::Bool);
        assert_eq!(Type::parse("s").unwrap(), Type::Str);
        assert_eq!(Type::parse("t").unwrap(), Type::Time);
        assert_eq!(Type::parse("").unwrap(), Type::Empty);
        assert_eq!(Type::parse("_").unwrap(), Type::Empty);
    }

    #[test]
    fn parse_value_and_complex_units() {
        assert_eq!(Type::parse("v").unwrap(), Type::Value(None));
        assert_eq!(
            Type::parse("v[m/s]").unwrap(),
            Type::Value(Some("m/s".to_string()))
        );
        assert_eq!(
            Type::parse("c[m/s]").unwrap(),
            Type::Complex(Some("m/s".to_string()))
        );
        // Units are preserved verbatim, never normalized.
        assert_ne!(
            Type::parse("v[m/s]").unwrap(),
            Type::parse("v[m s^-1]").unwrap()
        );
    }

    #[test]
    fn parse_list_depth() {
        let t1 = Type::parse("*i").unwrap();
        assert_eq!(t1, Type::list(1, Type::Int));
        assert_eq!(t1.inline_width(), 8);

        let t2 = Type::parse("*2i").unwrap();
        assert_eq!(t2, Type::list(2, Type::Int));
        assert_eq!(t2.inline_width(), 12);
    }

    #[test]
    fn parse_cluster_and_offsets() {
        let t = Type::parse("(bi)").unwrap();
        assert_eq!(t.size(), 2);
        assert_eq!(t.cluster_offset(0), 0);
        assert_eq!(t.cluster_offset(1), 1);
        assert_eq!(t.inline_width(), 5);
        assert!(t.is_fixed());
    }

    #[test]
    fn empty_cluster_is_an_error() {
        assert!(Type::parse("()").is_err());
    }

    #[test]
    fn error_type_default_payload_is_empty() {
        let t = Type::parse("E").unwrap();
        assert_eq!(t, Type::error(Type::Empty));
        assert_eq!(t.inline_width(), 8);
        assert!(!t.is_fixed());
    }

    #[test]
    fn error_type_with_payload() {
        let t = Type::parse("Ei").unwrap();
        assert_eq!(t, Type::error(Type::Int));
        assert_eq!(t.inline_width(), 12);
    }

    #[test]
    fn whitespace_and_commas_ignored_in_clusters() {
        let a = Type::parse("(b, i)").unwrap();
        let b = Type::parse("(bi)").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tag_fixpoint() {
        for s in ["i", "w", "b", "s", "t", "v", "v[m]", "c[m/s]", "*i", "*2i", "(bi)", "E", "Ei", "*2(is)"] {
            let t = Type::parse(s).unwrap();
            let rt = Type::parse(&t.tag()).unwrap();
            assert_eq!(t, rt, "round trip failed for {s}");
        }
    }

    #[test]
    fn pretty_printing() {
        let t = Type::parse("*2(is)").unwrap();
        assert_eq!(t.pretty(), "*2(int, string)");
    }

    #[test]
    fn malformed_tag_reports_position() {
        let err = Type::parse("(bx)").unwrap_err();
        assert_eq!(err.position, 2);
    }

    #[test]
    fn depth_reports_leading_star_count() {
        assert_eq!(Type::parse("*i").unwrap().depth(), 1);
        assert_eq!(Type::parse("*2i").unwrap().depth(), 2);
        assert_eq!(Type::parse("*3(bi)").unwrap().depth(), 3);
    }

    #[test]
    #[should_panic(expected = "depth() called on non-list type")]
    fn depth_panics_on_non_list() {
        Type::parse("i").unwrap().depth();
    }

    #[test]
    fn subtype_of_list_is_element_type() {
        let t = Type::parse("*2i").unwrap();
        assert_eq!(t.subtype(0), &Type::Int);
    }

    #[test]
    fn subtype_of_cluster_is_ith_child() {
        let t = Type::parse("(bi s)").unwrap();
        assert_eq!(t.subtype(0), &Type::Bool);
        assert_eq!(t.subtype(1), &Type::Int);
        assert_eq!(t.subtype(2), &Type::Str);
    }

    #[test]
    #[should_panic(expected = "subtype() called on non-composite type")]
    fn subtype_panics_on_scalar() {
        Type::parse("i").unwrap().subtype(0);
    }

    #[test]
    fn units_present_for_value_and_complex() {
        assert_eq!(Type::parse("v[m/s]").unwrap().units(), Some("m/s"));
        assert_eq!(Type::parse("c[m/s]").unwrap().units(), Some("m/s"));
        assert_eq!(Type::parse("v").unwrap().units(), None);
        assert_eq!(Type::parse("c").unwrap().units(), None);
    }

    #[test]
    fn units_absent_for_other_variants() {
        for tag in ["i", "w", "b", "s", "t", "*i", "(bi)", "E"] {
            assert_eq!(Type::parse(tag).unwrap().units(), None, "tag {tag}");
        }
    }
}

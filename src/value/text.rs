//! Structured-text codec for value trees
//!
//! Converts between a node tree and a linear nested key/value and
//! ordered-list representation:
//!
//! ```text
//! {"task": "plan the week", "steps": ["draft", "review"], "meta": {"owner": "agent"}}
//! ```
//!
//! Leaves serialize as quoted strings; branches serialize as an object when
//! every child carries a label and as a list when none does. Malformed input
//! is rejected with `MalformedInput` and any partially built nodes are
//! released, a parse never leaks pool blocks.

use super::node::{NodeArena, NodeId};
use crate::error::{Error, Result};
use crate::slab::SlabPool;

/// Maximum nesting depth accepted by both directions of the codec.
const MAX_DEPTH: usize = 64;

/// Serialize a tree to its text form.
pub fn to_text(arena: &NodeArena, pool: &SlabPool, root: NodeId) -> Result<String> {
    let mut out = String::new();
    write_value(arena, pool, root, 0, &mut out)?;
    Ok(out)
}

/// Parse text into a freshly built tree.
pub fn from_text(arena: &mut NodeArena, pool: &mut SlabPool, input: &str) -> Result<NodeId> {
    let mut parser = Parser {
        arena,
        pool,
        bytes: input.as_bytes(),
        pos: 0,
    };
    parser.skip_ws();
    let root = parser.parse_value(0)?;
    parser.skip_ws();
    if parser.pos != parser.bytes.len() {
        let pos = parser.pos;
        parser.arena.destroy(parser.pool, root)?;
        return Err(Error::MalformedInput(format!(
            "Trailing content at byte {}",
            pos
        )));
    }
    Ok(root)
}

/// Append a quoted, escaped string to `out`. Shared with the persistence
/// layer, which composes snapshot text directly.
pub(crate) fn write_quoted(out: &mut String, s: &str) {
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

fn write_value(
    arena: &NodeArena,
    pool: &SlabPool,
    node: NodeId,
    depth: usize,
    out: &mut String,
) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::MalformedInput(format!(
            "Value tree deeper than {} levels",
            MAX_DEPTH
        )));
    }

    if let Some(payload) = arena.payload(pool, node)? {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::MalformedInput(format!("Non-UTF-8 payload: {}", e)))?;
        write_quoted(out, text);
        return Ok(());
    }

    let children = arena.children(node)?;
    let labeled = children
        .iter()
        .filter(|&&c| matches!(arena.label(pool, c), Ok(Some(_))))
        .count();

    if labeled == children.len() {
        // Object (an empty branch serializes as an empty object)
        out.push('{');
        for (i, &child) in children.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let key = arena
                .label(pool, child)?
                .ok_or_else(|| Error::MalformedInput("Missing child label".to_string()))?;
            write_quoted(out, key);
            out.push_str(": ");
            write_value(arena, pool, child, depth + 1, out)?;
        }
        out.push('}');
        Ok(())
    } else if labeled == 0 {
        // Ordered list
        out.push('[');
        for (i, &child) in children.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_value(arena, pool, child, depth + 1, out)?;
        }
        out.push(']');
        Ok(())
    } else {
        Err(Error::MalformedInput(
            "Branch mixes labeled and unlabeled children".to_string(),
        ))
    }
}

struct Parser<'a> {
    arena: &'a mut NodeArena,
    pool: &'a mut SlabPool,
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn parse_value(&mut self, depth: usize) -> Result<NodeId> {
        if depth > MAX_DEPTH {
            return Err(Error::MalformedInput(format!(
                "Input nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        match self.peek() {
            Some(b'"') => {
                let text = self.parse_string()?;
                self.arena.create_leaf(self.pool, text.as_bytes())
            }
            Some(b'{') => self.parse_object(depth),
            Some(b'[') => self.parse_list(depth),
            Some(c) => Err(Error::MalformedInput(format!(
                "Unexpected byte '{}' at {}",
                c as char, self.pos
            ))),
            None => Err(Error::MalformedInput("Unexpected end of input".to_string())),
        }
    }

    fn parse_object(&mut self, depth: usize) -> Result<NodeId> {
        self.expect(b'{')?;
        let branch = self.arena.create_branch()?;

        match self.fill_object(branch, depth) {
            Ok(()) => Ok(branch),
            Err(e) => {
                self.arena.destroy(self.pool, branch)?;
                Err(e)
            }
        }
    }

    fn fill_object(&mut self, branch: NodeId, depth: usize) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(());
        }
        loop {
            self.skip_ws();
            let key = self.parse_string()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();

            let child = self.parse_value(depth + 1)?;
            if let Err(e) = self
                .arena
                .append_child_with_key(self.pool, branch, child, &key)
            {
                self.arena.destroy(self.pool, child)?;
                return Err(e);
            }

            self.skip_ws();
            match self.next() {
                Some(b',') => continue,
                Some(b'}') => return Ok(()),
                Some(c) => {
                    return Err(Error::MalformedInput(format!(
                        "Expected ',' or '}}', found '{}' at {}",
                        c as char,
                        self.pos - 1
                    )))
                }
                None => {
                    return Err(Error::MalformedInput(
                        "Unterminated object".to_string(),
                    ))
                }
            }
        }
    }

    fn parse_list(&mut self, depth: usize) -> Result<NodeId> {
        self.expect(b'[')?;
        let branch = self.arena.create_branch()?;

        match self.fill_list(branch, depth) {
            Ok(()) => Ok(branch),
            Err(e) => {
                self.arena.destroy(self.pool, branch)?;
                Err(e)
            }
        }
    }

    fn fill_list(&mut self, branch: NodeId, depth: usize) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(());
        }
        loop {
            self.skip_ws();
            let child = self.parse_value(depth + 1)?;
            self.arena.append_child(branch, child)?;

            self.skip_ws();
            match self.next() {
                Some(b',') => continue,
                Some(b']') => return Ok(()),
                Some(c) => {
                    return Err(Error::MalformedInput(format!(
                        "Expected ',' or ']', found '{}' at {}",
                        c as char,
                        self.pos - 1
                    )))
                }
                None => return Err(Error::MalformedInput("Unterminated list".to_string())),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            let start = self.pos;
            // Consume a run of plain bytes in one step
            while let Some(&c) = self.bytes.get(self.pos) {
                if c == b'"' || c == b'\\' {
                    break;
                }
                self.pos += 1;
            }
            out.push_str(
                std::str::from_utf8(&self.bytes[start..self.pos])
                    .map_err(|e| Error::MalformedInput(format!("Invalid UTF-8: {}", e)))?,
            );
            match self.next() {
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.next() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    Some(c) => {
                        return Err(Error::MalformedInput(format!(
                            "Unknown escape '\\{}' at {}",
                            c as char,
                            self.pos - 1
                        )))
                    }
                    None => {
                        return Err(Error::MalformedInput(
                            "Unterminated escape".to_string(),
                        ))
                    }
                },
                _ => {
                    return Err(Error::MalformedInput(
                        "Unterminated string".to_string(),
                    ))
                }
            }
        }
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        match self.next() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(Error::MalformedInput(format!(
                "Expected '{}', found '{}' at {}",
                expected as char,
                c as char,
                self.pos - 1
            ))),
            None => Err(Error::MalformedInput(format!(
                "Expected '{}', found end of input",
                expected as char
            ))),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_size_classes;

    fn fixtures() -> (NodeArena, SlabPool) {
        (
            NodeArena::new(64),
            SlabPool::new(&default_size_classes()).unwrap(),
        )
    }

    #[test]
    fn test_scalar_roundtrip() -> Result<()> {
        let (mut arena, mut pool) = fixtures();
        let node = from_text(&mut arena, &mut pool, r#""hello world""#)?;
        assert_eq!(to_text(&arena, &pool, node)?, r#""hello world""#);
        Ok(())
    }

    #[test]
    fn test_nested_roundtrip() -> Result<()> {
        let (mut arena, mut pool) = fixtures();
        let text = r#"{"task": "plan", "steps": ["draft", "review"], "meta": {"owner": "agent"}}"#;
        let node = from_text(&mut arena, &mut pool, text)?;
        assert_eq!(to_text(&arena, &pool, node)?, text);
        Ok(())
    }

    #[test]
    fn test_escapes_roundtrip() -> Result<()> {
        let (mut arena, mut pool) = fixtures();
        let text = r#""line one\nwith \"quotes\" and \\slash""#;
        let node = from_text(&mut arena, &mut pool, text)?;
        assert_eq!(
            arena.payload(&pool, node)?,
            Some("line one\nwith \"quotes\" and \\slash".as_bytes())
        );
        assert_eq!(to_text(&arena, &pool, node)?, text);
        Ok(())
    }

    #[test]
    fn test_resolve_path_into_parsed_tree() -> Result<()> {
        let (mut arena, mut pool) = fixtures();
        let node = from_text(&mut arena, &mut pool, r#"{"a": {"b": "deep"}}"#)?;
        let leaf = arena.resolve_path(&pool, node, "a.b")?.unwrap();
        assert_eq!(arena.payload(&pool, leaf)?, Some(&b"deep"[..]));
        Ok(())
    }

    #[test]
    fn test_malformed_inputs_leave_no_leak() {
        let (mut arena, mut pool) = fixtures();
        for bad in [
            "",
            "{",
            "[\"a\", ]extra",
            "{\"k\": }",
            "{\"k\" \"v\"}",
            "\"unterminated",
            "\"bad \\x escape\"",
            "{\"a\": \"1\"} trailing",
            "plain",
        ] {
            let err = from_text(&mut arena, &mut pool, bad).unwrap_err();
            assert!(matches!(err, Error::MalformedInput(_)), "input: {:?}", bad);
        }
        // Every partial tree was torn down
        assert_eq!(arena.nodes_in_use(), 0);
        assert_eq!(pool.blocks_in_use(), 0);
    }

    #[test]
    fn test_empty_containers() -> Result<()> {
        let (mut arena, mut pool) = fixtures();
        let obj = from_text(&mut arena, &mut pool, "{}")?;
        assert_eq!(to_text(&arena, &pool, obj)?, "{}");

        // An empty list parses; with no children it re-serializes as an
        // empty object, the two are indistinguishable in tree form
        let list = from_text(&mut arena, &mut pool, "[]")?;
        assert_eq!(to_text(&arena, &pool, list)?, "{}");
        Ok(())
    }

    #[test]
    fn test_depth_limit() {
        let (mut arena, mut pool) = fixtures();
        let deep = "[".repeat(80) + &"]".repeat(80);
        let err = from_text(&mut arena, &mut pool, &deep).unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
        assert_eq!(arena.nodes_in_use(), 0);
    }
}

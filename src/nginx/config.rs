//! Minimal nginx configuration model: enough to read a server file, change a
//! few directives, and write it back. Arguments are kept as raw tokens, so
//! quoting survives a round trip.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: unexpected '{found}'")]
    Unexpected { line: usize, found: char },
    #[error("line {line}: unterminated quoted string")]
    UnterminatedQuote { line: usize },
    #[error("line {line}: directive '{name}' is missing ';'")]
    MissingSemicolon { line: usize, name: String },
    #[error("unexpected end of file: block opened on line {line} is never closed")]
    UnclosedBlock { line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directive {
        name: String,
        args: Vec<String>,
    },
    Block {
        name: String,
        args: Vec<String>,
        children: Vec<Node>,
    },
    /// Text after `#`, without the marker
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NginxConfig {
    pub nodes: Vec<Node>,
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Open,
    Close,
    Semi,
    Comment(String),
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' => {
                chars.next();
                tokens.push((Token::Open, line));
            }
            '}' => {
                chars.next();
                tokens.push((Token::Close, line));
            }
            ';' => {
                chars.next();
                tokens.push((Token::Semi, line));
            }
            '#' => {
                chars.next();
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                tokens.push((Token::Comment(text.trim().to_string()), line));
            }
            '"' | '\'' => {
                let start = line;
                let quote = c;
                let mut word = String::new();
                word.push(quote);
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    word.push(c);
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        '\n' => line += 1,
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(ParseError::UnterminatedQuote { line: start });
                }
                tokens.push((Token::Word(word), start));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push((Token::Word(word), line));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: std::vec::IntoIter<(Token, usize)>,
}

impl Parser {
    /// Nodes up to the matching `}` (`open_line` is set) or end of input
    fn nodes(&mut self, open_line: Option<usize>) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();
        let mut words: Vec<String> = Vec::new();
        let mut words_line = 0;

        while let Some((token, line)) = self.tokens.next() {
            match token {
                Token::Word(w) => {
                    if words.is_empty() {
                        words_line = line;
                    }
                    words.push(w);
                }
                Token::Comment(text) => {
                    // comments inside a statement are dropped
                    if words.is_empty() {
                        nodes.push(Node::Comment(text));
                    }
                }
                Token::Semi => {
                    let mut it = std::mem::take(&mut words).into_iter();
                    let name = it.next().ok_or(ParseError::Unexpected { line, found: ';' })?;
                    nodes.push(Node::Directive {
                        name,
                        args: it.collect(),
                    });
                }
                Token::Open => {
                    let mut it = std::mem::take(&mut words).into_iter();
                    let name = it.next().ok_or(ParseError::Unexpected { line, found: '{' })?;
                    let children = self.nodes(Some(line))?;
                    nodes.push(Node::Block {
                        name,
                        args: it.collect(),
                        children,
                    });
                }
                Token::Close => {
                    if let Some(name) = words.first() {
                        return Err(ParseError::MissingSemicolon {
                            line: words_line,
                            name: name.clone(),
                        });
                    }
                    if open_line.is_none() {
                        return Err(ParseError::Unexpected { line, found: '}' });
                    }
                    return Ok(nodes);
                }
            }
        }

        if let Some(name) = words.first() {
            return Err(ParseError::MissingSemicolon {
                line: words_line,
                name: name.clone(),
            });
        }
        if let Some(line) = open_line {
            return Err(ParseError::UnclosedBlock { line });
        }
        Ok(nodes)
    }
}

impl NginxConfig {
    pub fn parse(src: &str) -> Result<Self, ParseError> {
        let mut parser = Parser {
            tokens: tokenize(src)?.into_iter(),
        };
        Ok(Self {
            nodes: parser.nodes(None)?,
        })
    }

    /// Arguments of the first directive called `name`, depth first
    pub fn find_first(&self, name: &str) -> Option<&[String]> {
        fn walk<'a>(nodes: &'a [Node], name: &str) -> Option<&'a [String]> {
            for node in nodes {
                match node {
                    Node::Directive { name: n, args } if n == name => return Some(args),
                    Node::Block { children, .. } => {
                        if let Some(found) = walk(children, name) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        walk(&self.nodes, name)
    }

    /// Replace the arguments of every directive called `name`. Returns how
    /// many were changed.
    pub fn set_all(&mut self, name: &str, args: &[&str]) -> usize {
        fn walk(nodes: &mut [Node], name: &str, args: &[&str]) -> usize {
            let mut count = 0;
            for node in nodes {
                match node {
                    Node::Directive { name: n, args: a } if n == name => {
                        *a = args.iter().map(|s| s.to_string()).collect();
                        count += 1;
                    }
                    Node::Block { children, .. } => count += walk(children, name, args),
                    _ => {}
                }
            }
            count
        }
        walk(&mut self.nodes, name, args)
    }
}

fn head(name: &str, args: &[String]) -> String {
    if args.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, args.join(" "))
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, node: &Node, depth: usize) -> fmt::Result {
    let indent = "    ".repeat(depth);
    match node {
        Node::Directive { name, args } => writeln!(f, "{}{};", indent, head(name, args)),
        Node::Comment(text) => writeln!(f, "{}# {}", indent, text),
        Node::Block {
            name,
            args,
            children,
        } => {
            writeln!(f, "{}{} {{", indent, head(name, args))?;
            for child in children {
                write_node(f, child, depth + 1)?;
            }
            writeln!(f, "{}}}", indent)
        }
    }
}

/// Canonical layout: four-space indent, one statement per line, a blank line
/// between top-level statements except after a comment.
impl fmt::Display for NginxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut previous: Option<&Node> = None;
        for node in &self.nodes {
            if let Some(prev) = previous {
                if !matches!(prev, Node::Comment(_)) {
                    writeln!(f)?;
                }
            }
            write_node(f, node, 0)?;
            previous = Some(node);
        }
        Ok(())
    }
}

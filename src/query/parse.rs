//! Hand-rolled tokenizer and recursive-descent parser for the query
//! grammar.
//!
//! ```text
//! query    ::= "file" STRING ("|" unit)* ("|" terminal)?
//! unit     ::= "$" ident "=" math
//!           |  "where" logic
//!           |  "reduce" strref+ agg+
//!           |  "zip" strref+ "(" query-sans-terminal ")"
//! terminal ::= "show" STRING?
//!           |  "saveVal" (valref "as" ident)+
//!           |  "saveQueryAs" ident
//! ```
//!
//! Parse errors are composition-time errors: they surface immediately and
//! nothing is planned or run.

use anyhow::{Result, bail};

use super::ast::*;

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Number(f64),
    NumRef(String),
    StrRefTok(String),
    Pipe,
    LParen,
    RParen,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
}

fn lex(input: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '|' => {
                toks.push(Tok::Pipe);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::EqEq);
                    i += 2;
                } else {
                    toks.push(Tok::Assign);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ne);
                    i += 2;
                } else {
                    bail!("unexpected '!' (did you mean '!='?)");
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    bail!("unterminated string literal");
                }
                i += 1;
                toks.push(Tok::Str(s));
            }
            '$' | '%' => {
                let sigil = c;
                i += 1;
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if start == i {
                    bail!("dangling '{sigil}'");
                }
                let name: String = chars[start..i].iter().collect();
                if sigil == '$' {
                    toks.push(Tok::NumRef(name));
                } else {
                    toks.push(Tok::StrRefTok(name));
                }
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| {
                    anyhow::anyhow!("'{text}' is not a number")
                })?;
                toks.push(Tok::Number(n));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            _ => bail!("unexpected character '{c}'"),
        }
    }
    Ok(toks)
}

struct Parser {
    toks: Vec<Tok>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.at)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.at).cloned();
        if t.is_some() {
            self.at += 1;
        }
        t
    }

    fn eat(&mut self, want: &Tok) -> Result<()> {
        match self.bump() {
            Some(t) if t == *want => Ok(()),
            other => bail!("expected {want:?}, found {other:?}"),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.bump() {
            Some(Tok::Ident(s)) => Ok(s),
            other => bail!("expected a name, found {other:?}"),
        }
    }

    fn keyword(&mut self, kw: &str) -> bool {
        if let Some(Tok::Ident(s)) = self.peek()
            && s == kw
        {
            self.at += 1;
            return true;
        }
        false
    }

    // math ::= term (("+"|"-") term)*
    fn math(&mut self) -> Result<MathExpr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.at += 1;
            let rhs = self.term()?;
            lhs = MathExpr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<MathExpr> {
        let mut lhs = self.atom()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => break,
            };
            self.at += 1;
            let rhs = self.atom()?;
            lhs = MathExpr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> Result<MathExpr> {
        match self.bump() {
            Some(Tok::Number(n)) => Ok(MathExpr::Num(n)),
            Some(Tok::Minus) => Ok(MathExpr::Neg(Box::new(self.atom()?))),
            Some(Tok::NumRef(name)) => Ok(num_ref(&name)),
            Some(Tok::LParen) => {
                let e = self.math()?;
                self.eat(&Tok::RParen)?;
                Ok(e)
            }
            other => bail!("expected a value, found {other:?}"),
        }
    }

    // logic ::= andexpr ("or" andexpr)*
    fn logic(&mut self) -> Result<LogicExpr> {
        let mut lhs = self.and_expr()?;
        while self.keyword("or") {
            let rhs = self.and_expr()?;
            lhs = LogicExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<LogicExpr> {
        let mut lhs = self.logic_atom()?;
        while self.keyword("and") {
            let rhs = self.logic_atom()?;
            lhs = LogicExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn logic_atom(&mut self) -> Result<LogicExpr> {
        if self.keyword("not") {
            return Ok(LogicExpr::Not(Box::new(self.logic_atom()?)));
        }
        if self.keyword("load") {
            let lib = match self.bump() {
                Some(Tok::Str(s)) => s,
                other => bail!("load expects a library path string, found {other:?}"),
            };
            let symbol = self.ident()?;
            return Ok(LogicExpr::LoadCmd { lib, symbol });
        }
        if let Some(Tok::LParen) = self.peek() {
            // could be a parenthesized predicate or a parenthesized math
            // expr starting a comparison; try the predicate first
            let save = self.at;
            self.at += 1;
            if let Ok(inner) = self.logic() {
                if self.eat(&Tok::RParen).is_ok() {
                    return Ok(inner);
                }
            }
            self.at = save;
        }
        // string comparison: %k == "lit"
        if let Some(Tok::StrRefTok(name)) = self.peek().cloned() {
            self.at += 1;
            let op = match self.bump() {
                Some(Tok::EqEq) => CmpOp::Eq,
                Some(Tok::Ne) => CmpOp::Ne,
                other => bail!("string columns compare with == or !=, found {other:?}"),
            };
            let lit = match self.bump() {
                Some(Tok::Str(s)) => s,
                other => bail!("expected a string literal, found {other:?}"),
            };
            return Ok(LogicExpr::StrCmp(op, str_ref(&name), lit));
        }
        let lhs = self.math()?;
        let op = match self.bump() {
            Some(Tok::EqEq) => CmpOp::Eq,
            Some(Tok::Ne) => CmpOp::Ne,
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::Le) => CmpOp::Le,
            Some(Tok::Ge) => CmpOp::Ge,
            other => bail!("expected a comparison, found {other:?}"),
        };
        let rhs = self.math()?;
        Ok(LogicExpr::Cmp(op, lhs, rhs))
    }

    fn str_refs(&mut self) -> Vec<StrRef> {
        let mut keys = Vec::new();
        while let Some(Tok::StrRefTok(name)) = self.peek().cloned() {
            keys.push(str_ref(&name));
            self.at += 1;
        }
        keys
    }

    fn aggs(&mut self) -> Result<Vec<AggExpr>> {
        let mut out = Vec::new();
        while let Some(Tok::Ident(name)) = self.peek().cloned() {
            let func = match name.as_str() {
                "sum" => AggFn::Sum,
                "count" => AggFn::Count,
                "min" => AggFn::Min,
                "max" => AggFn::Max,
                "avg" => AggFn::Avg,
                _ => break,
            };
            self.at += 1;
            self.eat(&Tok::LParen)?;
            let arg = if let Some(Tok::RParen) = self.peek() {
                None
            } else {
                Some(self.math()?)
            };
            self.eat(&Tok::RParen)?;
            out.push(AggExpr { func, arg });
        }
        if out.is_empty() {
            bail!("reduce needs at least one aggregation");
        }
        Ok(out)
    }

    fn unit(&mut self) -> Result<Unit> {
        if self.keyword("where") {
            return Ok(Unit::Where(self.logic()?));
        }
        if self.keyword("reduce") {
            let keys = self.str_refs();
            let aggs = self.aggs()?;
            return Ok(Unit::Reduce { keys, aggs });
        }
        if self.keyword("zip") {
            let keys = self.str_refs();
            self.eat(&Tok::LParen)?;
            let inner = self.query_expr(false)?;
            self.eat(&Tok::RParen)?;
            return Ok(Unit::Zip {
                keys,
                inner: Box::new(inner),
            });
        }
        if let Some(Tok::NumRef(name)) = self.peek().cloned() {
            self.at += 1;
            self.eat(&Tok::Assign)?;
            let expr = self.math()?;
            if name.parse::<usize>().is_ok() {
                bail!("can not assign to a column index (${name})");
            }
            return Ok(Unit::Let { name, expr });
        }
        bail!("expected a pipeline unit, found {:?}", self.peek())
    }

    fn terminal(&mut self) -> Result<Option<Terminal>> {
        if self.keyword("show") {
            let file = match self.peek() {
                Some(Tok::Str(_)) => match self.bump() {
                    Some(Tok::Str(s)) => Some(s),
                    _ => unreachable!(),
                },
                _ => None,
            };
            return Ok(Some(Terminal::Show { file }));
        }
        if self.keyword("saveVal") {
            let mut items = Vec::new();
            loop {
                let src = match self.bump() {
                    Some(Tok::NumRef(name)) => num_val_ref(&name),
                    Some(Tok::StrRefTok(name)) => str_val_ref(&name),
                    other => bail!("saveVal expects $col or %col, found {other:?}"),
                };
                if !self.keyword("as") {
                    bail!("saveVal expects 'as <name>'");
                }
                let dest = self.ident()?;
                items.push(SaveItem { src, dest });
                match self.peek() {
                    Some(Tok::NumRef(_)) | Some(Tok::StrRefTok(_)) => continue,
                    _ => break,
                }
            }
            return Ok(Some(Terminal::SaveVal(items)));
        }
        if self.keyword("saveQueryAs") {
            return Ok(Some(Terminal::SaveQueryAs(self.ident()?)));
        }
        Ok(None)
    }

    fn query_expr(&mut self, allow_terminal: bool) -> Result<QueryExpr> {
        if !self.keyword("file") {
            bail!("a query starts with: file \"name\"");
        }
        let file = match self.bump() {
            Some(Tok::Str(s)) => s,
            other => bail!("file expects a quoted name, found {other:?}"),
        };
        let mut units = Vec::new();
        let mut terminal = Terminal::None;
        while let Some(Tok::Pipe) = self.peek() {
            self.at += 1;
            if allow_terminal {
                if let Some(t) = self.terminal()? {
                    terminal = t;
                    break;
                }
            }
            units.push(self.unit()?);
        }
        Ok(QueryExpr {
            file,
            units,
            terminal,
        })
    }
}

fn num_ref(name: &str) -> MathExpr {
    match name.parse::<usize>() {
        Ok(n) => MathExpr::NumCol(n),
        Err(_) => MathExpr::Var(name.to_string()),
    }
}

fn str_ref(name: &str) -> StrRef {
    match name.parse::<usize>() {
        Ok(n) => StrRef::Col(n),
        Err(_) => StrRef::Name(name.to_string()),
    }
}

fn num_val_ref(name: &str) -> ValRef {
    match name.parse::<usize>() {
        Ok(n) => ValRef::NumCol(n),
        Err(_) => ValRef::NumName(name.to_string()),
    }
}

fn str_val_ref(name: &str) -> ValRef {
    match name.parse::<usize>() {
        Ok(n) => ValRef::StrCol(n),
        Err(_) => ValRef::StrName(name.to_string()),
    }
}

/// Parse one full query line.
pub fn parse_query(input: &str) -> Result<QueryExpr> {
    let toks = lex(input)?;
    let mut p = Parser { toks, at: 0 };
    let q = p.query_expr(true)?;
    if p.at != p.toks.len() {
        bail!("trailing input after the query: {:?}", &p.toks[p.at..]);
    }
    Ok(q)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_map_filter_show() {
        let q = parse_query(r#"file "t" | $y = $1 + $2 | where $y > 4 | show"#).unwrap();
        assert_eq!(q.file, "t");
        assert_eq!(q.units.len(), 2);
        assert_eq!(q.terminal, Terminal::Show { file: None });
    }

    #[test]
    fn parses_reduce() {
        let q = parse_query(r#"file "t" | reduce %1 sum($2) avg($3) | show"#).unwrap();
        match &q.units[0] {
            Unit::Reduce { keys, aggs } => {
                assert_eq!(keys, &[StrRef::Col(1)]);
                assert_eq!(aggs.len(), 2);
            }
            u => panic!("unexpected unit {u:?}"),
        }
    }

    #[test]
    fn parses_zip() {
        let q = parse_query(r#"file "a" | zip %1 (file "b" | $z = $1 * 2) | show"#).unwrap();
        match &q.units[0] {
            Unit::Zip { keys, inner } => {
                assert_eq!(keys.len(), 1);
                assert_eq!(inner.file, "b");
                assert_eq!(inner.units.len(), 1);
            }
            u => panic!("unexpected unit {u:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_query("show me the money").is_err());
        assert!(parse_query(r#"file "t" | $1 = $2"#).is_err());
        assert!(parse_query(r#"file "t" | where $1 <"#).is_err());
    }
}

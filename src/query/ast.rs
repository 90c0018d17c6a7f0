//! Query syntax tree. Deliberately thin: just enough structure for column
//! resolution and planning.

/// Arithmetic over numeric columns, variables and literals.
#[derive(Clone, Debug, PartialEq)]
pub enum MathExpr {
    Num(f64),
    /// `$N`: numeric file column, 1-based.
    NumCol(usize),
    /// `$name`: declared variable, numeric header name, or saved value.
    Var(String),
    Neg(Box<MathExpr>),
    Bin(BinOp, Box<MathExpr>, Box<MathExpr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Predicates for `where`.
#[derive(Clone, Debug, PartialEq)]
pub enum LogicExpr {
    Cmp(CmpOp, MathExpr, MathExpr),
    /// String column compared against a literal.
    StrCmp(CmpOp, StrRef, String),
    And(Box<LogicExpr>, Box<LogicExpr>),
    Or(Box<LogicExpr>, Box<LogicExpr>),
    Not(Box<LogicExpr>),
    /// `where load "lib.so" sym` — a dynamically loaded predicate. The
    /// parser accepts the form; planning rejects it unless the build opts
    /// in to native predicate loading.
    LoadCmd { lib: String, symbol: String },
}

/// A string-column reference: `%N` or `%name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrRef {
    Col(usize),
    Name(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFn {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

/// One aggregation in a `reduce` unit; `count` takes no argument.
#[derive(Clone, Debug, PartialEq)]
pub struct AggExpr {
    pub func: AggFn,
    pub arg: Option<MathExpr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Unit {
    /// `$name = math-expr`: append one numeric column.
    Let { name: String, expr: MathExpr },
    Where(LogicExpr),
    Reduce {
        keys: Vec<StrRef>,
        aggs: Vec<AggExpr>,
    },
    Zip {
        keys: Vec<StrRef>,
        inner: Box<QueryExpr>,
    },
}

/// What to save out of the result in a `saveVal` terminal.
#[derive(Clone, Debug, PartialEq)]
pub struct SaveItem {
    pub src: ValRef,
    pub dest: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValRef {
    NumCol(usize),
    NumName(String),
    StrCol(usize),
    StrName(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Terminal {
    Show { file: Option<String> },
    SaveVal(Vec<SaveItem>),
    SaveQueryAs(String),
    /// No terminal: plan and run, discarding output.
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryExpr {
    pub file: String,
    pub units: Vec<Unit>,
    pub terminal: Terminal,
}

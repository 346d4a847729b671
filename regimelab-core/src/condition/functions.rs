//! The closed registry of callable functions.
//!
//! Configuration may only name functions listed here; anything else is
//! rejected at load with `ConfigError::UnknownFunction`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `percentile(x, window, pct)`
    Percentile,
    /// `crossover(a, b)`
    Crossover,
    /// `is_null(x)`
    IsNull,
    /// `coalesce(x, fallback)`
    Coalesce,
    /// `first_non_null(a, b, …)`
    FirstNonNull,
}

/// Static type of an expression position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Number,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Bool => "boolean",
            ValueType::Number => "number",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(k) => write!(f, "{k}"),
            Arity::AtLeast(k) => write!(f, "at least {k}"),
        }
    }
}

impl Builtin {
    pub const ALL: [Builtin; 5] = [
        Builtin::Percentile,
        Builtin::Crossover,
        Builtin::IsNull,
        Builtin::Coalesce,
        Builtin::FirstNonNull,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Percentile => "percentile",
            Builtin::Crossover => "crossover",
            Builtin::IsNull => "is_null",
            Builtin::Coalesce => "coalesce",
            Builtin::FirstNonNull => "first_non_null",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            Builtin::Percentile => Arity::Exact(3),
            Builtin::Crossover => Arity::Exact(2),
            Builtin::IsNull => Arity::Exact(1),
            Builtin::Coalesce => Arity::Exact(2),
            Builtin::FirstNonNull => Arity::AtLeast(1),
        }
    }

    pub fn returns(self) -> ValueType {
        match self {
            Builtin::Crossover | Builtin::IsNull => ValueType::Bool,
            Builtin::Percentile | Builtin::Coalesce | Builtin::FirstNonNull => ValueType::Number,
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Linear-interpolated percentile of an ascending slice, `p` in 0..=100.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = rank - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

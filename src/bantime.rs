// src/bantime.rs

//! Ban-time escalation: per-jail configuration and the scoring formula.
//!
//! The default formula doubles the ban time with every prior ban,
//! `banTime * factor * 2^min(banCount, 20)`, capped at `maxtime`. A
//! `multipliers` list replaces the exponential with a saturating table,
//! and a custom formula expression replaces it entirely. An optional
//! uniform jitter in `[0, rndtime)` is added before the cap so parallel
//! attackers do not all unban at the same instant.

use crate::config::parse_seconds;
use crate::error::{Error, Result};
use rand::Rng;
use std::fmt;

/// Exponent cap for the default formula; beyond 20 prior bans the factor
/// stops growing.
const COUNT_CAP: u32 = 20;

/// Input to the scoring formula: the base ban time and how many times the
/// ip was banned before.
#[derive(Debug, Clone, Copy)]
pub struct BanTimeIncr {
    pub time: f64,
    pub count: u32,
}

/// Per-jail escalation settings.
#[derive(Debug, Clone)]
pub struct BanTimeExtra {
    /// Master switch; when false the formula is bypassed entirely.
    pub increment: bool,
    /// Upper bound in seconds on any computed ban time.
    pub max_time: i64,
    /// Jitter range in seconds; 0 disables.
    pub rnd_time: i64,
    /// Scalar applied to the formula result.
    pub factor: f64,
    /// Saturating multiplier table; overrides the formula expression.
    pub multipliers: Option<Vec<u64>>,
    /// Custom formula; overrides the default exponential.
    pub formula: Option<Formula>,
    /// Whether ban-history lookups aggregate across jails.
    pub overall_jails: bool,
}

impl Default for BanTimeExtra {
    fn default() -> Self {
        Self {
            increment: false,
            max_time: 24 * 60 * 60,
            rnd_time: 0,
            factor: 1.0,
            multipliers: None,
            formula: None,
            overall_jails: false,
        }
    }
}

impl BanTimeExtra {
    /// Evaluate the configured formula for `incr`.
    ///
    /// A custom formula that fails to evaluate falls back to the input
    /// ban time unmodified.
    pub fn ev_formula(&self, incr: BanTimeIncr) -> f64 {
        let raw = if let Some(multipliers) = &self.multipliers {
            let idx = (incr.count as usize).min(multipliers.len().saturating_sub(1));
            let multiplier = multipliers.get(idx).copied().unwrap_or(1);
            incr.time * self.factor * multiplier as f64
        } else if let Some(formula) = &self.formula {
            match formula.eval(incr, self.factor) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!("ban time formula failed: {}", e);
                    return incr.time;
                }
            }
        } else {
            incr.time * self.factor * (1u64 << incr.count.min(COUNT_CAP)) as f64
        };
        let jittered = if self.rnd_time > 0 {
            raw + rand::thread_rng().gen_range(0.0..self.rnd_time as f64)
        } else {
            raw
        };
        jittered.min(self.max_time as f64)
    }

    /// Parse a space-separated multiplier list such as `"1 2 4 8 16"`.
    pub fn parse_multipliers(s: &str) -> Result<Vec<u64>> {
        let values = s
            .split_whitespace()
            .map(|tok| {
                tok.parse::<u64>()
                    .map_err(|_| Error::Config(format!("invalid multiplier: {}", tok)))
            })
            .collect::<Result<Vec<u64>>>()?;
        if values.is_empty() {
            return Err(Error::Config("empty multiplier list".into()));
        }
        Ok(values)
    }

    /// Apply a `bantime.*` option by key, as received over the control
    /// channel or read from the config file. An empty value resets the
    /// option to its default.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "increment" => {
                self.increment = parse_bool(value)?;
            }
            "maxtime" => {
                self.max_time = parse_seconds(value)?;
            }
            "rndtime" => {
                self.rnd_time = if value.is_empty() {
                    0
                } else {
                    parse_seconds(value)?
                };
            }
            "factor" => {
                self.factor = if value.is_empty() {
                    1.0
                } else {
                    value
                        .parse::<f64>()
                        .map_err(|_| Error::Config(format!("invalid factor: {}", value)))?
                };
            }
            "multipliers" => {
                self.multipliers = if value.is_empty() {
                    None
                } else {
                    Some(Self::parse_multipliers(value)?)
                };
            }
            "formula" => {
                self.formula = if value.is_empty() {
                    None
                } else {
                    Some(Formula::parse(value)?)
                };
            }
            "overalljails" => {
                self.overall_jails = parse_bool(value)?;
            }
            _ => {
                return Err(Error::Command(format!("unknown bantime option: {}", key)));
            }
        }
        Ok(())
    }

    /// Read a `bantime.*` option by key.
    pub fn get_option(&self, key: &str) -> Result<String> {
        let value = match key {
            "increment" => self.increment.to_string(),
            "maxtime" => self.max_time.to_string(),
            "rndtime" => self.rnd_time.to_string(),
            "factor" => self.factor.to_string(),
            "multipliers" => self
                .multipliers
                .as_ref()
                .map(|m| {
                    m.iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default(),
            "formula" => self.formula.as_ref().map(|f| f.to_string()).unwrap_or_default(),
            "overalljails" => self.overall_jails.to_string(),
            _ => {
                return Err(Error::Command(format!("unknown bantime option: {}", key)));
            }
        };
        Ok(value)
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" | "" => Ok(false),
        _ => Err(Error::Config(format!("invalid boolean: {}", s))),
    }
}

// ---------------------------------------------------------------------------
// Formula expressions
// ---------------------------------------------------------------------------

/// A parsed ban-time expression over `ban.Time`, `ban.Count` and
/// `banFactor`, with `+ - * / **`, parentheses and the functions `exp`,
/// `log`, `min`, `max`. A leading `math.` on function names and a
/// `float(...)`/`int(...)` wrapper are accepted for compatibility with
/// formulas written against the original daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    root: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    BanTime,
    BanCount,
    BanFactor,
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Exp(Box<Expr>),
    Log(Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    Trunc(Box<Expr>),
}

impl Formula {
    /// Parse an expression, rejecting it at configuration time rather
    /// than on first evaluation.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::Formula(format!(
                "unexpected trailing input in formula: {}",
                source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Evaluate for the given escalation input and jail factor. Non-finite
    /// results are reported as errors so the caller can fall back.
    pub fn eval(&self, incr: BanTimeIncr, factor: f64) -> Result<f64> {
        let value = eval_expr(&self.root, incr.time, incr.count as f64, factor)?;
        if !value.is_finite() {
            return Err(Error::Formula(format!(
                "formula produced a non-finite value: {}",
                self.source
            )));
        }
        Ok(value)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval_expr(expr: &Expr, time: f64, count: f64, factor: f64) -> Result<f64> {
    let v = match expr {
        Expr::Num(n) => *n,
        Expr::BanTime => time,
        Expr::BanCount => count,
        Expr::BanFactor => factor,
        Expr::Neg(e) => -eval_expr(e, time, count, factor)?,
        Expr::Add(a, b) => eval_expr(a, time, count, factor)? + eval_expr(b, time, count, factor)?,
        Expr::Sub(a, b) => eval_expr(a, time, count, factor)? - eval_expr(b, time, count, factor)?,
        Expr::Mul(a, b) => eval_expr(a, time, count, factor)? * eval_expr(b, time, count, factor)?,
        Expr::Div(a, b) => {
            let divisor = eval_expr(b, time, count, factor)?;
            if divisor == 0.0 {
                return Err(Error::Formula("division by zero".into()));
            }
            eval_expr(a, time, count, factor)? / divisor
        }
        Expr::Pow(a, b) => {
            eval_expr(a, time, count, factor)?.powf(eval_expr(b, time, count, factor)?)
        }
        Expr::Exp(e) => eval_expr(e, time, count, factor)?.exp(),
        Expr::Log(e) => eval_expr(e, time, count, factor)?.ln(),
        Expr::Min(a, b) => {
            eval_expr(a, time, count, factor)?.min(eval_expr(b, time, count, factor)?)
        }
        Expr::Max(a, b) => {
            eval_expr(a, time, count, factor)?.max(eval_expr(b, time, count, factor)?)
        }
        Expr::Trunc(e) => eval_expr(e, time, count, factor)?.trunc(),
    };
    Ok(v)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    DoubleStar,
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num
                    .parse::<f64>()
                    .map_err(|_| Error::Formula(format!("invalid number: {}", num)))?;
                tokens.push(Token::Num(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        // idents may be dotted (ban.Time, math.exp) but a
                        // trailing dot belongs to the next token
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    tokens.push(Token::DoubleStar);
                } else {
                    tokens.push(Token::Star);
                }
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            _ => {
                return Err(Error::Formula(format!(
                    "unexpected character '{}' in formula",
                    c
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(Error::Formula(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.next();
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.term()?));
                }
                Some(Token::Minus) => {
                    self.next();
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.term()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.power()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.next();
                    lhs = Expr::Mul(Box::new(lhs), Box::new(self.power()?));
                }
                Some(Token::Slash) => {
                    self.next();
                    lhs = Expr::Div(Box::new(lhs), Box::new(self.power()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.unary()?;
        if self.peek() == Some(&Token::DoubleStar) {
            self.next();
            // right-associative
            let exponent = self.power()?;
            return Ok(Expr::Pow(Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.next();
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.ident(name),
            other => Err(Error::Formula(format!(
                "unexpected token in formula: {:?}",
                other
            ))),
        }
    }

    fn ident(&mut self, name: String) -> Result<Expr> {
        match name.as_str() {
            "ban.Time" => return Ok(Expr::BanTime),
            "ban.Count" => return Ok(Expr::BanCount),
            "banFactor" => return Ok(Expr::BanFactor),
            _ => {}
        }
        let func = name.strip_prefix("math.").unwrap_or(&name);
        match func {
            "exp" | "log" | "float" | "int" => {
                self.expect(Token::LParen)?;
                let arg = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(match func {
                    "exp" => Expr::Exp(Box::new(arg)),
                    "log" => Expr::Log(Box::new(arg)),
                    "int" => Expr::Trunc(Box::new(arg)),
                    // float() is a no-op in an all-float evaluator
                    _ => arg,
                })
            }
            "min" | "max" => {
                self.expect(Token::LParen)?;
                let a = self.expr()?;
                self.expect(Token::Comma)?;
                let b = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(if func == "min" {
                    Expr::Min(Box::new(a), Box::new(b))
                } else {
                    Expr::Max(Box::new(a), Box::new(b))
                })
            }
            _ => Err(Error::Formula(format!("unknown name in formula: {}", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extra() -> BanTimeExtra {
        BanTimeExtra {
            increment: true,
            ..Default::default()
        }
    }

    fn series(extra: &BanTimeExtra, base: i64) -> Vec<i64> {
        (1..=10)
            .map(|count| {
                extra.ev_formula(BanTimeIncr {
                    time: base as f64,
                    count,
                }) as i64
            })
            .collect()
    }

    #[test]
    fn test_default_formula_24h_cap() {
        let e = extra();
        assert_eq!(
            series(&e, 600),
            [1200, 2400, 4800, 9600, 19200, 38400, 76800, 86400, 86400, 86400]
        );
    }

    #[test]
    fn test_default_formula_30d_cap() {
        let mut e = extra();
        e.max_time = 30 * 24 * 60 * 60;
        assert_eq!(
            series(&e, 600),
            [1200, 2400, 4800, 9600, 19200, 38400, 76800, 153600, 307200, 614400]
        );
    }

    #[test]
    fn test_factor_scales_result() {
        let mut e = extra();
        e.factor = 2.0;
        assert_eq!(
            series(&e, 600),
            [2400, 4800, 9600, 19200, 38400, 76800, 86400, 86400, 86400, 86400]
        );
        e.factor = 1.33;
        assert_eq!(
            series(&e, 600),
            [1596, 3192, 6384, 12768, 25536, 51072, 86400, 86400, 86400, 86400]
        );
    }

    #[test]
    fn test_smaller_max_time() {
        let mut e = extra();
        e.max_time = 12 * 60 * 60;
        assert_eq!(
            series(&e, 600),
            [1200, 2400, 4800, 9600, 19200, 38400, 43200, 43200, 43200, 43200]
        );
    }

    #[test]
    fn test_multipliers_match_default_then_saturate() {
        let mut e = extra();
        e.multipliers = Some(BanTimeExtra::parse_multipliers("1 2 4 8 16 32 64 128 256").unwrap());
        // same as the default formula under the 24h cap
        assert_eq!(
            series(&e, 600),
            [1200, 2400, 4800, 9600, 19200, 38400, 76800, 86400, 86400, 86400]
        );
        // with a high cap the growth stops at the last multiplier
        e.max_time = 30 * 24 * 60 * 60;
        assert_eq!(
            series(&e, 600),
            [1200, 2400, 4800, 9600, 19200, 38400, 76800, 153600, 153600, 153600]
        );
    }

    #[test]
    fn test_exponent_cap_at_twenty() {
        let mut e = extra();
        e.max_time = i64::MAX / 2;
        let at_20 = e.ev_formula(BanTimeIncr {
            time: 600.0,
            count: 20,
        });
        let at_25 = e.ev_formula(BanTimeIncr {
            time: 600.0,
            count: 25,
        });
        assert_eq!(at_20, at_25);
    }

    #[test]
    fn test_jitter_disabled_is_deterministic() {
        let mut e = extra();
        let values: Vec<f64> = (0..10)
            .map(|_| {
                e.ev_formula(BanTimeIncr {
                    time: 600.0,
                    count: 1,
                })
            })
            .collect();
        assert!(values.iter().all(|&v| v == 1200.0));

        // with jitter, ten trials cannot realistically all hit 1200 exactly
        e.rnd_time = 300;
        let jittered: Vec<f64> = (0..10)
            .map(|_| {
                e.ev_formula(BanTimeIncr {
                    time: 600.0,
                    count: 1,
                })
            })
            .collect();
        assert!(jittered.iter().any(|&v| v != 1200.0));
        assert!(jittered.iter().all(|&v| (1200.0..1500.0).contains(&v)));
    }

    #[test]
    fn test_custom_formula_matches_default() {
        // exp((count+1)*f)/exp(f) == 2^count when f == ln 2
        let mut e = extra();
        e.factor = 2.0 / 2.885385;
        e.formula = Some(
            Formula::parse(
                "ban.Time * math.exp(float(ban.Count+1)*banFactor)/math.exp(1*banFactor)",
            )
            .unwrap(),
        );
        assert_eq!(
            series(&e, 600),
            [1200, 2400, 4800, 9600, 19200, 38400, 76800, 86400, 86400, 86400]
        );
        e.max_time = 30 * 24 * 60 * 60;
        assert_eq!(
            series(&e, 600),
            [1200, 2400, 4800, 9600, 19200, 38400, 76800, 153601, 307203, 614407]
        );
    }

    #[test]
    fn test_formula_eval_error_falls_back_to_input() {
        let mut e = extra();
        e.formula = Some(Formula::parse("ban.Time / (ban.Count - ban.Count)").unwrap());
        let v = e.ev_formula(BanTimeIncr {
            time: 600.0,
            count: 3,
        });
        assert_eq!(v, 600.0);
    }

    #[test]
    fn test_formula_parse_errors() {
        assert!(Formula::parse("ban.Time *").is_err());
        assert!(Formula::parse("ban.Time ) 2").is_err());
        assert!(Formula::parse("nonsense(ban.Time)").is_err());
        assert!(Formula::parse("ban.Time $ 2").is_err());
    }

    #[test]
    fn test_formula_operators() {
        let f = Formula::parse("min(2 ** 3, max(-4, 10)) + log(exp(1))").unwrap();
        let v = f
            .eval(
                BanTimeIncr {
                    time: 0.0,
                    count: 0,
                },
                1.0,
            )
            .unwrap();
        assert!((v - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_multiplier_parsing() {
        assert_eq!(
            BanTimeExtra::parse_multipliers("1 2 4").unwrap(),
            vec![1, 2, 4]
        );
        assert!(BanTimeExtra::parse_multipliers("").is_err());
        assert!(BanTimeExtra::parse_multipliers("1 two 3").is_err());
    }

    #[test]
    fn test_set_and_get_options() {
        let mut e = BanTimeExtra::default();
        e.set_option("increment", "true").unwrap();
        e.set_option("maxtime", "12h").unwrap();
        e.set_option("factor", "2").unwrap();
        e.set_option("multipliers", "1 2 4 8").unwrap();
        e.set_option("rndtime", "5m").unwrap();
        e.set_option("overalljails", "yes").unwrap();
        assert!(e.increment);
        assert_eq!(e.max_time, 43200);
        assert_eq!(e.factor, 2.0);
        assert_eq!(e.get_option("multipliers").unwrap(), "1 2 4 8");
        assert_eq!(e.rnd_time, 300);
        assert!(e.overall_jails);

        // resets
        e.set_option("multipliers", "").unwrap();
        assert!(e.multipliers.is_none());
        e.set_option("factor", "").unwrap();
        assert_eq!(e.factor, 1.0);

        assert!(e.set_option("nosuch", "1").is_err());
        assert!(e.get_option("nosuch").is_err());
    }
}

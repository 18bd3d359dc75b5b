// LuaValue - tagged Lua 5.2 value.
//
// Numbers keep an integer/float split internally; observable semantics
// (comparison, formatting, coercion) follow the 5.2 reference, where
// integral results print without a decimal point. Aggregates are shared
// by reference so the continuation snapshot can flatten them by identity.

use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::LuaTable;
use crate::lua_vm::{HostFunction, LuaClosure, LuaError, LuaResult};

#[derive(Clone)]
pub enum LuaValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(SmolStr),
    Table(Rc<RefCell<LuaTable>>),
    Function(LuaFunction),
    UserData(Rc<LuaUserData>),
}

#[derive(Clone)]
pub enum LuaFunction {
    Lua(Rc<LuaClosure>),
    Host(Rc<HostFunction>),
}

/// Opaque host-object handle. Scripts can only touch it through whatever
/// metatable the host attached.
pub struct LuaUserData {
    pub name: SmolStr,
    pub metatable: RefCell<Option<LuaValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaValueKind {
    Nil,
    Boolean,
    Integer,
    Number,
    String,
    Table,
    Function,
    UserData,
}

impl LuaFunction {
    /// Stable identity for equality and table-key hashing.
    pub fn id(&self) -> usize {
        match self {
            LuaFunction::Lua(c) => Rc::as_ptr(c) as usize,
            LuaFunction::Host(h) => Rc::as_ptr(h) as usize,
        }
    }

    pub fn as_closure(&self) -> Option<&Rc<LuaClosure>> {
        match self {
            LuaFunction::Lua(c) => Some(c),
            LuaFunction::Host(_) => None,
        }
    }
}

impl LuaValue {
    pub fn nil() -> LuaValue {
        LuaValue::Nil
    }

    pub fn boolean(b: bool) -> LuaValue {
        LuaValue::Boolean(b)
    }

    pub fn integer(i: i64) -> LuaValue {
        LuaValue::Integer(i)
    }

    pub fn number(n: f64) -> LuaValue {
        LuaValue::Number(n)
    }

    pub fn string(s: impl Into<SmolStr>) -> LuaValue {
        LuaValue::String(s.into())
    }

    pub fn table(t: LuaTable) -> LuaValue {
        LuaValue::Table(Rc::new(RefCell::new(t)))
    }

    pub fn closure(c: Rc<LuaClosure>) -> LuaValue {
        LuaValue::Function(LuaFunction::Lua(c))
    }

    pub fn host_function(f: Rc<HostFunction>) -> LuaValue {
        LuaValue::Function(LuaFunction::Host(f))
    }

    pub fn kind(&self) -> LuaValueKind {
        match self {
            LuaValue::Nil => LuaValueKind::Nil,
            LuaValue::Boolean(_) => LuaValueKind::Boolean,
            LuaValue::Integer(_) => LuaValueKind::Integer,
            LuaValue::Number(_) => LuaValueKind::Number,
            LuaValue::String(_) => LuaValueKind::String,
            LuaValue::Table(_) => LuaValueKind::Table,
            LuaValue::Function(_) => LuaValueKind::Function,
            LuaValue::UserData(_) => LuaValueKind::UserData,
        }
    }

    /// The `type()` name of the value.
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Integer(_) | LuaValue::Number(_) => "number",
            LuaValue::String(_) => "string",
            LuaValue::Table(_) => "table",
            LuaValue::Function(_) => "function",
            LuaValue::UserData(_) => "userdata",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// Lua truthiness: everything except nil and false.
    pub fn to_boolean(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    pub fn as_table(&self) -> Option<&Rc<RefCell<LuaTable>>> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&LuaFunction> {
        match self {
            LuaValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LuaValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    // ============ Numeric coercion ============

    /// Numeric view as f64 (strings coerce), or None.
    pub fn to_number(&self) -> Option<f64> {
        match self.to_numeric() {
            Some(LuaValue::Integer(i)) => Some(i as f64),
            Some(LuaValue::Number(n)) => Some(n),
            _ => None,
        }
    }

    /// Numeric view preserving the integer/float split; strings coerce
    /// the way the lexer would read them.
    pub fn to_numeric(&self) -> Option<LuaValue> {
        match self {
            LuaValue::Integer(_) | LuaValue::Number(_) => Some(self.clone()),
            LuaValue::String(s) => parse_number(s.as_str()),
            _ => None,
        }
    }

    /// Integer view with integral-float acceptance, for arguments that
    /// must be whole (e.g. `select(n, ...)`).
    pub fn to_integer(&self) -> Option<i64> {
        match self.to_numeric() {
            Some(LuaValue::Integer(i)) => Some(i),
            Some(LuaValue::Number(n)) if n.trunc() == n => Some(n as i64),
            _ => None,
        }
    }

    /// Coercion used by the numeric `for` preamble; the message names the
    /// offending slot.
    pub fn check_for_number(&self, what: &str) -> LuaResult<LuaValue> {
        self.to_numeric()
            .ok_or_else(|| LuaError::new(format!("'for' {} must be a number", what)))
    }

    // ============ Arithmetic (Lua 5.2 contracts) ============

    pub fn add(&self, rhs: &LuaValue) -> LuaResult<LuaValue> {
        arith(self, rhs, "add", |a, b| a.checked_add(b), |a, b| a + b)
    }

    pub fn sub(&self, rhs: &LuaValue) -> LuaResult<LuaValue> {
        arith(self, rhs, "sub", |a, b| a.checked_sub(b), |a, b| a - b)
    }

    pub fn mul(&self, rhs: &LuaValue) -> LuaResult<LuaValue> {
        arith(self, rhs, "mul", |a, b| a.checked_mul(b), |a, b| a * b)
    }

    /// `/` always produces a float.
    pub fn div(&self, rhs: &LuaValue) -> LuaResult<LuaValue> {
        let (a, b) = both_numbers(self, rhs)?;
        Ok(LuaValue::Number(a / b))
    }

    /// Floored modulo; the integer/integer case stays integral and a zero
    /// divisor raises.
    pub fn modulo(&self, rhs: &LuaValue) -> LuaResult<LuaValue> {
        let (l, r) = both_numeric(self, rhs)?;
        if let (LuaValue::Integer(a), LuaValue::Integer(b)) = (&l, &r) {
            if *b == 0 {
                return Err(LuaError::new("attempt to perform 'n%%0'"));
            }
            if *b == -1 {
                // i64::MIN.rem_euclid(-1) would overflow; the result is 0
                // for every dividend.
                return Ok(LuaValue::Integer(0));
            }
            let m = a.rem_euclid(*b);
            // rem_euclid is sign-of-divisor-agnostic; Lua's result carries
            // the divisor's sign.
            let m = if m != 0 && (*b < 0) { m + *b } else { m };
            return Ok(LuaValue::Integer(m));
        }
        let a = numeric_as_f64(&l);
        let b = numeric_as_f64(&r);
        Ok(LuaValue::Number(a - (a / b).floor() * b))
    }

    /// `^` always produces a float.
    pub fn pow(&self, rhs: &LuaValue) -> LuaResult<LuaValue> {
        let (a, b) = both_numbers(self, rhs)?;
        Ok(LuaValue::Number(a.powf(b)))
    }

    pub fn unm(&self) -> LuaResult<LuaValue> {
        match self.to_numeric() {
            Some(LuaValue::Integer(i)) => Ok(i
                .checked_neg()
                .map(LuaValue::Integer)
                .unwrap_or(LuaValue::Number(-(i as f64)))),
            Some(LuaValue::Number(n)) => Ok(LuaValue::Number(-n)),
            _ => Err(LuaError::new(format!(
                "attempt to perform arithmetic on a {} value",
                self.type_name()
            ))),
        }
    }

    pub fn not(&self) -> LuaValue {
        LuaValue::Boolean(!self.to_boolean())
    }

    /// The `#` operator for strings and tables.
    pub fn len(&self) -> LuaResult<LuaValue> {
        match self {
            LuaValue::String(s) => Ok(LuaValue::Integer(s.len() as i64)),
            LuaValue::Table(t) => Ok(LuaValue::Integer(t.borrow().length())),
            _ => Err(LuaError::new(format!(
                "attempt to get length of a {} value",
                self.type_name()
            ))),
        }
    }

    // ============ Comparison ============

    /// Raw Lua equality (`==` without metamethods): numbers compare across
    /// the integer/float split, aggregates by identity, NaN ≠ NaN.
    pub fn lua_eq(&self, other: &LuaValue) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Number(a), LuaValue::Number(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Number(b)) => (*a as f64) == *b,
            (LuaValue::Number(a), LuaValue::Integer(b)) => *a == (*b as f64),
            (LuaValue::String(a), LuaValue::String(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => Rc::ptr_eq(a, b),
            (LuaValue::Function(a), LuaValue::Function(b)) => a.id() == b.id(),
            (LuaValue::UserData(a), LuaValue::UserData(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn lt(&self, other: &LuaValue) -> LuaResult<bool> {
        match (self, other) {
            (LuaValue::String(a), LuaValue::String(b)) => Ok(a.as_bytes() < b.as_bytes()),
            _ => match (self.number_view(), other.number_view()) {
                (Some(a), Some(b)) => Ok(a < b),
                _ => Err(compare_error(self, other)),
            },
        }
    }

    pub fn le(&self, other: &LuaValue) -> LuaResult<bool> {
        match (self, other) {
            (LuaValue::String(a), LuaValue::String(b)) => Ok(a.as_bytes() <= b.as_bytes()),
            _ => match (self.number_view(), other.number_view()) {
                (Some(a), Some(b)) => Ok(a <= b),
                _ => Err(compare_error(self, other)),
            },
        }
    }

    pub fn lt_b(&self, other: &LuaValue) -> LuaResult<bool> {
        self.lt(other)
    }

    pub fn le_b(&self, other: &LuaValue) -> LuaResult<bool> {
        self.le(other)
    }

    pub fn gt_b(&self, other: &LuaValue) -> LuaResult<bool> {
        other.lt(self)
    }

    pub fn gteq_b(&self, other: &LuaValue) -> LuaResult<bool> {
        other.le(self)
    }

    /// Numeric view for ordering only: no string coercion (5.2 does not
    /// order strings against numbers).
    fn number_view(&self) -> Option<f64> {
        match self {
            LuaValue::Integer(i) => Some(*i as f64),
            LuaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    // ============ String conversion ============

    /// Fragment for concatenation: strings pass through, numbers format.
    pub fn concat_fragment(&self) -> Option<SmolStr> {
        match self {
            LuaValue::String(s) => Some(s.clone()),
            LuaValue::Integer(i) => {
                let mut buf = itoa::Buffer::new();
                Some(SmolStr::new(buf.format(*i)))
            }
            LuaValue::Number(n) => Some(SmolStr::new(fmt_number(*n))),
            _ => None,
        }
    }

    /// `tostring()` rendering.
    pub fn display_string(&self) -> String {
        match self {
            LuaValue::Nil => "nil".to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            LuaValue::Integer(i) => {
                let mut buf = itoa::Buffer::new();
                buf.format(*i).to_string()
            }
            LuaValue::Number(n) => fmt_number(*n),
            LuaValue::String(s) => s.to_string(),
            LuaValue::Table(t) => format!("table: {:p}", Rc::as_ptr(t)),
            LuaValue::Function(f) => format!("function: 0x{:012x}", f.id()),
            LuaValue::UserData(u) => format!("userdata: {}", u.name),
        }
    }
}

// ============ Arithmetic helpers ============

fn both_numeric(lhs: &LuaValue, rhs: &LuaValue) -> LuaResult<(LuaValue, LuaValue)> {
    match (lhs.to_numeric(), rhs.to_numeric()) {
        (Some(a), Some(b)) => Ok((a, b)),
        (None, _) => Err(arith_error(lhs)),
        (_, None) => Err(arith_error(rhs)),
    }
}

fn both_numbers(lhs: &LuaValue, rhs: &LuaValue) -> LuaResult<(f64, f64)> {
    let (a, b) = both_numeric(lhs, rhs)?;
    Ok((numeric_as_f64(&a), numeric_as_f64(&b)))
}

fn numeric_as_f64(v: &LuaValue) -> f64 {
    match v {
        LuaValue::Integer(i) => *i as f64,
        LuaValue::Number(n) => *n,
        _ => unreachable!("numeric_as_f64 on non-numeric"),
    }
}

fn arith(
    lhs: &LuaValue,
    rhs: &LuaValue,
    _what: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    flt_op: fn(f64, f64) -> f64,
) -> LuaResult<LuaValue> {
    let (l, r) = both_numeric(lhs, rhs)?;
    if let (LuaValue::Integer(a), LuaValue::Integer(b)) = (&l, &r) {
        if let Some(v) = int_op(*a, *b) {
            return Ok(LuaValue::Integer(v));
        }
        // i64 overflow promotes to float, matching the unbounded-number
        // reading of the 5.2 reference.
        return Ok(LuaValue::Number(flt_op(*a as f64, *b as f64)));
    }
    Ok(LuaValue::Number(flt_op(
        numeric_as_f64(&l),
        numeric_as_f64(&r),
    )))
}

fn arith_error(v: &LuaValue) -> LuaError {
    LuaError::new(format!(
        "attempt to perform arithmetic on a {} value",
        v.type_name()
    ))
}

fn compare_error(a: &LuaValue, b: &LuaValue) -> LuaError {
    LuaError::new(format!(
        "attempt to compare {} with {}",
        a.type_name(),
        b.type_name()
    ))
}

/// Number lexing for string coercion: decimal integers, decimal floats,
/// and 0x hex integers, with surrounding whitespace allowed.
pub fn parse_number(s: &str) -> Option<LuaValue> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let (neg, body) = match t.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, t),
    };
    if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16)
            .ok()
            .map(|v| LuaValue::Integer(if neg { -v } else { v }));
    }
    if let Ok(i) = body.parse::<i64>() {
        return Some(LuaValue::Integer(if neg { -i } else { i }));
    }
    body.parse::<f64>()
        .ok()
        .map(|n| LuaValue::Number(if neg { -n } else { n }))
}

/// %.14g-style rendering: integral floats drop the decimal point.
pub fn fmt_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if n.trunc() == n && n.abs() < 1e15 {
        let mut buf = itoa::Buffer::new();
        return buf.format(n as i64).to_string();
    }
    format!("{}", n)
}

// ============ Key equality & hashing ============
// PartialEq deviates from `lua_eq` in exactly one spot: NaN equals NaN, so
// the Eq contract holds for hash keys (the table rejects NaN keys anyway).

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        if let (LuaValue::Number(a), LuaValue::Number(b)) = (self, other) {
            if a.is_nan() && b.is_nan() {
                return true;
            }
        }
        self.lua_eq(other)
    }
}

impl Eq for LuaValue {}

impl Hash for LuaValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            LuaValue::Nil => state.write_u8(0),
            LuaValue::Boolean(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            LuaValue::Integer(i) => {
                state.write_u8(2);
                i.hash(state);
            }
            LuaValue::Number(n) => {
                // Integral floats hash like the equal integer.
                if n.trunc() == *n && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    state.write_u8(2);
                    (*n as i64).hash(state);
                } else {
                    state.write_u8(3);
                    n.to_bits().hash(state);
                }
            }
            LuaValue::String(s) => {
                state.write_u8(4);
                s.as_bytes().hash(state);
            }
            LuaValue::Table(t) => {
                state.write_u8(5);
                (Rc::as_ptr(t) as usize).hash(state);
            }
            LuaValue::Function(f) => {
                state.write_u8(6);
                f.id().hash(state);
            }
            LuaValue::UserData(u) => {
                state.write_u8(7);
                (Rc::as_ptr(u) as usize).hash(state);
            }
        }
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::String(s) => write!(f, "{:?}", s.as_str()),
            other => write!(f, "{}", other.display_string()),
        }
    }
}

impl std::fmt::Debug for LuaFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaFunction::Lua(c) => write!(f, "function: 0x{:012x}", Rc::as_ptr(c) as usize),
            LuaFunction::Host(h) => write!(f, "function: builtin '{}'", h.name()),
        }
    }
}

impl std::fmt::Debug for LuaUserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "userdata: {}", self.name)
    }
}

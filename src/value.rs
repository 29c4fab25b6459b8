//! Macro parameter and result values.

use crate::error::MacroError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Strongly-typed macro parameter or result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    FloatArray(Vec<f64>),
    Array(Vec<ParamValue>),
    Null,
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(fl) => write!(f, "{}", fl),
            ParamValue::String(s) => write!(f, "{}", s),
            ParamValue::FloatArray(arr) => write!(f, "{:?}", arr),
            ParamValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            ParamValue::Null => write!(f, "null"),
        }
    }
}

impl ParamValue {
    /// Interpret a command-line token: integer, float, bool, otherwise string.
    pub fn from_token(token: &str) -> Self {
        if let Ok(i) = token.parse::<i64>() {
            ParamValue::Int(i)
        } else if let Ok(f) = token.parse::<f64>() {
            ParamValue::Float(f)
        } else if let Ok(b) = token.parse::<bool>() {
            ParamValue::Bool(b)
        } else {
            ParamValue::String(token.to_string())
        }
    }

    /// Extract value as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract value as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            ParamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract value as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(value: Vec<f64>) -> Self {
        ParamValue::FloatArray(value)
    }
}

/// Sequential reader over a macro's parameter list.
#[derive(Debug)]
pub struct ParamCursor<'a> {
    macro_name: &'a str,
    params: &'a [ParamValue],
    pos: usize,
}

impl<'a> ParamCursor<'a> {
    pub fn new(macro_name: &'a str, params: &'a [ParamValue]) -> Self {
        Self {
            macro_name,
            params,
            pos: 0,
        }
    }

    /// Parameters not consumed yet
    pub fn remaining(&self) -> usize {
        self.params.len().saturating_sub(self.pos)
    }

    fn next(&mut self, what: &str) -> Result<&'a ParamValue, MacroError> {
        let value = self.params.get(self.pos).ok_or_else(|| {
            MacroError::InvalidParameter(format!("{}: missing {}", self.macro_name, what))
        })?;
        self.pos += 1;
        Ok(value)
    }

    fn invalid(&self, what: &str, value: &ParamValue) -> MacroError {
        MacroError::InvalidParameter(format!(
            "{}: {} has invalid value '{}'",
            self.macro_name, what, value
        ))
    }

    pub fn string(&mut self, what: &str) -> Result<String, MacroError> {
        let value = self.next(what)?;
        match value {
            ParamValue::String(s) => Ok(s.clone()),
            other => Err(self.invalid(what, other)),
        }
    }

    pub fn f64(&mut self, what: &str) -> Result<f64, MacroError> {
        let value = self.next(what)?;
        value.as_f64().ok_or_else(|| self.invalid(what, value))
    }

    pub fn usize(&mut self, what: &str) -> Result<usize, MacroError> {
        let value = self.next(what)?;
        value
            .as_i64()
            .filter(|v| *v >= 0)
            .map(|v| v as usize)
            .ok_or_else(|| self.invalid(what, value))
    }

    /// Finite, non-negative number of seconds
    pub fn seconds(&mut self, what: &str) -> Result<Duration, MacroError> {
        let value = self.f64(what)?;
        seconds(self.macro_name, what, value)
    }

    /// Optional trailing float
    pub fn opt_f64(&mut self, what: &str) -> Result<Option<f64>, MacroError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        self.f64(what).map(Some)
    }

    /// Optional trailing string
    pub fn opt_string(&mut self, what: &str) -> Result<Option<String>, MacroError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        self.string(what).map(Some)
    }

    /// Fail when parameters are left over
    pub fn finish(&self) -> Result<(), MacroError> {
        if self.remaining() > 0 {
            return Err(MacroError::InvalidParameter(format!(
                "{}: {} unexpected trailing parameter(s)",
                self.macro_name,
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Build a parameter list from heterogeneous literals.
///
/// ```
/// use daq_macroserver::params;
/// let p = params!["mot01", 0.0, 10.0, 5, 0.1];
/// assert_eq!(p.len(), 5);
/// ```
#[macro_export]
macro_rules! params {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::value::ParamValue::from($value)),*]
    };
}

/// Duration of `value` seconds; NaN, infinite and negative values are
/// rejected as invalid parameters.
pub fn seconds(macro_name: &str, what: &str, value: f64) -> Result<Duration, MacroError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        MacroError::InvalidParameter(format!(
            "{}: {} must be a finite, non-negative number of seconds, got {}",
            macro_name, what, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_token() {
        assert_eq!(ParamValue::from_token("10"), ParamValue::Int(10));
        assert_eq!(ParamValue::from_token("0.5"), ParamValue::Float(0.5));
        assert_eq!(ParamValue::from_token("true"), ParamValue::Bool(true));
        assert_eq!(
            ParamValue::from_token("mot01"),
            ParamValue::String("mot01".into())
        );
    }

    #[test]
    fn test_numeric_coercions() {
        assert_eq!(ParamValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(ParamValue::Float(4.0).as_i64(), Some(4));
        assert_eq!(ParamValue::Float(4.5).as_i64(), None);
        assert_eq!(ParamValue::from("2.5").as_f64(), Some(2.5));
    }

    #[test]
    fn test_cursor_reads_in_order() {
        let params = crate::params!["mot01", 10.0, 5, "extra"];
        let mut cur = ParamCursor::new("mv", &params);
        assert_eq!(cur.string("motor").unwrap(), "mot01");
        assert_eq!(cur.f64("position").unwrap(), 10.0);
        assert_eq!(cur.usize("intervals").unwrap(), 5);
        assert!(cur.finish().is_err());
        assert_eq!(cur.opt_string("mode").unwrap().as_deref(), Some("extra"));
        assert!(cur.finish().is_ok());
        assert!(matches!(cur.f64("more"), Err(MacroError::InvalidParameter(_))));
    }

    #[test]
    fn test_seconds_rejects_non_finite() {
        assert_eq!(seconds("wait", "seconds", 0.25).unwrap(), Duration::from_millis(250));
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -1.0] {
            assert!(matches!(
                seconds("wait", "seconds", bad),
                Err(MacroError::InvalidParameter(_))
            ));
        }
        let params = crate::params![f64::INFINITY];
        assert!(ParamCursor::new("wait", &params).seconds("seconds").is_err());
    }
}

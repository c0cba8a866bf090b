//! Environment variable parsing with type safety.
//!
//! Provides a parser for `SOAKWATCH_` environment variables that validates
//! values and collects every error so they can be reported together.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Path could not be expanded.
    #[error("Cannot expand path for {var}: {message}")]
    PathExpansion { var: String, message: String },
}

type Lookup = Box<dyn Fn(&str) -> Option<String>>;

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
/// Getters return `None` when the variable is unset or invalid.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a parser reading the process environment with the `SOAKWATCH_`
    /// prefix.
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Create a parser backed by an arbitrary lookup function.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + 'static) -> Self {
        Self {
            prefix: "SOAKWATCH_",
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, var_name: &str) -> Option<String> {
        (self.lookup)(var_name)
    }

    /// Get a non-empty string.
    pub fn get_string(&mut self, name: &str) -> Option<String> {
        let var_name = self.var_name(name);
        self.raw(&var_name).filter(|v| !v.trim().is_empty())
    }

    /// Get a boolean.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off (for false)
    pub fn get_bool(&mut self, name: &str) -> Option<bool> {
        let var_name = self.var_name(name);
        let value = self.raw(&var_name)?;
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Get a u32 with range validation.
    pub fn get_u32_range(&mut self, name: &str, min: u32, max: u32) -> Option<u32> {
        let var_name = self.var_name(name);
        let value = self.raw(&var_name)?;
        match value.trim().parse::<u32>() {
            Ok(n) if (min..=max).contains(&n) => Some(n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: var_name,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "unsigned 32-bit integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Get a duration in humantime syntax (`5s`, `2m 30s`).
    pub fn get_duration(&mut self, name: &str) -> Option<Duration> {
        let var_name = self.var_name(name);
        let value = self.raw(&var_name)?;
        match humantime::parse_duration(value.trim()) {
            Ok(d) => Some(d),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration {
                    var: var_name,
                    value,
                });
                None
            }
        }
    }

    /// Get a path with `~` and `$VAR` expansion.
    pub fn get_path(&mut self, name: &str) -> Option<PathBuf> {
        let var_name = self.var_name(name);
        let value = self.raw(&var_name).filter(|v| !v.trim().is_empty())?;
        match super::expand_path(&value) {
            Ok(path) => Some(path),
            Err(message) => {
                self.errors.push(EnvError::PathExpansion {
                    var: var_name,
                    message,
                });
                None
            }
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parser(vars: &[(&str, &str)]) -> EnvParser {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvParser::with_lookup(move |name| map.get(name).cloned())
    }

    #[test]
    fn test_unset_returns_none_without_error() {
        let mut p = parser(&[]);
        assert_eq!(p.get_string("BRANCH"), None);
        assert_eq!(p.get_bool("EXPORT"), None);
        assert_eq!(p.get_u32_range("PASSES", 1, 100), None);
        assert!(!p.has_errors());
    }

    #[test]
    fn test_bool_parsing() {
        let mut p = parser(&[("SOAKWATCH_A", "yes"), ("SOAKWATCH_B", "OFF")]);
        assert_eq!(p.get_bool("A"), Some(true));
        assert_eq!(p.get_bool("B"), Some(false));
        assert!(!p.has_errors());
    }

    #[test]
    fn test_errors_are_collected() {
        let mut p = parser(&[
            ("SOAKWATCH_PASSES", "zero"),
            ("SOAKWATCH_LIMIT", "500"),
            ("SOAKWATCH_EXPORT", "maybe"),
            ("SOAKWATCH_TICK", "soon"),
        ]);
        assert_eq!(p.get_u32_range("PASSES", 1, 100), None);
        assert_eq!(p.get_u32_range("LIMIT", 1, 100), None);
        assert_eq!(p.get_bool("EXPORT"), None);
        assert_eq!(p.get_duration("TICK"), None);

        let errors = p.take_errors();
        assert_eq!(errors.len(), 4);
        assert!(matches!(errors[1], EnvError::OutOfRange { .. }));
        assert!(matches!(errors[3], EnvError::InvalidDuration { .. }));
        assert!(!p.has_errors());
    }

    #[test]
    fn test_duration_and_path() {
        let mut p = parser(&[
            ("SOAKWATCH_TICK", "250ms"),
            ("SOAKWATCH_CACHE_ROOT", "/srv/perf-cache"),
        ]);
        assert_eq!(p.get_duration("TICK"), Some(Duration::from_millis(250)));
        assert_eq!(
            p.get_path("CACHE_ROOT"),
            Some(PathBuf::from("/srv/perf-cache"))
        );
    }
}

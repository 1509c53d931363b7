//! Package identity extraction from SCIP symbol names.
//!
//! Global symbols carry their package inline:
//!
//! ```text
//! <scheme> ' ' <manager> ' ' <package-name> ' ' <version> ' ' <descriptors>
//! ```
//!
//! Inside a token, a double space encodes a literal space and a lone `.`
//! encodes an empty value. Symbols starting with `local ` are document-local
//! and never belong to a package.

use crate::models::Package;

const LOCAL_PREFIX: &str = "local ";

/// Errors produced while parsing a global symbol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    #[error("symbol {symbol:?} is missing its {part}")]
    Missing { symbol: String, part: &'static str },

    #[error("symbol {symbol:?} has an empty scheme")]
    EmptyScheme { symbol: String },
}

/// A global symbol split into package and descriptor parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSymbol<'a> {
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
    pub descriptors: &'a str,
}

impl ParsedSymbol<'_> {
    pub fn package(&self) -> Package {
        Package {
            scheme: self.scheme.clone(),
            manager: self.manager.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

pub fn is_local_symbol(symbol: &str) -> bool {
    symbol.starts_with(LOCAL_PREFIX)
}

/// Parses a symbol. Returns `Ok(None)` for empty and local symbols.
pub fn parse_symbol(symbol: &str) -> Result<Option<ParsedSymbol<'_>>, SymbolError> {
    if symbol.is_empty() || is_local_symbol(symbol) {
        return Ok(None);
    }

    let mut rest = symbol;
    let mut parts: [String; 4] = Default::default();
    const PART_NAMES: [&str; 4] = ["scheme", "package manager", "package name", "version"];

    for (slot, part) in parts.iter_mut().zip(PART_NAMES) {
        let (token, remainder) = next_token(rest).ok_or_else(|| SymbolError::Missing {
            symbol: symbol.to_string(),
            part,
        })?;
        *slot = token;
        rest = remainder;
    }

    if rest.is_empty() {
        return Err(SymbolError::Missing {
            symbol: symbol.to_string(),
            part: "descriptors",
        });
    }

    let [scheme, manager, name, version] = parts;
    if scheme.is_empty() {
        return Err(SymbolError::EmptyScheme {
            symbol: symbol.to_string(),
        });
    }

    Ok(Some(ParsedSymbol {
        scheme,
        manager,
        name,
        version,
        descriptors: rest,
    }))
}

/// Package a symbol belongs to, if any.
///
/// Local symbols, malformed symbols, and symbols whose package name is
/// empty contribute no package.
pub fn package_for_symbol(symbol: &str) -> Option<Package> {
    match parse_symbol(symbol) {
        Ok(Some(parsed)) if !parsed.name.is_empty() => Some(parsed.package()),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(error = %err, "skipping malformed symbol");
            None
        }
    }
}

/// Splits one space-terminated token off `input`, unescaping double spaces.
///
/// Returns `None` when the input ends before the terminating space.
fn next_token(input: &str) -> Option<(String, &str)> {
    let bytes = input.as_bytes();
    let mut token = String::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b' ' {
            if bytes.get(i + 1) == Some(&b' ') {
                token.push_str(&input[start..i]);
                token.push(' ');
                i += 2;
                start = i;
                continue;
            }
            token.push_str(&input[start..i]);
            let token = if token == "." { String::new() } else { token };
            return Some((token, &input[i + 1..]));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_symbol() {
        let parsed = parse_symbol("scip-go gomod github.com/foo/bar v1.2.3 `pkg`/Func().")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.scheme, "scip-go");
        assert_eq!(parsed.manager, "gomod");
        assert_eq!(parsed.name, "github.com/foo/bar");
        assert_eq!(parsed.version, "v1.2.3");
        assert_eq!(parsed.descriptors, "`pkg`/Func().");
    }

    #[test]
    fn test_local_and_empty_symbols_have_no_package() {
        assert_eq!(parse_symbol("local 12").unwrap(), None);
        assert_eq!(parse_symbol("").unwrap(), None);
        assert_eq!(package_for_symbol("local 3"), None);
    }

    #[test]
    fn test_dot_placeholder_is_empty() {
        let parsed = parse_symbol("scip-ruby gem . . Foo#").unwrap().unwrap();
        assert_eq!(parsed.manager, "gem");
        assert_eq!(parsed.name, "");
        assert_eq!(parsed.version, "");
        assert_eq!(package_for_symbol("scip-ruby gem . . Foo#"), None);
    }

    #[test]
    fn test_double_space_is_literal_space() {
        let parsed = parse_symbol("scheme manager my  package 1.0 Desc#")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.name, "my package");
        assert_eq!(parsed.version, "1.0");
    }

    #[test]
    fn test_missing_parts_are_errors() {
        assert!(matches!(
            parse_symbol("scip-go gomod name"),
            Err(SymbolError::Missing { part: "package name", .. })
        ));
        assert!(matches!(
            parse_symbol("scip-go gomod name v1 "),
            Err(SymbolError::Missing { part: "descriptors", .. })
        ));
        assert_eq!(package_for_symbol("garbage"), None);
    }

    #[test]
    fn test_package_for_symbol() {
        let pkg = package_for_symbol("scip-typescript npm react 18.2.0 `index.d.ts`/useState().")
            .unwrap();
        assert_eq!(
            pkg,
            Package {
                scheme: "scip-typescript".to_string(),
                manager: "npm".to_string(),
                name: "react".to_string(),
                version: "18.2.0".to_string(),
            }
        );
    }
}

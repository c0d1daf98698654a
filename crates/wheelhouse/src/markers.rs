//! Translation of PEP 508 environment markers into conda selector
//! expressions.
//!
//! A marker restricts a dependency to certain environments
//! (`sys_platform == 'win32'`); conda expresses the same idea with selector
//! conditions (`; if __win`). Most marker atoms map onto a selector fragment,
//! but two do not produce a condition at all: CPython-implementation checks
//! either make the dependency unconditional or impossible to materialize.
//! Those two outcomes are first-class ([`Condition::IncludeAlways`] and
//! [`Condition::DropDep`]) rather than strings.

use pep508_rs::{
    MarkerExpression, MarkerOperator, MarkerTree, MarkerValue, MarkerValueString,
    MarkerValueVersion,
};
use thiserror::Error;

/// The outcome of translating a marker tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// A conda selector expression, to be appended as `; if <selector>`.
    Selector(String),
    /// The marker is always satisfied for conda's purposes; the dependency is
    /// included without a condition.
    IncludeAlways,
    /// The marker can never be satisfied for conda's purposes; the dependency
    /// is dropped entirely.
    DropDep,
}

/// A marker that cannot be expressed as a conda selector.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum MarkerError {
    #[error("cannot convert marker variable '{0}': unsupported")]
    UnsupportedVariable(String),

    #[error("unknown {variable} value: {value}")]
    UnknownValue { variable: String, value: String },

    #[error("platform_version requires a platform marker")]
    UnpairedPlatformVersion,
}

/// Translation of a single comparison.
enum Atom {
    /// An ordinary selector fragment, e.g. `python <3.11` or `not __win`.
    Fragment(String),
    /// A bare platform flag (`__win`, `__linux`, `__osx`, `__unix`), eligible
    /// for fusion with a `platform_version` comparison.
    Platform(&'static str),
    /// A `platform_version` comparison, deferred until a platform flag is
    /// found to attach it to. Holds `<op><value>`.
    PlatformVersion(String),
    IncludeAlways,
    DropDep,
}

/// Translates a full marker tree into a conda selector (or one of the two
/// sentinels).
pub fn marker_to_condition(marker: &MarkerTree) -> Result<Condition, MarkerError> {
    match translate_tree(marker)? {
        Node::Fragment(selector) | Node::Platform(selector) => {
            Ok(Condition::Selector(selector))
        }
        Node::PlatformVersion(_) => Err(MarkerError::UnpairedPlatformVersion),
        Node::IncludeAlways => Ok(Condition::IncludeAlways),
        Node::DropDep => Ok(Condition::DropDep),
    }
}

/// Splits `extra == 'NAME'` out of a requirement marker.
///
/// Three shapes are admitted: the bare extra, `extra == 'x' and REST`, and
/// `REST and extra == 'x'`. Returns the extra name and the leftover marker
/// tree (to be translated separately), or `None` when the marker is not
/// extra-shaped at all.
pub fn extract_extra(marker: &MarkerTree) -> Option<(String, Option<MarkerTree>)> {
    if let Some(name) = as_extra_comparison(marker) {
        return Some((name, None));
    }

    let MarkerTree::And(children) = marker else {
        return None;
    };
    if children.len() < 2 {
        return None;
    }

    if let Some(name) = as_extra_comparison(&children[0]) {
        return Some((name, Some(rest_of(&children[1..]))));
    }
    if let Some(name) = as_extra_comparison(&children[children.len() - 1]) {
        return Some((name, Some(rest_of(&children[..children.len() - 1]))));
    }

    None
}

fn as_extra_comparison(tree: &MarkerTree) -> Option<String> {
    match tree {
        MarkerTree::Expression(MarkerExpression {
            l_value: MarkerValue::Extra,
            operator: MarkerOperator::Equal,
            r_value: MarkerValue::QuotedString(name),
        }) => Some(name.clone()),
        _ => None,
    }
}

fn rest_of(children: &[MarkerTree]) -> MarkerTree {
    if children.len() == 1 {
        children[0].clone()
    } else {
        MarkerTree::And(children.to_vec())
    }
}

/// Intermediate result for a (sub)tree. `Platform` and `PlatformVersion` stay
/// distinguishable so a parent `and` node can fuse them; everything else is an
/// opaque fragment.
enum Node {
    Fragment(String),
    Platform(String),
    PlatformVersion(String),
    IncludeAlways,
    DropDep,
}

fn translate_tree(tree: &MarkerTree) -> Result<Node, MarkerError> {
    match tree {
        MarkerTree::Expression(expr) => Ok(match translate_atom(expr)? {
            Atom::Fragment(s) => Node::Fragment(s),
            Atom::Platform(flag) => Node::Platform(flag.to_owned()),
            Atom::PlatformVersion(v) => Node::PlatformVersion(v),
            Atom::IncludeAlways => Node::IncludeAlways,
            Atom::DropDep => Node::DropDep,
        }),
        MarkerTree::And(children) => translate_junction(children, "and"),
        MarkerTree::Or(children) => translate_junction(children, "or"),
    }
}

fn translate_junction(children: &[MarkerTree], joiner: &str) -> Result<Node, MarkerError> {
    let mut pieces: Vec<Node> = Vec::new();
    let mut saw_include_always = false;
    let mut saw_drop = false;

    for child in children {
        let piece = match translate_tree(child)? {
            // A nested junction keeps its own grouping.
            Node::Fragment(inner) if matches!(child, MarkerTree::And(_) | MarkerTree::Or(_)) => {
                Node::Fragment(format!("({inner})"))
            }
            other => other,
        };
        match piece {
            Node::IncludeAlways => saw_include_always = true,
            Node::DropDep => saw_drop = true,
            other => pieces.push(other),
        }
    }

    // Any impossible leg poisons the whole dependency. Under `or` this is a
    // conservative simplification; it mirrors the upstream behavior.
    if saw_drop {
        return Ok(Node::DropDep);
    }
    if pieces.is_empty() {
        debug_assert!(saw_include_always);
        return Ok(Node::IncludeAlways);
    }

    // `platform_version` must pair up with exactly one bare platform flag,
    // and only within an `and` node.
    let version_count = pieces
        .iter()
        .filter(|p| matches!(p, Node::PlatformVersion(_)))
        .count();
    if version_count > 0 {
        let platform_count = pieces
            .iter()
            .filter(|p| matches!(p, Node::Platform(_)))
            .count();
        if joiner != "and" || version_count != 1 || platform_count != 1 {
            return Err(MarkerError::UnpairedPlatformVersion);
        }
        let version = pieces
            .iter()
            .find_map(|p| match p {
                Node::PlatformVersion(v) => Some(v.clone()),
                _ => None,
            })
            .expect("counted above");
        pieces = pieces
            .into_iter()
            .filter(|p| !matches!(p, Node::PlatformVersion(_)))
            .map(|p| match p {
                Node::Platform(flag) => Node::Fragment(format!("{flag} {version}")),
                other => other,
            })
            .collect();
    }

    let selector = pieces
        .iter()
        .map(|p| match p {
            Node::Fragment(s) | Node::Platform(s) => s.as_str(),
            _ => unreachable!("sentinels and versions removed above"),
        })
        .collect::<Vec<_>>()
        .join(&format!(" {joiner} "));

    Ok(Node::Fragment(selector))
}

fn translate_atom(expr: &MarkerExpression) -> Result<Atom, MarkerError> {
    let variable = match &expr.l_value {
        MarkerValue::MarkerEnvString(s) => Variable::String(s),
        MarkerValue::MarkerEnvVersion(v) => Variable::Version(v),
        other => return Err(MarkerError::UnsupportedVariable(value_name(other))),
    };
    let MarkerValue::QuotedString(value) = &expr.r_value else {
        return Err(MarkerError::UnsupportedVariable(value_name(&expr.r_value)));
    };
    let op = &expr.operator;

    match variable {
        Variable::Version(MarkerValueVersion::PythonVersion) => {
            Ok(Atom::Fragment(format!("python {op}{value}")))
        }
        Variable::String(MarkerValueString::SysPlatform)
        | Variable::String(MarkerValueString::SysPlatformDeprecated) => {
            let flag = match value.as_str() {
                "win32" | "cygwin" => "__win",
                "linux" => "__linux",
                "darwin" => "__osx",
                _ => {
                    return Err(MarkerError::UnknownValue {
                        variable: "sys_platform".into(),
                        value: value.clone(),
                    })
                }
            };
            platform_atom(flag, op, "sys_platform")
        }
        Variable::String(MarkerValueString::PlatformSystem) => {
            let flag = match value.as_str() {
                "Windows" => "__win",
                "Linux" => "__linux",
                "Darwin" => "__osx",
                _ => {
                    return Err(MarkerError::UnknownValue {
                        variable: "platform_system".into(),
                        value: value.clone(),
                    })
                }
            };
            platform_atom(flag, op, "platform_system")
        }
        Variable::String(MarkerValueString::OsName)
        | Variable::String(MarkerValueString::OsNameDeprecated) => {
            match (op, value.as_str()) {
                (MarkerOperator::Equal, "nt") => Ok(Atom::Platform("__win")),
                (MarkerOperator::Equal, "posix") => Ok(Atom::Platform("__unix")),
                (MarkerOperator::NotEqual, "nt") => Ok(Atom::Platform("__unix")),
                _ => Err(MarkerError::UnsupportedVariable("os_name".into())),
            }
        }
        Variable::String(MarkerValueString::PlatformVersion)
        | Variable::String(MarkerValueString::PlatformVersionDeprecated) => {
            Ok(Atom::PlatformVersion(format!("{op}{value}")))
        }
        Variable::String(MarkerValueString::PlatformPythonImplementation)
        | Variable::String(MarkerValueString::PlatformPythonImplementationDeprecated)
        | Variable::String(MarkerValueString::ImplementationName) => {
            let is_cpython = value.eq_ignore_ascii_case("cpython");
            match op {
                MarkerOperator::Equal if is_cpython => Ok(Atom::IncludeAlways),
                MarkerOperator::Equal => Ok(Atom::DropDep),
                MarkerOperator::NotEqual if is_cpython => Ok(Atom::DropDep),
                MarkerOperator::NotEqual => Ok(Atom::IncludeAlways),
                _ => Err(MarkerError::UnsupportedVariable(
                    value_name(&expr.l_value),
                )),
            }
        }
        _ => Err(MarkerError::UnsupportedVariable(value_name(&expr.l_value))),
    }
}

enum Variable<'a> {
    String(&'a MarkerValueString),
    Version(&'a MarkerValueVersion),
}

fn platform_atom(
    flag: &'static str,
    op: &MarkerOperator,
    variable: &str,
) -> Result<Atom, MarkerError> {
    match op {
        MarkerOperator::Equal => Ok(Atom::Platform(flag)),
        // Negated flags are ordinary fragments: they never fuse with a
        // platform_version comparison.
        MarkerOperator::NotEqual => Ok(Atom::Fragment(format!("not {flag}"))),
        _ => Err(MarkerError::UnsupportedVariable(variable.to_owned())),
    }
}

fn value_name(value: &MarkerValue) -> String {
    match value {
        MarkerValue::QuotedString(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    fn translate(marker: &str) -> Result<Condition, MarkerError> {
        marker_to_condition(&MarkerTree::from_str(marker).unwrap())
    }

    fn selector(marker: &str) -> String {
        match translate(marker).unwrap() {
            Condition::Selector(s) => s,
            other => panic!("expected a selector, got {other:?}"),
        }
    }

    #[rstest]
    #[case("python_version < '3.11'", "python <3.11")]
    #[case("python_version >= '3.8'", "python >=3.8")]
    #[case("sys_platform == 'win32'", "__win")]
    #[case("sys_platform == 'cygwin'", "__win")]
    #[case("sys_platform == 'linux'", "__linux")]
    #[case("sys_platform == 'darwin'", "__osx")]
    #[case("sys_platform != 'darwin'", "not __osx")]
    #[case("platform_system == 'Windows'", "__win")]
    #[case("platform_system != 'Linux'", "not __linux")]
    #[case("os_name == 'nt'", "__win")]
    #[case("os_name == 'posix'", "__unix")]
    #[case("os_name != 'nt'", "__unix")]
    fn test_atom_table(#[case] marker: &str, #[case] expected: &str) {
        assert_eq!(selector(marker), expected);
    }

    #[test]
    fn test_conjunction() {
        assert_eq!(
            selector("python_version >= '3.8' and sys_platform == 'win32'"),
            "python >=3.8 and __win"
        );
    }

    #[test]
    fn test_disjunction() {
        assert_eq!(
            selector("sys_platform == 'win32' or sys_platform == 'linux'"),
            "__win or __linux"
        );
    }

    #[test]
    fn test_nested_subtree_keeps_parentheses() {
        assert_eq!(
            selector("python_version >= '3.8' and (sys_platform == 'win32' or sys_platform == 'linux')"),
            "python >=3.8 and (__win or __linux)"
        );
    }

    #[rstest]
    #[case("sys_platform == 'win32' and platform_version >= '10.0'", "__win >=10.0")]
    #[case("sys_platform == 'darwin' and platform_version >= '21.0'", "__osx >=21.0")]
    #[case("platform_version >= '5.4' and sys_platform == 'linux'", "__linux >=5.4")]
    fn test_platform_version_fusion(#[case] marker: &str, #[case] expected: &str) {
        assert_eq!(selector(marker), expected);
    }

    #[test]
    fn test_platform_version_alone_is_an_error() {
        assert!(matches!(
            translate("platform_version >= '10.0'"),
            Err(MarkerError::UnpairedPlatformVersion)
        ));
    }

    #[test]
    fn test_platform_version_with_nested_platform_is_an_error() {
        // The flags are hidden inside a nested subtree and cannot fuse.
        assert!(matches!(
            translate(
                "(sys_platform == 'win32' or sys_platform == 'linux') and platform_version >= '10.0'"
            ),
            Err(MarkerError::UnpairedPlatformVersion)
        ));
    }

    #[test]
    fn test_unsupported_variable_is_named() {
        let err = translate("platform_machine == 'x86_64'").unwrap_err();
        assert!(err.to_string().contains("platform_machine"));
    }

    #[rstest]
    #[case("platform_python_implementation == 'CPython'", Condition::IncludeAlways)]
    #[case("platform_python_implementation == 'PyPy'", Condition::DropDep)]
    #[case("platform_python_implementation != 'CPython'", Condition::DropDep)]
    #[case("platform_python_implementation != 'PyPy'", Condition::IncludeAlways)]
    #[case("implementation_name == 'cpython'", Condition::IncludeAlways)]
    #[case("implementation_name == 'pypy'", Condition::DropDep)]
    fn test_implementation_sentinels(#[case] marker: &str, #[case] expected: Condition) {
        assert_eq!(translate(marker).unwrap(), expected);
    }

    #[test]
    fn test_include_always_is_erased_in_conjunction() {
        assert_eq!(
            selector("implementation_name == 'cpython' and sys_platform == 'win32'"),
            "__win"
        );
    }

    #[test]
    fn test_drop_dep_poisons_disjunction() {
        // Conservative: any impossible leg drops the whole dependency.
        assert_eq!(
            translate("sys_platform == 'win32' or implementation_name == 'pypy'").unwrap(),
            Condition::DropDep
        );
    }

    #[test]
    fn test_extract_extra_pure() {
        let marker = MarkerTree::from_str("extra == 'dev'").unwrap();
        let (name, rest) = extract_extra(&marker).unwrap();
        assert_eq!(name, "dev");
        assert!(rest.is_none());
    }

    #[test]
    fn test_extract_extra_left() {
        let marker = MarkerTree::from_str("extra == 'dev' and python_version >= '3.8'").unwrap();
        let (name, rest) = extract_extra(&marker).unwrap();
        assert_eq!(name, "dev");
        let rest = rest.unwrap();
        assert_eq!(
            marker_to_condition(&rest).unwrap(),
            Condition::Selector("python >=3.8".into())
        );
    }

    #[test]
    fn test_extract_extra_right() {
        let marker = MarkerTree::from_str("sys_platform == 'win32' and extra == 'dev'").unwrap();
        let (name, rest) = extract_extra(&marker).unwrap();
        assert_eq!(name, "dev");
        assert_eq!(
            marker_to_condition(&rest.unwrap()).unwrap(),
            Condition::Selector("__win".into())
        );
    }

    #[test]
    fn test_extract_extra_not_an_extra() {
        let marker = MarkerTree::from_str("python_version < '3.11'").unwrap();
        assert!(extract_extra(&marker).is_none());
    }

    #[test]
    fn test_leftover_extra_is_unsupported() {
        // An extra under `or` is not one of the admitted shapes; translation
        // must reject it rather than guess.
        let marker = MarkerTree::from_str("extra == 'dev' or sys_platform == 'win32'").unwrap();
        assert!(extract_extra(&marker).is_none());
        assert!(translate("extra == 'dev' or sys_platform == 'win32'").is_err());
    }
}

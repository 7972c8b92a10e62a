//! Static validation — run this before compiling or executing a script.
//!
//! Checks enforced, in order:
//! 1. Size ceiling (oversized scripts are rejected outright).
//! 2. Dangerous-construct scan (regex table; every match is fatal).
//! 3. Syntax check via a parse-only compile (the script is never executed).
//! 4. Best-practice warnings (non-fatal, only emitted when nothing fatal).
//!
//! The whole pass is a pure function of the script text: no I/O, no
//! execution, deterministic diagnostic ordering (errors before warnings,
//! scan order within each group).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Scripts longer than this many characters are rejected before any
/// further inspection.
pub const MAX_SCRIPT_CHARS: usize = 100_000;

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Diagnostic severity. `valid` is true iff no `Error` diagnostics exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One finding from the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    /// 1-based line of the offending text; 0 when unknown.
    pub line: usize,
    /// 1-based column of the offending text; 0 when unknown.
    pub column: usize,
    pub message: String,
    pub severity: Severity,
    /// Stable machine-readable code, e.g. `SECURITY_EVAL_FORBIDDEN`.
    pub code: String,
}

/// The outcome of validating one script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl ValidationReport {
    /// The first fatal diagnostic, if any. Convenient for one-line error
    /// surfaces (CLI, compile errors).
    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.errors.first()
    }
}

// ---------------------------------------------------------------------------
// Dangerous-construct table
// ---------------------------------------------------------------------------

struct DangerPattern {
    regex: Regex,
    code: &'static str,
    message: &'static str,
}

static DANGER_PATTERNS: LazyLock<Vec<DangerPattern>> = LazyLock::new(|| {
    let table: &[(&str, &str, &str)] = &[
        (
            r"\beval\s*\(",
            "SECURITY_EVAL_FORBIDDEN",
            "direct eval() is forbidden inside node scripts",
        ),
        (
            r"[=:]\s*eval\b",
            "SECURITY_EVAL_FORBIDDEN",
            "aliasing eval is forbidden inside node scripts",
        ),
        (
            r"\bnew\s+Function\b",
            "SECURITY_FUNCTION_CONSTRUCTOR",
            "constructing functions from strings is forbidden",
        ),
        (
            r"\bFunction\s*\(",
            "SECURITY_FUNCTION_CONSTRUCTOR",
            "constructing functions from strings is forbidden",
        ),
        (
            r"__proto__",
            "SECURITY_PROTOTYPE_POLLUTION",
            "__proto__ access is forbidden",
        ),
        (
            r"\.prototype\s*(\.\s*\w+|\[[^\]]*\])\s*=",
            "SECURITY_PROTOTYPE_POLLUTION",
            "prototype mutation is forbidden",
        ),
        (
            r"\bconstructor\s*\(",
            "SECURITY_CONSTRUCTOR_CALL",
            "bare constructor() invocation is forbidden",
        ),
        (
            r"\b(process|require|document|window|localStorage|sessionStorage)\b",
            "SECURITY_HOST_ACCESS",
            "host environment objects are not available inside the sandbox",
        ),
        (
            r"\bimport\s*\(",
            "SECURITY_DYNAMIC_IMPORT",
            "dynamic import() is forbidden; use a static import of an allowed package",
        ),
        (
            r#"\bon\w+\s*=\s*["']"#,
            "SECURITY_INLINE_HANDLER",
            "inline event-handler strings are forbidden",
        ),
        (
            r"(javascript:|data:text/html)",
            "SECURITY_URI_SCHEME",
            "script-bearing URI schemes are forbidden",
        ),
    ];

    table
        .iter()
        .map(|(pattern, code, message)| DangerPattern {
            // Patterns are compile-time constants; a failure here is a
            // programming error caught by the tests below.
            regex: Regex::new(pattern).unwrap_or_else(|e| {
                panic!("invalid danger pattern {pattern:?}: {e}")
            }),
            code,
            message,
        })
        .collect()
});

/// Parse-only engine. Compilation never runs user code, so one shared
/// engine with no registered functions is enough for syntax checking.
static PARSER: LazyLock<rhai::Engine> = LazyLock::new(rhai::Engine::new_raw);

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Validate a script without executing it.
pub fn validate(script: &str) -> ValidationReport {
    // -----------------------------------------------------------------------
    // 1. Size ceiling (in characters, not bytes) — fatal, short-circuits
    //    everything else.
    // -----------------------------------------------------------------------
    if script.chars().count() > MAX_SCRIPT_CHARS {
        return ValidationReport {
            valid: false,
            errors: vec![Diagnostic {
                line: 0,
                column: 0,
                message: format!(
                    "script exceeds the {MAX_SCRIPT_CHARS}-character ceiling"
                ),
                severity: Severity::Error,
                code: "SCRIPT_TOO_LARGE".to_string(),
            }],
            warnings: Vec::new(),
        };
    }

    // -----------------------------------------------------------------------
    // 2. Dangerous-construct scan — every match is fatal.
    // -----------------------------------------------------------------------
    let mut errors = scan_dangerous_constructs(script);

    // -----------------------------------------------------------------------
    // 3. Syntax check — parse-only compile, skipped once something fatal
    //    has already been found.
    // -----------------------------------------------------------------------
    if errors.is_empty() {
        if let Err(parse_err) = PARSER.compile(script) {
            let pos = parse_err.position();
            errors.push(Diagnostic {
                line: pos.line().unwrap_or(0),
                column: pos.position().unwrap_or(0),
                message: parse_err.to_string(),
                severity: Severity::Error,
                code: "SYNTAX_ERROR".to_string(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // 4. Best-practice warnings — only when the script is otherwise clean.
    // -----------------------------------------------------------------------
    let warnings = if errors.is_empty() {
        collect_warnings(script)
    } else {
        Vec::new()
    };

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Run only the dangerous-construct scan. The execution engine re-runs this
/// as a final pre-execution gate even when full validation happened at
/// compile time.
pub fn scan_dangerous_constructs(script: &str) -> Vec<Diagnostic> {
    let mut findings = Vec::new();

    for pattern in DANGER_PATTERNS.iter() {
        for m in pattern.regex.find_iter(script) {
            let (line, column) = line_col(script, m.start());
            findings.push(Diagnostic {
                line,
                column,
                message: format!("{} (matched `{}`)", pattern.message, m.as_str().trim()),
                severity: Severity::Error,
                code: pattern.code.to_string(),
            });
        }
    }

    findings
}

fn collect_warnings(script: &str) -> Vec<Diagnostic> {
    static DEBUG_CALL: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\bdebug\s*\(").unwrap_or_else(|e| panic!("{e}")));

    let mut warnings = Vec::new();

    // A node script that neither calls set_output nor ends in an object map
    // produces no output sockets at all.
    if !script.contains("set_output") && !script.contains("#{") {
        warnings.push(Diagnostic {
            line: 0,
            column: 0,
            message: "script never sets an output; downstream nodes will see nothing"
                .to_string(),
            severity: Severity::Warning,
            code: "NO_OUTPUTS".to_string(),
        });
    }

    if let Some(m) = DEBUG_CALL.find(script) {
        let (line, column) = line_col(script, m.start());
        warnings.push(Diagnostic {
            line,
            column,
            message: "debug() output is noisy in node logs; prefer log(message, level)"
                .to_string(),
            severity: Severity::Warning,
            code: "DISCOURAGED_DEBUG".to_string(),
        });
    }

    warnings
}

/// Translate a byte offset into 1-based (line, column).
fn line_col(text: &str, offset: usize) -> (usize, usize) {
    let prefix = &text[..offset.min(text.len())];
    let line = prefix.bytes().filter(|&b| b == b'\n').count() + 1;
    let column = match prefix.rfind('\n') {
        Some(nl) => prefix[nl + 1..].chars().count() + 1,
        None => prefix.chars().count() + 1,
    };
    (line, column)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn codes(report: &ValidationReport) -> Vec<&str> {
        report.errors.iter().map(|d| d.code.as_str()).collect()
    }

    #[test]
    fn clean_script_passes() {
        let report = validate(r#"set_output("sum", get_input("a") + get_input("b"));"#);
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn oversized_script_is_rejected_without_scanning() {
        let big = "x".repeat(MAX_SCRIPT_CHARS + 1);
        let report = validate(&big);
        assert!(!report.valid);
        assert_eq!(codes(&report), vec!["SCRIPT_TOO_LARGE"]);
    }

    #[test]
    fn size_ceiling_counts_characters_not_bytes() {
        // Exactly at the ceiling in characters but far beyond it in bytes.
        let script = format!("//{}", "é".repeat(MAX_SCRIPT_CHARS - 2));
        assert!(script.len() > MAX_SCRIPT_CHARS);
        let report = validate(&script);
        assert!(!codes(&report).contains(&"SCRIPT_TOO_LARGE"));
    }

    #[test]
    fn report_round_trips_through_serde() {
        let report = validate(r#"let r = eval("1 + 1");"#);
        let json = serde_json::to_string(&report).expect("serialize");
        let back: ValidationReport = serde_json::from_str(&json).expect("deserialize");
        assert!(!back.valid);
        assert_eq!(back.errors[0].code, report.errors[0].code);
        assert_eq!(back.errors[0].line, report.errors[0].line);
    }

    #[test]
    fn eval_is_rejected() {
        let report = validate(r#"let r = eval("1 + 1");"#);
        assert!(!report.valid);
        assert!(codes(&report).contains(&"SECURITY_EVAL_FORBIDDEN"));
    }

    #[test]
    fn aliased_eval_is_rejected() {
        let report = validate("let sneaky = eval;\nsneaky(\"1\");");
        assert!(!report.valid);
        assert!(codes(&report).contains(&"SECURITY_EVAL_FORBIDDEN"));
    }

    #[test]
    fn function_constructor_is_rejected() {
        for script in [r#"let f = new Function("return 1");"#, r#"Function("x")"#] {
            let report = validate(script);
            assert!(codes(&report).contains(&"SECURITY_FUNCTION_CONSTRUCTOR"), "{script}");
        }
    }

    #[test]
    fn proto_access_is_rejected() {
        let report = validate(r#"let p = obj.__proto__;"#);
        assert!(codes(&report).contains(&"SECURITY_PROTOTYPE_POLLUTION"));
    }

    #[test]
    fn prototype_mutation_is_rejected() {
        let report = validate(r#"Object.prototype.polluted = "x";"#);
        assert!(codes(&report).contains(&"SECURITY_PROTOTYPE_POLLUTION"));
    }

    #[test]
    fn host_globals_are_rejected() {
        for script in ["process.exit(1)", "window.alert(1)", "localStorage.x"] {
            let report = validate(script);
            assert!(codes(&report).contains(&"SECURITY_HOST_ACCESS"), "{script}");
        }
    }

    #[test]
    fn dynamic_import_is_rejected() {
        let report = validate(r#"import("evil_pkg");"#);
        assert!(codes(&report).contains(&"SECURITY_DYNAMIC_IMPORT"));
    }

    #[test]
    fn uri_schemes_are_rejected() {
        let report = validate(r#"let u = "javascript:alert(1)";"#);
        assert!(codes(&report).contains(&"SECURITY_URI_SCHEME"));
    }

    #[test]
    fn syntax_error_reports_line_number() {
        let report = validate("let a = 1;\nlet b = ;\n");
        assert!(!report.valid);
        let err = report.first_error().expect("one error");
        assert_eq!(err.code, "SYNTAX_ERROR");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn errors_precede_warnings_and_are_deterministic() {
        let script = "let x = eval(\"1\");\ndebug(x);";
        let first = validate(script);
        let second = validate(script);
        assert_eq!(codes(&first), codes(&second));
        // Fatal findings suppress the warning tier entirely.
        assert!(first.warnings.is_empty());
    }

    #[test]
    fn script_without_outputs_warns() {
        let report = validate("let a = get_input(\"a\");");
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.code == "NO_OUTPUTS"));
    }

    #[test]
    fn debug_call_warns_with_position() {
        let report = validate("set_output(\"a\", 1);\ndebug(\"hi\");");
        assert!(report.valid);
        let warn = report
            .warnings
            .iter()
            .find(|w| w.code == "DISCOURAGED_DEBUG")
            .expect("debug warning");
        assert_eq!(warn.line, 2);
    }
}

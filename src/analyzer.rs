use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::HashSet;
use tracing::error;

/// Structural metrics computed without executing anything
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityMetrics {
    pub cyclomatic_complexity: u32,
    pub lines_of_code: u32,
    pub maintainability_index: f64,
    pub cognitive_complexity: u32,
}

/// Syntax families sharing a branching vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    CLike,
    Rust,
    Python,
    Ruby,
}

impl Family {
    fn for_language(language: &str) -> Self {
        match language.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Family::Python,
            "ruby" | "rb" => Family::Ruby,
            "rust" | "rs" => Family::Rust,
            _ => Family::CLike,
        }
    }

    fn branch_patterns(&self) -> &'static [Regex] {
        match self {
            Family::CLike => &C_LIKE_BRANCHES,
            Family::Rust => &RUST_BRANCHES,
            Family::Python => &PYTHON_BRANCHES,
            Family::Ruby => &RUBY_BRANCHES,
        }
    }

    fn literals_and_comments(&self) -> Option<&'static Regex> {
        match self {
            Family::CLike => C_LIKE_LITERALS.as_ref(),
            Family::Rust => RUST_LITERALS.as_ref(),
            Family::Python => PYTHON_LITERALS.as_ref(),
            Family::Ruby => RUBY_LITERALS.as_ref(),
        }
    }
}

fn compile_one(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            error!("Invalid analyzer pattern {}: {}", pattern, e);
            None
        }
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| compile_one(p)).collect()
}

lazy_static! {
    static ref C_LIKE_BRANCHES: Vec<Regex> = compile(&[
        r"\b(if|else|while|for|switch|case|catch|select)\b",
        r"&&|\|\|",
        // Ternary, not optional chaining / nullish coalescing / optional params
        r"(^|[^?])\?[^?.:]",
    ]);
    static ref RUST_BRANCHES: Vec<Regex> = compile(&[
        r"\b(if|else|while|for|loop|match)\b",
        r"=>",
        r"&&|\|\|",
    ]);
    static ref PYTHON_BRANCHES: Vec<Regex> = compile(&[
        r"\b(if|elif|else|while|for|except|and|or)\b",
    ]);
    static ref RUBY_BRANCHES: Vec<Regex> = compile(&[
        r"\b(if|elsif|else|unless|while|until|for|when|rescue|and|or)\b",
        r"&&|\|\|",
        r"(^|[^?])\?[^?.:]",
    ]);

    // Comments and literals share one alternation so whichever opens first
    // wins: a `'//'` literal stays a literal, a `// don't` comment stays a comment.
    static ref C_LIKE_LITERALS: Option<Regex> = compile_one(
        r#"(?s)/\*.*?\*/|//[^\n]*|`(\\.|[^`\\])*`|"(\\.|[^"\\\n])*"|'(\\.|[^'\\\n])*'"#
    );
    // Char literals hold a single character, which leaves lifetimes alone
    static ref RUST_LITERALS: Option<Regex> = compile_one(
        r#"(?s)/\*.*?\*/|//[^\n]*|"(\\.|[^"\\])*"|'(\\.|[^'\\\n])'"#
    );
    static ref PYTHON_LITERALS: Option<Regex> = compile_one(
        r#"(?s)"""(\\.|[^\\])*?"""|'''(\\.|[^\\])*?'''|#[^\n]*|"(\\.|[^"\\\n])*"|'(\\.|[^'\\\n])*'"#
    );
    static ref RUBY_LITERALS: Option<Regex> = compile_one(
        r#"#[^\n]*|"(\\.|[^"\\])*"|'(\\.|[^'\\])*'"#
    );
    static ref TOKEN: Option<Regex> =
        compile_one(r"[A-Za-z_][A-Za-z0-9_]*|\d+(\.\d+)?|[^\sA-Za-z0-9_]+");
}

/// Drop comments and collapse every string literal to an empty one
fn strip_literals_and_comments(source: &str, family: Family) -> String {
    match family.literals_and_comments() {
        Some(pattern) => pattern
            .replace_all(source, |caps: &Captures| {
                let text = &caps[0];
                if text.starts_with('/') || text.starts_with('#') {
                    String::new()
                } else {
                    "\"\"".to_string()
                }
            })
            .into_owned(),
        None => source.to_string(),
    }
}

/// Compute metrics for `source_code` written in `language`.
///
/// Cognitive complexity equals cyclomatic complexity in this model. Unknown
/// languages are treated as C-like.
pub fn analyze(source_code: &str, language: &str) -> ComplexityMetrics {
    let family = Family::for_language(language);

    let lines_of_code = source_code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count() as u32;

    // String contents and comments never count as branches
    let code = strip_literals_and_comments(source_code, family);

    let branches: usize = family
        .branch_patterns()
        .iter()
        .map(|pattern| pattern.find_iter(&code).count())
        .sum();
    let cyclomatic_complexity = 1 + branches as u32;

    let volume = halstead_volume(&code);
    let maintainability_index = maintainability_index(volume, cyclomatic_complexity, lines_of_code);

    ComplexityMetrics {
        cyclomatic_complexity,
        lines_of_code,
        maintainability_index,
        cognitive_complexity: cyclomatic_complexity,
    }
}

/// Approximate Halstead volume N * log2(n) over a flat token stream
fn halstead_volume(code: &str) -> f64 {
    let tokens: Vec<&str> = match TOKEN.as_ref() {
        Some(token) => token.find_iter(code).map(|m| m.as_str()).collect(),
        None => code.split_whitespace().collect(),
    };
    let length = tokens.len() as f64;
    let vocabulary = tokens.iter().collect::<HashSet<_>>().len().max(2) as f64;
    length * vocabulary.log2()
}

/// 171 - 5.2 ln(V) - 0.23 CC - 16.2 ln(LOC), floored at zero, two decimals
fn maintainability_index(volume: f64, cyclomatic: u32, lines_of_code: u32) -> f64 {
    let raw = 171.0
        - 5.2 * volume.max(1.0).ln()
        - 0.23 * f64::from(cyclomatic)
        - 16.2 * f64::from(lines_of_code.max(1)).ln();
    (raw.max(0.0) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        assert_eq!(C_LIKE_BRANCHES.len(), 3);
        assert_eq!(RUST_BRANCHES.len(), 3);
        assert_eq!(PYTHON_BRANCHES.len(), 1);
        assert_eq!(RUBY_BRANCHES.len(), 3);
        assert!(C_LIKE_LITERALS.is_some());
        assert!(RUST_LITERALS.is_some());
        assert!(PYTHON_LITERALS.is_some());
        assert!(RUBY_LITERALS.is_some());
        assert!(TOKEN.is_some());
    }

    #[test]
    fn test_straight_line_code() {
        let metrics = analyze("print('hello')\n\nprint('world')\n", "python");
        assert_eq!(metrics.lines_of_code, 2);
        assert_eq!(metrics.cyclomatic_complexity, 1);
        assert_eq!(metrics.cognitive_complexity, 1);
        assert!(metrics.maintainability_index > 100.0);
    }

    #[test]
    fn test_python_branches() {
        let source = "\
def f(x):
    if x > 0 and x < 10:
        return 1
    elif x < 0 or x > 100:
        return 2
    else:
        for i in range(x):
            pass
    try:
        pass
    except ValueError:
        pass
";
        let metrics = analyze(source, "py");
        // if, and, elif, or, else, for, except
        assert_eq!(metrics.cyclomatic_complexity, 8);
    }

    #[test]
    fn test_c_like_branches() {
        let source = r#"
int main(void) {
    int x = 3;
    if (x > 1 && x < 5) { x++; } else { x--; }
    while (x) { x--; }
    switch (x) { case 0: break; case 1: break; }
    return x ? 1 : 0;
}
"#;
        let metrics = analyze(source, "c");
        // if, &&, else, while, switch, case, case, ternary
        assert_eq!(metrics.cyclomatic_complexity, 9);
        assert_eq!(metrics.lines_of_code, 7);
    }

    #[test]
    fn test_comments_and_strings_do_not_count() {
        let source = "// if while for\nconst s = \"if (a && b)\";\nconsole.log(s?.length ?? 0);\n";
        assert_eq!(analyze(source, "javascript").cyclomatic_complexity, 1);
    }

    #[test]
    fn test_single_quoted_comment_markers_keep_the_rest_of_the_line() {
        let js = "const url = 'http://example.com'; if (a) { b(); }\n";
        assert_eq!(analyze(js, "javascript").cyclomatic_complexity, 2);

        let python = "s = '#'; x = 1 if a else 2\n";
        assert_eq!(analyze(python, "python").cyclomatic_complexity, 3);

        let ruby = "tag = '#'; puts tag if ready\n";
        assert_eq!(analyze(ruby, "ruby").cyclomatic_complexity, 2);

        let c = "char slash = '/'; char other = '/'; if (slash == other) { return 1; }\n";
        assert_eq!(analyze(c, "c").cyclomatic_complexity, 2);
    }

    #[test]
    fn test_template_and_triple_quoted_literals_are_skipped() {
        let js = "const t = `if ${a} while // not a comment`; if (b) {}\n";
        assert_eq!(analyze(js, "js").cyclomatic_complexity, 2);

        let python = "def f(a):\n    \"\"\"Return 1 if a else 2.\n\n    # not a comment\n    \"\"\"\n    return 1 if a else 2\n";
        // if, else in the return only
        assert_eq!(analyze(python, "python").cyclomatic_complexity, 3);
    }

    #[test]
    fn test_apostrophes_in_comments_do_not_open_strings() {
        let js = "// don't count this\nif (a) { b(); }\n/* it's fine */ while (c) {}\n";
        assert_eq!(analyze(js, "javascript").cyclomatic_complexity, 3);

        let python = "# don't\nif a:\n    pass\n";
        assert_eq!(analyze(python, "python").cyclomatic_complexity, 2);
    }

    #[test]
    fn test_rust_lifetimes_are_not_literals() {
        let source = "fn pick<'a>(x: &'a str, y: &'a str) -> &'a str {\n    if x.len() > y.len() { x } else { y }\n}\n";
        assert_eq!(analyze(source, "rust").cyclomatic_complexity, 3);
    }

    #[test]
    fn test_rust_question_mark_is_not_a_branch() {
        let source = "fn f() -> Result<(), E> {\n    let x = g()?;\n    match x {\n        1 => {}\n        _ => {}\n    }\n    Ok(())\n}\n";
        // match, two arms
        assert_eq!(analyze(source, "rust").cyclomatic_complexity, 4);
    }

    #[test]
    fn test_is_pure_and_deterministic() {
        let source = "for (let i = 0; i < 10; i++) { if (i % 2) console.log(i); }";
        assert_eq!(analyze(source, "js"), analyze(source, "js"));
    }

    #[test]
    fn test_maintainability_is_floored_at_zero() {
        let huge = "if (a && b || c) { x = y ? z : w; }\n".repeat(5000);
        let metrics = analyze(&huge, "java");
        assert_eq!(metrics.maintainability_index, 0.0);
        assert!(metrics.cyclomatic_complexity > 5000);
    }

    #[test]
    fn test_empty_source() {
        let metrics = analyze("", "go");
        assert_eq!(metrics.lines_of_code, 0);
        assert_eq!(metrics.cyclomatic_complexity, 1);
        assert!(metrics.maintainability_index > 0.0);
    }
}

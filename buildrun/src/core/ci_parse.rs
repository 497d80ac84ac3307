//! Table-driven parsing of test-runner summaries.
//!
//! Shapes are tried in a fixed order and the first that recognizes the
//! output wins. When none does, `errors` stays unknown (`None`) instead of
//! defaulting to zero. Collection/import-level errors are counted on their
//! own, independent of which shape matched.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CiSummary {
    pub passed: u32,
    pub failed: u32,
    pub errors: Option<u32>,
    pub collection_errors: u32,
    pub shape: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    passed: u32,
    failed: u32,
    errors: u32,
}

struct SummaryShape {
    name: &'static str,
    parse: fn(&str) -> Option<Counts>,
}

const SHAPES: &[SummaryShape] = &[
    SummaryShape {
        name: "cargo",
        parse: parse_cargo,
    },
    SummaryShape {
        name: "pytest",
        parse: parse_pytest,
    },
    SummaryShape {
        name: "jest",
        parse: parse_jest,
    },
    SummaryShape {
        name: "generic",
        parse: parse_generic,
    },
];

/// Names of the known shapes, in the order they are tried.
pub fn shape_names() -> impl Iterator<Item = &'static str> {
    SHAPES.iter().map(|s| s.name)
}

pub fn parse_summary(output: &str) -> CiSummary {
    let collection_errors = count_collection_errors(output);
    for shape in SHAPES {
        if let Some(counts) = (shape.parse)(output) {
            return CiSummary {
                passed: counts.passed,
                failed: counts.failed,
                errors: Some(counts.errors),
                collection_errors,
                shape: Some(shape.name),
            };
        }
    }
    CiSummary {
        collection_errors,
        ..CiSummary::default()
    }
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in summary pattern")
}

fn num(s: &str) -> u32 {
    s.parse().unwrap_or(u32::MAX)
}

static CARGO_RESULT: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(?m)^test result: \w+\. (\d+) passed; (\d+) failed;"));

/// `cargo test` prints one result line per test binary; they are summed.
fn parse_cargo(output: &str) -> Option<Counts> {
    let mut total: Option<Counts> = None;
    for caps in CARGO_RESULT.captures_iter(output) {
        let acc = total.get_or_insert_with(Counts::default);
        acc.passed = acc.passed.saturating_add(num(&caps[1]));
        acc.failed = acc.failed.saturating_add(num(&caps[2]));
    }
    total
}

static PYTEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(?m)^=+ (.+?) in [\d.]+s(?: \([^)]*\))? =+\s*$"));
static PYTEST_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(\d+) (passed|failed|errors?)\b"));

fn parse_pytest(output: &str) -> Option<Counts> {
    let line = PYTEST_LINE.captures_iter(output).last()?;
    let mut counts = Counts::default();
    let mut seen = false;
    for token in PYTEST_TOKEN.captures_iter(&line[1]) {
        seen = true;
        let n = num(&token[1]);
        match &token[2] {
            "passed" => counts.passed = n,
            "failed" => counts.failed = n,
            _ => counts.errors = n,
        }
    }
    seen.then_some(counts)
}

static JEST_TESTS: LazyLock<Regex> = LazyLock::new(|| regex(r"(?m)^Tests:\s+(.+)$"));
static JEST_TOKEN: LazyLock<Regex> = LazyLock::new(|| regex(r"(\d+) (passed|failed)\b"));

fn parse_jest(output: &str) -> Option<Counts> {
    let line = JEST_TESTS.captures_iter(output).last()?;
    let mut counts = Counts::default();
    for token in JEST_TOKEN.captures_iter(&line[1]) {
        match &token[2] {
            "passed" => counts.passed = num(&token[1]),
            _ => counts.failed = num(&token[1]),
        }
    }
    Some(counts)
}

static GENERIC: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"(?i)\b(\d+) passed\b.*?\b(\d+) failed\b(?:.*?\b(\d+) errors?\b)?")
});

fn parse_generic(output: &str) -> Option<Counts> {
    let caps = GENERIC.captures_iter(output).last()?;
    Some(Counts {
        passed: num(&caps[1]),
        failed: num(&caps[2]),
        errors: caps.get(3).map_or(0, |m| num(m.as_str())),
    })
}

static DURING_COLLECTION: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(\d+) errors? during collection"));
static COLLECTION_LINES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        regex(r"(?m)^ERROR collecting "),
        regex(r"(?m)^_+ ERROR collecting .* _+$"),
        regex(r"(?m)^error: could not compile "),
        regex(r"Test suite failed to run"),
        regex(r"ImportError while importing test module"),
    ]
});

/// Errors that stopped tests from being collected at all. Different tools
/// report the same failure in several places, so the largest single count
/// is used rather than a sum.
pub fn count_collection_errors(output: &str) -> u32 {
    let declared = DURING_COLLECTION
        .captures_iter(output)
        .map(|caps| num(&caps[1]))
        .max()
        .unwrap_or(0);
    COLLECTION_LINES
        .iter()
        .map(|re| u32::try_from(re.find_iter(output).count()).unwrap_or(u32::MAX))
        .fold(declared, u32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_summary_line() {
        let s = parse_summary("12 passed, 3 failed, 0 errors");
        assert_eq!((s.passed, s.failed, s.errors), (12, 3, Some(0)));
        assert_eq!(s.shape, Some("generic"));
    }

    #[test]
    fn unrecognized_output_is_unknown_not_zero() {
        let s = parse_summary("Segmentation fault (core dumped)\n");
        assert_eq!(s.errors, None);
        assert_eq!(s.shape, None);
    }

    #[test]
    fn pytest_final_line_in_any_order() {
        let out = "collected 17 items\n\n...\n========= 3 failed, 12 passed, 2 errors in 4.21s =========\n";
        let s = parse_summary(out);
        assert_eq!((s.passed, s.failed, s.errors), (12, 3, Some(2)));
        assert_eq!(s.shape, Some("pytest"));
    }

    #[test]
    fn pytest_collection_errors_are_counted_separately() {
        let mut out = String::new();
        for i in 0..10 {
            out.push_str(&format!("_____ ERROR collecting tests/test_{i}.py _____\n"));
            out.push_str("ImportError while importing test module 'tests/test_x.py'.\n");
        }
        out.push_str("!!!!!!! Interrupted: 10 errors during collection !!!!!!!\n");
        out.push_str("============ 10 errors in 0.52s ============\n");
        let s = parse_summary(&out);
        assert_eq!(s.collection_errors, 10);
        assert_eq!((s.passed, s.failed, s.errors), (0, 0, Some(10)));
    }

    #[test]
    fn cargo_results_are_summed_across_binaries() {
        let out = "\
running 3 tests
test result: ok. 3 passed; 0 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.01s

running 5 tests
test result: FAILED. 4 passed; 1 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.20s
";
        let s = parse_summary(out);
        assert_eq!((s.passed, s.failed, s.errors), (7, 1, Some(0)));
        assert_eq!(s.shape, Some("cargo"));
    }

    #[test]
    fn cargo_compile_failure_is_collection_error() {
        let out = "error[E0425]: cannot find value `x`\nerror: could not compile `demo` (lib test) due to 1 previous error\n";
        let s = parse_summary(out);
        assert_eq!(s.collection_errors, 1);
        assert_eq!(s.errors, None);
    }

    #[test]
    fn jest_summary() {
        let out = "Test Suites: 1 failed, 3 passed, 4 total\nTests:       2 failed, 40 passed, 42 total\nSnapshots:   0 total\n";
        let s = parse_summary(out);
        assert_eq!((s.passed, s.failed, s.errors), (40, 2, Some(0)));
        assert_eq!(s.shape, Some("jest"));
    }

    #[test]
    fn shapes_are_tried_in_fixed_order() {
        let names: Vec<_> = shape_names().collect();
        assert_eq!(names, ["cargo", "pytest", "jest", "generic"]);
    }
}

//! Parser failure modes: every rejection is a categorized `parser` error
//! citing the offending fragment.

use lomda::{ErrorCategory, Runner};

fn parse_err(src: &str) -> lomda::LomdaError {
    Runner::new(src, "test.lom").expect_err("program is rejected")
}

#[test]
fn rejections_carry_the_parser_category() {
    for src in [
        "1 +",
        "(1 + 2",
        "[1, 2",
        "{a : }",
        "\"unterminated",
        "let = 5; 1",
        "let x 5; 1",
        "if 1 then 2",
        "while",
        "lambda x x",
        "fold [1] into f",
        "insert 1 into xs",
        "d/d (x)",
        "let x = 5",
        "1 ; ; 2",
    ] {
        let err = parse_err(src);
        assert_eq!(err.category, ErrorCategory::Parser, "case: {src}");
    }
}

#[test]
fn messages_cite_the_offending_fragment() {
    let err = parse_err("1 + + 2");
    assert!(err.message.contains("+ 2"), "message was: {}", err.message);
}

#[test]
fn keywords_cannot_be_bound() {
    assert_eq!(parse_err("let then = 1; then").category, ErrorCategory::Parser);
    assert_eq!(parse_err("lambda (if) 1").category, ErrorCategory::Parser);
}

#[test]
fn empty_input_is_rejected() {
    assert_eq!(parse_err("").category, ErrorCategory::Parser);
    assert_eq!(parse_err("   # only a comment").category, ErrorCategory::Parser);
}

use std::path::Path;

use crate::error::Error;
use crate::problem::{parse_int128, solution_path, Problem};

#[test]
fn parses_plain_and_signed_decimals() {
    assert_eq!(parse_int128("0"), Ok(0));
    assert_eq!(parse_int128("42"), Ok(42));
    assert_eq!(parse_int128("+42"), Ok(42));
    assert_eq!(parse_int128("-42"), Ok(-42));
    assert_eq!(parse_int128("007"), Ok(7));
}

#[test]
fn parses_full_128_bit_range() {
    assert_eq!(
        parse_int128("170141183460469231731687303715884105727"),
        Ok(i128::MAX)
    );
    assert_eq!(
        parse_int128("-170141183460469231731687303715884105728"),
        Ok(i128::MIN)
    );
    assert!(parse_int128("170141183460469231731687303715884105728").is_err());
    assert!(parse_int128("-170141183460469231731687303715884105729").is_err());
}

#[test]
fn rejects_garbage_tokens() {
    assert!(parse_int128("").is_err());
    assert!(parse_int128("-").is_err());
    assert!(parse_int128("+").is_err());
    assert!(parse_int128("12a").is_err());
    assert!(parse_int128("0x10").is_err());
}

#[test]
fn from_text_splits_on_any_whitespace() {
    let problem = Problem::from_text("1 2\t3\n-6  10\r\n-4 -6", "mem").unwrap();
    assert_eq!(problem.numbers(), &[1, 2, 3, -6, 10, -4, -6]);
}

#[test]
fn rejects_empty_set() {
    assert!(matches!(
        Problem::from_text("  \n ", "mem"),
        Err(Error::EmptyProblem)
    ));
}

#[test]
fn rejects_zero_elements() {
    assert!(matches!(
        Problem::from_text("1 0 -1", "mem"),
        Err(Error::ZeroElement)
    ));
}

#[test]
fn rejects_oversized_sets() {
    let text = (0..129).map(|i| (i + 1).to_string()).collect::<Vec<_>>().join(" ");
    assert!(matches!(
        Problem::from_text(&text, "mem"),
        Err(Error::TooManyNumbers)
    ));
}

#[test]
fn rejects_per_sign_overflow() {
    let max = i128::MAX.to_string();
    assert!(matches!(
        Problem::from_text(&format!("{max} 1"), "mem"),
        Err(Error::PositiveSumOverflow)
    ));
    let min = i128::MIN.to_string();
    assert!(matches!(
        Problem::from_text(&format!("{min} -1"), "mem"),
        Err(Error::NegativeSumOverflow)
    ));
}

#[test]
fn parse_errors_carry_location() {
    match Problem::from_text("1 2\nbad 3", "input.txt") {
        Err(Error::Parse { path, line, .. }) => {
            assert_eq!(path, "input.txt");
            assert_eq!(line, 2);
        }
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn solution_path_replaces_last_extension() {
    assert_eq!(
        solution_path(Path::new("problems/set1.txt")),
        Path::new("problems/set1.sol")
    );
    assert_eq!(solution_path(Path::new("set1")), Path::new("set1.sol"));
    assert_eq!(
        solution_path(Path::new("dir.d/plain")),
        Path::new("dir.d/plain.sol")
    );
}

#[test]
fn loads_problem_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("case.txt");
    std::fs::write(&path, "4 -2 -2\n").unwrap();
    let problem = Problem::from_file(&path).unwrap();
    assert_eq!(problem.numbers(), &[4, -2, -2]);
    assert_eq!(solution_path(&path), dir.path().join("case.sol"));
}

#[test]
fn verify_mask_checks_sum_and_nonempty() {
    let problem = Problem::new(vec![1, -1, 5]).unwrap();
    assert!(problem.verify_mask(0b011));
    assert!(!problem.verify_mask(0b111));
    assert!(!problem.verify_mask(0));
}

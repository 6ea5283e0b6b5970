//! Warming pattern, a profile of the usage of the linear classes of a shared heap.
//!
//! The textual form starts with a header line, `<quantum> <number of linear classes>`, followed by one fraction per
//! linear class, ten per line, each with twelve decimals.

use core::fmt;

use alloc::vec::Vec;

use crate::Error;

const FRACTIONS_PER_LINE: usize = 10;

/// WarmingPattern
///
/// The fraction of the heap consumed by each linear class, headers included, over a past run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WarmingPattern {
    quantum: usize,
    fractions: Vec<f64>,
}

impl WarmingPattern {
    /// Creates a pattern, from its fractions, indexed by class.
    pub fn new(quantum: usize, fractions: Vec<f64>) -> Self { Self { quantum, fractions } }

    /// Returns the quantum of the heap the pattern was captured from.
    pub fn quantum(&self) -> usize { self.quantum }

    /// Returns the number of linear classes of the heap the pattern was captured from.
    pub fn classes(&self) -> usize { self.fractions.len() }

    /// Returns the fractions, indexed by class.
    pub fn fractions(&self) -> &[f64] { &self.fractions }

    /// Returns the sum of all fractions, nominally 1.
    pub fn total(&self) -> f64 { self.fractions.iter().sum() }

    /// Parses the textual form of a pattern.
    ///
    /// Errors with `CorruptPattern` on a missing or malformed header, and on missing, extraneous, or non-numeric
    /// fractions. The layout of the header is not checked against any heap.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut lines = text.lines().enumerate().map(|(index, line)| (index + 1, line));

        let (quantum, classes) = match lines.next() {
            Some((_, header)) => Self::parse_header(header)?,
            None => return Err(Error::CorruptPattern { line: 1, reason: "missing header" }),
        };

        let mut fractions = Vec::with_capacity(classes);
        let mut last = 1;

        for (line, content) in lines {
            last = line;

            for token in content.split_whitespace() {
                let fraction: f64 = token.parse()
                    .map_err(|_| Error::CorruptPattern { line, reason: "non-numeric fraction" })?;

                if !fraction.is_finite() || fraction < 0.0 {
                    return Err(Error::CorruptPattern { line, reason: "fraction out of range" });
                }

                if fractions.len() == classes {
                    return Err(Error::CorruptPattern { line, reason: "too many fractions" });
                }

                fractions.push(fraction);
            }
        }

        if fractions.len() < classes {
            return Err(Error::CorruptPattern { line: last, reason: "missing fractions" });
        }

        Ok(Self { quantum, fractions })
    }

    //  Internal.
    fn parse_header(header: &str) -> Result<(usize, usize), Error> {
        const MALFORMED: Error = Error::CorruptPattern { line: 1, reason: "malformed header" };

        let mut tokens = header.split_whitespace();

        let quantum = tokens.next().and_then(|token| token.parse().ok()).ok_or(MALFORMED)?;
        let classes = tokens.next().and_then(|token| token.parse().ok()).ok_or(MALFORMED)?;

        if tokens.next().is_some() {
            return Err(MALFORMED);
        }

        Ok((quantum, classes))
    }
}

impl fmt::Display for WarmingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.quantum, self.fractions.len())?;

        for line in self.fractions.chunks(FRACTIONS_PER_LINE) {
            for fraction in line {
                write!(f, "{:.12} ", fraction)?;
            }

            writeln!(f)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {

use alloc::{string::ToString, vec};

use super::*;

#[test]
fn pattern_render() {
    let fractions: Vec<_> = (0..12).map(|i| i as f64 / 100.0).collect();
    let pattern = WarmingPattern::new(8, fractions);

    let text = pattern.to_string();
    let lines: Vec<_> = text.lines().collect();

    assert_eq!(3, lines.len());
    assert_eq!("8 12", lines[0]);
    assert!(lines[1].starts_with("0.000000000000 0.010000000000 "));
    assert_eq!("0.100000000000 0.110000000000 ", lines[2]);
}

#[test]
fn pattern_parse_rendered() {
    let pattern = WarmingPattern::new(8, vec![0.0, 0.25, 0.5, 0.125, 0.125]);

    let parsed = WarmingPattern::parse(&pattern.to_string()).expect("Valid");

    assert_eq!(pattern, parsed);
    assert_eq!(1.0, parsed.total());
}

#[test]
fn pattern_parse_lenient_layout() {
    let parsed = WarmingPattern::parse("16 3\n0.5\n\n  0.25   0.25\n").expect("Valid");

    assert_eq!(16, parsed.quantum());
    assert_eq!(3, parsed.classes());
    assert_eq!(&[0.5, 0.25, 0.25], parsed.fractions());
}

#[test]
fn pattern_parse_corrupt() {
    fn corrupt(text: &str) -> (usize, &'static str) {
        match WarmingPattern::parse(text) {
            Err(Error::CorruptPattern { line, reason }) => (line, reason),
            other => panic!("Expected CorruptPattern, got {:?}", other),
        }
    }

    assert_eq!((1, "missing header"), corrupt(""));
    assert_eq!((1, "malformed header"), corrupt("8\n"));
    assert_eq!((1, "malformed header"), corrupt("8 x\n"));
    assert_eq!((1, "malformed header"), corrupt("8 2 3\n"));
    assert_eq!((2, "non-numeric fraction"), corrupt("8 2\n0.5 abc\n"));
    assert_eq!((3, "fraction out of range"), corrupt("8 2\n0.5\n-0.5\n"));
    assert_eq!((2, "too many fractions"), corrupt("8 2\n0.5 0.25 0.25\n"));
    assert_eq!((2, "missing fractions"), corrupt("8 3\n0.5 0.5\n"));
    assert_eq!((1, "missing fractions"), corrupt("8 3\n"));
}

}

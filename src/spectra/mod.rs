//! Per-test coverage and outcome records for statistical fault localization.
//!
//! Records arrive as CSV lines of the form `test,PASS,com.Foo:12,com.Foo:13`.
//! A test's outcome must be consistent across all updates; a contradiction
//! points at a broken upstream tool and is a hard error, never silently
//! resolved. The two dump forms feed the external patch generator.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Suspiciousness assigned to a perfect location in override mode. High
/// enough to dominate, but other locations stay selectable at value 1 —
/// ruling them out entirely tends to crash the downstream generator.
const OVERRIDE_PERFECT_SUSP: f64 = 10_000_000.0;
const OVERRIDE_OTHER_SUSP: f64 = 1.0;

#[derive(Debug, Error)]
pub enum SpectraError {
    #[error("malformed spectra record: {0:?}")]
    Malformed(String),
    #[error("contradictory outcome for test {test}: recorded {recorded}, got {conflicting}")]
    Contradiction {
        test: String,
        recorded: TestResult,
        conflicting: TestResult,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
}

impl TestResult {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// A covered source location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub class_name: String,
    pub line: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct TestCount {
    ex_pass: u32,
    ex_fail: u32,
    not_ex_pass: u32,
    not_ex_fail: u32,
}

/// Coverage/outcome store with both directions of the test/location mapping.
#[derive(Debug, Default)]
pub struct Spectra {
    test_results: BTreeMap<String, TestResult>,
    tests_for_location: BTreeMap<Location, BTreeSet<String>>,
    locations_for_test: BTreeMap<String, BTreeSet<Location>>,
}

impl Spectra {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.test_results.is_empty()
    }

    /// Ingest CSV records. Blank lines are skipped; re-ingesting identical
    /// records is a no-op.
    pub fn update(&mut self, content: &str) -> Result<(), SpectraError> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split(',');
            let test = fields
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| SpectraError::Malformed(line.to_string()))?;
            let result = fields
                .next()
                .and_then(TestResult::parse)
                .ok_or_else(|| SpectraError::Malformed(line.to_string()))?;

            let mut locations = Vec::new();
            for field in fields {
                let (class_name, line_no) = field
                    .rsplit_once(':')
                    .ok_or_else(|| SpectraError::Malformed(line.to_string()))?;
                let line_no: u32 = line_no
                    .parse()
                    .map_err(|_| SpectraError::Malformed(line.to_string()))?;
                locations.push(Location {
                    class_name: class_name.to_string(),
                    line: line_no,
                });
            }

            self.record(test, result, locations)?;
        }
        Ok(())
    }

    /// Record one test's outcome and covered locations.
    pub fn record(
        &mut self,
        test: &str,
        result: TestResult,
        locations: Vec<Location>,
    ) -> Result<(), SpectraError> {
        if let Some(&recorded) = self.test_results.get(test) {
            if recorded != result {
                return Err(SpectraError::Contradiction {
                    test: test.to_string(),
                    recorded,
                    conflicting: result,
                });
            }
        }
        self.test_results.insert(test.to_string(), result);

        for location in &locations {
            self.tests_for_location
                .entry(location.clone())
                .or_default()
                .insert(test.to_string());
        }
        self.locations_for_test
            .entry(test.to_string())
            .or_default()
            .extend(locations);
        Ok(())
    }

    fn test_counts(&self) -> BTreeMap<Location, TestCount> {
        let mut counts: BTreeMap<Location, TestCount> = self
            .tests_for_location
            .keys()
            .map(|loc| (loc.clone(), TestCount::default()))
            .collect();
        for (test, result) in &self.test_results {
            let covered = self.locations_for_test.get(test);
            for (location, count) in &mut counts {
                let executed = covered.is_some_and(|set| set.contains(location));
                match (result, executed) {
                    (TestResult::Pass, true) => count.ex_pass += 1,
                    (TestResult::Pass, false) => count.not_ex_pass += 1,
                    (TestResult::Fail, true) => count.ex_fail += 1,
                    (TestResult::Fail, false) => count.not_ex_fail += 1,
                }
            }
        }
        counts
    }

    /// Ochiai suspiciousness per known location.
    pub fn suspiciousness(&self) -> BTreeMap<Location, f64> {
        self.test_counts()
            .into_iter()
            .map(|(loc, count)| (loc, ochiai(count)))
            .collect()
    }

    /// Tests table consumed by the patch generator: `name,outcome` plus the
    /// covered locations of each test.
    pub fn dump_tests(&self) -> String {
        let mut out = String::from("name,outcome");
        for (test, result) in &self.test_results {
            out.push('\n');
            out.push_str(test);
            out.push(',');
            out.push_str(&result.to_string());
            if let Some(locations) = self.locations_for_test.get(test) {
                for location in locations {
                    out.push_str(&format!(",{}:{}", location.class_name, location.line));
                }
            }
        }
        out
    }

    /// Ranked locations table in the generator's expected form
    /// (`<className{#lineNumber,suspValue`), highest suspiciousness first.
    ///
    /// With `perfect_locations` given, those locations are forced to a very
    /// high value and every other known location collapses to a uniform low
    /// one instead of the Ochiai score.
    pub fn dump_suspiciousness(&self, perfect_locations: Option<&BTreeSet<Location>>) -> String {
        let values: BTreeMap<Location, f64> = match perfect_locations {
            None => self.suspiciousness(),
            Some(perfect) => {
                let mut values: BTreeMap<Location, f64> = perfect
                    .iter()
                    .map(|loc| (loc.clone(), OVERRIDE_PERFECT_SUSP))
                    .collect();
                for location in self.tests_for_location.keys() {
                    values
                        .entry(location.clone())
                        .or_insert(OVERRIDE_OTHER_SUSP);
                }
                values
            }
        };

        let mut ranked: Vec<(Location, f64)> = values.into_iter().collect();
        ranked.sort_by(|(loc_a, val_a), (loc_b, val_b)| {
            val_b
                .partial_cmp(val_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| loc_a.cmp(loc_b))
        });

        let mut out = String::from("<className{#lineNumber,suspValue");
        for (location, value) in ranked {
            out.push_str(&format!(
                "\n<{}{{#{},{}",
                location.class_name, location.line, value
            ));
        }
        out
    }
}

/// `exFail / sqrt((exFail + notExFail) * (exFail + exPass))`, 0 when no
/// failing test covers the location.
fn ochiai(count: TestCount) -> f64 {
    if count.ex_fail == 0 {
        return 0.0;
    }
    let executed = f64::from(count.ex_fail + count.ex_pass);
    let failed = f64::from(count.ex_fail + count.not_ex_fail);
    f64::from(count.ex_fail) / (failed * executed).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(class: &str, line: u32) -> Location {
        Location {
            class_name: class.to_string(),
            line,
        }
    }

    #[test]
    fn test_ochiai_two_failing_covering() {
        // Two failing tests cover the location, nothing else exists:
        // 2 / sqrt((2 + 0) * (2 + 0)) = 1.0
        let mut spectra = Spectra::new();
        spectra
            .update("t1,FAIL,com.Foo:5\nt2,FAIL,com.Foo:5")
            .unwrap();
        let susp = spectra.suspiciousness();
        assert_eq!(susp[&loc("com.Foo", 5)], 1.0);
    }

    #[test]
    fn test_ochiai_mixed_coverage() {
        // Location covered by 1 failing and 1 passing test, plus one failing
        // test elsewhere: 1 / sqrt((1 + 1) * (1 + 1)) = 0.5
        let mut spectra = Spectra::new();
        spectra
            .update("t1,FAIL,com.Foo:5\nt2,PASS,com.Foo:5\nt3,FAIL,com.Bar:9")
            .unwrap();
        let susp = spectra.suspiciousness();
        assert!((susp[&loc("com.Foo", 5)] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ochiai_no_failing_coverage_is_zero() {
        let mut spectra = Spectra::new();
        spectra.update("t1,PASS,com.Foo:5").unwrap();
        assert_eq!(spectra.suspiciousness()[&loc("com.Foo", 5)], 0.0);
    }

    #[test]
    fn test_contradiction_is_an_error() {
        let mut spectra = Spectra::new();
        spectra.update("t1,PASS,com.Foo:5").unwrap();
        let err = spectra.update("t1,FAIL,com.Foo:6").unwrap_err();
        assert!(matches!(err, SpectraError::Contradiction { .. }));
    }

    #[test]
    fn test_update_is_idempotent() {
        let input = "t1,FAIL,com.Foo:5,com.Foo:6\nt2,PASS,com.Bar:9";
        let mut once = Spectra::new();
        once.update(input).unwrap();
        let mut twice = Spectra::new();
        twice.update(input).unwrap();
        twice.update(input).unwrap();

        assert_eq!(once.dump_tests(), twice.dump_tests());
        assert_eq!(
            once.dump_suspiciousness(None),
            twice.dump_suspiciousness(None)
        );
    }

    #[test]
    fn test_malformed_record() {
        let mut spectra = Spectra::new();
        assert!(matches!(
            spectra.update("t1,MAYBE,com.Foo:5"),
            Err(SpectraError::Malformed(_))
        ));
        assert!(matches!(
            spectra.update("t1,PASS,com.Foo"),
            Err(SpectraError::Malformed(_))
        ));
    }

    #[test]
    fn test_dump_tests_form() {
        let mut spectra = Spectra::new();
        spectra.update("t2,PASS\nt1,FAIL,com.Foo:5").unwrap();
        let dump = spectra.dump_tests();
        let mut lines = dump.lines();
        assert_eq!(lines.next(), Some("name,outcome"));
        // Sorted by test name.
        assert_eq!(lines.next(), Some("t1,FAIL,com.Foo:5"));
        assert_eq!(lines.next(), Some("t2,PASS"));
    }

    #[test]
    fn test_suspiciousness_dump_ranked() {
        let mut spectra = Spectra::new();
        spectra
            .update("t1,FAIL,com.Foo:5\nt2,PASS,com.Bar:9,com.Foo:5")
            .unwrap();
        let dump = spectra.dump_suspiciousness(None);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "<className{#lineNumber,suspValue");
        // Foo:5 (covered by the failing test) must rank above Bar:9.
        assert!(lines[1].starts_with("<com.Foo{#5,"));
        assert!(lines[2].starts_with("<com.Bar{#9,0"));
    }

    #[test]
    fn test_perfect_location_override() {
        let mut spectra = Spectra::new();
        spectra
            .update("t1,FAIL,com.Foo:5\nt2,PASS,com.Bar:9")
            .unwrap();
        let perfect = BTreeSet::from([loc("com.Baz", 1)]);
        let dump = spectra.dump_suspiciousness(Some(&perfect));
        let lines: Vec<&str> = dump.lines().collect();
        // Perfect location dominates; known locations stay present at the
        // uniform low value rather than being eliminated.
        assert_eq!(lines[1], "<com.Baz{#1,10000000");
        assert!(lines.iter().any(|l| l.starts_with("<com.Foo{#5,1")));
        assert!(lines.iter().any(|l| l.starts_with("<com.Bar{#9,1")));
    }
}

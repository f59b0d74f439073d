//! Step-recording test reports shared by unit and integration tests.
//!
//! A test opens a report with [`test_report!`], narrates what it does with
//! `setup`/`action`, and asserts through the report so every check is
//! recorded. When `TEST_REPORT_DIR` is set the report is written there as a
//! JSON document on drop, including whether the test panicked.

use serde::Serialize;
use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::sync::Mutex;

/// Open a [`TestReport`] named after the enclosing test function.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3];
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::TestReport::new(name, $title, file!(), line!())
    }};
}

const MAX_VALUE_LEN: usize = 512;

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Step {
    Setup { text: String },
    Action { text: String },
    Check { text: String, passed: bool },
}

#[derive(Serialize)]
struct Document<'a> {
    test: &'a str,
    title: &'a str,
    source: String,
    outcome: &'a str,
    steps: &'a [Step],
}

pub struct TestReport {
    full_path: String,
    title: String,
    source: String,
    steps: Mutex<Vec<Step>>,
    out_dir: Option<PathBuf>,
}

impl TestReport {
    pub fn new(full_path: &str, title: &str, source_file: &str, source_line: u32) -> Self {
        Self {
            full_path: full_path.to_string(),
            title: title.to_string(),
            source: format!("{}:{}", source_file, source_line),
            steps: Mutex::new(Vec::new()),
            out_dir: std::env::var_os("TEST_REPORT_DIR").map(PathBuf::from),
        }
    }

    fn push(&self, step: Step) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(step);
        }
    }

    fn shorten(value: String) -> String {
        if value.len() <= MAX_VALUE_LEN {
            return value;
        }
        let mut cut = MAX_VALUE_LEN;
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}… ({} bytes)", &value[..cut], value.len())
    }

    pub fn setup(&self, text: impl Display) {
        self.push(Step::Setup {
            text: text.to_string(),
        });
    }

    pub fn action(&self, text: impl Display) {
        self.push(Step::Action {
            text: text.to_string(),
        });
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let passed = actual == expected;
        self.push(Step::Check {
            text: Self::shorten(format!("{}: {:?} == {:?}", label, actual, expected)),
            passed,
        });
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.push(Step::Check {
            text: label.to_string(),
            passed: value,
        });
        assert!(value, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let passed = haystack.contains(needle);
        self.push(Step::Check {
            text: Self::shorten(format!("{}: {:?} contains {:?}", label, haystack, needle)),
            passed,
        });
        assert!(passed, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    fn write(&self) {
        let Some(dir) = &self.out_dir else {
            return;
        };
        let outcome = if std::thread::panicking() {
            "fail"
        } else {
            "pass"
        };
        let steps = match self.steps.lock() {
            Ok(steps) => steps,
            Err(poisoned) => poisoned.into_inner(),
        };
        let doc = Document {
            test: &self.full_path,
            title: &self.title,
            source: self.source.clone(),
            outcome,
            steps: &steps,
        };
        let Ok(json) = serde_json::to_string_pretty(&doc) else {
            return;
        };
        let _ = std::fs::create_dir_all(dir);
        let file = dir.join(format!("{}.json", self.full_path.replace("::", "__")));
        let _ = std::fs::write(file, json);
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write();
    }
}

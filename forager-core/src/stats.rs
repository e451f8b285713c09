//! Best-effort extraction of aggregate counters from the cumulative run
//! output. A miss never fails a run; absent or unparseable counts stay zero.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::RunStats;

static SELLERS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+seller").expect("hardcoded regex"));
static PRODUCTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[Ss]aved\s+(\d+)\s+product").expect("hardcoded regex"));

pub fn extract_run_stats(output: &str) -> RunStats {
    RunStats {
        sellers_processed: first_capture(&SELLERS_RE, output),
        products_scraped: first_capture(&PRODUCTS_RE, output),
    }
}

fn first_capture(re: &Regex, text: &str) -> i32 {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

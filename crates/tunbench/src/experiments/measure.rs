//! Parsers for the text output of the measurement clients.

use std::collections::BTreeMap;

/// The `Total:` row of an `ab` connection-times table, in ms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbTotal {
    pub min: f64,
    pub mean: f64,
    pub sd: f64,
    pub median: f64,
    pub max: f64,
}

impl AbTotal {
    pub fn fields(&self) -> [f64; 5] {
        [self.min, self.mean, self.sd, self.median, self.max]
    }
}

/// Find and parse `Total:  min  mean  sd  median  max` in `ab` output.
pub fn parse_ab_total(output: &str) -> Option<AbTotal> {
    let row = output
        .lines()
        .find_map(|l| l.trim_start().strip_prefix("Total:"))?;
    let nums: Vec<f64> = row
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    match nums[..] {
        [min, mean, sd, median, max] => Some(AbTotal {
            min,
            mean,
            sd,
            median,
            max,
        }),
        _ => None,
    }
}

/// Per-flow statistics from `ITGDec`, delays and jitters converted to
/// whole milliseconds.
pub fn parse_itgdec(output: &str) -> BTreeMap<u32, BTreeMap<String, i64>> {
    let mut flows: BTreeMap<u32, BTreeMap<String, i64>> = BTreeMap::new();
    let mut current = None;

    for line in output.lines() {
        let line = line.trim();
        if line.contains("TOTAL RESULTS") {
            current = None;
            continue;
        }
        if let Some(n) = line.strip_prefix("Flow number:") {
            current = n.trim().parse().ok();
            if let Some(id) = current {
                flows.entry(id).or_default();
            }
            continue;
        }
        let (Some(id), Some((key, value))) = (current, line.split_once('=')) else {
            continue;
        };
        let key = key.trim();
        if !(key.contains("delay") || key.contains("jitter")) {
            continue;
        }
        let value = value.trim().trim_end_matches('s').trim();
        if let Ok(secs) = value.parse::<f64>() {
            if let Some(flow) = flows.get_mut(&id) {
                flow.insert(key.to_string(), (secs * 1000.0) as i64);
            }
        }
    }
    flows
}

/// `Average delay` of flows `1..=count`, `None` for flows absent from the log.
pub fn average_delays(output: &str, count: u32) -> Vec<Option<f64>> {
    let flows = parse_itgdec(output);
    (1..=count)
        .map(|id| {
            flows
                .get(&id)
                .and_then(|f| f.get("Average delay"))
                .map(|&ms| ms as f64)
        })
        .collect()
}

use anyhow::Result;
use std::path::Path;

use crate::cli::config::Config;
use crate::engine::scenario::Scenario;

/// Load and validate a scenario file without running it, printing what
/// would be run.
pub fn run_validate(path: &Path) -> Result<Scenario> {
    println!("Validating {}...", path.display());

    let scenario = match Config::from_path(path).and_then(Config::into_scenario) {
        Ok(scenario) => scenario,
        Err(e) => {
            println!("  ✗ Validation failed: {}", e);
            return Err(e.into());
        }
    };

    println!("  ✓ Configuration parsed");
    println!("{}", describe(&scenario));
    println!("\nValidation complete.");
    Ok(scenario)
}

pub fn describe(scenario: &Scenario) -> String {
    let schedule = &scenario.schedule;
    let mut lines = vec![
        format!(
            "    stages: {} stage(s), {:?} total",
            schedule.stages().len(),
            schedule.total_duration()
        ),
        format!("    peak vus: {}", schedule.max_target()),
        format!("    requests per iteration: {}", scenario.iteration.len()),
    ];
    for (index, request) in scenario.iteration.requests().iter().enumerate() {
        lines.push(format!(
            "      [{}] {} {} ({} check(s))",
            index,
            request.method,
            request.uri,
            scenario.iteration.checks_for(index).len()
        ));
    }
    if let Some(pacing) = scenario.options.min_iteration_duration {
        lines.push(format!("    min iteration duration: {:?}", pacing));
    }
    if !scenario.thresholds.is_empty() {
        lines.push(format!("    thresholds: {}", scenario.thresholds.len()));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_reports_errors() {
        let dir = std::env::temp_dir().join(format!("volley-validate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.yaml");
        std::fs::write(
            &good,
            "stages:\n  - duration: 10s\n    target: 3\nrequests:\n  - url: http://localhost/\n    checks:\n      - type: success\n",
        )
        .unwrap();
        let scenario = run_validate(&good).unwrap();
        let text = describe(&scenario);
        assert!(text.contains("peak vus: 3"));
        assert!(text.contains("[0] GET http://localhost/ (1 check(s))"));

        let bad = dir.join("bad.yaml");
        std::fs::write(&bad, "stages: []\nrequests:\n  - url: http://localhost/\n").unwrap();
        assert!(run_validate(&bad).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

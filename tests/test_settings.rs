//! Settings loading from a TOML file.

use farm_valuation_sdk::Settings;
use std::io::Write;

#[test]
fn test_from_file_overrides_and_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[contracts]
farm = "KT1TestFarm"
wrapped_tez = ["KT1Wtez"]

[refresh]
rewards_millis = 250

[curation]
excluded_farms = ["7"]

[curation.badges]
core = ["1", "2"]
"#
    )
    .unwrap();

    let settings = Settings::from_file(file.path()).unwrap();
    assert_eq!(settings.contracts.wrapped_tez, vec!["KT1Wtez".to_string()]);
    assert_eq!(settings.refresh.rewards_millis, 250);
    assert_eq!(settings.curation.excluded_farms, vec!["7".to_string()]);
    assert_eq!(settings.curation.badges.core.len(), 2);

    // Unset sections fall back to their defaults.
    assert_eq!(settings.refresh.current_prices_secs, 60);
    assert_eq!(settings.valuation.farm_tvl_threshold, 10_000);
    assert_eq!(settings.rewards.acc_precision, "1000000000000");
    assert!(settings.curation.errant_farms.contains(&"75".to_string()));
}

#[test]
fn test_from_file_missing_path_errors() {
    assert!(Settings::from_file("/nonexistent/farm-config.toml").is_err());
}

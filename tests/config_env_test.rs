use std::env;
use std::fs;

use etcdwatch::Settings;
use tempfile::TempDir;

// TOML and env layering in one test: the two override paths share the
// working directory and the process environment, so splitting them
// would race under the parallel test runner.
#[test]
fn test_layered_overrides() {
    let temp_dir = TempDir::new().unwrap();
    let original_dir = env::current_dir().unwrap();
    env::set_current_dir(&temp_dir).unwrap();

    fs::write(
        "etcdwatch.toml",
        r#"
server_url = "http://10.0.0.5:4001"
prefix = "/service/"

[watch]
flush_period_secs = 30
backoff_max_ms = 4000
"#,
    )
    .unwrap();

    unsafe {
        // Double underscore separates nested levels.
        env::set_var("EW_WATCH__FLUSH_PERIOD_SECS", "45");
        env::set_var("EW_LOGGING__DEFAULT", "debug");
    }

    let settings = Settings::load().unwrap();

    // From the TOML file
    assert_eq!(settings.server_url, "http://10.0.0.5:4001");
    assert_eq!(settings.prefix, "/service/");
    assert_eq!(settings.watch.backoff_max_ms, 4000);

    // Env beats TOML
    assert_eq!(settings.watch.flush_period_secs, 45);
    assert_eq!(settings.logging.default, "debug");

    // Untouched values keep their defaults
    assert_eq!(settings.watch.request_timeout_secs, 60);
    assert_eq!(settings.watch.backoff_initial_ms, 500);

    unsafe {
        env::remove_var("EW_WATCH__FLUSH_PERIOD_SECS");
        env::remove_var("EW_LOGGING__DEFAULT");
    }

    env::set_current_dir(original_dir).unwrap();
}

//! Integration tests for the application poll loop.

use scale_daq::app::{AppEvent, DaqApp};
use scale_daq::config::Settings;
use scale_daq::hardware::synthetic::SYNTHETIC_KEY;
use std::time::Duration;

/// Synthetic scale only, so the tests never touch real ports.
fn create_test_config() -> Settings {
    let toml_str = r#"
        [application]
        name = "Scale DAQ Test"
        log_level = "info"

        [acquisition]
        sample_rate_hz = 10.0
        poll_interval_ms = 20
        discovery_interval_ms = 100

        [serial]
        enabled = false

        [wireless]
        enabled = false

        [synthetic]
        enabled = true
        sample_rate_hz = 80.0
        seed = 7
    "#;
    toml::from_str(toml_str).expect("Failed to parse test config")
}

#[tokio::test]
async fn test_run_fills_series_until_shutdown() {
    let mut app = DaqApp::new(create_test_config()).expect("Failed to create app");
    app.update_available_sources();
    app.use_source(Some(SYNTHETIC_KEY)).expect("Synthetic source missing");

    app.run(tokio::time::sleep(Duration::from_millis(400)))
        .await
        .expect("Run failed");

    let series = app.session().series();
    assert!(!series.is_empty(), "no readings reconciled");
    let times: Vec<f64> = series.iter().map(|p| p.time).collect();
    assert!(times.windows(2).all(|w| w[1] > w[0]));

    // Shutdown closed everything
    assert!(app.active_source().is_none());
}

#[tokio::test]
async fn test_run_discovers_sources() {
    let mut app = DaqApp::new(create_test_config()).expect("Failed to create app");
    let mut events = app.subscribe();

    app.run(tokio::time::sleep(Duration::from_millis(250)))
        .await
        .expect("Run failed");

    match events.try_recv() {
        Ok(AppEvent::SourcesChanged(changes)) => {
            assert_eq!(changes.added, vec![SYNTHETIC_KEY.to_string()]);
        }
        other => panic!("expected a discovery event, got {:?}", other),
    }
}

#[test]
fn test_shutdown_is_idempotent() {
    let mut app = DaqApp::new(create_test_config()).expect("Failed to create app");
    app.update_available_sources();
    app.use_source(Some(SYNTHETIC_KEY)).expect("Synthetic source missing");

    app.shutdown();
    app.shutdown();
    assert_eq!(app.poll_active(), 0);
}

mod common;
use common::*;

use std::io::Write as _;
use std::time::Duration;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn loads_from_file() -> Result<()> {
    let file = write_config(&Factory::config_yaml());
    let config = ConfigWrapper::new(file.path().to_string_lossy().into_owned())?;

    assert_eq!(config.loglevel(), "debug");
    assert_eq!(config.inverter().address(), "/dev/ttyUSB0");
    assert_eq!(config.mqtt().username(), &Some("solar".to_string()));
    assert_eq!(config.mqtt().topic(), "solar/growatt");

    Ok(())
}

#[test]
fn missing_file_names_path() {
    let err = Config::new("/nonexistent/growatt.yaml".to_string()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("/nonexistent/growatt.yaml"));
    assert!(msg.starts_with("[config.rs:"));
}

#[test]
fn invalid_yaml_is_an_error() {
    let file = write_config("inverter: [not, a, map]\n");
    assert!(Config::new(file.path().to_string_lossy().into_owned()).is_err());
}

#[test]
fn settings_follow_config() {
    let yaml = Factory::config_yaml().replace(
        "  waiting_backoff_secs: 60\n",
        "  waiting_backoff_secs: 90\n  unit_id: 3\n  timeout_secs: 5\n  consecutive_pv1_watt: true\n",
    );
    let config = Config::from_yaml(&yaml).unwrap();

    let poll = PollSettings::from(&config.inverter);
    assert_eq!(poll.poll_interval, Duration::from_secs(2));
    assert_eq!(poll.waiting_backoff, Duration::from_secs(90));
    assert_eq!(poll.timesync_interval, Duration::from_secs(1800));
    assert_eq!(poll.max_consecutive_timeouts, 10);
    assert!(poll.decode.consecutive_pv1_watt);

    let serial = SerialSettings::from(&config.inverter);
    assert_eq!(serial.address, "/dev/ttyUSB0");
    assert_eq!(serial.baud_rate, 9600);
    assert_eq!(serial.unit_id, 3);
    assert_eq!(serial.timeout, Duration::from_secs(5));
}
